//! Memory pressure gate.
//!
//! Workers call [`MemoryGate::await_capacity`] before each unit. Sampling
//! process memory is not free, so samples are cached for an adaptive
//! window: `(total / used)^2 * base_interval`. A worker far below its
//! budget re-samples rarely; one close to it re-samples every
//! `base_interval`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MemoryConfig;

/// Longest cache window, in multiples of the base interval.
const MAX_DELAY_FACTOR: f64 = 100.0;

fn now() -> Instant {
    Instant::now()
}

/// One reading of worker memory use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub heap_used: u64,
    pub heap_total: u64,
    /// `heap_used / heap_total`, clamped to `[0, 1]`.
    pub ratio: f64,
    #[serde(skip, default = "now")]
    pub captured_at: Instant,
}

impl MemorySample {
    pub fn new(heap_used: u64, heap_total: u64) -> Self {
        let ratio = if heap_total == 0 {
            0.0
        } else {
            (heap_used as f64 / heap_total as f64).min(1.0)
        };
        Self {
            heap_used,
            heap_total,
            ratio,
            captured_at: Instant::now(),
        }
    }
}

/// Source of `(used, total)` memory readings in bytes.
pub trait MemorySampler: Send + Sync {
    fn read(&mut self) -> (u64, u64);
}

/// Reads this process's resident memory through `sysinfo`.
///
/// The total is the configured budget when set, otherwise system memory.
pub struct ProcessMemorySampler {
    system: System,
    pid: Option<Pid>,
    budget: Option<u64>,
}

impl ProcessMemorySampler {
    pub fn new(budget: Option<u64>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot resolve current pid, memory gate disabled: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            budget,
        }
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn read(&mut self) -> (u64, u64) {
        let Some(pid) = self.pid else {
            return (0, 0);
        };
        self.system.refresh_process(pid);
        let used = self.system.process(pid).map(|p| p.memory()).unwrap_or(0);
        let total = match self.budget {
            Some(budget) => budget,
            None => {
                self.system.refresh_memory();
                self.system.total_memory()
            }
        };
        (used, total)
    }
}

/// Hook that tries to free memory when the gate is over its limit.
pub trait Reclaim: Send + Sync {
    /// Attempt reclamation. Returns `false` when no facility exists, in
    /// which case the gate stops waiting.
    fn reclaim(&self) -> bool;
}

/// Built-in hook: frees nothing itself, only gives pressure created
/// elsewhere (other tasks, page cache) time to subside.
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldReclaim;

impl Reclaim for YieldReclaim {
    fn reclaim(&self) -> bool {
        true
    }
}

/// Per-worker memory gate. Owned exclusively by one executor.
pub struct MemoryGate {
    sampler: Box<dyn MemorySampler>,
    reclaim: Option<Box<dyn Reclaim>>,
    base_interval: Duration,
    reclaim_delay: Duration,
    limit: f64,
    last: Option<MemorySample>,
}

impl MemoryGate {
    pub fn new(
        sampler: Box<dyn MemorySampler>,
        limit: f64,
        base_interval: Duration,
        reclaim_delay: Duration,
    ) -> Self {
        Self {
            sampler,
            reclaim: None,
            base_interval,
            reclaim_delay,
            limit,
            last: None,
        }
    }

    /// Build the gate a worker runs with, probing this process.
    pub fn from_config(config: &MemoryConfig) -> Self {
        let gate = Self::new(
            Box::new(ProcessMemorySampler::new(config.heap_budget_bytes())),
            config.limit,
            Duration::from_millis(config.check_interval_ms),
            Duration::from_millis(config.reclaim_delay_ms),
        );
        if config.wait_for_capacity {
            gate.with_reclaim(Box::new(YieldReclaim))
        } else {
            gate
        }
    }

    pub fn with_reclaim(mut self, hook: Box<dyn Reclaim>) -> Self {
        self.reclaim = Some(hook);
        self
    }

    /// How long `sample` may be reused.
    pub fn next_check_delay(&self, sample: &MemorySample) -> Duration {
        let factor = if sample.heap_used == 0 {
            MAX_DELAY_FACTOR
        } else {
            let inverse = sample.heap_total as f64 / sample.heap_used as f64;
            (inverse * inverse).min(MAX_DELAY_FACTOR)
        };
        self.base_interval.mul_f64(factor)
    }

    /// Return the cached sample while it is fresh, otherwise take a new one.
    pub fn sample(&mut self) -> MemorySample {
        if let Some(last) = self.last {
            if last.captured_at.elapsed() < self.next_check_delay(&last) {
                return last;
            }
        }
        self.fresh_sample()
    }

    fn fresh_sample(&mut self) -> MemorySample {
        let (used, total) = self.sampler.read();
        let sample = MemorySample::new(used, total);
        self.last = Some(sample);
        sample
    }

    /// Most recent sample, if any was taken.
    pub fn latest(&self) -> Option<MemorySample> {
        self.last
    }

    /// Wait until the ratio is below the limit or no reclamation is possible.
    pub async fn await_capacity(&mut self) -> MemorySample {
        let mut sample = self.sample();
        while sample.ratio >= self.limit {
            let Some(hook) = self.reclaim.as_ref() else {
                warn!(
                    "Memory at {:.0}% of budget (limit {:.0}%), no reclamation available, proceeding",
                    sample.ratio * 100.0,
                    self.limit * 100.0
                );
                return sample;
            };
            if !hook.reclaim() {
                warn!("Memory reclamation unavailable, proceeding over limit");
                return sample;
            }
            debug!(
                "Memory at {:.0}% of budget, waiting {:?}",
                sample.ratio * 100.0,
                self.reclaim_delay
            );
            tokio::time::sleep(self.reclaim_delay).await;
            sample = self.fresh_sample();
        }
        sample
    }
}
