//! Per-unit execution helpers used by the worker executor.
//!
//! - [`retry`]: Immediate-retry wrapper around a fallible backend call
//! - [`gate`]: Memory pressure gate with adaptive sampling

pub mod gate;
pub mod retry;

pub use gate::{
    MemoryGate, MemorySample, MemorySampler, ProcessMemorySampler, Reclaim, YieldReclaim,
};
pub use retry::with_retry;
