//! Run environment shared with every worker at initialization.

use serde::{Deserialize, Serialize};

use crate::config::Config;

use super::traits::{SourceStats, TargetStats};

/// Configuration snapshot plus run statistics.
///
/// Built once by the orchestrator before the pool starts and sent to each
/// worker inside `Initialize`. Workers treat it as read-only; the
/// coordinator's copy is the only authoritative one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// Configuration snapshot.
    pub options: Config,
    /// Counters gathered during pre-flight.
    #[serde(default)]
    pub statistics: Statistics,
}

impl Environment {
    /// Create an environment with empty statistics.
    pub fn new(options: Config) -> Self {
        Self {
            options,
            statistics: Statistics::default(),
        }
    }
}

/// Run statistics gathered by the coordinating side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    /// Source stats as reported during pre-flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceStats>,
    /// Target stats as reported during pre-flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetStats>,
    /// Records the run is expected to move.
    #[serde(default)]
    pub records_expected: u64,
}
