//! Messages exchanged between the coordinator and its workers.
//!
//! Every message is a JSON object tagged by `type`. Process isolation
//! writes one message per line.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Environment;
use crate::error::{Result, TransferError};
use crate::pipeline::MemorySample;

/// A contiguous slice `[offset, offset + size)` of the source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub offset: u64,
    pub size: usize,
}

impl WorkUnit {
    pub fn new(offset: u64, size: usize) -> Self {
        Self { offset, size }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size as u64)
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Coordinator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Initialize { id: usize, environment: Environment },
    Work { offset: u64, size: usize },
    Terminate,
}

impl CoordinatorMessage {
    pub fn work(unit: WorkUnit) -> Self {
        CoordinatorMessage::Work {
            offset: unit.offset,
            size: unit.size,
        }
    }
}

/// Worker to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Done {
        processed: u64,
        memory_usage: MemorySample,
        /// The source reported no records past this unit.
        #[serde(default)]
        end_of_stream: bool,
    },
    Error {
        message: String,
        /// The failure will repeat on every attempt (contract, config or
        /// data-shape error) rather than having exhausted its retries.
        #[serde(default)]
        fatal: bool,
    },
}

impl WorkerMessage {
    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        WorkerMessage::Error {
            message: message.into(),
            fatal,
        }
    }
}

/// Encode a message as a single JSON line (without the newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message)
        .map_err(|e| TransferError::Protocol(format!("cannot encode message: {}", e)))
}

/// Decode one JSON line.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| TransferError::Protocol(format!("malformed message: {}", e)))
}
