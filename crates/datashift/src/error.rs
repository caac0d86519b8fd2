//! Error types for the transfer library.

use thiserror::Error;

/// Main error type for transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Configuration error (invalid YAML, missing fields, rejected options).
    #[error("Configuration error: {0}")]
    Config(String),

    /// No backend is registered under the requested driver name.
    #[error("Unknown backend driver: {0}")]
    UnknownDriver(String),

    /// Transient backend failure (network hiccup, temporary unavailability).
    #[error("Backend '{backend}' error: {message}")]
    Backend { backend: String, message: String },

    /// Unrecoverable backend failure (contract violation, misconfiguration).
    #[error("Backend '{backend}' failed fatally: {message}")]
    Fatal { backend: String, message: String },

    /// A work unit failed after exhausting its retry budget.
    #[error("Work unit [{offset}, {end}) failed: {message}")]
    WorkUnit {
        offset: u64,
        end: u64,
        message: String,
    },

    /// Malformed message between coordinator and worker.
    #[error("Worker protocol error: {0}")]
    Protocol(String),

    /// Worker pool error (spawn failure, every worker lost).
    #[error("Worker pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// IO error (file operations, child process pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transfer was cancelled (SIGINT, etc.)
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Create a transient backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a fatal backend error.
    pub fn fatal(backend: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Fatal {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        TransferError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Whether the retry wrapper may re-attempt the failed operation.
    ///
    /// Only I/O-shaped failures are retried; configuration, contract and
    /// data-shape errors fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Backend { .. } | TransferError::Io(_) | TransferError::Postgres(_)
        )
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Config(_) | TransferError::UnknownDriver(_) | TransferError::Yaml(_) => 2,
            TransferError::Fatal { .. } | TransferError::Protocol(_) | TransferError::Pool { .. } => 3,
            TransferError::WorkUnit { .. } => 4,
            TransferError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;
