//! Error types for the chainloader pipeline.

use thiserror::Error;

use crate::aggregate::NetworkStatus;

/// Errors that can occur while tracking the chain or projecting read models.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Version conflict on aggregate '{aggregate_id}': expected {expected}, found {actual}")]
    VersionConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("{command}() rejected: aggregate is {actual}, expected {expected}")]
    StateConflict {
        command: &'static str,
        expected: NetworkStatus,
        actual: NetworkStatus,
    },

    #[error("No common ancestor found walking back from height {height} (window floor {floor})")]
    DivergenceUnresolvable { height: u64, floor: u64 },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Mapper error in worker {worker}: {reason}")]
    Mapper { worker: usize, reason: String },

    #[error("Read model integrity violation on '{entity}': {reason}")]
    Integrity { entity: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl LoaderError {
    /// Shorthand for mapper implementations reporting a failure.
    ///
    /// The worker index is filled in by the pool when the error crosses the
    /// worker boundary.
    pub fn mapper(reason: impl Into<String>) -> Self {
        Self::Mapper {
            worker: 0,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the outer orchestration layer may retry the command.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Provider(_)
                | Self::Timeout { .. }
                | Self::Storage(_)
                | Self::VersionConflict { .. }
                | Self::InvalidBatch(_)
        )
    }

    /// Returns `true` if the error needs operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DivergenceUnresolvable { .. })
    }

    /// Returns `true` for a duplicate-key write on the read side.
    ///
    /// Blind retries are unsafe here; height reconciliation (`init`) has to run first.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}
