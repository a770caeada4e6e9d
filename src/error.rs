//! Error Taxonomy
//!
//! Every failure the decision path can hit has a variant here. None of them
//! reach the caller of `decide`: the orchestrator converts each one into a
//! conservative value and, ultimately, an ESCALATE decision.

use thiserror::Error;

use crate::context::CONTEXT_DIM;

/// Invalid or unreadable configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Context vector validation failure (fatal for the current request only)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("context vector must have {expected} components, got {found}")]
    WrongLength { expected: usize, found: usize },
    #[error("context component {index} ({name}) is not finite: {value}")]
    NonFinite {
        index: usize,
        name: &'static str,
        value: f64,
    },
}

impl FeatureError {
    pub fn wrong_length(found: usize) -> Self {
        Self::WrongLength {
            expected: CONTEXT_DIM,
            found,
        }
    }
}

/// Persistence read/write failure
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store operation `{op}` timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    Duplicate(String),
}

impl StoreError {
    /// Whether retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

/// Critic checkpoint (de)serialization failure
#[derive(Debug, Clone, Error)]
pub enum CheckpointError {
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("unsupported checkpoint version: {found} (max supported: {max_supported})")]
    UnsupportedVersion { found: u32, max_supported: u32 },
    #[error("invalid checkpoint state: {0}")]
    InvalidState(String),
}

/// Umbrella error for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("evidence unavailable from detector `{detector}`: {reason}")]
    EvidenceUnavailable { detector: String, reason: String },
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("outcome queue closed")]
    QueueClosed,
}
