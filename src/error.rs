//! Typed error classification for the chain executor (§7).
//!
//! `anyhow::Error` remains the error type at the process boundary (worker
//! loop, supervisor, config loading) exactly as in the teacher; stages and
//! storages return this typed enum so the executor can classify a failure
//! without string-sniffing.

use thiserror::Error;

/// The outcome a link (stage) implementation signals back to the executor.
#[derive(Debug, Error)]
pub enum StageError {
    /// Transient failure: network timeout, 5xx from a dependent service, or
    /// an explicit "try later" signal. Routed to the DLQ with a recoverable
    /// classification (§7.2).
    #[error("recoverable stage failure: {0}")]
    Recoverable(String),

    /// Permanent failure: malformed vCon, unresolvable reference, or a
    /// stage marked "do not retry". Routed to the DLQ with a permanent
    /// classification (§7.3).
    #[error("permanent stage failure: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn classification(&self) -> FailureClass {
        match self {
            StageError::Recoverable(_) => FailureClass::Recoverable,
            StageError::Permanent(_) => FailureClass::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Recoverable(m) | StageError::Permanent(m) => m,
        }
    }
}

/// A storage backend's `save`/`get`/`delete` failure. Storage failures
/// never carry a recoverable/permanent distinction in the spec — they're
/// either tolerated (partial fan-out failure) or fatal (total fan-out
/// failure, §4.4).
#[derive(Debug, Error)]
#[error("storage failure: {0}")]
pub struct StorageError(pub String);

/// Failure classification recorded on DLQ placement (§7 items 2-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Recoverable,
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Recoverable => "recoverable",
            FailureClass::Permanent => "permanent",
        }
    }
}

/// Configuration-time errors (§4.7, §7 item 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chain '{chain}' references unresolved stage '{stage}'")]
    UnresolvedStage { chain: String, stage: String },

    #[error("chain '{chain}' references unresolved storage '{storage}'")]
    UnresolvedStorage { chain: String, storage: String },

    #[error("chain '{chain}' has no ingress queues")]
    NoIngressQueues { chain: String },

    #[error("duplicate chain name '{0}'")]
    DuplicateChain(String),

    #[error("failed to parse configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),
}
