use thiserror::Error;

/// Errors produced by the hftproxy core.
#[derive(Debug, Error)]
pub enum HftError {
    /// A rule file was rejected. Carries every problem found, one per entry.
    #[error("rule file rejected: {}", .0.join("; "))]
    RulesRejected(Vec<String>),

    #[error("rule file contains no rules")]
    EmptyRuleSet,

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("listening port {0} is already registered")]
    PortInUse(u16),

    #[error("no free listening port at or above {0}")]
    PortsExhausted(u16),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type HftResult<T> = Result<T, HftError>;
