use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the decision oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("API key not configured")]
    CredentialMissing,

    #[error("API key rejected by the provider")]
    CredentialInvalid,

    #[error("provider rate limit reached")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed oracle response: {0}")]
    Malformed(String),

    #[error("oracle error: {0}")]
    Unknown(String),
}

/// How the orchestrator reacts to an oracle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop the loop after telling the user.
    Fatal,
    /// Sleep for the cool-down and retry the same step.
    CoolDown,
    /// Record a step error and ask again, subject to the attempt cap.
    StepLocal,
}

impl OracleError {
    pub fn disposition(&self) -> Disposition {
        match self {
            OracleError::CredentialMissing
            | OracleError::CredentialInvalid
            | OracleError::Network(_) => Disposition::Fatal,
            OracleError::RateLimited => Disposition::CoolDown,
            OracleError::Malformed(_) | OracleError::Unknown(_) => Disposition::StepLocal,
        }
    }
}

/// Failures reported by the host page.
#[derive(Debug, Error)]
pub enum PageError {
    /// The document went away underneath us (reload or navigation).
    #[error("page navigated away")]
    Navigated,

    #[error("element {0} is no longer attached to the page")]
    StaleHandle(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("unexpected page payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("browser unavailable: {0}")]
    Browser(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The action started a navigation before it finished; its real outcome
    /// is unknown to this page.
    #[error("action interrupted by navigation")]
    NavigatedAway,
}

/// Why the orchestrator refused to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakReason {
    Stopped,
    MaxSteps { limit: u32 },
    Timeout { limit: Duration },
    MaxAttempts { limit: u32 },
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::Stopped => f.write_str("Agent stopped"),
            BreakReason::MaxSteps { limit } => write!(f, "Reached the limit of {limit} steps"),
            BreakReason::Timeout { limit } => {
                write!(f, "Timeout: exceeded {} seconds", limit.as_secs())
            }
            BreakReason::MaxAttempts { limit } => {
                write!(f, "Too many failed attempts ({limit})")
            }
        }
    }
}
