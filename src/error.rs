#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const CLI_ERROR: &str = "CLI_ERROR";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const BUDGET: &str = "BUDGET";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Unknown assertion kind: {0}")]
    UnknownAssertion(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Backend timed out after {0}s")]
    BackendTimeout(u64),

    #[error("Approval error: {0}")]
    ApprovalError(String),

    #[error("Quarantine record not found: {0}")]
    QuarantineNotFound(String),

    #[error("Worker pool error: {0}")]
    WorkerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the protocol error code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) | Self::UnknownAssertion(_) | Self::SerializationError(_) => {
                code::INVALID
            }
            Self::StoreError(_) | Self::SqlxError(_) | Self::Internal(_) => code::INTERNAL,
            Self::RunNotFound(_) | Self::QuarantineNotFound(_) => code::NOTFOUND,
            Self::InvalidTransition { .. } | Self::ApprovalError(_) | Self::Duplicate(_) => {
                code::CONFLICT
            }
            Self::BackendError(_) | Self::IoError(_) | Self::WorkerError(_) => code::DEPENDENCY,
            Self::BackendTimeout(_) => code::TIMEOUT,
        }
    }

    /// Returns the exit code for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) => 2,
            Self::StoreError(_) | Self::SqlxError(_) => 3,
            Self::RunNotFound(_) | Self::QuarantineNotFound(_) => 4,
            Self::InvalidTransition { .. } | Self::ApprovalError(_) | Self::Duplicate(_) => 5,
            Self::UnknownAssertion(_) => 6,
            Self::BackendError(_) | Self::BackendTimeout(_) | Self::WorkerError(_) => 7,
            Self::IoError(_) => 8,
            Self::SerializationError(_) => 9,
            Self::Internal(_) => 10,
        }
    }

    pub(crate) fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Protocol error codes as documented in the CLI
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::CLI_ERROR,
        "Invalid CLI usage",
        "Run 'buildloop --help' for valid options",
    ),
    (
        code::NOTFOUND,
        "Run or quarantine record was not found",
        "List runs or quarantined cases and verify the identifier",
    ),
    (
        code::INVALID,
        "Invalid configuration or evaluation spec",
        "Fix the config file or the assertion definitions and resubmit",
    ),
    (
        code::CONFLICT,
        "Conflicting run state transition or duplicate per-iteration record",
        "Poll the run status to inspect its current state",
    ),
    (
        code::BUDGET,
        "Run budget exhausted",
        "Raise the attempts, time or cost limit for the tenant",
    ),
    (
        code::DEPENDENCY,
        "Code generation backend or worker pool unavailable",
        "Check backend health and retry",
    ),
    (
        code::TIMEOUT,
        "Backend call timed out",
        "Increase the step timeout and retry",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry",
    ),
];

/// Get error code details (description and fix) for a given error code
#[must_use]
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, EngineError>;
