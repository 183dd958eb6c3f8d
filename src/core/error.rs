use thiserror::Error;

/// Core error types for sgfw
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A policy rule cannot be compiled into filter fragments
    #[error("Invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Group-reference expansion could not reach the member lookup
    #[error("Member lookup for group {group} failed: {message}")]
    MemberLookup { group: String, message: String },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Some entities of a multi-entity refresh failed; the rest were applied
    #[error("Refresh failed for {}: {source}", entities.join(", "))]
    Refresh {
        entities: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid_rule(rule: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        Error::InvalidRule {
            rule: format!("{rule:?}"),
            reason: reason.into(),
        }
    }

    /// True for errors raised while compiling policy (before any sink mutation).
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRule { .. } | Error::MemberLookup { .. } | Error::Validation { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
