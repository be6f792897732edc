use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures that abort a conversation turn.
///
/// Conversational failures (policy not found, ambiguous matches, no provider
/// for a service type, guard violations) never surface here: they are tool
/// outputs that the language model reacts to.
#[derive(Error, Debug)]
pub enum ClaimError {
    #[error("Claim not found: {0}")]
    ClaimNotFound(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Language model call failed: {0}")]
    Model(String),

    #[error("Language model did not answer within {0:?}")]
    ModelTimeout(Duration),

    #[error("Tool-call loop did not settle after {0} rounds")]
    ToolLoopExhausted(usize),

    #[error("Claim {claim_id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        claim_id: Uuid,
        expected: i64,
        found: i64,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClaimError {
    /// Whether retrying the whole turn may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClaimError::Storage(_)
                | ClaimError::Directory(_)
                | ClaimError::Model(_)
                | ClaimError::ModelTimeout(_)
                | ClaimError::ToolLoopExhausted(_)
                | ClaimError::VersionConflict { .. }
        )
    }

    /// Short text safe to show to the driver.
    pub fn user_message(&self) -> &'static str {
        match self {
            ClaimError::ClaimNotFound(_) => {
                "We couldn't find that claim. Please start a new claim or check the link."
            }
            _ if self.is_transient() => "Something went wrong, please try again.",
            _ => "Something went wrong on our side. Please try again in a moment.",
        }
    }
}

impl From<sqlx::Error> for ClaimError {
    fn from(e: sqlx::Error) -> Self {
        ClaimError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClaimError>;
