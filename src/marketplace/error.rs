//! Error taxonomy for claim, proof and verification operations.

use super::types::ClaimStatus;

/// Errors returned by marketplace operations.
///
/// Every variant except [`MarketError::Storage`] is an expected business
/// rejection the caller can act on. `Storage` is an infrastructure failure and
/// means "try again", never a definitive answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketError {
    #[error("user already has an active claim")]
    AlreadyHasActiveTask,

    #[error("task has already been claimed")]
    TaskAlreadyTaken,

    #[error("task is inactive, expired or missing")]
    TaskUnavailable,

    #[error("claim countdown has expired")]
    ClaimExpired,

    #[error("proof slot does not match claim status {status}")]
    WrongProofSlot { status: ClaimStatus },

    #[error("invalid proof artifact: {0}")]
    InvalidArtifact(String),

    #[error("caller does not own this record")]
    NotOwner,

    #[error("claim is already finalized as {status}")]
    AlreadyFinalized { status: ClaimStatus },

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: ClaimStatus, to: ClaimStatus },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("caller lacks the {0} capability")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    /// Wrap an infrastructure failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        MarketError::Storage(err.to_string())
    }

    /// Whether this is a business-rule rejection (as opposed to infrastructure).
    pub fn is_business(&self) -> bool {
        !matches!(self, MarketError::Storage(_))
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::AlreadyHasActiveTask => "already_has_active_task",
            MarketError::TaskAlreadyTaken => "task_already_taken",
            MarketError::TaskUnavailable => "task_unavailable",
            MarketError::ClaimExpired => "claim_expired",
            MarketError::WrongProofSlot { .. } => "wrong_proof_slot",
            MarketError::InvalidArtifact(_) => "invalid_artifact",
            MarketError::NotOwner => "not_owner",
            MarketError::AlreadyFinalized { .. } => "already_finalized",
            MarketError::InvalidTransition { .. } => "invalid_transition",
            MarketError::InvalidInput(_) => "invalid_input",
            MarketError::Forbidden(_) => "forbidden",
            MarketError::NotFound(_) => "not_found",
            MarketError::Storage(_) => "storage",
        }
    }

    /// Message shown to the end user. Each kind has its own wording.
    pub fn user_message(&self) -> String {
        match self {
            MarketError::AlreadyHasActiveTask => {
                "You already have an active task. Complete it first.".to_string()
            }
            MarketError::TaskAlreadyTaken => {
                "This task has already been taken by another user.".to_string()
            }
            MarketError::TaskUnavailable => "This task is no longer available.".to_string(),
            MarketError::ClaimExpired => "This task has expired.".to_string(),
            MarketError::WrongProofSlot { status } => match status {
                ClaimStatus::Taken => "Upload proof 1 first.".to_string(),
                ClaimStatus::Proof1Uploaded => {
                    "Proof 1 is waiting for admin verification.".to_string()
                }
                ClaimStatus::Proof2Uploaded => {
                    "Proof 2 is waiting for final verification.".to_string()
                }
                _ => "No proof can be uploaded for this task right now.".to_string(),
            },
            MarketError::InvalidArtifact(reason) => {
                format!("The uploaded proof was rejected: {}.", reason)
            }
            MarketError::NotOwner => "This task does not belong to you.".to_string(),
            MarketError::AlreadyFinalized { status } => {
                format!("This task has already been marked {}.", status)
            }
            MarketError::InvalidTransition { from, to } => {
                format!("A task in status {} cannot be marked {}.", from, to)
            }
            MarketError::InvalidInput(reason) => format!("Invalid request: {}.", reason),
            MarketError::Forbidden(_) => "You are not allowed to do that.".to_string(),
            MarketError::NotFound(what) => format!("The requested {} was not found.", what),
            MarketError::Storage(_) => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<rusqlite::Error> for MarketError {
    fn from(err: rusqlite::Error) -> Self {
        MarketError::storage(err)
    }
}

impl From<tokio::task::JoinError> for MarketError {
    fn from(err: tokio::task::JoinError) -> Self {
        MarketError::storage(err)
    }
}
