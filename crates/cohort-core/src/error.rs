//! # AppError
//!
//! Centralized error handling for the cohort engine.
//! Every variant is recoverable and reported back to the trigger or
//! administrative caller; none of them is fatal to the process.

use thiserror::Error;

use crate::calendar::CycleId;

/// The primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum AppError {
    /// A precondition about current state is violated (e.g. a window is already open)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Resource not found (e.g., Member, Invitation, Cycle)
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    /// The requested transition has already happened
    #[error("already processed: {0}")]
    AlreadyProcessed(String),

    #[error("{0} is already a member")]
    AlreadyMember(String),

    #[error("cycle {0} is already compiled")]
    AlreadyCompiled(CycleId),

    #[error("expired: {0}")]
    Expired(String),

    #[error("{member} already submitted for cycle {cycle}")]
    DuplicateSubmission { member: String, cycle: CycleId },

    #[error("a pending invitation already targets {0}")]
    DuplicatePendingInvite(String),

    #[error("no submission window is open")]
    NoActiveWindow,

    /// Malformed input or a caller not allowed to perform the action
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Infrastructure failure (e.g., DB down)
    #[error("internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable name used in structured outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(..) => "not_found",
            AppError::AlreadyProcessed(_) => "already_processed",
            AppError::AlreadyMember(_) => "already_member",
            AppError::AlreadyCompiled(_) => "already_compiled",
            AppError::Expired(_) => "expired",
            AppError::DuplicateSubmission { .. } => "duplicate_submission",
            AppError::DuplicatePendingInvite(_) => "duplicate_pending_invite",
            AppError::NoActiveWindow => "no_active_window",
            AppError::ValidationError(_) => "validation",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Failures surfaced by store ports.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Carries the constraint name.
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(constraint) => AppError::Conflict(constraint),
            StoreError::Backend(source) => AppError::Internal(format!("{source:#}")),
        }
    }
}

/// A specialized Result type for engine logic.
pub type Result<T> = std::result::Result<T, AppError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
