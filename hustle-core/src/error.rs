//! Error types for the money and trust core
//!
//! The core never throws across its public boundary: every fallible
//! operation returns `CoreResult<T>`, and every failure is one of the
//! closed set of kinds in [`ErrorKind`]. Transport layers map kinds to
//! status codes; the core itself only tags.

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::models::MoneyState;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// AI attempted a forbidden or over-privileged action
    #[error("authority violation: '{action}' on '{subsystem}' is not permitted")]
    AuthorityViolation { action: String, subsystem: String },

    /// Caller asked for an illegal state change
    #[error("illegal {machine} transition: {from} -> {to}")]
    IllegalTransition {
        machine: &'static str,
        from: String,
        to: String,
    },

    /// Business rule denied the operation
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Optimistic conflict or refund-already-pending race; caller may retry
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Payment gateway returned an error or timed out mid-saga
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Transfer reversal failed because the destination balance is short
    #[error(
        "destination balance too low for reversal (worker {worker_id}): needed {needed}, available {available}"
    )]
    NegativeBalance {
        worker_id: Uuid,
        needed: i64,
        available: i64,
    },

    /// The event or action was already applied; the money state carries the prior result
    #[error("already applied; money state is {state}")]
    IdempotentReplay { state: MoneyState },

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Unexpected fault (integrity violated, append-only broken)
    #[error("internal error: {0}")]
    Internal(String),
}

/// The closed set of error kinds the core exposes to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthorityViolation,
    IllegalTransition,
    PreconditionFailed,
    ConcurrencyConflict,
    GatewayError,
    NegativeBalance,
    IdempotentReplay,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorityViolation => "AUTHORITY_VIOLATION",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            Self::GatewayError => "GATEWAY_ERROR",
            Self::NegativeBalance => "NEGATIVE_BALANCE",
            Self::IdempotentReplay => "IDEMPOTENT_REPLAY",
            Self::Internal => "INTERNAL",
        }
    }
}

impl CoreError {
    /// Map this error onto the closed kind set
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthorityViolation { .. } => ErrorKind::AuthorityViolation,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Self::Gateway(_) => ErrorKind::GatewayError,
            Self::NegativeBalance { .. } => ErrorKind::NegativeBalance,
            Self::IdempotentReplay { .. } => ErrorKind::IdempotentReplay,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same call can possibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrencyConflict | ErrorKind::GatewayError
        )
    }

    /// Create an authority violation error
    pub fn authority<S: Into<String>>(action: S, subsystem: S) -> Self {
        Self::AuthorityViolation {
            action: action.into(),
            subsystem: subsystem.into(),
        }
    }

    /// Create an illegal transition error
    pub fn illegal_transition<S: Into<String>>(machine: &'static str, from: S, to: S) -> Self {
        Self::IllegalTransition {
            machine,
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a precondition failure
    pub fn precondition<S: Into<String>>(msg: S) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Create a concurrency conflict
    pub fn concurrency<S: Into<String>>(msg: S) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = CoreError::precondition("task not completed");
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(err.kind().as_str(), "PRECONDITION_FAILED");
        assert!(!err.is_retryable());

        let err = CoreError::concurrency("refund already pending");
        assert!(err.is_retryable());

        let err = CoreError::storage("connection reset");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn replay_carries_prior_state() {
        let err = CoreError::IdempotentReplay {
            state: MoneyState::Released,
        };
        assert_eq!(err.kind(), ErrorKind::IdempotentReplay);
        assert!(err.to_string().contains("released"));
    }
}
