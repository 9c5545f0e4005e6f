//! Error types for the two-phase commit subsystem.
//!
//! User-class errors abort the offending session cleanly; the session's
//! abort hook then releases whatever registry slot it held. `CorruptWal`
//! is operator-class: the caller is expected to log loudly and request
//! failover. Conditions that cannot be surfaced as errors (aborting an
//! already-committed transaction, a missing dummy participant) panic
//! instead, because the process state can no longer be trusted.

use thiserror::Error;

use crate::common::{Lsn, SessionId, TransactionId};

/// Result type alias for two-phase operations.
pub type TwoPhaseResult<T> = std::result::Result<T, TwoPhaseError>;

#[derive(Debug, Error)]
pub enum TwoPhaseError {
    /// The subsystem was configured with zero slots.
    #[error("prepared transactions are disabled (set max_prepared_xacts to a nonzero value)")]
    Disabled,

    /// The client-supplied GID exceeds the identifier limit.
    #[error("transaction identifier \"{gid}\" is too long ({len} >= {max} max)")]
    GidTooLong { gid: String, len: usize, max: usize },

    /// Another resident transaction already carries this GID.
    #[error("transaction identifier \"{gid}\" is already in use")]
    DuplicateGid { gid: String },

    /// Every registry slot is taken.
    #[error("maximum number of prepared transactions reached (increase max_prepared_xacts, currently {capacity})")]
    CapacityExhausted { capacity: usize },

    /// No valid prepared transaction carries this GID.
    #[error("prepared transaction with identifier \"{gid}\" does not exist")]
    NotFound { gid: String },

    /// Another session is currently finishing this transaction.
    #[error("prepared transaction with identifier \"{gid}\" is busy")]
    Busy { gid: String },

    /// The caller is neither the preparing role nor a superuser.
    #[error("permission denied to finish prepared transaction \"{gid}\"")]
    PermissionDenied { gid: String },

    /// The transaction was prepared in a different database.
    #[error("prepared transaction \"{gid}\" belongs to another database")]
    WrongDatabase { gid: String },

    /// The assembled prepare payload exceeds the configured ceiling.
    #[error("two-phase state payload maximum length exceeded ({total_len} > {max})")]
    LimitExceeded { total_len: u64, max: u64 },

    /// The prepare record could not be re-read from the log.
    #[error("two-phase state for transaction {xid} at log position {lsn} is corrupt: {detail}")]
    CorruptWal {
        xid: TransactionId,
        lsn: Lsn,
        detail: String,
    },

    /// A session attempted a second prepare or finish while already
    /// holding a registry slot.
    #[error("session {session} already has a two-phase operation in progress")]
    OperationInProgress { session: SessionId },

    /// A prepare payload failed structural validation.
    #[error("malformed two-phase state payload: {0}")]
    MalformedPayload(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TwoPhaseError {
    /// Wraps a WAL-layer failure.
    pub fn wal(err: impl std::fmt::Display) -> Self {
        TwoPhaseError::Wal(err.to_string())
    }

    /// Returns true for errors caused by client input rather than system
    /// state; these abort only the issuing session.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TwoPhaseError::Disabled
                | TwoPhaseError::GidTooLong { .. }
                | TwoPhaseError::DuplicateGid { .. }
                | TwoPhaseError::CapacityExhausted { .. }
                | TwoPhaseError::NotFound { .. }
                | TwoPhaseError::Busy { .. }
                | TwoPhaseError::PermissionDenied { .. }
                | TwoPhaseError::WrongDatabase { .. }
                | TwoPhaseError::LimitExceeded { .. }
        )
    }

    /// Returns true when the error should trigger failover handling.
    pub fn is_operator_error(&self) -> bool {
        matches!(self, TwoPhaseError::CorruptWal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = TwoPhaseError::Busy {
            gid: "gxa".to_string(),
        };
        assert!(err.is_user_error());
        assert!(!err.is_operator_error());

        let err = TwoPhaseError::CorruptWal {
            xid: 42,
            lsn: 128,
            detail: "checksum mismatch".to_string(),
        };
        assert!(err.is_operator_error());
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_error_display() {
        let err = TwoPhaseError::NotFound {
            gid: "gxa".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "prepared transaction with identifier \"gxa\" does not exist"
        );
    }
}
