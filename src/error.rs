//! Error handling for the gauge tracking engine
//!
//! Every failure names the offending gauge or set and the violated rule so
//! that callers can act on it without guessing. Driver-level errors are
//! classified after the fact: serialization conflicts and deadlocks become
//! [`GaugeError::Retryable`], lock-wait timeouts become
//! [`GaugeError::LockTimeout`], everything else stays [`GaugeError::Database`].

use thiserror::Error;

use crate::models::gauge::GaugeStatus;

/// Main error type for gauge identity, pairing, and calibration operations.
#[derive(Error, Debug)]
pub enum GaugeError {
    #[error("no gauge matches identifier '{identifier}'")]
    NotFound { identifier: String },

    #[error("identifier '{identifier}' is ambiguous: {matches} gauges match")]
    Ambiguous { identifier: String, matches: usize },

    #[error("gauge '{serial}' is already paired into set '{set_code}'")]
    AlreadyPaired { serial: String, set_code: String },

    #[error("gauge '{serial}' is not a spare")]
    NotASpare { serial: String },

    #[error("gauge '{serial}' does not belong to set '{set_code}'")]
    NotInSet { serial: String, set_code: String },

    #[error("gauges '{serial_a}' and '{serial_b}' cannot be paired: {reason}")]
    IncompatiblePair {
        serial_a: String,
        serial_b: String,
        reason: String,
    },

    #[error("gauge '{identifier}' cannot move from {from} to {attempted}")]
    InvalidStateTransition {
        identifier: String,
        from: GaugeStatus,
        attempted: GaugeStatus,
    },

    #[error("set '{set_code}' does not exist")]
    SetNotFound { set_code: String },

    /// A set code resolving to a member count other than two indicates
    /// prior data corruption. Reported, never auto-healed.
    #[error("set '{set_code}' is corrupted: found {member_count} members, expected 2")]
    SetCorrupted {
        set_code: String,
        member_count: usize,
    },

    #[error("operation '{operation}' hit a serialization conflict, retry possible")]
    Retryable {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("operation '{operation}' timed out waiting for a row lock")]
    LockTimeout { operation: String },

    #[error("invalid request: {message}")]
    Validation { message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type GaugeResult<T> = Result<T, GaugeError>;

/// PostgreSQL SQLSTATE codes that the lock coordinator treats specially.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

impl GaugeError {
    /// Reclassify a driver error surfaced inside a locked transaction.
    ///
    /// Semantic errors pass through untouched; only the `Database` variant
    /// is inspected for the SQLSTATE codes that change retry behavior.
    pub fn classify_for(self, operation: &str) -> GaugeError {
        match self {
            GaugeError::Database(source) => match sqlstate_of(&source).as_deref() {
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED) => {
                    GaugeError::Retryable {
                        operation: operation.to_string(),
                        source,
                    }
                }
                Some(SQLSTATE_LOCK_NOT_AVAILABLE) => GaugeError::LockTimeout {
                    operation: operation.to_string(),
                },
                _ => GaugeError::Database(source),
            },
            other => other,
        }
    }

    /// True when a bounded retry with backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GaugeError::Retryable { .. })
    }
}

fn sqlstate_of(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}
