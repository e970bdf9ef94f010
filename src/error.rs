//! Harness Error Types
//!
//! Every failure the harness can observe is classified into one of these
//! variants. The classification drives the orchestrator's failure policy:
//! conflicts are counted, cancellations are expected near a deadline, and
//! everything else is fatal to the batch.

use thiserror::Error;

use crate::transfer::AccountId;

/// SQLSTATE reported by PostgreSQL for `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE reported by PostgreSQL for `deadlock_detected`.
pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE class `08`: connection exception.
pub const SQLSTATE_CLASS_CONNECTION: &str = "08";
/// SQLSTATE reported by PostgreSQL for `too_many_connections`.
pub const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";
/// `admin_shutdown`, `crash_shutdown`, `cannot_connect_now`
pub const SQLSTATE_SERVER_SHUTDOWN: [&str; 3] = ["57P01", "57P02", "57P03"];

/// Whether a SQLSTATE means the server is unreachable rather than the
/// statement being wrong.
pub fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with(SQLSTATE_CLASS_CONNECTION)
        || code == SQLSTATE_TOO_MANY_CONNECTIONS
        || SQLSTATE_SERVER_SHUTDOWN.contains(&code)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    // === Store Errors ===
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction conflict (SQLSTATE {code}): {message}")]
    Conflict { code: String, message: String },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Store error: {0}")]
    Store(String),

    // === Harness Errors ===
    #[error("Cancelled before commit")]
    Cancelled,

    #[error(
        "Invariant violated: source={source_balance} dest={dest_balance} expected_total={expected_total}"
    )]
    InvariantViolation {
        source_balance: i64,
        dest_balance: i64,
        expected_total: i64,
    },

    #[error("Invalid transfer attempt: {0}")]
    InvalidAttempt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl HarnessError {
    /// Stable identifier for logs and summaries
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::Connection(_) => "CONNECTION_ERROR",
            HarnessError::Conflict { .. } => "CONFLICT",
            HarnessError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            HarnessError::Store(_) => "STORE_ERROR",
            HarnessError::Cancelled => "CANCELLED",
            HarnessError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            HarnessError::InvalidAttempt(_) => "INVALID_ATTEMPT",
            HarnessError::Config(_) => "CONFIG_ERROR",
            HarnessError::TaskPanicked(_) => "TASK_PANICKED",
        }
    }

    /// Expected under concurrency; counted but never cancels sibling work.
    #[inline]
    pub fn is_benign(&self) -> bool {
        matches!(self, HarnessError::Conflict { .. })
    }

    /// Fatal errors cancel the current batch.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HarnessError::Conflict { .. } | HarnessError::Cancelled)
    }

    /// Connection failures abort the whole campaign, not just the batch.
    #[inline]
    pub fn is_connection(&self) -> bool {
        matches!(self, HarnessError::Connection(_))
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        HarnessError::Conflict {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for HarnessError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(ref db_err) => match db_err.code().as_deref() {
                Some(code @ (SQLSTATE_SERIALIZATION_FAILURE | SQLSTATE_DEADLOCK_DETECTED)) => {
                    HarnessError::conflict(code, db_err.message())
                }
                Some(code) if is_connection_sqlstate(code) => {
                    HarnessError::Connection(e.to_string())
                }
                _ => HarnessError::Store(e.to_string()),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => HarnessError::Connection(e.to_string()),
            // Reads use fetch_optional; a bare RowNotFound carries no account id
            _ => HarnessError::Store(e.to_string()),
        }
    }
}
