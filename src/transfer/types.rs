//! Transfer Types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Account identifier (primary key of `accounts`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One conditional balance transfer: move `amount` from `source` to `dest`
/// if `source` can afford it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferAttempt {
    source: AccountId,
    dest: AccountId,
    amount: i64,
}

impl TransferAttempt {
    pub fn new(source: AccountId, dest: AccountId, amount: i64) -> Result<Self, HarnessError> {
        if amount <= 0 {
            return Err(HarnessError::InvalidAttempt(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        if source == dest {
            return Err(HarnessError::InvalidAttempt(format!(
                "source and destination are both account {}",
                source
            )));
        }
        Ok(Self {
            source,
            dest,
            amount,
        })
    }

    #[inline]
    pub fn source(&self) -> AccountId {
        self.source
    }

    #[inline]
    pub fn dest(&self) -> AccountId {
        self.dest
    }

    #[inline]
    pub fn amount(&self) -> i64 {
        self.amount
    }
}

/// Successful terminal outcome of one executor run.
///
/// Insufficient funds is a valid business result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Both balances were written and the transaction committed
    Transferred,
    /// Source could not afford the amount; committed without writes
    InsufficientFunds,
}

impl TransferOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferOutcome::Transferred => "TRANSFERRED",
            TransferOutcome::InsufficientFunds => "INSUFFICIENT_FUNDS",
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
