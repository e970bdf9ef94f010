//! Executor State Definitions
//!
//! ```text
//! Idle → Began → ReadSource → ReadDest → Updated → Committed
//!                                      ↘ NoOp    ↗
//!   (any non-terminal state) ─────────────────────→ RolledBack
//! ```

use std::fmt;

/// State of one executor run
///
/// Terminal states: COMMITTED, ROLLED_BACK. Every run reaches exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    /// Nothing started yet
    Idle,

    /// Transaction open at the requested isolation level
    Began,

    /// Decrementing account read
    ReadSource,

    /// Incrementing account read
    ReadDest,

    /// Both balances written
    Updated,

    /// Source could not afford the amount; nothing written
    NoOp,

    /// Terminal: commit succeeded
    Committed,

    /// Terminal: rolled back (error, conflict or cancellation)
    RolledBack,
}

impl TxState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: TxState) -> bool {
        use TxState::*;
        match (*self, next) {
            (Idle, Began) => true,
            (Began, ReadSource) => true,
            (ReadSource, ReadDest) => true,
            (ReadDest, Updated) | (ReadDest, NoOp) => true,
            (Updated, Committed) | (NoOp, Committed) => true,
            // Begin failures never open a transaction but still terminate the run
            (s, RolledBack) => !s.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Idle => "IDLE",
            TxState::Began => "BEGAN",
            TxState::ReadSource => "READ_SOURCE",
            TxState::ReadDest => "READ_DEST",
            TxState::Updated => "UPDATED",
            TxState::NoOp => "NO_OP",
            TxState::Committed => "COMMITTED",
            TxState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TxState::Committed.is_terminal());
        assert!(TxState::RolledBack.is_terminal());

        assert!(!TxState::Idle.is_terminal());
        assert!(!TxState::Began.is_terminal());
        assert!(!TxState::ReadSource.is_terminal());
        assert!(!TxState::ReadDest.is_terminal());
        assert!(!TxState::Updated.is_terminal());
        assert!(!TxState::NoOp.is_terminal());
    }

    #[test]
    fn test_happy_paths() {
        let updated = [
            TxState::Idle,
            TxState::Began,
            TxState::ReadSource,
            TxState::ReadDest,
            TxState::Updated,
            TxState::Committed,
        ];
        for pair in updated.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(TxState::ReadDest.can_transition_to(TxState::NoOp));
        assert!(TxState::NoOp.can_transition_to(TxState::Committed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!TxState::Idle.can_transition_to(TxState::Committed));
        assert!(!TxState::Began.can_transition_to(TxState::Updated));
        assert!(!TxState::ReadSource.can_transition_to(TxState::Updated));
        assert!(!TxState::Committed.can_transition_to(TxState::RolledBack));
        assert!(!TxState::RolledBack.can_transition_to(TxState::Committed));
        assert!(!TxState::RolledBack.can_transition_to(TxState::RolledBack));
    }

    #[test]
    fn test_rollback_from_any_live_state() {
        for state in [
            TxState::Idle,
            TxState::Began,
            TxState::ReadSource,
            TxState::ReadDest,
            TxState::Updated,
            TxState::NoOp,
        ] {
            assert!(state.can_transition_to(TxState::RolledBack), "{}", state);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(TxState::ReadSource.to_string(), "READ_SOURCE");
        assert_eq!(TxState::RolledBack.to_string(), "ROLLED_BACK");
    }
}
