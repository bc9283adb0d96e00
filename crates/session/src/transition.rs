//! The transaction state machine
//!
//! A pure validator over transaction states. Strict validation is the
//! default; relaxed validation exists only for rehydrating state from the
//! durable log, where the observed end-state may have been reached through
//! a path the in-memory machine never traversed.

use papyrus_common::fatal_invariant;
use std::fmt;

/// States a session's transaction can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// No multi-statement transaction; retryable writes are allowed
    None,
    InProgress,
    Prepared,
    CommittingWithoutPrepare,
    CommittingWithPrepare,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::None => "TxnState::None",
            TxnState::InProgress => "TxnState::InProgress",
            TxnState::Prepared => "TxnState::Prepared",
            TxnState::CommittingWithoutPrepare => "TxnState::CommittingWithoutPrepare",
            TxnState::CommittingWithPrepare => "TxnState::CommittingWithPrepare",
            TxnState::Committed => "TxnState::Committed",
            TxnState::Aborted => "TxnState::Aborted",
        };
        f.write_str(name)
    }
}

/// Whether a transition is checked against the legality table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionValidation {
    Validate,
    Relaxed,
}

/// The state machine: current state plus the transition validator
#[derive(Debug)]
pub(crate) struct TransitionTable {
    state: TxnState,
}

impl TransitionTable {
    pub(crate) fn new() -> Self {
        Self {
            state: TxnState::None,
        }
    }

    pub(crate) fn state(&self) -> TxnState {
        self.state
    }

    /// Move to `new_state`. An illegal transition under `Validate` is a
    /// programmer error and terminates the process.
    pub(crate) fn transition_to(&mut self, new_state: TxnState, validation: TransitionValidation) {
        if validation == TransitionValidation::Validate
            && !Self::is_legal_transition(self.state, new_state)
        {
            fatal_invariant(&format!(
                "Current state: {}, Illegal attempted next state: {}",
                self.state, new_state
            ));
        }
        self.state = new_state;
    }

    pub(crate) fn is_legal_transition(old_state: TxnState, new_state: TxnState) -> bool {
        match old_state {
            TxnState::None => matches!(new_state, TxnState::None | TxnState::InProgress),
            TxnState::InProgress => matches!(
                new_state,
                TxnState::None
                    | TxnState::Prepared
                    | TxnState::CommittingWithoutPrepare
                    | TxnState::Aborted
            ),
            TxnState::Prepared => {
                matches!(new_state, TxnState::CommittingWithPrepare | TxnState::Aborted)
            }
            TxnState::CommittingWithoutPrepare | TxnState::CommittingWithPrepare => matches!(
                new_state,
                TxnState::None | TxnState::Committed | TxnState::Aborted
            ),
            TxnState::Committed => matches!(new_state, TxnState::None | TxnState::InProgress),
            TxnState::Aborted => matches!(new_state, TxnState::None | TxnState::InProgress),
        }
    }

    pub(crate) fn is_none(&self) -> bool {
        self.state == TxnState::None
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        self.state == TxnState::InProgress
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.state == TxnState::Prepared
    }

    pub(crate) fn is_committing_without_prepare(&self) -> bool {
        self.state == TxnState::CommittingWithoutPrepare
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.state == TxnState::Aborted
    }

    /// True in every state of a multi-statement transaction
    pub(crate) fn in_multi_document_transaction(&self) -> bool {
        self.state != TxnState::None
    }
}
