//! Refresh cycle bookkeeping
//!
//! Pure state with no I/O, so the single-flight rules can be tested without
//! a network or timers.

use tokio::sync::oneshot;

use super::RefreshError;
use crate::token::Token;

pub(crate) type RefreshOutcome = Result<Token, RefreshError>;

/// A caller waiting for the running refresh cycle to finish
#[derive(Debug)]
pub struct RefreshWaiter {
    ticket: usize,
    sender: oneshot::Sender<RefreshOutcome>,
}

impl RefreshWaiter {
    pub(crate) fn channel() -> (oneshot::Sender<RefreshOutcome>, oneshot::Receiver<RefreshOutcome>) {
        oneshot::channel()
    }

    /// Position in the cycle's queue, starting at 0 for the initiator
    pub fn ticket(&self) -> usize {
        self.ticket
    }

    /// Hand the cycle's outcome to the waiting caller
    pub(crate) fn resolve(self, outcome: RefreshOutcome) {
        // The caller may have given up; nothing to do then.
        let _ = self.sender.send(outcome);
    }
}

/// Whether a caller started the cycle or joined one already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Initiator,
    Joined,
}

/// Refresh state owned by the coordinator
#[derive(Debug, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    InFlight { waiters: Vec<RefreshWaiter> },
}

impl RefreshState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }

    /// Number of callers waiting on the running cycle
    pub fn pending(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::InFlight { waiters } => waiters.len(),
        }
    }

    /// Register a caller, starting a cycle if none is running
    ///
    /// The check and the transition happen in one step: whoever gets
    /// [`Admission::Initiator`] is the only caller allowed to start the
    /// network exchange.
    pub(crate) fn admit(&mut self, sender: oneshot::Sender<RefreshOutcome>) -> Admission {
        match self {
            Self::Idle => {
                *self = Self::InFlight {
                    waiters: vec![RefreshWaiter { ticket: 0, sender }],
                };
                Admission::Initiator
            }
            Self::InFlight { waiters } => {
                let ticket = waiters.len();
                waiters.push(RefreshWaiter { ticket, sender });
                Admission::Joined
            }
        }
    }

    /// End the cycle, returning its waiters in arrival order
    pub(crate) fn finish(&mut self) -> Vec<RefreshWaiter> {
        match std::mem::take(self) {
            Self::Idle => Vec::new(),
            Self::InFlight { waiters } => waiters,
        }
    }
}
