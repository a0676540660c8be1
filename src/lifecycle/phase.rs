//! Session phase state machine
//!
//! ```text
//!            SessionRestored / LoggedIn
//!  Booting ─────────────────────────────► Authenticated ◄──┐
//!     │                                      │    │        │ LoggedIn
//!     │ NoSession / SessionEnded / LoggedOut │    └────────┘
//!     ▼                                      │ LoggedOut / SessionEnded
//!  Unauthenticated ◄─────────────────────────┘
//!     │ LoggedIn
//!     └──────────────────────────────────────► Authenticated
//! ```
//!
//! Nothing leads back to `Booting`.

use std::sync::{Mutex, MutexGuard};

use rust_fsm::*;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

state_machine! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub session_machine(Booting)

    Booting => {
        SessionRestored => Authenticated,
        LoggedIn => Authenticated,
        NoSession => Unauthenticated,
        SessionEnded => Unauthenticated,
        LoggedOut => Unauthenticated
    },
    Authenticated => {
        LoggedIn => Authenticated,
        LoggedOut => Unauthenticated,
        SessionEnded => Unauthenticated
    },
    Unauthenticated => {
        LoggedIn => Authenticated
    }
}

pub use session_machine::Input as PhaseInput;
use session_machine::State as MachineState;
use session_machine::StateMachine as SessionMachine;

/// Where the session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Stored credentials have not been checked yet
    Booting,
    Authenticated,
    Unauthenticated,
}

impl SessionPhase {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionPhase::Authenticated)
    }
}

impl From<&MachineState> for SessionPhase {
    fn from(state: &MachineState) -> Self {
        match state {
            MachineState::Booting => SessionPhase::Booting,
            MachineState::Authenticated => SessionPhase::Authenticated,
            MachineState::Unauthenticated => SessionPhase::Unauthenticated,
        }
    }
}

/// Owns the phase machine and broadcasts every change
#[derive(Debug)]
pub struct PhaseTracker {
    machine: Mutex<SessionMachine>,
    sender: watch::Sender<SessionPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let machine = SessionMachine::new();
        let (sender, _) = watch::channel(SessionPhase::from(machine.state()));
        Self {
            machine: Mutex::new(machine),
            sender,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from(self.machine().state())
    }

    /// Receiver that observes every later phase change
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.sender.subscribe()
    }

    /// Feed an input to the machine
    ///
    /// Inputs with no transition from the current phase are ignored.
    /// Returns the phase after the input.
    pub fn apply(&self, input: PhaseInput) -> SessionPhase {
        let mut machine = self.machine();
        let before = SessionPhase::from(machine.state());

        if machine.consume(&input).is_err() {
            debug!(phase = ?before, input = ?input, "Ignoring impossible session transition");
            return before;
        }

        let after = SessionPhase::from(machine.state());
        if after != before {
            info!(from = ?before, to = ?after, "Session phase changed");
        }
        // Sent under the machine lock so observers see changes in order.
        self.sender.send_replace(after);
        after
    }

    pub fn session_restored(&self) -> SessionPhase {
        self.apply(PhaseInput::SessionRestored)
    }

    pub fn no_session(&self) -> SessionPhase {
        self.apply(PhaseInput::NoSession)
    }

    pub fn logged_in(&self) -> SessionPhase {
        self.apply(PhaseInput::LoggedIn)
    }

    pub fn logged_out(&self) -> SessionPhase {
        self.apply(PhaseInput::LoggedOut)
    }

    /// The session can no longer be refreshed
    pub fn session_ended(&self) -> SessionPhase {
        self.apply(PhaseInput::SessionEnded)
    }

    fn machine(&self) -> MutexGuard<'_, SessionMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }
}
