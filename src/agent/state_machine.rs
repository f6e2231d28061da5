//! Cycle State Machine
//!
//! Tracks where one symbol's trading cycle is:
//! - Idle: between cycles
//! - Observing: fetching the snapshot and marking the open position
//! - Exiting: closing a position on a stop/take level
//! - Proposing: building the trade proposal
//! - Voting: waiting on the evaluator round
//! - Executing: placing the order and updating the position ledger
//! - Paused: trading halted by the operator or a circuit breaker
//! - Error: the cycle failed and was abandoned

use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Idle,
    Observing,
    Exiting,
    Proposing,
    Voting,
    Executing,
    Paused,
    Error,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::Idle => write!(f, "Idle"),
            CycleState::Observing => write!(f, "Observing"),
            CycleState::Exiting => write!(f, "Exiting"),
            CycleState::Proposing => write!(f, "Proposing"),
            CycleState::Voting => write!(f, "Voting"),
            CycleState::Executing => write!(f, "Executing"),
            CycleState::Paused => write!(f, "Paused"),
            CycleState::Error => write!(f, "Error"),
        }
    }
}

/// State transition record
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// Previous state
    pub from: CycleState,
    /// New state
    pub to: CycleState,
    /// Transition timestamp (unix millis)
    pub timestamp: i64,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Per-symbol cycle state machine
pub struct CycleStateMachine {
    /// Symbol this machine tracks
    symbol: String,
    /// Current state
    current: CycleState,
    /// Previous state
    previous: Option<CycleState>,
    /// When we entered current state
    state_entered_at: Instant,
    /// State history
    history: Vec<StateTransition>,
    /// Max history size
    max_history: usize,
}

impl CycleStateMachine {
    /// Create a new state machine for `symbol`, starting Idle
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current: CycleState::Idle,
            previous: None,
            state_entered_at: Instant::now(),
            history: Vec::new(),
            max_history: 100,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get current state
    pub fn current_state(&self) -> CycleState {
        self.current
    }

    pub fn previous_state(&self) -> Option<CycleState> {
        self.previous
    }

    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    /// Check if transition is valid
    pub fn can_transition_to(&self, target: CycleState) -> bool {
        use CycleState::*;

        match (self.current, target) {
            // From Idle
            (Idle, Observing) => true,
            (Idle, Paused) => true,

            // From Observing
            (Observing, Proposing) => true,
            (Observing, Exiting) => true,
            (Observing, Idle) => true, // No market data this cycle

            // From Exiting
            (Exiting, Idle) => true,

            // From Proposing
            (Proposing, Voting) => true,

            // From Voting
            (Voting, Executing) => true,
            (Voting, Idle) => true, // HOLD

            // From Executing
            (Executing, Idle) => true,

            // From Paused
            (Paused, Idle) => true,

            // From Error
            (Error, Idle) => true,
            (Error, Paused) => true,

            // Any in-flight state can fail
            (Observing | Exiting | Proposing | Voting | Executing, Error) => true,

            _ => false,
        }
    }

    /// Attempt state transition
    pub fn transition_to(&mut self, target: CycleState) -> bool {
        self.transition_to_with_reason(target, None)
    }

    pub fn transition_to_with_reason(&mut self, target: CycleState, reason: Option<String>) -> bool {
        if !self.can_transition_to(target) {
            warn!(
                "Invalid state transition for {}: {} -> {}",
                self.symbol, self.current, target
            );
            return false;
        }

        debug!(
            "State transition [{}]: {} -> {}{}",
            self.symbol,
            self.current,
            target,
            reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default()
        );

        self.history.push(StateTransition {
            from: self.current,
            to: target,
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason,
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        self.previous = Some(self.current);
        self.current = target;
        self.state_entered_at = Instant::now();
        true
    }

    /// Get state history
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// A cycle is in flight
    pub fn is_active(&self) -> bool {
        matches!(
            self.current,
            CycleState::Observing
                | CycleState::Exiting
                | CycleState::Proposing
                | CycleState::Voting
                | CycleState::Executing
        )
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.current, CycleState::Paused | CycleState::Error)
    }

    /// Abandon whatever was in flight and return to Idle
    pub fn reset(&mut self, reason: &str) {
        if self.current == CycleState::Idle {
            return;
        }
        if self.is_active() {
            self.transition_to_with_reason(CycleState::Error, Some(reason.to_string()));
        }
        self.transition_to_with_reason(CycleState::Idle, Some(reason.to_string()));
    }
}
