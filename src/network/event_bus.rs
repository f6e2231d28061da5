//! Event Bus for Internal Communication
//!
//! Broadcast-based event system that decouples the trading loop from its
//! observers (alerting, logging). Delivery is best effort: a lagging
//! subscriber skips events, so nothing the ledgers depend on travels here.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::engines::volatility::Regime;
use crate::position::Position;
use crate::utils::types::{ConsensusResult, TradeProposal};

/// Event types that can be broadcast through the system
#[derive(Debug, Clone)]
pub enum Event {
    // Decision events
    ProposalCreated {
        proposal: TradeProposal,
    },
    ConsensusReached {
        result: ConsensusResult,
    },

    // Market regime
    RegimeChanged {
        from: Regime,
        to: Regime,
        reading: f64,
        threshold: f64,
    },

    // Evaluator backend
    BackendHealthChanged {
        healthy: bool,
        detail: String,
    },

    // Position events
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        position: Position,
    },
    ExecutionFailed {
        symbol: String,
        reason: String,
    },

    // Weight ledger
    WeightsUpdated {
        weights: Vec<(String, f64)>,
    },
    LedgerInvariantViolation {
        detail: String,
    },

    // System events
    SystemPause {
        reason: String,
    },
    SystemResume,
    Heartbeat {
        timestamp: i64,
    },
}

impl Event {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProposalCreated { .. } => "proposal_created",
            Event::ConsensusReached { .. } => "consensus_reached",
            Event::RegimeChanged { .. } => "regime_changed",
            Event::BackendHealthChanged { .. } => "backend_health_changed",
            Event::PositionOpened { .. } => "position_opened",
            Event::PositionClosed { .. } => "position_closed",
            Event::ExecutionFailed { .. } => "execution_failed",
            Event::WeightsUpdated { .. } => "weights_updated",
            Event::LedgerInvariantViolation { .. } => "ledger_invariant_violation",
            Event::SystemPause { .. } => "system_pause",
            Event::SystemResume => "system_resume",
            Event::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Event bus for broadcasting events to multiple subscribers
pub struct EventBus {
    /// Broadcast sender
    sender: broadcast::Sender<Event>,
    /// Channel capacity
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Get a sender for publishing events
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.sender.clone()
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(count) => {
                debug!("Event {} sent to {} receivers", kind, count);
            }
            Err(_) => {
                // No receivers - this is fine during startup/shutdown
                debug!("No receivers for event {}", kind);
            }
        }
    }

    /// Get number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event processor that handles events from the bus
pub struct EventProcessor {
    receiver: broadcast::Receiver<Event>,
    /// Name for logging
    name: String,
}

impl EventProcessor {
    pub fn new(bus: &EventBus, name: &str) -> Self {
        Self {
            receiver: bus.subscribe(),
            name: name.to_string(),
        }
    }

    /// Wait for the next event. Lagged messages are skipped with a warning.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!("Event processor '{}' lagged by {} messages", self.name, count);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for processor '{}'", self.name);
                    return None;
                }
            }
        }
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// Helper to create typed event handlers
pub fn spawn_event_handler<F, Fut>(
    bus: &EventBus,
    name: &str,
    mut handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Event) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut processor = EventProcessor::new(bus, name);
    let name = name.to_string();

    tokio::spawn(async move {
        debug!("Event handler '{}' started", name);
        while let Some(event) = processor.next().await {
            handler(event).await;
        }
        debug!("Event handler '{}' stopped", name);
    })
}
