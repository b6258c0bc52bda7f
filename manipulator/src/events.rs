//! Notifications published by the manager and the append-only transaction log.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::models::{AxisId, Waypoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventScope {
    Axis(AxisId),
    All,
    Path,
}

impl fmt::Display for EventScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventScope::Axis(axis) => write!(f, "{axis}"),
            EventScope::All => f.write_str("ALL"),
            EventScope::Path => f.write_str("PATH"),
        }
    }
}

impl From<AxisId> for EventScope {
    fn from(axis: AxisId) -> Self {
        EventScope::Axis(axis)
    }
}

/// One entry of the transaction log.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusEvent {
    pub timestamp: SystemTime,
    pub scope: EventScope,
    pub action: String,
    pub description: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Status(String),
    Position {
        axis: AxisId,
        position: f64,
    },
    Error {
        scope: EventScope,
        message: String,
    },
    ConnectionChanged {
        axis: AxisId,
        connected: bool,
    },
    Progress {
        index: usize,
        fraction: f64,
        remaining_secs: f64,
    },
    PatternCompleted,
    PointReached(Waypoint),
    Transaction(ModbusEvent),
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ManagerEvent);
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: broadcast::Sender<ManagerEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::Status(message) => info!(%message, "status"),
            ManagerEvent::Position { axis, position } => debug!(%axis, position, "position"),
            ManagerEvent::Error { scope, message } => error!(%scope, %message, "error"),
            ManagerEvent::ConnectionChanged { axis, connected } => {
                info!(%axis, connected, "connection changed")
            }
            ManagerEvent::Progress {
                index,
                fraction,
                remaining_secs,
            } => info!(index, fraction, remaining_secs, "progress"),
            ManagerEvent::PatternCompleted => info!("pattern completed"),
            ManagerEvent::PointReached(point) => info!(?point, "point reached"),
            ManagerEvent::Transaction(entry) => debug!(
                scope = %entry.scope,
                action = %entry.action,
                description = %entry.description,
                raw = %entry.raw,
                "transaction"
            ),
        }
    }
}

/// Publishes to several sinks in order.
pub struct FanOut(pub Vec<Arc<dyn EventSink>>);

impl EventSink for FanOut {
    fn publish(&self, event: ManagerEvent) {
        for sink in &self.0 {
            sink.publish(event.clone());
        }
    }
}

/// Append-only record of register-level activity, shared by the manager and
/// every axis controller.
pub struct TransactionLog {
    entries: Mutex<Vec<ModbusEvent>>,
    sink: Arc<dyn EventSink>,
}

impl TransactionLog {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn record(
        &self,
        scope: impl Into<EventScope>,
        action: &str,
        description: impl Into<String>,
        raw: impl Into<String>,
    ) {
        let entry = ModbusEvent {
            timestamp: SystemTime::now(),
            scope: scope.into(),
            action: action.to_string(),
            description: description.into(),
            raw: raw.into(),
        };

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        self.sink.publish(ManagerEvent::Transaction(entry));
    }

    pub fn snapshot(&self) -> Vec<ModbusEvent> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }
}
