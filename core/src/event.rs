// Typed events delivered to application callbacks
use connman_proto::{PropertyMap, Value};
use serde::Serialize;

use crate::ledger::CallId;

/// Manager-level change reported by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    TechnologyAdded {
        technology: String,
        properties: PropertyMap,
    },
    TechnologyRemoved {
        technology: String,
    },
    /// A service was added or changed. Only the properties that changed
    /// are present.
    ServiceChanged {
        service: String,
        properties: PropertyMap,
    },
    ServiceRemoved {
        service: String,
    },
    PropertyChanged {
        name: String,
        value: Value,
    },
}

impl ManagerEvent {
    /// Technology name, service name or property name the event is about.
    pub fn subject(&self) -> &str {
        match self {
            ManagerEvent::TechnologyAdded { technology, .. }
            | ManagerEvent::TechnologyRemoved { technology } => technology,
            ManagerEvent::ServiceChanged { service, .. }
            | ManagerEvent::ServiceRemoved { service } => service,
            ManagerEvent::PropertyChanged { name, .. } => name,
        }
    }
}

/// A technology property changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechnologyEvent {
    pub technology: String,
    pub name: String,
    pub value: Value,
}

/// A service property changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceEvent {
    pub service: String,
    pub name: String,
    pub value: Value,
}

/// The daemon asked for input while connecting `service`. Answer with
/// [`crate::Connman::agent_respond`] using `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentEvent {
    pub service: String,
    pub id: CallId,
    pub fields: PropertyMap,
}

/// Result of an asynchronous connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOutcome {
    pub service: String,
    /// `None` on success
    pub error: Option<String>,
}

impl ConnectOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Completion callback for an asynchronous connect.
pub type ConnectCallback = Box<dyn FnOnce(&ConnectOutcome) + Send + 'static>;
