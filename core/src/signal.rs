// Signal dispatcher: daemon signals -> typed events -> registries
use connman_proto::{
    strip_path, BusSignal, SignalStream, Value, MANAGER_INTERFACE, MANAGER_PATH,
    SERVICE_INTERFACE, SERVICE_PREFIX, TECHNOLOGY_INTERFACE, TECHNOLOGY_PREFIX,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::event::{ManagerEvent, ServiceEvent, TechnologyEvent};
use crate::registry::Subscribers;

/// One signal subscription, by interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalChannel {
    Manager,
    Technology,
    Service,
}

impl SignalChannel {
    pub const ALL: [SignalChannel; 3] = [
        SignalChannel::Manager,
        SignalChannel::Technology,
        SignalChannel::Service,
    ];

    pub fn interface(self) -> &'static str {
        match self {
            SignalChannel::Manager => MANAGER_INTERFACE,
            SignalChannel::Technology => TECHNOLOGY_INTERFACE,
            SignalChannel::Service => SERVICE_INTERFACE,
        }
    }
}

impl fmt::Display for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.interface())
    }
}

pub struct SignalDispatcher {
    subscribers: Arc<Subscribers>,
}

impl SignalDispatcher {
    pub fn new(subscribers: Arc<Subscribers>) -> Self {
        Self { subscribers }
    }

    /// Routes `signal` received on `channel` to the matching handler.
    pub fn dispatch(&self, channel: SignalChannel, signal: &BusSignal) {
        match channel {
            SignalChannel::Manager => self.handle_manager(signal),
            SignalChannel::Technology => self.handle_technology(signal),
            SignalChannel::Service => self.handle_service(signal),
        }
    }

    /// Manager signals. Only the manager object at `/` is accepted.
    pub fn handle_manager(&self, signal: &BusSignal) {
        if signal.path != MANAGER_PATH || signal.interface != MANAGER_INTERFACE {
            return;
        }
        let registry = &self.subscribers.manager;

        match signal.member.as_str() {
            "TechnologyAdded" => match signal.args.as_slice() {
                [path, Value::Dict(properties)] if path_arg(path).is_some() => {
                    registry.dispatch(&ManagerEvent::TechnologyAdded {
                        technology: basename(path).to_string(),
                        properties: properties.clone(),
                    });
                }
                _ => malformed(signal),
            },
            "TechnologyRemoved" => match signal.args.as_slice() {
                [path] if path_arg(path).is_some() => {
                    registry.dispatch(&ManagerEvent::TechnologyRemoved {
                        technology: basename(path).to_string(),
                    });
                }
                _ => malformed(signal),
            },
            "ServicesChanged" => match signal.args.as_slice() {
                [Value::Array(changed), Value::Array(removed)] => {
                    self.services_changed(signal, changed, removed)
                }
                _ => malformed(signal),
            },
            "PropertyChanged" => match signal.args.as_slice() {
                [Value::Str(name), value] => {
                    registry.dispatch(&ManagerEvent::PropertyChanged {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
                _ => malformed(signal),
            },
            other => debug!(target: "connman::signal", member = other, "ignoring manager signal"),
        }
    }

    // Changed entries with an empty property set carry no news and are skipped.
    fn services_changed(&self, signal: &BusSignal, changed: &[Value], removed: &[Value]) {
        let registry = &self.subscribers.manager;

        for item in changed {
            match item.as_struct() {
                Some([path, Value::Dict(properties)]) if path_arg(path).is_some() => {
                    if properties.is_empty() {
                        continue;
                    }
                    registry.dispatch(&ManagerEvent::ServiceChanged {
                        service: basename(path).to_string(),
                        properties: properties.clone(),
                    });
                }
                _ => malformed(signal),
            }
        }

        for path in removed {
            if path_arg(path).is_none() {
                malformed(signal);
                continue;
            }
            registry.dispatch(&ManagerEvent::ServiceRemoved {
                service: basename(path).to_string(),
            });
        }
    }

    pub fn handle_technology(&self, signal: &BusSignal) {
        if let Some((technology, name, value)) =
            property_change(signal, TECHNOLOGY_PREFIX, TECHNOLOGY_INTERFACE)
        {
            self.subscribers.technology.dispatch(&TechnologyEvent {
                technology,
                name,
                value,
            });
        }
    }

    pub fn handle_service(&self, signal: &BusSignal) {
        if let Some((service, name, value)) =
            property_change(signal, SERVICE_PREFIX, SERVICE_INTERFACE)
        {
            self.subscribers.service.dispatch(&ServiceEvent {
                service,
                name,
                value,
            });
        }
    }

    /// Drains `stream` until the subscription ends.
    pub(crate) async fn run(self: Arc<Self>, channel: SignalChannel, mut stream: SignalStream) {
        debug!(target: "connman::signal", %channel, "signal subscription active");
        while let Some(signal) = stream.recv().await {
            self.dispatch(channel, &signal);
        }
        debug!(target: "connman::signal", %channel, "signal subscription closed");
    }
}

/// `PropertyChanged(s, v)` on an object under `prefix`.
fn property_change(
    signal: &BusSignal,
    prefix: &str,
    interface: &str,
) -> Option<(String, String, Value)> {
    let under_prefix = signal
        .path
        .strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('/'));
    if !under_prefix || signal.interface != interface {
        return None;
    }
    if signal.member != "PropertyChanged" {
        debug!(target: "connman::signal", member = %signal.member, path = %signal.path, "ignoring signal");
        return None;
    }
    match signal.args.as_slice() {
        [Value::Str(name), value] => Some((
            basename_of(&signal.path).to_string(),
            name.clone(),
            value.clone(),
        )),
        _ => {
            malformed(signal);
            None
        }
    }
}

fn path_arg(value: &Value) -> Option<&str> {
    match value {
        Value::ObjectPath(p) => Some(p.as_str()),
        Value::Str(s) if s.starts_with('/') => Some(s),
        _ => None,
    }
}

fn basename(value: &Value) -> &str {
    basename_of(path_arg(value).unwrap_or_default())
}

// A daemon object path always names an object; an empty basename means
// the daemon broke the protocol.
fn basename_of(path: &str) -> &str {
    strip_path(path).unwrap_or_else(|| panic!("object path '{}' has no basename", path))
}

fn malformed(signal: &BusSignal) {
    warn!(
        target: "connman::signal",
        member = %signal.member,
        path = %signal.path,
        args = ?signal.args,
        "dropping signal with unexpected arguments"
    );
}
