// Connman client shared bus types
//
// Everything the client core needs to speak to the network daemon without
// knowing which bus library carries the bytes.

pub mod error;
pub mod memory;
pub mod transport;
pub mod value;

pub use error::BusError;
pub use transport::{
    BusConnection, BusConnector, BusSignal, InboundCall, InboundStream, MethodCall, MethodReply,
    SignalStream,
};
pub use value::{strip_path, ObjectList, ObjectPath, PropertyMap, Value};

use std::time::Duration;

/// Well-known bus name of the network daemon.
pub const CONNMAN_SERVICE: &str = "net.connman";

pub const MANAGER_INTERFACE: &str = "net.connman.Manager";
pub const TECHNOLOGY_INTERFACE: &str = "net.connman.Technology";
pub const SERVICE_INTERFACE: &str = "net.connman.Service";
pub const AGENT_INTERFACE: &str = "net.connman.Agent";

pub const MANAGER_PATH: &str = "/";
pub const CONNMAN_PATH: &str = "/net/connman";
pub const TECHNOLOGY_PREFIX: &str = "/net/connman/technology";
pub const SERVICE_PREFIX: &str = "/net/connman/service";

/// Well-known name claimed before the agent object is exported.
pub const AGENT_SERVICE: &str = "org.agent";

/// Reply timeout for every outbound call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on how long init waits for the event loop.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error names exchanged on the bus.
pub mod errors {
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const AGENT_CANCELED: &str = "net.connman.Agent.Error.Canceled";
}

/// Object path of a technology, e.g. `/net/connman/technology/wifi`.
pub fn technology_path(name: &str) -> String {
    format!("{}/{}", TECHNOLOGY_PREFIX, name)
}

/// Object path of a service, e.g. `/net/connman/service/wifi_dead_beef`.
pub fn service_path(name: &str) -> String {
    format!("{}/{}", SERVICE_PREFIX, name)
}

/// Default object path for this process' agent.
pub fn default_agent_path() -> String {
    format!("{}/agent{}", CONNMAN_PATH, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_join_prefix_and_name() {
        assert_eq!(technology_path("wifi"), "/net/connman/technology/wifi");
        assert_eq!(service_path("svc0"), "/net/connman/service/svc0");
        assert!(default_agent_path().starts_with("/net/connman/agent"));
    }
}
