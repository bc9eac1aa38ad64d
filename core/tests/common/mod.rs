//! Shared fixtures for the integration tests: a programmed in-memory daemon
//! and a few waiting helpers.
#![allow(dead_code)]

use connman_core::ConnmanConfig;
use connman_proto::memory::InMemoryBus;
use connman_proto::{ObjectList, ObjectPath, PropertyMap, Value, MANAGER_PATH};
use crossbeam::channel::Receiver;
use std::time::{Duration, Instant};

pub const AGENT_PATH: &str = "/net/connman/agenttest";
pub const AGENT_NAME: &str = "org.agent";

pub const WAIT: Duration = Duration::from_secs(5);

pub fn path(p: &str) -> ObjectPath {
    ObjectPath::new(p).expect("valid object path")
}

pub fn technologies() -> ObjectList {
    let mut list = ObjectList::new();
    list.push(
        path("/net/connman/technology/wifi"),
        PropertyMap::new()
            .with("Name", "WiFi")
            .with("Type", "wifi")
            .with("Powered", true),
    );
    list.push(
        path("/net/connman/technology/ethernet"),
        PropertyMap::new()
            .with("Name", "Wired")
            .with("Type", "ethernet")
            .with("Powered", false),
    );
    list
}

pub fn services() -> ObjectList {
    let mut list = ObjectList::new();
    list.push(
        path("/net/connman/service/svc0"),
        PropertyMap::new()
            .with("Name", "HomeNet")
            .with("State", "idle")
            .with("Strength", 72u8),
    );
    list.push(
        path("/net/connman/service/svc1"),
        PropertyMap::new().with("Name", "Office").with("State", "idle"),
    );
    list
}

/// A daemon answering the bulk queries and agent registration.
pub fn daemon() -> InMemoryBus {
    let bus = InMemoryBus::new();
    bus.reply(
        MANAGER_PATH,
        "GetProperties",
        vec![Value::Dict(
            PropertyMap::new()
                .with("State", "idle")
                .with("OfflineMode", false),
        )],
    );
    bus.reply(MANAGER_PATH, "GetTechnologies", vec![technologies().to_value()]);
    bus.reply(MANAGER_PATH, "GetServices", vec![services().to_value()]);
    bus.reply(MANAGER_PATH, "RegisterAgent", vec![]);
    bus.reply(MANAGER_PATH, "UnregisterAgent", vec![]);
    bus
}

pub fn config(register_agent: bool) -> ConnmanConfig {
    ConnmanConfig {
        register_agent,
        call_timeout: Duration::from_secs(5),
        init_timeout: Duration::from_secs(5),
        agent_name: AGENT_NAME.to_string(),
        agent_path: Some(AGENT_PATH.to_string()),
        ..ConnmanConfig::default()
    }
}

pub fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(WAIT).expect("timed out waiting for event")
}

/// Polls `check` until it holds or the wait budget runs out.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

/// Single-threaded runtime for driving the fake daemon from a plain test.
pub fn daemon_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}
