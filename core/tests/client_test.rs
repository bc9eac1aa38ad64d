mod common;

use common::{config, daemon, path, recv};
use connman_core::{Category, Connman, ConnmanError, ErrorKind, Value};
use connman_proto::errors::UNKNOWN_OBJECT;
use connman_proto::{BusError, PropertyMap, MANAGER_INTERFACE, MANAGER_PATH};
use std::sync::{Arc, OnceLock, Weak};

#[test]
fn state_is_read_on_demand() {
    let bus = daemon();
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    assert_eq!(client.get_state().unwrap(), "idle");
    assert!(!client.get_online());

    bus.reply(
        MANAGER_PATH,
        "GetProperties",
        vec![Value::Dict(PropertyMap::new().with("State", "online"))],
    );
    assert!(client.get_online());
    assert_eq!(bus.call_count("GetProperties"), 2);
}

#[test]
fn non_string_state_is_rejected() {
    let bus = daemon();
    bus.reply(
        MANAGER_PATH,
        "GetProperties",
        vec![Value::Dict(PropertyMap::new().with("State", 3i32))],
    );
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    let err = client.get_state().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadProperty);
    assert!(!client.get_online());
}

#[test]
fn enable_skips_technologies_already_powered() {
    let bus = daemon();
    bus.reply("/net/connman/technology/ethernet", "SetProperty", vec![]);
    bus.reply("/net/connman/technology/wifi", "SetProperty", vec![]);
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    client.technology_enable("wifi").unwrap();
    assert_eq!(bus.call_count("SetProperty"), 0);

    client.technology_enable("ethernet").unwrap();
    client.technology_disable("ethernet").unwrap();
    let sets: Vec<_> = bus
        .calls()
        .into_iter()
        .filter(|c| c.member == "SetProperty")
        .collect();
    // ethernet still reports Powered=false, so only the enable goes out
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].path, "/net/connman/technology/ethernet");
    assert_eq!(sets[0].args, vec![Value::from("Powered"), Value::from(true)]);
}

#[test]
fn unknown_technology_has_no_powered_property() {
    let bus = daemon();
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    let err = client.technology_enable("bluetooth").unwrap_err();
    assert_eq!(err.to_string(), "Bad property 'Powered' on technology/bluetooth");
}

#[test]
fn missing_target_never_reaches_the_daemon() {
    let bus = daemon();
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    assert!(matches!(
        client.technology_enable(""),
        Err(ConnmanError::MissingArgument(Category::Technology))
    ));
    assert!(matches!(
        client.technology_scan(""),
        Err(ConnmanError::MissingArgument(Category::Technology))
    ));
    assert!(matches!(
        client.service_remove(""),
        Err(ConnmanError::MissingArgument(Category::Service))
    ));
    assert!(matches!(
        client.service_move("svc0", "", true),
        Err(ConnmanError::MissingArgument(Category::Service))
    ));
    assert!(matches!(
        client.service_connect("", |_| {}),
        Err(ConnmanError::MissingArgument(Category::Service))
    ));
    assert!(bus.calls().is_empty());
}

#[test]
fn unknown_objects_are_remapped() {
    let bus = daemon();
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    assert!(matches!(
        client.technology_scan("bogus"),
        Err(ConnmanError::UnknownTechnology(ref t)) if t == "bogus"
    ));
    assert!(matches!(
        client.service_remove("ghost"),
        Err(ConnmanError::UnknownService(ref s)) if s == "ghost"
    ));
    assert!(matches!(
        client.set_property(Category::Technology, Some("bogus"), "Powered", Value::from(true)),
        Err(ConnmanError::UnknownProperty { category: Category::Technology, .. })
    ));
}

#[test]
fn other_daemon_errors_pass_through() {
    let bus = daemon();
    bus.fail(
        "/net/connman/service/svc0",
        "Disconnect",
        BusError::remote("net.connman.Error.NotConnected", "Not connected"),
    );
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    let err = client.service_disconnect("svc0").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(err.to_string(), "Not connected");

    bus.fail(
        "/net/connman/technology/wifi",
        "Scan",
        BusError::remote(UNKNOWN_OBJECT, "gone"),
    );
    assert!(matches!(
        client.technology_scan("wifi"),
        Err(ConnmanError::UnknownTechnology(_))
    ));
}

#[test]
fn move_passes_target_object_path() {
    let bus = daemon();
    bus.reply("/net/connman/service/svc0", "MoveAfter", vec![]);
    bus.reply("/net/connman/service/svc0", "MoveBefore", vec![]);
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    client.service_move("svc0", "svc1", true).unwrap();
    client.service_move("svc0", "svc1", false).unwrap();

    let calls = bus.calls();
    assert_eq!(calls[0].member, "MoveAfter");
    assert_eq!(calls[1].member, "MoveBefore");
    assert_eq!(
        calls[0].args,
        vec![Value::ObjectPath(path("/net/connman/service/svc1"))]
    );
}

#[test]
fn offline_mode_is_set_on_the_manager() {
    let bus = daemon();
    bus.reply(MANAGER_PATH, "SetProperty", vec![]);
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    client.set_offline(true).unwrap();
    let call = bus.calls().pop().unwrap();
    assert_eq!(call.path, MANAGER_PATH);
    assert_eq!(call.interface, MANAGER_INTERFACE);
    assert_eq!(call.args, vec![Value::from("OfflineMode"), Value::from(true)]);
}

#[test]
fn listing_and_property_lookup() {
    let bus = daemon();
    let client = Connman::init_with_config(bus.connector(), config(false)).expect("init");

    let technologies = client.list_technologies().unwrap();
    assert_eq!(technologies.len(), 2);
    let services = client.list_services().unwrap();
    assert_eq!(
        services
            .get("/net/connman/service/svc1")
            .and_then(|p| p.get("Name"))
            .and_then(Value::as_str),
        Some("Office")
    );

    let strength = client
        .get_property(Category::Service, Some("svc0"), "Strength")
        .unwrap();
    assert_eq!(strength, Value::from(72u8));
    assert!(matches!(
        client.get_property(Category::Service, Some("svc0"), "Ethernet"),
        Err(ConnmanError::BadProperty(_))
    ));
}

#[test]
fn blocking_calls_are_refused_on_the_event_loop() {
    let bus = daemon();
    let client = Arc::new(Connman::init_with_config(bus.connector(), config(false)).expect("init"));

    let handle: Arc<OnceLock<Weak<Connman>>> = Arc::new(OnceLock::new());
    handle.set(Arc::downgrade(&client)).expect("set once");

    let (tx, rx) = crossbeam::channel::unbounded();
    let h = Arc::clone(&handle);
    client.subscribe_manager(move |_| {
        if let Some(client) = h.get().and_then(Weak::upgrade) {
            let _ = tx.send(client.get_state().map_err(|e| e.kind()));
        }
    });

    bus.emit_signal(
        MANAGER_PATH,
        MANAGER_INTERFACE,
        "PropertyChanged",
        vec![Value::from("State"), Value::from("ready")],
    );
    assert_eq!(recv(&rx), Err(ErrorKind::Lifecycle));

    // still usable from other threads
    assert_eq!(client.get_state().unwrap(), "idle");
}
