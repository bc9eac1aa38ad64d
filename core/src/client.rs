// Public client handle
use connman_proto::{
    service_path, BusConnector, BusError, ObjectList, ObjectPath, PropertyMap, Value,
};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::call::{decode_call_error, require_target, Category, PendingCall};
use crate::config::ConnmanConfig;
use crate::event::{AgentEvent, ConnectOutcome, ManagerEvent, ServiceEvent, TechnologyEvent};
use crate::ledger::{CallId, CallKey, CallTicket, CONNECT_SERVICE};
use crate::registry::{Subscribers, SubscriptionId};
use crate::runtime::{EventLoop, Shared};
use crate::telemetry::init_tracing;
use crate::{ConnmanError, Result};

/// Handle to a running client.
///
/// Blocking methods may be called from any thread except the event loop
/// thread (i.e. not from inside an event callback); there they fail with
/// [`ConnmanError::EventLoopThread`]. Dropping the handle shuts the client
/// down.
pub struct Connman {
    shared: Arc<Shared>,
    event_loop: EventLoop,
}

impl Connman {
    /// Connects, subscribes to daemon signals and, when asked to, registers
    /// the agent. Logging is set up at the configured level unless the
    /// application installed its own subscriber. Blocks until ready or the default init timeout elapses.
    pub fn init(connector: impl BusConnector, register_agent: bool) -> Result<Self> {
        Self::init_with_config(
            connector,
            ConnmanConfig::default().with_register_agent(register_agent),
        )
    }

    pub fn init_with_config(connector: impl BusConnector, config: ConnmanConfig) -> Result<Self> {
        Self::init_with_subscribers(connector, config, Arc::new(Subscribers::new()))
    }

    /// Like [`Connman::init_with_config`], with callbacks registered up
    /// front so no early signal is missed.
    pub fn init_with_subscribers(
        connector: impl BusConnector,
        config: ConnmanConfig,
        subscribers: Arc<Subscribers>,
    ) -> Result<Self> {
        // best effort: an application-installed subscriber is left alone
        if !init_tracing(config.log_level) {
            debug!(target: "connman::client", "tracing subscriber already installed");
        }
        info!(
            target: "connman::client",
            register_agent = config.register_agent,
            call_timeout = ?config.call_timeout,
            "initializing"
        );
        let (shared, event_loop) = EventLoop::start(Box::new(connector), config, subscribers)?;
        Ok(Self { shared, event_loop })
    }

    /// Stops the event loop, unregisters the agent and joins the loop
    /// thread.
    pub fn shutdown(mut self) {
        self.event_loop.stop();
    }

    /// `false` after shutdown, or after the loop stopped on a daemon
    /// contract violation. Blocking calls then fail with
    /// [`ConnmanError::NotRunning`].
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // ---- subscriptions ----

    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.shared.subscribers
    }

    pub fn subscribe_manager<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ManagerEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.manager.subscribe(Arc::new(f))
    }

    pub fn subscribe_technology<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&TechnologyEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.technology.subscribe(Arc::new(f))
    }

    pub fn subscribe_service<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.service.subscribe(Arc::new(f))
    }

    pub fn subscribe_agent<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.agent.subscribe(Arc::new(f))
    }

    // ---- manager ----

    /// Daemon state, e.g. `idle`, `ready` or `online`.
    pub fn get_state(&self) -> Result<String> {
        let value = self.get_property(Category::Manager, None, "State")?;
        match value {
            Value::Str(state) => Ok(state),
            other => Err(ConnmanError::BadProperty(format!(
                "Invalid state property {}",
                other
            ))),
        }
    }

    /// `true` only when the state is `online`; errors read as offline.
    pub fn get_online(&self) -> bool {
        matches!(self.get_state().as_deref(), Ok("online"))
    }

    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.set_property(Category::Manager, None, "OfflineMode", Value::from(offline))
    }

    pub fn list_technologies(&self) -> Result<ObjectList> {
        self.list(Category::Technology)
    }

    pub fn list_services(&self) -> Result<ObjectList> {
        self.list(Category::Service)
    }

    fn list(&self, category: Category) -> Result<ObjectList> {
        let shared = Arc::clone(&self.shared);
        self.block_on(async move { shared.properties.list(category).await })
    }

    // ---- properties ----

    pub fn get_property(&self, category: Category, target: Option<&str>, name: &str) -> Result<Value> {
        let shared = Arc::clone(&self.shared);
        let target = target.map(str::to_string);
        let name = name.to_string();
        self.block_on(async move {
            shared
                .properties
                .get_named(category, target.as_deref(), &name)
                .await
        })
    }

    pub fn set_property(
        &self,
        category: Category,
        target: Option<&str>,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let target = target.map(str::to_string);
        let name = name.to_string();
        self.block_on(async move {
            shared
                .properties
                .set_named(category, target.as_deref(), &name, value)
                .await
        })
    }

    // ---- technologies ----

    pub fn technology_enable(&self, technology: &str) -> Result<()> {
        self.set_powered(technology, true)
    }

    pub fn technology_disable(&self, technology: &str) -> Result<()> {
        self.set_powered(technology, false)
    }

    // Skips SetProperty when Powered already has the requested value.
    fn set_powered(&self, technology: &str, powered: bool) -> Result<()> {
        let current = self.get_property(Category::Technology, Some(technology), "Powered")?;
        let current = current.as_bool().ok_or_else(|| {
            ConnmanError::BadProperty(format!("Bad property 'Powered' on technology/{}", technology))
        })?;
        if current == powered {
            info!(target: "connman::client", technology, powered, "technology already in requested state");
            return Ok(());
        }
        self.set_property(
            Category::Technology,
            Some(technology),
            "Powered",
            Value::from(powered),
        )
    }

    pub fn technology_scan(&self, technology: &str) -> Result<()> {
        self.call(Category::Technology, technology, "Scan", vec![])
    }

    // ---- services ----

    /// Moves `service` after (or before) `target` in the service order.
    pub fn service_move(&self, service: &str, target: &str, after: bool) -> Result<()> {
        let target = require_target(Category::Service, Some(target))?;
        let target_path = ObjectPath::new(service_path(target))
            .map_err(|e| ConnmanError::IllegalArgument(e.to_string()))?;
        let method = if after { "MoveAfter" } else { "MoveBefore" };
        self.call(
            Category::Service,
            service,
            method,
            vec![Value::ObjectPath(target_path)],
        )
    }

    pub fn service_remove(&self, service: &str) -> Result<()> {
        self.call(Category::Service, service, "Remove", vec![])
    }

    pub fn service_disconnect(&self, service: &str) -> Result<()> {
        self.call(Category::Service, service, "Disconnect", vec![])
    }

    /// Starts connecting `service` and returns the id of the in-flight
    /// call. `on_complete` runs once, on the event loop thread, when the
    /// connect finishes. While the connect is in flight the daemon may ask
    /// for input through the agent.
    pub fn service_connect<F>(&self, service: &str, on_complete: F) -> Result<CallId>
    where
        F: FnOnce(&ConnectOutcome) + Send + 'static,
    {
        let service = require_target(Category::Service, Some(service))?;
        let shared = &self.shared;

        // Create, start and record under one lock so the completion, which
        // needs the same lock, always sees a fully populated entry.
        let mut ledger = shared.ledger.lock();
        let ticket = ledger.create(Category::Service, Some(service), CONNECT_SERVICE, "Connect")?;

        let completion_shared = Arc::clone(shared);
        let completion_ticket = ticket.clone();
        let started = shared.gateway.call_async(
            &shared.runtime,
            Category::Service,
            Some(service),
            "Connect",
            vec![],
            move |result| {
                tokio::spawn(connect_finished(completion_shared, completion_ticket, result));
            },
        );

        match started {
            Ok(pending) => {
                if let Some(entry) = ledger.get_mut(&ticket) {
                    entry.pending = Some(pending);
                    entry.completion = Some(Box::new(on_complete));
                }
                info!(target: "connman::client", service, id = %ticket.id(), "connect started");
                Ok(ticket.id())
            }
            Err(e) => {
                ledger.destroy(&ticket);
                Err(e)
            }
        }
    }

    /// Cancels an in-flight connect. Its completion still runs, reporting
    /// the cancellation. Returns `false` if no connect is pending.
    pub fn service_connect_cancel(&self, service: &str) -> bool {
        let mut ledger = self.shared.ledger.lock();
        let key = CallKey::new(Category::Service, Some(service), CONNECT_SERVICE);
        ledger
            .find_mut(&key)
            .and_then(|entry| entry.pending.as_mut())
            .map_or(false, PendingCall::cancel)
    }

    // ---- agent ----

    /// Answers an [`AgentEvent`]. Safe to call from inside the agent
    /// callback.
    pub fn agent_respond(&self, id: CallId, fields: PropertyMap) -> Result<()> {
        match &self.shared.agent {
            Some(agent) => agent.respond(id, fields),
            None => Err(ConnmanError::Unimplemented("agent is not registered".into())),
        }
    }

    pub fn is_agent_registered(&self) -> bool {
        self.shared.agent.is_some()
    }

    pub fn agent_path(&self) -> Option<&str> {
        self.shared
            .agent_registration
            .as_ref()
            .map(|r| r.path.as_str())
    }

    /// Id of the live call for (category, target, method), if any.
    pub fn pending_call(&self, category: Category, target: Option<&str>, method: &str) -> Option<CallId> {
        self.shared.ledger.find(category, target, method).map(|info| info.id)
    }

    // ---- plumbing ----

    fn call(&self, category: Category, target: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let target = target.to_string();
        let method = method.to_string();
        self.block_on(async move {
            shared
                .gateway
                .call(category, Some(&target), &method, args)
                .await
                .map(|_| ())
        })
    }

    // Runs `fut` on the event loop and waits for its output.
    fn block_on<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.on_loop_thread() {
            return Err(ConnmanError::EventLoopThread);
        }
        if !self.shared.is_running() {
            return Err(ConnmanError::NotRunning);
        }
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.shared.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.recv().map_err(|_| ConnmanError::NotRunning)?
    }
}

async fn connect_finished(
    shared: Arc<Shared>,
    ticket: CallTicket,
    result: std::result::Result<Vec<Value>, BusError>,
) {
    let service = ticket.key().target.clone().unwrap_or_default();
    let error = match result {
        Ok(_) => None,
        Err(raw) => {
            let err = decode_call_error(Category::Service, Some(&service), "Connect", raw);
            Some(connect_error_message(&shared, &service, err).await)
        }
    };

    let completion = shared
        .ledger
        .lock()
        .get_mut(&ticket)
        .and_then(|entry| entry.completion.take());

    let outcome = ConnectOutcome { service, error };
    match &outcome.error {
        None => info!(target: "connman::client", service = %outcome.service, "service connected"),
        Some(e) => error!(target: "connman::client", service = %outcome.service, error = %e, "connect failed"),
    }
    match completion {
        Some(on_complete) => {
            // the entry must go away even if the application callback panics
            if panic::catch_unwind(AssertUnwindSafe(|| on_complete(&outcome))).is_err() {
                error!(target: "connman::client", service = %outcome.service, "connect completion panicked");
            }
        }
        None => debug!(target: "connman::client", id = %ticket.id(), "connect finished without completion"),
    }

    shared.ledger.destroy(&ticket);
}

// The daemon's own reason, from the service's Error property, beats the
// transport message. The property is cleared once read.
async fn connect_error_message(shared: &Shared, service: &str, err: ConnmanError) -> String {
    match shared
        .properties
        .get_named(Category::Service, Some(service), "Error")
        .await
    {
        Ok(Value::Str(reason)) => {
            if let Err(e) = shared
                .gateway
                .call(Category::Service, Some(service), "ClearProperty", vec![Value::from("Error")])
                .await
            {
                debug!(target: "connman::client", service, error = %e, "unable to clear Error property");
            }
            reason
        }
        _ => err.to_string(),
    }
}
