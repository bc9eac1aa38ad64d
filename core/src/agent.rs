// Agent protocol handler
//
// The daemon calls into our exported agent object while a connect is in
// flight. RequestInput is parked on the connect's ledger entry until the
// application answers through `AgentService::respond`.
use connman_proto::errors::{AGENT_CANCELED, INVALID_ARGS, UNKNOWN_METHOD};
use connman_proto::{
    strip_path, BusConnection, InboundCall, InboundStream, ObjectPath, PropertyMap, Value,
    AGENT_INTERFACE,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::call::{CallGateway, Category};
use crate::event::AgentEvent;
use crate::ledger::{AgentMethod, AgentRequest, CallId, CallKey, CallLedger, CONNECT_SERVICE};
use crate::registry::Subscribers;
use crate::{ConnmanError, Result};

/// Bus name and object path held while the agent is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRegistration {
    pub name: String,
    pub path: String,
}

pub struct AgentService {
    ledger: Arc<CallLedger>,
    subscribers: Arc<Subscribers>,
}

impl AgentService {
    pub fn new(ledger: Arc<CallLedger>, subscribers: Arc<Subscribers>) -> Self {
        Self {
            ledger,
            subscribers,
        }
    }

    /// Handles one inbound agent method call.
    pub fn handle_call(&self, call: InboundCall) {
        debug!(target: "connman::agent", member = %call.member, "agent method called");
        match call.member.as_str() {
            "RequestInput" => self.request_input(call),
            "ReportError" => report_error(call),
            other => {
                warn!(target: "connman::agent", member = other, "unknown agent method");
                call.reply.return_error(UNKNOWN_METHOD, "Unknown method");
            }
        }
    }

    fn request_input(&self, call: InboundCall) {
        let InboundCall { args, reply, .. } = call;
        let mut args = args.into_iter();
        let (path, fields) = match (args.next(), args.next(), args.next()) {
            (Some(Value::ObjectPath(path)), Some(Value::Dict(fields)), None) => (path, fields),
            _ => {
                warn!(target: "connman::agent", "RequestInput with unexpected arguments");
                reply.return_error(INVALID_ARGS, "Invalid arguments");
                return;
            }
        };
        let service = strip_path(path.as_str()).unwrap_or_default().to_string();
        let key = CallKey::new(Category::Service, Some(&service), CONNECT_SERVICE);

        let mut ledger = self.ledger.lock();
        let id = match ledger.find(&key).map(|entry| entry.id()) {
            Some(id) => id,
            None => {
                drop(ledger);
                info!(target: "connman::agent", %service, "input requested with no connection pending");
                reply.return_error(AGENT_CANCELED, "No connection pending");
                return;
            }
        };
        if let Some(entry) = ledger.find_by_id_mut(id) {
            let previous = entry.agent.replace(AgentRequest {
                method: AgentMethod::RequestInput,
                reply,
            });
            if let Some(previous) = previous {
                previous
                    .reply
                    .return_error(AGENT_CANCELED, "Superseded by a newer request");
            }
        }
        drop(ledger);

        info!(target: "connman::agent", %service, %id, fields = %fields, "input requested");
        let delivered = self.subscribers.agent.dispatch(&AgentEvent {
            service,
            id,
            fields,
        });
        if delivered == 0 {
            warn!(target: "connman::agent", %id, "no agent callback registered; request stays open");
        }
    }

    /// Answers the request parked on entry `id` with `fields`.
    ///
    /// Only `RequestInput` is ever parked, so there is no unknown-method
    /// case to answer here; a new [`AgentMethod`] variant must extend the
    /// match below.
    pub fn respond(&self, id: CallId, fields: PropertyMap) -> Result<()> {
        let request = {
            let mut ledger = self.ledger.lock();
            let entry = ledger
                .find_by_id_mut(id)
                .ok_or(ConnmanError::RequestNotFound(id))?;
            entry
                .agent
                .take()
                .ok_or(ConnmanError::RequestNotFound(id))?
        };

        match request.method {
            AgentMethod::RequestInput => {
                request.reply.return_value(vec![Value::Dict(fields)]);
            }
        }
        info!(target: "connman::agent", %id, "agent response sent");
        Ok(())
    }

    /// Serves inbound calls until the object is unregistered.
    pub(crate) async fn run(self: Arc<Self>, mut inbound: InboundStream) {
        while let Some(call) = inbound.recv().await {
            self.handle_call(call);
        }
        debug!(target: "connman::agent", "agent object closed");
    }
}

fn report_error(call: InboundCall) {
    match call.args.as_slice() {
        [Value::ObjectPath(path), Value::Str(message)] => {
            error!(target: "connman::agent", service = %path, error = %message, "daemon reported error");
        }
        args => {
            warn!(target: "connman::agent", ?args, "ReportError with unexpected arguments");
        }
    }
    call.reply.return_value(vec![]);
}

/// Claims `name`, exports the agent object at `path` and registers it with
/// the daemon. Every step is rolled back if a later one fails.
pub(crate) async fn register(
    gateway: &CallGateway,
    name: &str,
    path: &str,
) -> Result<(AgentRegistration, InboundStream)> {
    let conn = gateway.connection();
    let object = ObjectPath::new(path)
        .map_err(|e| ConnmanError::IllegalArgument(format!("agent path: {}", e)))?;

    info!(target: "connman::agent", %name, %path, "acquiring agent bus name");
    conn.own_name(name).await.map_err(|e| {
        error!(target: "connman::agent", %name, error = %e, "unable to acquire agent name");
        ConnmanError::InitFailed(format!("agent name {}: {}", name, e))
    })?;

    let inbound = match conn.register_object(path, AGENT_INTERFACE) {
        Ok(inbound) => inbound,
        Err(e) => {
            error!(target: "connman::agent", %path, error = %e, "unable to export agent object");
            conn.release_name(name).await;
            return Err(ConnmanError::InitFailed(format!("agent object {}: {}", path, e)));
        }
    };

    if let Err(e) = gateway
        .call(Category::Manager, None, "RegisterAgent", vec![Value::ObjectPath(object)])
        .await
    {
        error!(target: "connman::agent", %path, error = %e, "daemon refused agent registration");
        conn.unregister_object(path);
        conn.release_name(name).await;
        return Err(ConnmanError::InitFailed(format!("RegisterAgent: {}", e)));
    }

    info!(target: "connman::agent", %path, "agent registered");
    Ok((
        AgentRegistration {
            name: name.to_string(),
            path: path.to_string(),
        },
        inbound,
    ))
}

/// Reverses [`register`]. Failures are logged only.
pub(crate) async fn unregister(gateway: &CallGateway, registration: &AgentRegistration) {
    let conn: &Arc<dyn BusConnection> = gateway.connection();
    if let Ok(object) = ObjectPath::new(registration.path.as_str()) {
        if let Err(e) = gateway
            .call(Category::Manager, None, "UnregisterAgent", vec![Value::ObjectPath(object)])
            .await
        {
            debug!(target: "connman::agent", error = %e, "UnregisterAgent failed");
        }
    }
    conn.unregister_object(&registration.path);
    conn.release_name(&registration.name).await;
    info!(target: "connman::agent", path = %registration.path, "agent unregistered");
}
