// In-memory bus that plays the network daemon
//
// Used by tests: method handlers are programmed per (path, member), signals
// fan out to every subscriber of the signal's interface, and the "daemon" can
// call back into objects the client exported.
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::errors::{UNKNOWN_METHOD, UNKNOWN_OBJECT};
use crate::{
    BusConnection, BusConnector, BusError, BusSignal, InboundCall, InboundStream, MethodCall,
    MethodReply, SignalStream, Value, CONNMAN_SERVICE,
};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>, BusError>> + Send>>;

type Handler = Arc<dyn Fn(MethodCall) -> HandlerFuture + Send + Sync>;

struct ExportedObject {
    interface: String,
    sender: mpsc::UnboundedSender<InboundCall>,
}

#[derive(Default)]
struct Inner {
    // (path, member) -> handler
    handlers: DashMap<(String, String), Handler>,
    // interface -> subscribers
    subscriptions: DashMap<String, Vec<mpsc::UnboundedSender<BusSignal>>>,
    objects: DashMap<String, ExportedObject>,
    owned_names: DashSet<String>,
    denied_names: DashSet<String>,
    journal: Mutex<Vec<MethodCall>>,
    refuse_connect: AtomicBool,
}

/// A fake daemon living in process memory.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector handing out this bus; pass it to the client's init.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector { bus: self.clone() }
    }

    /// Makes every later `connect` fail.
    pub fn refuse_connections(&self) {
        self.inner.refuse_connect.store(true, Ordering::SeqCst);
    }

    /// Installs an async handler for `member` on the object at `path`.
    pub fn handle<F, Fut>(&self, path: &str, member: &str, f: F)
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, BusError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |call| Box::pin(f(call)));
        self.inner
            .handlers
            .insert((path.to_string(), member.to_string()), handler);
    }

    /// Answers every call to `member` at `path` with `body`.
    pub fn reply(&self, path: &str, member: &str, body: Vec<Value>) {
        self.handle(path, member, move |_| {
            let body = body.clone();
            async move { Ok(body) }
        });
    }

    /// Fails every call to `member` at `path` with `error`.
    pub fn fail(&self, path: &str, member: &str, error: BusError) {
        self.handle(path, member, move |_| {
            let error = error.clone();
            async move { Err(error) }
        });
    }

    /// Refuses ownership of `name`.
    pub fn deny_name(&self, name: &str) {
        self.inner.denied_names.insert(name.to_string());
    }

    pub fn owns_name(&self, name: &str) -> bool {
        self.inner.owned_names.contains(name)
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.inner.objects.contains_key(path)
    }

    pub fn subscriber_count(&self, interface: &str) -> usize {
        self.inner
            .subscriptions
            .get(interface)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<MethodCall> {
        self.inner
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, member: &str) -> usize {
        self.calls().iter().filter(|c| c.member == member).count()
    }

    /// Delivers a signal to every subscriber of its interface. Returns the
    /// number of subscribers reached.
    pub fn emit(&self, signal: BusSignal) -> usize {
        let mut delivered = 0;
        if let Some(mut subs) = self.inner.subscriptions.get_mut(&signal.interface) {
            subs.retain(|tx| {
                let alive = tx.send(signal.clone()).is_ok();
                if alive {
                    delivered += 1;
                }
                alive
            });
        }
        debug!(target: "connman::bus", member = %signal.member, path = %signal.path, delivered, "signal emitted");
        delivered
    }

    /// Convenience wrapper around [`InMemoryBus::emit`].
    pub fn emit_signal(&self, path: &str, interface: &str, member: &str, args: Vec<Value>) -> usize {
        self.emit(BusSignal {
            sender: Some(CONNMAN_SERVICE.to_string()),
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
            args,
        })
    }

    /// Calls `member` on an object the client exported, as the daemon would.
    /// The returned receiver resolves once the client replies.
    pub fn invoke_object(
        &self,
        path: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<oneshot::Receiver<Result<Vec<Value>, BusError>>, BusError> {
        let object = self.inner.objects.get(path).ok_or_else(|| {
            BusError::remote(UNKNOWN_OBJECT, format!("No such object path '{}'", path))
        })?;
        let (reply, rx) = MethodReply::channel();
        object
            .sender
            .send(InboundCall {
                sender: Some(CONNMAN_SERVICE.to_string()),
                path: path.to_string(),
                interface: object.interface.clone(),
                member: member.to_string(),
                args,
                reply,
            })
            .map_err(|_| BusError::Disconnected)?;
        Ok(rx)
    }

    /// [`InMemoryBus::invoke_object`] and wait for the reply.
    pub async fn call_object(
        &self,
        path: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, BusError> {
        let rx = self.invoke_object(path, member, args)?;
        rx.await.map_err(|_| BusError::Disconnected)?
    }

    fn lookup(&self, path: &str, member: &str) -> Result<Handler, BusError> {
        let key = (path.to_string(), member.to_string());
        if let Some(handler) = self.inner.handlers.get(&key) {
            return Ok(Arc::clone(handler.value()));
        }
        let object_known = self.inner.handlers.iter().any(|e| e.key().0 == path);
        if object_known {
            Err(BusError::remote(
                UNKNOWN_METHOD,
                format!("Method \"{}\" doesn't exist on '{}'", member, path),
            ))
        } else {
            Err(BusError::remote(
                UNKNOWN_OBJECT,
                format!("No such object path '{}'", path),
            ))
        }
    }
}

#[async_trait]
impl BusConnection for InMemoryBus {
    async fn call(&self, call: MethodCall, timeout: Duration) -> Result<Vec<Value>, BusError> {
        self.inner
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());

        let handler = self.lookup(&call.path, &call.member)?;
        match tokio::time::timeout(timeout, handler(call)).await {
            Ok(res) => res,
            Err(_) => Err(BusError::Timeout),
        }
    }

    fn subscribe(&self, interface: &str) -> Result<SignalStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscriptions
            .entry(interface.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn own_name(&self, name: &str) -> Result<(), BusError> {
        if self.inner.denied_names.contains(name) {
            return Err(BusError::remote(
                "org.freedesktop.DBus.Error.AccessDenied",
                format!("Connection is not allowed to own the service \"{}\"", name),
            ));
        }
        self.inner.owned_names.insert(name.to_string());
        Ok(())
    }

    async fn release_name(&self, name: &str) {
        self.inner.owned_names.remove(name);
    }

    fn register_object(&self, path: &str, interface: &str) -> Result<InboundStream, BusError> {
        if self.inner.objects.contains_key(path) {
            return Err(BusError::Failed(format!(
                "An object is already exported for the interface {} at {}",
                interface, path
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.objects.insert(
            path.to_string(),
            ExportedObject {
                interface: interface.to_string(),
                sender: tx,
            },
        );
        Ok(rx)
    }

    fn unregister_object(&self, path: &str) {
        self.inner.objects.remove(path);
    }
}

/// [`BusConnector`] for an [`InMemoryBus`].
pub struct InMemoryConnector {
    bus: InMemoryBus,
}

#[async_trait]
impl BusConnector for InMemoryConnector {
    async fn connect(self: Box<Self>) -> Result<Arc<dyn BusConnection>, BusError> {
        if self.bus.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(BusError::Failed("Could not connect: Connection refused".into()));
        }
        Ok(Arc::new(self.bus))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MANAGER_INTERFACE, MANAGER_PATH};

    fn manager_call(member: &str) -> MethodCall {
        MethodCall {
            destination: CONNMAN_SERVICE.into(),
            path: MANAGER_PATH.into(),
            interface: MANAGER_INTERFACE.into(),
            member: member.into(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn programmed_reply_is_returned_and_journaled() {
        let bus = InMemoryBus::new();
        bus.reply(MANAGER_PATH, "GetProperties", vec![Value::from("ok")]);

        let body = bus
            .call(manager_call("GetProperties"), Duration::from_secs(1))
            .await
            .expect("reply");
        assert_eq!(body, vec![Value::from("ok")]);
        assert_eq!(bus.call_count("GetProperties"), 1);
    }

    #[tokio::test]
    async fn unknown_object_and_method_are_distinguished() {
        let bus = InMemoryBus::new();
        let err = bus
            .call(manager_call("GetProperties"), Duration::from_secs(1))
            .await
            .expect_err("no handler");
        assert!(err.is_unknown_object());

        bus.reply(MANAGER_PATH, "GetProperties", vec![]);
        let err = bus
            .call(manager_call("GetServices"), Duration::from_secs(1))
            .await
            .expect_err("no handler");
        assert_eq!(err.name(), Some(UNKNOWN_METHOD));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let bus = InMemoryBus::new();
        bus.handle(MANAGER_PATH, "Slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        });
        let err = bus
            .call(manager_call("Slow"), Duration::from_millis(20))
            .await
            .expect_err("times out");
        assert_eq!(err, BusError::Timeout);
    }

    #[tokio::test]
    async fn signals_fan_out_by_interface() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe(MANAGER_INTERFACE).expect("subscribe");
        let mut b = bus.subscribe(MANAGER_INTERFACE).expect("subscribe");
        let _other = bus.subscribe("net.connman.Service").expect("subscribe");

        let n = bus.emit_signal(MANAGER_PATH, MANAGER_INTERFACE, "PropertyChanged", vec![]);
        assert_eq!(n, 2);
        assert_eq!(a.recv().await.expect("signal").member, "PropertyChanged");
        assert_eq!(b.recv().await.expect("signal").member, "PropertyChanged");

        drop(a);
        assert_eq!(bus.subscriber_count(MANAGER_INTERFACE), 1);
    }

    #[tokio::test]
    async fn exported_objects_receive_calls() {
        let bus = InMemoryBus::new();
        let mut inbound = bus
            .register_object("/net/connman/agent1", "net.connman.Agent")
            .expect("register");
        assert!(bus.register_object("/net/connman/agent1", "net.connman.Agent").is_err());

        let rx = bus
            .invoke_object("/net/connman/agent1", "ReportError", vec![])
            .expect("invoke");
        let call = inbound.recv().await.expect("inbound call");
        assert_eq!(call.member, "ReportError");
        call.reply.return_value(vec![]);
        assert_eq!(rx.await.expect("reply"), Ok(vec![]));

        bus.unregister_object("/net/connman/agent1");
        assert!(bus.invoke_object("/net/connman/agent1", "ReportError", vec![]).is_err());
    }

    #[tokio::test]
    async fn denied_names_are_refused() {
        let bus = InMemoryBus::new();
        bus.deny_name("org.agent");
        assert!(bus.own_name("org.agent").await.is_err());
        assert!(bus.own_name("org.other").await.is_ok());
        assert!(bus.owns_name("org.other"));
    }
}
