// Call gateways: method calls on daemon objects
//
// `call` awaits the reply; `call_async` runs the call on the event loop and
// hands the raw result to a completion closure. Neither retries.
use connman_proto::{
    service_path, technology_path, BusConnection, BusError, MethodCall, Value, CONNMAN_SERVICE,
    MANAGER_INTERFACE, MANAGER_PATH, SERVICE_INTERFACE, TECHNOLOGY_INTERFACE,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{ConnmanError, Result};

/// Kind of daemon object a call or property addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Manager,
    Technology,
    Service,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Manager => "manager",
            Category::Technology => "technology",
            Category::Service => "service",
        }
    }

    pub fn interface(self) -> &'static str {
        match self {
            Category::Manager => MANAGER_INTERFACE,
            Category::Technology => TECHNOLOGY_INTERFACE,
            Category::Service => SERVICE_INTERFACE,
        }
    }

    /// Manager method returning the properties of every object of this
    /// category.
    pub fn bulk_method(self) -> &'static str {
        match self {
            Category::Manager => "GetProperties",
            Category::Technology => "GetTechnologies",
            Category::Service => "GetServices",
        }
    }

    /// Object path for `target`. The manager lives at `/` and ignores the
    /// target.
    pub fn object_path(self, target: Option<&str>) -> Result<String> {
        match self {
            Category::Manager => Ok(MANAGER_PATH.to_string()),
            Category::Technology => Ok(technology_path(require_target(self, target)?)),
            Category::Service => Ok(service_path(require_target(self, target)?)),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ConnmanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manager" => Ok(Category::Manager),
            "technology" => Ok(Category::Technology),
            "service" => Ok(Category::Service),
            other => Err(ConnmanError::IllegalArgument(format!(
                "unknown object category '{}'",
                other
            ))),
        }
    }
}

/// Validates the target of a technology or service operation. Absent and
/// empty targets are `MissingArgument`; names that cannot form an object
/// path segment are `IllegalArgument`.
pub fn require_target(category: Category, target: Option<&str>) -> Result<&str> {
    let target = match target.filter(|t| !t.is_empty()) {
        Some(t) => t,
        None => return Err(ConnmanError::MissingArgument(category)),
    };
    if !target.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConnmanError::IllegalArgument(format!(
            "illegal {} name '{}'",
            category, target
        )));
    }
    Ok(target)
}

/// Maps a transport failure to the library taxonomy. Only "unknown object"
/// failures are remapped, by the method that failed; everything else is
/// passed through with its message intact.
pub fn decode_call_error(
    category: Category,
    target: Option<&str>,
    method: &str,
    error: BusError,
) -> ConnmanError {
    let error = match error {
        BusError::Failed(text) => BusError::from_raw(&text),
        other => other,
    };
    if !error.is_unknown_object() {
        return ConnmanError::Bus(error);
    }

    let target = target.unwrap_or_default().to_string();
    match method {
        "SetProperty" | "GetProperty" | "ClearProperty" => {
            ConnmanError::UnknownProperty { category, target }
        }
        "Connect" | "Disconnect" | "Remove" | "ResetCounters" | "MoveAfter" | "MoveBefore" => {
            ConnmanError::UnknownService(target)
        }
        "Scan" => ConnmanError::UnknownTechnology(target),
        _ => ConnmanError::Bus(error),
    }
}

/// Handle to a call issued with [`CallGateway::call_async`].
#[derive(Debug)]
pub struct PendingCall {
    method: String,
    cancel: Option<oneshot::Sender<()>>,
}

impl PendingCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Requests cancellation. The completion still runs, once, with
    /// `BusError::Cancelled`. Returns `false` if the call already finished
    /// or was cancelled before.
    pub fn cancel(&mut self) -> bool {
        match self.cancel.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cancel.as_ref().map_or(true, oneshot::Sender::is_closed)
    }
}

/// Issues method calls on daemon objects with a fixed reply timeout.
#[derive(Clone)]
pub struct CallGateway {
    conn: Arc<dyn BusConnection>,
    timeout: Duration,
}

impl CallGateway {
    pub fn new(conn: Arc<dyn BusConnection>, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub fn connection(&self) -> &Arc<dyn BusConnection> {
        &self.conn
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn method_call(
        category: Category,
        target: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<MethodCall> {
        Ok(MethodCall {
            destination: CONNMAN_SERVICE.to_string(),
            path: category.object_path(target)?,
            interface: category.interface().to_string(),
            member: method.to_string(),
            args,
        })
    }

    /// Calls `method` and waits for the reply body. Failures are decoded
    /// with [`decode_call_error`] and logged.
    pub async fn call(
        &self,
        category: Category,
        target: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let call = Self::method_call(category, target, method, args)?;
        debug!(target: "connman::call", %category, path = %call.path, method, "calling");

        match self.conn.call(call, self.timeout).await {
            Ok(body) => Ok(body),
            Err(raw) => {
                let err = decode_call_error(category, target, method, raw);
                error!(
                    target: "connman::call",
                    %category,
                    object = target.unwrap_or_default(),
                    method,
                    error = %err,
                    "method call failed"
                );
                Err(err)
            }
        }
    }

    /// Starts `method` on `runtime` and returns at once. `on_complete`
    /// receives the raw transport result exactly once, including after
    /// cancellation.
    pub fn call_async<F>(
        &self,
        runtime: &Handle,
        category: Category,
        target: Option<&str>,
        method: &str,
        args: Vec<Value>,
        on_complete: F,
    ) -> Result<PendingCall>
    where
        F: FnOnce(std::result::Result<Vec<Value>, BusError>) + Send + 'static,
    {
        let call = Self::method_call(category, target, method, args)?;
        debug!(target: "connman::call", %category, path = %call.path, method, "calling async");

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let conn = Arc::clone(&self.conn);
        let timeout = self.timeout;
        runtime.spawn(async move {
            let result = tokio::select! {
                res = conn.call(call, timeout) => res,
                Ok(()) = cancel_rx => Err(BusError::Cancelled),
            };
            on_complete(result);
        });

        Ok(PendingCall {
            method: method.to_string(),
            cancel: Some(cancel_tx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connman_proto::errors::UNKNOWN_OBJECT;
    use connman_proto::memory::InMemoryBus;

    fn unknown_object() -> BusError {
        BusError::remote(UNKNOWN_OBJECT, "No such object path")
    }

    #[test]
    fn category_parses_and_resolves_paths() {
        assert_eq!("technology".parse::<Category>().unwrap(), Category::Technology);
        assert!(matches!(
            "gadget".parse::<Category>(),
            Err(ConnmanError::IllegalArgument(_))
        ));
        assert_eq!(Category::Manager.object_path(Some("ignored")).unwrap(), "/");
        assert_eq!(
            Category::Service.object_path(Some("wifi_1")).unwrap(),
            "/net/connman/service/wifi_1"
        );
    }

    #[test]
    fn missing_and_illegal_targets() {
        assert!(matches!(
            Category::Technology.object_path(None),
            Err(ConnmanError::MissingArgument(Category::Technology))
        ));
        assert!(matches!(
            Category::Service.object_path(Some("")),
            Err(ConnmanError::MissingArgument(Category::Service))
        ));
        assert!(matches!(
            Category::Service.object_path(Some("../etc")),
            Err(ConnmanError::IllegalArgument(_))
        ));
    }

    #[test]
    fn unknown_object_is_remapped_by_method() {
        let err = decode_call_error(Category::Technology, Some("wifi"), "Scan", unknown_object());
        assert!(matches!(err, ConnmanError::UnknownTechnology(ref t) if t == "wifi"));

        let err = decode_call_error(Category::Service, Some("svc0"), "MoveAfter", unknown_object());
        assert!(matches!(err, ConnmanError::UnknownService(ref s) if s == "svc0"));

        let err = decode_call_error(Category::Technology, Some("wifi"), "SetProperty", unknown_object());
        assert!(matches!(
            err,
            ConnmanError::UnknownProperty { category: Category::Technology, .. }
        ));

        let err = decode_call_error(Category::Manager, None, "GetServices", unknown_object());
        assert!(matches!(err, ConnmanError::Bus(_)));
    }

    #[test]
    fn other_errors_keep_their_message() {
        let err = decode_call_error(
            Category::Service,
            Some("svc0"),
            "Connect",
            BusError::Failed("GDBus.Error:net.connman.Error.AlreadyConnected: Already connected".into()),
        );
        assert_eq!(err.to_string(), "Already connected");

        let framed = BusError::Failed(format!("GDBus.Error:{}: gone", UNKNOWN_OBJECT));
        let err = decode_call_error(Category::Service, Some("svc0"), "Remove", framed);
        assert!(matches!(err, ConnmanError::UnknownService(_)));
    }

    #[tokio::test]
    async fn sync_call_returns_body() {
        let bus = InMemoryBus::new();
        bus.reply("/net/connman/technology/wifi", "Scan", vec![]);
        let gateway = CallGateway::new(Arc::new(bus.clone()), Duration::from_secs(1));

        gateway
            .call(Category::Technology, Some("wifi"), "Scan", vec![])
            .await
            .expect("scan");
        let calls = bus.calls();
        assert_eq!(calls[0].interface, TECHNOLOGY_INTERFACE);
        assert_eq!(calls[0].destination, CONNMAN_SERVICE);
    }

    #[tokio::test]
    async fn missing_target_never_reaches_transport() {
        let bus = InMemoryBus::new();
        let gateway = CallGateway::new(Arc::new(bus.clone()), Duration::from_secs(1));
        let err = gateway
            .call(Category::Service, None, "Remove", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ConnmanError::MissingArgument(Category::Service)));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_async_call_completes_once() {
        let bus = InMemoryBus::new();
        bus.handle("/net/connman/service/svc0", "Connect", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        });
        let gateway = CallGateway::new(Arc::new(bus), Duration::from_secs(60));

        let (tx, rx) = oneshot::channel();
        let mut pending = gateway
            .call_async(
                &Handle::current(),
                Category::Service,
                Some("svc0"),
                "Connect",
                vec![],
                move |res| {
                    let _ = tx.send(res);
                },
            )
            .expect("started");

        assert_eq!(pending.method(), "Connect");
        assert!(pending.cancel());
        assert!(!pending.cancel());

        let res = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("completion ran")
            .expect("sent");
        assert_eq!(res, Err(BusError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel() {
        let bus = InMemoryBus::new();
        bus.reply("/net/connman/service/svc0", "Connect", vec![]);
        let gateway = CallGateway::new(Arc::new(bus), Duration::from_secs(1));

        let (tx, rx) = oneshot::channel();
        let pending = gateway
            .call_async(
                &Handle::current(),
                Category::Service,
                Some("svc0"),
                "Connect",
                vec![],
                move |res| {
                    let _ = tx.send(res);
                },
            )
            .expect("started");
        drop(pending);

        let res = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("completion ran")
            .expect("sent");
        assert_eq!(res, Ok(vec![]));
    }
}
