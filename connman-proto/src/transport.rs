// Transport abstraction: the bus connection the client core drives
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{BusError, Value};

/// Signals delivered for one subscription, in transport order.
pub type SignalStream = mpsc::UnboundedReceiver<BusSignal>;

/// Method calls addressed to a locally exported object.
pub type InboundStream = mpsc::UnboundedReceiver<InboundCall>;

/// Outbound method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

/// Inbound signal.
#[derive(Debug, Clone, PartialEq)]
pub struct BusSignal {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

/// A method call from a remote peer into a local object. The peer waits
/// until `reply` is consumed (or dropped, which reads as a failure).
#[derive(Debug)]
pub struct InboundCall {
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
    pub reply: MethodReply,
}

/// Single-use reply handle for an inbound call.
#[derive(Debug)]
pub struct MethodReply {
    tx: oneshot::Sender<Result<Vec<Value>, BusError>>,
}

impl MethodReply {
    /// Creates a reply handle together with the receiver the caller waits on.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Vec<Value>, BusError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn return_value(self, body: Vec<Value>) {
        if self.tx.send(Ok(body)).is_err() {
            debug!(target: "connman::bus", "caller went away before the reply was sent");
        }
    }

    pub fn return_error(self, name: &str, message: &str) {
        if self.tx.send(Err(BusError::remote(name, message))).is_err() {
            debug!(target: "connman::bus", error = name, "caller went away before the error was sent");
        }
    }
}

/// A live connection to the bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Issues a method call and waits up to `timeout` for its reply body.
    async fn call(&self, call: MethodCall, timeout: Duration) -> Result<Vec<Value>, BusError>;

    /// Subscribes to every signal on `interface`, regardless of object path.
    /// Dropping the stream ends the subscription.
    fn subscribe(&self, interface: &str) -> Result<SignalStream, BusError>;

    /// Claims a well-known name, resolving once it is acquired.
    async fn own_name(&self, name: &str) -> Result<(), BusError>;

    async fn release_name(&self, name: &str);

    /// Exports a local object implementing `interface` at `path`.
    fn register_object(&self, path: &str, interface: &str) -> Result<InboundStream, BusError>;

    fn unregister_object(&self, path: &str);
}

/// Establishes a connection. Runs on the event-loop thread so the connection
/// is created where it is owned.
#[async_trait]
pub trait BusConnector: Send + 'static {
    async fn connect(self: Box<Self>) -> Result<Arc<dyn BusConnection>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_is_delivered_once() {
        let (reply, rx) = MethodReply::channel();
        reply.return_value(vec![Value::from("ok")]);
        assert_eq!(rx.await.expect("sent"), Ok(vec![Value::from("ok")]));
    }

    #[tokio::test]
    async fn error_reply_carries_name() {
        let (reply, rx) = MethodReply::channel();
        reply.return_error(crate::errors::AGENT_CANCELED, "No connection pending");
        let err = rx.await.expect("sent").expect_err("error reply");
        assert_eq!(err.name(), Some(crate::errors::AGENT_CANCELED));
    }

    #[tokio::test]
    async fn dropped_reply_closes_channel() {
        let (reply, rx) = MethodReply::channel();
        drop(reply);
        assert!(rx.await.is_err());
    }
}
