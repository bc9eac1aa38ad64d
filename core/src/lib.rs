// Connman Client Core
// Asynchronous call/signal engine for the network connection daemon

pub mod agent;
pub mod call;
pub mod client;
pub mod config;
pub mod event;
pub mod ledger;
pub mod properties;
pub mod registry;
mod runtime;
pub mod signal;
pub mod telemetry;

// Export core types
pub use call::{decode_call_error, CallGateway, Category, PendingCall};
pub use client::Connman;
pub use config::ConnmanConfig;
pub use event::{AgentEvent, ConnectOutcome, ManagerEvent, ServiceEvent, TechnologyEvent};
pub use ledger::{CallId, CallKey, CallLedger};
pub use registry::{CallbackRegistry, SubscriptionId, Subscribers};
pub use telemetry::{init_tracing, LogLevel};

pub use connman_proto::{BusError, ObjectList, ObjectPath, PropertyMap, Value};

use std::time::Duration;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnmanError {
    #[error("missing {0} argument")]
    MissingArgument(Category),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("unknown {category} property on {target}")]
    UnknownProperty { category: Category, target: String },

    #[error("unknown technology {0}")]
    UnknownTechnology(String),

    #[error("unknown service {0}")]
    UnknownService(String),

    #[error("{0}")]
    BadProperty(String),

    #[error("another call in progress ({0})")]
    CallInProgress(CallKey),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("cannot find request with id {0}")]
    RequestNotFound(CallId),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("init timeout after {0:?}")]
    InitTimeout(Duration),

    #[error("init failed: {0}")]
    InitFailed(String),

    #[error("event loop is not running")]
    NotRunning,

    #[error("blocking call issued from the event loop thread")]
    EventLoopThread,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flat classification of [`ConnmanError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingArgument,
    IllegalArgument,
    UnknownProperty,
    UnknownTechnology,
    UnknownService,
    BadProperty,
    CallInProgress,
    OutOfMemory,
    Unimplemented,
    NotFound,
    Transport,
    Init,
    Lifecycle,
    Config,
}

impl ConnmanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnmanError::MissingArgument(_) => ErrorKind::MissingArgument,
            ConnmanError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            ConnmanError::UnknownProperty { .. } => ErrorKind::UnknownProperty,
            ConnmanError::UnknownTechnology(_) => ErrorKind::UnknownTechnology,
            ConnmanError::UnknownService(_) => ErrorKind::UnknownService,
            ConnmanError::BadProperty(_) => ErrorKind::BadProperty,
            ConnmanError::CallInProgress(_) => ErrorKind::CallInProgress,
            ConnmanError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            ConnmanError::Unimplemented(_) => ErrorKind::Unimplemented,
            ConnmanError::RequestNotFound(_) => ErrorKind::NotFound,
            ConnmanError::Bus(_) => ErrorKind::Transport,
            ConnmanError::InitTimeout(_) | ConnmanError::InitFailed(_) => ErrorKind::Init,
            ConnmanError::NotRunning | ConnmanError::EventLoopThread => ErrorKind::Lifecycle,
            ConnmanError::Config(_) | ConnmanError::Io(_) => ErrorKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnmanError>;
