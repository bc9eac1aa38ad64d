// Event loop thread and lifecycle
//
// All bus traffic runs on one dedicated thread driving a current-thread
// tokio runtime. Init blocks until that thread reports ready (or failed),
// bounded by the init timeout. A panic in any loop task (a daemon contract
// violation) stops the whole loop.
use connman_proto::BusConnector;
use crossbeam::channel::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::agent::{self, AgentRegistration, AgentService};
use crate::call::CallGateway;
use crate::config::ConnmanConfig;
use crate::ledger::CallLedger;
use crate::properties::PropertyResolver;
use crate::registry::Subscribers;
use crate::signal::{SignalChannel, SignalDispatcher};
use crate::{ConnmanError, Result};

const THREAD_NAME: &str = "connman_handler";

/// State shared between the public handle and the event loop.
pub(crate) struct Shared {
    pub gateway: CallGateway,
    pub properties: PropertyResolver,
    pub ledger: Arc<CallLedger>,
    pub subscribers: Arc<Subscribers>,
    pub agent: Option<Arc<AgentService>>,
    pub agent_registration: Option<AgentRegistration>,
    pub runtime: Handle,
    pub loop_thread: ThreadId,
    running: AtomicBool,
}

impl Shared {
    pub fn on_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// `false` once teardown has started.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Owner of the event loop thread.
pub(crate) struct EventLoop {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawns the loop thread and waits until it is operational.
    pub fn start(
        connector: Box<dyn BusConnector>,
        config: ConnmanConfig,
        subscribers: Arc<Subscribers>,
    ) -> Result<(Arc<Shared>, EventLoop)> {
        let (ready_tx, ready_rx) = channel::bounded::<Result<Arc<Shared>>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let init_timeout = config.init_timeout;

        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(connector, config, subscribers, ready_tx, shutdown_rx))
            .map_err(|e| ConnmanError::OutOfMemory(format!("unable to spawn event loop: {}", e)))?;

        info!(target: "connman::runtime", timeout = ?init_timeout, "waiting for event loop");
        match ready_rx.recv_timeout(init_timeout) {
            Ok(Ok(shared)) => {
                info!(target: "connman::runtime", "event loop operational");
                Ok((
                    shared,
                    EventLoop {
                        shutdown: Some(shutdown_tx),
                        thread: Some(thread),
                    },
                ))
            }
            Ok(Err(e)) => {
                error!(target: "connman::runtime", error = %e, "event loop failed to start");
                if thread.join().is_err() {
                    error!(target: "connman::runtime", "event loop thread panicked");
                }
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread notices on its own: its ready send fails and
                // the dropped shutdown sender ends the loop.
                error!(target: "connman::runtime", timeout = ?init_timeout, "init timeout");
                drop(shutdown_tx);
                Err(ConnmanError::InitTimeout(init_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!(target: "connman::runtime", "event loop exited during init");
                Err(ConnmanError::InitFailed("event loop exited during init".into()))
            }
        }
    }

    /// Stops the loop and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            warn!(target: "connman::runtime", "shutdown requested from the event loop; not joining");
            return;
        }
        if thread.join().is_err() {
            error!(target: "connman::runtime", "event loop thread panicked");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    connector: Box<dyn BusConnector>,
    config: ConnmanConfig,
    subscribers: Arc<Subscribers>,
    ready_tx: channel::Sender<Result<Arc<Shared>>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(ConnmanError::OutOfMemory(format!(
                "unable to create event loop runtime: {}",
                e
            ))));
            return;
        }
    };

    runtime.block_on(async move {
        let (shared, mut tasks) = match setup(connector, &config, subscribers).await {
            Ok(ready) => ready,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        if ready_tx.send(Ok(Arc::clone(&shared))).is_err() {
            warn!(target: "connman::runtime", "init stopped waiting; shutting down");
            teardown(&shared, tasks).await;
            return;
        }

        tokio::select! {
            // shutdown, or the handle is gone
            _ = shutdown_rx => {}
            failure = first_panic(&mut tasks) => {
                error!(target: "connman::runtime", error = %failure, "event loop task panicked; shutting down");
            }
        }
        teardown(&shared, tasks).await;
    });
    debug!(target: "connman::runtime", "event loop thread exiting");
}

async fn setup(
    connector: Box<dyn BusConnector>,
    config: &ConnmanConfig,
    subscribers: Arc<Subscribers>,
) -> Result<(Arc<Shared>, JoinSet<()>)> {
    info!(target: "connman::runtime", "connecting to bus");
    let conn = connector.connect().await.map_err(|e| {
        error!(target: "connman::runtime", error = %e, "cannot connect to bus");
        ConnmanError::InitFailed(format!("cannot connect to bus: {}", e))
    })?;

    let gateway = CallGateway::new(Arc::clone(&conn), config.call_timeout);
    let ledger = Arc::new(CallLedger::new());
    let dispatcher = Arc::new(SignalDispatcher::new(Arc::clone(&subscribers)));

    // dropping the set on an error path aborts whatever was spawned
    let mut tasks = JoinSet::new();
    for channel in SignalChannel::ALL {
        let stream = match conn.subscribe(channel.interface()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(target: "connman::runtime", %channel, error = %e, "unable to subscribe");
                return Err(ConnmanError::InitFailed(format!(
                    "subscribe to {}: {}",
                    channel, e
                )));
            }
        };
        tasks.spawn(Arc::clone(&dispatcher).run(channel, stream));
    }

    let (agent, agent_registration) = if config.register_agent {
        let path = config.agent_path();
        match agent::register(&gateway, &config.agent_name, &path).await {
            Ok((registration, inbound)) => {
                let service = Arc::new(AgentService::new(
                    Arc::clone(&ledger),
                    Arc::clone(&subscribers),
                ));
                tasks.spawn(Arc::clone(&service).run(inbound));
                (Some(service), Some(registration))
            }
            Err(e) => return Err(e),
        }
    } else {
        (None, None)
    };

    let shared = Arc::new(Shared {
        properties: PropertyResolver::new(gateway.clone()),
        gateway,
        ledger,
        subscribers,
        agent,
        agent_registration,
        runtime: Handle::current(),
        loop_thread: thread::current().id(),
        running: AtomicBool::new(true),
    });
    Ok((shared, tasks))
}

// Resolves with the first task panic. Tasks that end on their own (their
// stream closed) are not an error.
async fn first_panic(tasks: &mut JoinSet<()>) -> JoinError {
    loop {
        match tasks.join_next().await {
            Some(Err(e)) if e.is_panic() => return e,
            Some(_) => continue,
            None => return std::future::pending().await,
        }
    }
}

async fn teardown(shared: &Shared, mut tasks: JoinSet<()>) {
    shared.running.store(false, Ordering::SeqCst);
    if let Some(registration) = &shared.agent_registration {
        agent::unregister(&shared.gateway, registration).await;
    }
    tasks.shutdown().await;

    let in_flight = shared.ledger.len();
    if in_flight > 0 {
        warn!(target: "connman::runtime", in_flight, "dropping calls still in flight");
    }
    info!(target: "connman::runtime", "event loop stopped");
}

