//! Server role: the authoritative holder of variables and triggers.
//!
//! # Architecture
//!
//! The server binds a ROUTER socket for requests and a PUB socket for
//! publications (optionally a second, "external", pair served identically
//! by the same dispatcher). A single dispatcher thread polls the
//! router(s), an in-process reply relay, and the control PAIR; every
//! decoded command becomes a worker-pool task so user callbacks never
//! block dispatch. Completed responses are funneled back to the
//! dispatcher over the relay and sent on the originating router with the
//! identity frame echoed.
//!
//! Only the server-side [`Server::set_variable`] publishes. Peer-originated
//! writes are answered on the request channel and deliberately not
//! republished: the writing peer already knows the new value, and other
//! peers learn of it when the authoritative side adopts it.

pub(crate) mod dispatch;
pub(crate) mod registry;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use prost::Message;
use thiserror::Error;

use crate::net::control::{self, ControlSocket};
use crate::pool::WorkerPool;
use crate::trace::{error, info, warn};
use crate::wire::message::VariableMessage;
use crate::wire::value::{Value, Variable, VariableChangedCallback, TriggerCallback};

use dispatch::Dispatcher;
use registry::{Registry, ServerSetOutcome};

/// Error starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A socket could not be bound to its endpoint.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        /// The endpoint that failed to bind.
        endpoint: String,
        /// The underlying transport error.
        source: zmq::Error,
    },
    /// Transport-level failure while setting up internal plumbing.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
}

/// Server endpoints and tuning.
///
/// Endpoints are transport URIs (`tcp://host:port`, `ipc:///path`). The
/// optional external pair is functionally identical to the internal one
/// and exists to separate policy zones operationally.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Request (ROUTER) endpoint.
    pub router_endpoint: String,
    /// Publish (PUB) endpoint.
    pub pub_endpoint: String,
    /// Optional external request endpoint.
    pub external_router_endpoint: Option<String>,
    /// Optional external publish endpoint.
    pub external_pub_endpoint: Option<String>,
    /// Worker pool size; defaults to the hardware concurrency.
    pub pool_size: Option<usize>,
}

impl ServerConfig {
    /// Config with a single router/publisher pair.
    pub fn new(router_endpoint: impl Into<String>, pub_endpoint: impl Into<String>) -> Self {
        Self {
            router_endpoint: router_endpoint.into(),
            pub_endpoint: pub_endpoint.into(),
            external_router_endpoint: None,
            external_pub_endpoint: None,
            pool_size: None,
        }
    }

    /// Adds the external router/publisher pair.
    #[must_use]
    pub fn with_external(
        mut self,
        router_endpoint: impl Into<String>,
        pub_endpoint: impl Into<String>,
    ) -> Self {
        self.external_router_endpoint = Some(router_endpoint.into());
        self.external_pub_endpoint = Some(pub_endpoint.into());
        self
    }

    /// Overrides the worker pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }
}

/// The server role.
///
/// All methods take `&self`; a `Server` is typically shared behind an
/// [`Arc`] so registered callbacks can reach back into it.
pub struct Server {
    config: ServerConfig,
    context: zmq::Context,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
    publishers: Mutex<Vec<zmq::Socket>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    control_endpoint: Mutex<Option<String>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a stopped server. No sockets are opened until
    /// [`Server::start`].
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            context: zmq::Context::new(),
            registry: Arc::new(Registry::new()),
            running: Arc::new(AtomicBool::new(false)),
            publishers: Mutex::new(Vec::new()),
            pool: Mutex::new(None),
            control_endpoint: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Whether the dispatcher is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds all sockets and starts the dispatcher. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] on bind failure; any partially opened
    /// sockets are torn down before returning.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.is_running() {
            info!("server is already running");
            return Ok(());
        }
        match self.bind_and_spawn() {
            Ok(()) => {
                info!(
                    router = %self.config.router_endpoint,
                    publisher = %self.config.pub_endpoint,
                    external = self.config.external_router_endpoint.is_some(),
                    "server started"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "server start failed");
                Err(e)
            }
        }
    }

    fn bind_and_spawn(&self) -> Result<(), ServerError> {
        let bind = |kind: zmq::SocketType, endpoint: &str| -> Result<zmq::Socket, ServerError> {
            let socket = self.context.socket(kind)?;
            socket.set_linger(0)?;
            socket.bind(endpoint).map_err(|source| ServerError::Bind {
                endpoint: endpoint.to_owned(),
                source,
            })?;
            Ok(socket)
        };

        // On any failure the already-created sockets drop here and close.
        let mut routers = vec![bind(zmq::ROUTER, &self.config.router_endpoint)?];
        if let Some(endpoint) = &self.config.external_router_endpoint {
            routers.push(bind(zmq::ROUTER, endpoint)?);
        }

        let mut publishers = vec![bind(zmq::PUB, &self.config.pub_endpoint)?];
        if let Some(endpoint) = &self.config.external_pub_endpoint {
            publishers.push(bind(zmq::PUB, endpoint)?);
        }

        let relay_endpoint = control::unique_inproc_endpoint("server-replies");
        let reply_pull = bind(zmq::PULL, &relay_endpoint)?;
        let reply_push = self.context.socket(zmq::PUSH)?;
        reply_push.set_linger(0)?;
        // Bounded so a worker cannot block forever relaying a response
        // after the dispatcher has already shut down.
        reply_push.set_sndtimeo(1000)?;
        reply_push.connect(&relay_endpoint)?;

        let control = ControlSocket::bind(&self.context, "server")?;

        let pool_size = self.config.pool_size.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        });
        let pool = Arc::new(WorkerPool::new(pool_size));

        *self.publishers.lock().expect("publishers poisoned") = publishers;
        *self.control_endpoint.lock().expect("control endpoint poisoned") =
            Some(control.endpoint().to_owned());
        *self.pool.lock().expect("pool poisoned") = Some(Arc::clone(&pool));
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher::new(
            routers,
            reply_pull,
            Arc::new(Mutex::new(reply_push)),
            control,
            pool,
            Arc::clone(&self.registry),
        );
        let handle = std::thread::Builder::new()
            .name("tether-server".into())
            .spawn(move || {
                info!("dispatcher started");
                dispatcher.run();
                info!("dispatcher exiting");
            })
            .expect("failed to spawn dispatcher thread");
        *self.dispatcher.lock().expect("dispatcher poisoned") = Some(handle);

        Ok(())
    }

    /// Stops the dispatcher, drains and joins the worker pool, and closes
    /// all sockets. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(endpoint) = self
            .control_endpoint
            .lock()
            .expect("control endpoint poisoned")
            .take()
        {
            if let Err(_e) = control::signal_stop(&self.context, &endpoint) {
                warn!(error = %_e, "failed to signal dispatcher shutdown");
            }
        }
        if let Some(handle) = self.dispatcher.lock().expect("dispatcher poisoned").take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.pool.lock().expect("pool poisoned").take() {
            pool.shutdown();
        }
        self.publishers.lock().expect("publishers poisoned").clear();
        info!("server stopped");
    }

    /// Registers (or replaces) a variable; the stored type is pinned from
    /// `variable.value`'s variant.
    ///
    /// The callback, if any, fires only when a *peer* changes the
    /// variable. It is invoked on a pool worker with the new value,
    /// outside any internal lock.
    pub fn register_variable(
        &self,
        variable: Variable,
        callback: Option<VariableChangedCallback>,
    ) {
        info!(
            name = %variable.name,
            kind = %variable.value.kind(),
            read_only = variable.read_only,
            "variable registered"
        );
        self.registry.register_variable(variable, callback);
    }

    /// Registers (or replaces) a trigger. The callback is invoked on a
    /// pool worker each time a peer executes the trigger.
    pub fn register_trigger(&self, name: impl Into<String>, callback: TriggerCallback) {
        let name = name.into();
        info!(name = %name, "trigger registered");
        self.registry.register_trigger(name, callback);
    }

    /// Snapshot of all variable values.
    #[must_use]
    pub fn variables(&self) -> HashMap<String, Value> {
        self.registry.values_snapshot()
    }

    /// The current value of `name`, if registered.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.registry.value(name)
    }

    /// Authoritative write. Read-only variables may be changed this way.
    ///
    /// No-ops (with a log) on an unknown name or a value whose variant
    /// does not match the pinned type. An equal value is a no-op without
    /// publication. A changed value is published to subscribers while the
    /// server is running; the variable's change callback is *not* invoked
    /// (it is reserved for peer-originated writes).
    pub fn set_variable(&self, name: &str, value: impl Into<Value>) {
        // Publication happens under the variables lock so the publish
        // order always matches the store order. PUB sends never block.
        let outcome = self
            .registry
            .apply_server_set(name, value.into(), |new_value, read_only| {
                if !self.is_running() {
                    return;
                }
                let update = VariableMessage::from_parts(name, new_value, read_only);
                let payload = update.encode_to_vec();
                for publisher in self.publishers.lock().expect("publishers poisoned").iter() {
                    if let Err(_e) = publisher.send(payload.as_slice(), 0) {
                        warn!(variable = %name, error = %_e, "failed to publish update");
                    }
                }
            });

        match outcome {
            ServerSetOutcome::Changed { .. } => {
                info!(variable = %name, "variable updated by server");
            }
            ServerSetOutcome::Unchanged => {}
            ServerSetOutcome::NotFound => {
                warn!(variable = %name, "set ignored: variable not registered");
            }
            ServerSetOutcome::KindMismatch { expected: _expected } => {
                warn!(
                    variable = %name,
                    expected = %_expected,
                    "set ignored: value kind does not match registered type"
                );
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
