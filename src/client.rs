//! Client role: a consumer of a server's variables and triggers.
//!
//! # Architecture
//!
//! The client connects a DEALER socket for requests and a SUB socket for
//! publications. A single reactor thread polls both, plus an in-process
//! relay carrying requests from caller threads and the control PAIR used
//! to stop it. Request APIs may be called from any thread: they allocate
//! a `command_id`, register a waiter (sync) or continuation (async) with
//! the correlator, and hand the framed request to the reactor. Sync
//! callers block on a rendezvous channel; async callbacks run on the
//! reactor thread.
//!
//! When the dealer goes quiet past its timeout while requests are
//! outstanding, the reactor reconnects with exponential backoff (100 ms
//! doubling, capped at 5 s, five attempts) and fails the in-flight
//! requests; see [`crate::client::worker`] internals for the exact state
//! machine.

pub(crate) mod correlator;
pub(crate) mod reconnect;
pub(crate) mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use prost::Message;
use thiserror::Error;

use crate::net::control::{self, ControlSocket};
use crate::net::frames;
use crate::trace::{debug, info, warn};
use crate::wire::message::{CommandMessage, ResponseMessage};
use crate::wire::value::{ConnectionOptions, Value, VariableChangedCallback};

use correlator::Correlator;
use worker::{Reactor, ReactorConfig, ReactorShared, Slot};

/// Socket timeout used by [`Client::open`] when none is given.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Callback invoked once with the server's response to a request.
pub type ResponseCallback = Box<dyn FnOnce(&ResponseMessage) + Send>;

/// Error opening the client or handing off a request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client is not opened (never opened, closed, or reconnect gave
    /// up).
    #[error("client is not opened")]
    NotOpened,
    /// A socket could not be created or connected.
    #[error("failed to connect {endpoint}: {source}")]
    Connect {
        /// The endpoint that failed.
        endpoint: String,
        /// The underlying transport error.
        source: zmq::Error,
    },
    /// Transport-level failure while setting up internal plumbing.
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
}

/// The client role. All methods take `&self`; share it behind an
/// [`Arc`] to issue requests from several threads.
pub struct Client {
    dealer_endpoint: String,
    sub_endpoint: String,
    context: zmq::Context,
    opened: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    next_command_id: Arc<AtomicU64>,
    correlator: Arc<Correlator>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    request_push: Mutex<Option<zmq::Socket>>,
    control_endpoint: Mutex<Option<String>>,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a closed client for the given request and subscribe
    /// endpoints.
    pub fn new(dealer_endpoint: impl Into<String>, sub_endpoint: impl Into<String>) -> Self {
        Self {
            dealer_endpoint: dealer_endpoint.into(),
            sub_endpoint: sub_endpoint.into(),
            context: zmq::Context::new(),
            opened: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            next_command_id: Arc::new(AtomicU64::new(0)),
            correlator: Arc::new(Correlator::new()),
            slots: Arc::new(Mutex::new(HashMap::new())),
            request_push: Mutex::new(None),
            control_endpoint: Mutex::new(None),
            reactor: Mutex::new(None),
        }
    }

    /// Whether the sockets are open. Does not imply the server has ever
    /// answered.
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Connects the request and subscribe sockets and starts the reactor.
    /// Idempotent while open. `timeout` is the dealer send/receive
    /// timeout and the receive-timeout window for outstanding requests.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when a socket cannot be created or
    /// connected; everything opened so far is cleaned up.
    pub fn open(&self, timeout: Duration) -> Result<(), ClientError> {
        if self.is_opened() {
            return Ok(());
        }
        // Clear any stale reactor state from a previous session.
        self.close();

        let dealer = worker::open_dealer(&self.context, &self.dealer_endpoint, timeout).map_err(
            |source| ClientError::Connect {
                endpoint: self.dealer_endpoint.clone(),
                source,
            },
        )?;
        let subscriber = worker::open_subscriber(&self.context, &self.sub_endpoint, timeout)
            .map_err(|source| ClientError::Connect {
                endpoint: self.sub_endpoint.clone(),
                source,
            })?;

        let relay_endpoint = control::unique_inproc_endpoint("client-requests");
        let relay = self.context.socket(zmq::PULL)?;
        relay.set_linger(0)?;
        relay.bind(&relay_endpoint)?;
        let push = self.context.socket(zmq::PUSH)?;
        push.set_linger(0)?;
        // Bounded so a caller cannot block forever handing off a request
        // while the reactor is going down.
        push.set_sndtimeo(1000)?;
        push.connect(&relay_endpoint)?;

        let control = ControlSocket::bind(&self.context, "client")?;
        *self
            .control_endpoint
            .lock()
            .expect("control endpoint poisoned") = Some(control.endpoint().to_owned());
        *self.request_push.lock().expect("request push poisoned") = Some(push);

        self.running.store(true, Ordering::SeqCst);
        self.opened.store(true, Ordering::SeqCst);

        let reactor = Reactor::new(
            self.context.clone(),
            ReactorConfig {
                dealer_endpoint: self.dealer_endpoint.clone(),
                sub_endpoint: self.sub_endpoint.clone(),
                request_timeout: timeout,
            },
            dealer,
            subscriber,
            relay,
            control,
            ReactorShared {
                correlator: Arc::clone(&self.correlator),
                slots: Arc::clone(&self.slots),
                next_command_id: Arc::clone(&self.next_command_id),
                opened: Arc::clone(&self.opened),
                running: Arc::clone(&self.running),
            },
        );
        let handle = std::thread::Builder::new()
            .name("tether-client".into())
            .spawn(move || reactor.run())
            .expect("failed to spawn client reactor");
        *self.reactor.lock().expect("reactor poisoned") = Some(handle);

        info!(
            dealer = %self.dealer_endpoint,
            subscriber = %self.sub_endpoint,
            "client opened"
        );
        Ok(())
    }

    /// Stops the reactor and closes all sockets. Every outstanding
    /// request fails with a distinct error before this returns.
    /// Idempotent.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(endpoint) = self
            .control_endpoint
            .lock()
            .expect("control endpoint poisoned")
            .take()
        {
            if let Err(_e) = control::signal_stop(&self.context, &endpoint) {
                warn!(error = %_e, "failed to signal reactor shutdown");
            }
        }
        if let Some(handle) = self.reactor.lock().expect("reactor poisoned").take() {
            let _ = handle.join();
            info!("client closed");
        }
        *self.request_push.lock().expect("request push poisoned") = None;
        self.opened.store(false, Ordering::SeqCst);
    }

    /// Reads one variable from the server. `None` on a miss or error
    /// (logged).
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        if !self.is_opened() {
            warn!("client is not opened");
            return None;
        }
        let command = CommandMessage::get_variable(self.next_id(), name);
        let response = self.send_command_sync(command);
        if !response.success {
            warn!(variable = %name, error = %response.error_text(), "get variable failed");
            return None;
        }
        response.variable.as_ref().and_then(|v| v.value())
    }

    /// Snapshot of every variable on the server. Empty on error (logged).
    #[must_use]
    pub fn get_all_variables(&self) -> HashMap<String, Value> {
        let mut result = HashMap::new();
        if !self.is_opened() {
            warn!("client is not opened");
            return result;
        }
        let response = self.send_command_sync(CommandMessage::get_all_variables(self.next_id()));
        if response.success {
            for variable in &response.variables {
                if let Some(value) = variable.value() {
                    result.insert(variable.name.clone(), value);
                }
            }
        } else {
            warn!(error = %response.error_text(), "get all variables failed");
        }
        result
    }

    /// Names of every trigger on the server. Empty on error (logged).
    #[must_use]
    pub fn get_all_triggers(&self) -> Vec<String> {
        if !self.is_opened() {
            warn!("client is not opened");
            return Vec::new();
        }
        let response = self.send_command_sync(CommandMessage::get_all_triggers(self.next_id()));
        if !response.success {
            warn!(error = %response.error_text(), "get all triggers failed");
            return Vec::new();
        }
        response
            .triggers
            .into_iter()
            .map(|trigger| trigger.name)
            .collect()
    }

    /// Writes one variable on the server.
    ///
    /// `Ok` means the request was handed off, not that the value changed;
    /// the server's verdict (read-only, type mismatch, …) arrives in the
    /// response passed to `callback`. With [`ConnectionOptions::Sync`]
    /// the call blocks until that response; with
    /// [`ConnectionOptions::Async`] the callback runs later on the
    /// reactor thread.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotOpened`] when the client is closed.
    pub fn set_variable(
        &self,
        name: &str,
        value: impl Into<Value>,
        options: ConnectionOptions,
        callback: Option<ResponseCallback>,
    ) -> Result<(), ClientError> {
        if !self.is_opened() {
            return Err(ClientError::NotOpened);
        }
        let command = CommandMessage::set_variable(self.next_id(), name, &value.into());
        self.dispatch(command, options, callback)
    }

    /// Executes a trigger on the server. Same discipline as
    /// [`Client::set_variable`].
    ///
    /// # Errors
    ///
    /// [`ClientError::NotOpened`] when the client is closed.
    pub fn execute_trigger(
        &self,
        name: &str,
        options: ConnectionOptions,
        callback: Option<ResponseCallback>,
    ) -> Result<(), ClientError> {
        if !self.is_opened() {
            return Err(ClientError::NotOpened);
        }
        let command = CommandMessage::execute_trigger(self.next_id(), name);
        self.dispatch(command, options, callback)
    }

    /// Registers a callback for publications of variable `name`. The
    /// callback fires on the reactor thread whenever a received value
    /// differs from the last one delivered; the first publication always
    /// delivers.
    pub fn register_callback(&self, name: impl Into<String>, callback: VariableChangedCallback) {
        self.slots.lock().expect("slots poisoned").insert(
            name.into(),
            Slot {
                callback,
                last_delivered: None,
            },
        );
    }

    fn next_id(&self) -> u64 {
        self.next_command_id.fetch_add(1, Ordering::SeqCst)
    }

    fn dispatch(
        &self,
        command: CommandMessage,
        options: ConnectionOptions,
        callback: Option<ResponseCallback>,
    ) -> Result<(), ClientError> {
        match options {
            ConnectionOptions::Sync => {
                let response = self.send_command_sync(command);
                if let Some(callback) = callback {
                    callback(&response);
                }
                Ok(())
            }
            ConnectionOptions::Async => {
                let id = command.command_id;
                debug!(command_id = id, kind = ?command.command_kind(), "sending command (async)");
                // Register even without a callback so the response is
                // consumed instead of logged as unknown.
                self.correlator
                    .register_async(id, callback.unwrap_or_else(|| Box::new(|_| {})));
                if let Err(error) = self.push_request(id, &command) {
                    self.correlator.forget(id);
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// Sends a command and blocks until its response (or a failure
    /// response synthesized by the transport layer).
    fn send_command_sync(&self, command: CommandMessage) -> ResponseMessage {
        let id = command.command_id;
        debug!(command_id = id, kind = ?command.command_kind(), "sending command (sync)");
        let waiter = self.correlator.register_sync(id);
        if let Err(_e) = self.push_request(id, &command) {
            self.correlator.forget(id);
            warn!(command_id = id, error = %_e, "failed to hand command to reactor");
            return ResponseMessage::failed(id, format!("ZeroMQ error: {_e}"));
        }
        waiter
            .recv()
            .unwrap_or_else(|_| ResponseMessage::failed(id, "Client connection closed"))
    }

    /// Hands a framed request to the reactor over the relay.
    fn push_request(&self, id: u64, command: &CommandMessage) -> Result<(), ClientError> {
        let guard = self.request_push.lock().expect("request push poisoned");
        let Some(push) = guard.as_ref() else {
            return Err(ClientError::NotOpened);
        };
        let payload = command.encode_to_vec();
        push.send(&frames::encode_command_id(id)[..], zmq::SNDMORE)?;
        push.send(payload.as_slice(), 0)?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
