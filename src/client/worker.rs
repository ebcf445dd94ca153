//! The client reactor: one thread multiplexing the dealer, the
//! subscriber, the caller-request relay, and the control socket.
//!
//! Caller threads never touch the dealer (`zmq::Socket` is not `Sync`);
//! they register a waiter with the correlator and push the framed request
//! over an in-process relay, and the reactor forwards it as
//! `[empty][payload]`. Incoming responses are correlated by `command_id`;
//! incoming publications go through duplicate suppression before the
//! registered change callback fires.
//!
//! The reactor also runs the reconnect state machine. The poll timeout is
//! bounded by the earliest pending deadline (receive timeout or backoff)
//! so those deadlines fire without depending on unrelated traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use prost::Message;
use thiserror::Error;

use crate::net::control::ControlSocket;
use crate::net::frames;
use crate::trace::{debug, error, info, warn};
use crate::wire::message::{CommandMessage, ResponseMessage, VariableMessage};
use crate::wire::value::{Value, VariableChangedCallback};

use super::correlator::Correlator;
use super::reconnect::{MAX_RECONNECT_ATTEMPTS, ReconnectPolicy};

/// A registered change callback and the last value delivered to it.
/// `last_delivered` starts unset, so the first publication always
/// delivers.
pub(crate) struct Slot {
    pub callback: VariableChangedCallback,
    pub last_delivered: Option<Value>,
}

/// Handles shared between the [`Client`](crate::client::Client) and its
/// reactor thread.
pub(crate) struct ReactorShared {
    pub correlator: Arc<Correlator>,
    pub slots: Arc<Mutex<HashMap<String, Slot>>>,
    pub next_command_id: Arc<AtomicU64>,
    pub opened: Arc<AtomicBool>,
    pub running: Arc<AtomicBool>,
}

/// Endpoints and tuning the reactor needs to recreate its sockets.
pub(crate) struct ReactorConfig {
    pub dealer_endpoint: String,
    pub sub_endpoint: String,
    pub request_timeout: Duration,
}

/// Creates and connects a dealer socket with send/receive timeouts.
pub(crate) fn open_dealer(
    context: &zmq::Context,
    endpoint: &str,
    timeout: Duration,
) -> Result<zmq::Socket, zmq::Error> {
    let socket = context.socket(zmq::DEALER)?;
    socket.set_linger(0)?;
    let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    socket.set_rcvtimeo(ms)?;
    socket.set_sndtimeo(ms)?;
    socket.connect(endpoint)?;
    Ok(socket)
}

/// Creates and connects a subscriber socket receiving all topics.
pub(crate) fn open_subscriber(
    context: &zmq::Context,
    endpoint: &str,
    timeout: Duration,
) -> Result<zmq::Socket, zmq::Error> {
    let socket = context.socket(zmq::SUB)?;
    socket.set_linger(0)?;
    let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    socket.set_rcvtimeo(ms)?;
    socket.set_subscribe(b"")?;
    socket.connect(endpoint)?;
    Ok(socket)
}

#[derive(Debug, Error)]
enum ReconnectError {
    #[error("transport error: {0}")]
    Transport(#[from] zmq::Error),
    #[error("no response to liveness probe")]
    ProbeTimeout,
}

enum ExitReason {
    /// Close was requested on the control socket.
    Stopped,
    /// All reconnect attempts failed; outstanding requests already
    /// carry the reconnect error.
    Exhausted,
    /// An unrecoverable socket error in the loop itself.
    SocketError,
}

struct Readable {
    dealer: bool,
    subscriber: bool,
    relay: bool,
    control: bool,
}

pub(crate) struct Reactor {
    context: zmq::Context,
    config: ReactorConfig,
    dealer: zmq::Socket,
    subscriber: zmq::Socket,
    relay: zmq::Socket,
    control: ControlSocket,
    shared: ReactorShared,
    policy: ReconnectPolicy,
    need_reconnect: bool,
    last_attempt: Instant,
    /// Last time anything arrived on (or was successfully sent on) the
    /// dealer; the receive-timeout clock.
    last_activity: Instant,
}

impl Reactor {
    pub(crate) fn new(
        context: zmq::Context,
        config: ReactorConfig,
        dealer: zmq::Socket,
        subscriber: zmq::Socket,
        relay: zmq::Socket,
        control: ControlSocket,
        shared: ReactorShared,
    ) -> Self {
        Self {
            context,
            config,
            dealer,
            subscriber,
            relay,
            control,
            shared,
            policy: ReconnectPolicy::new(),
            need_reconnect: false,
            last_attempt: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn run(mut self) {
        match self.event_loop() {
            ExitReason::Stopped | ExitReason::SocketError => {
                self.shared.correlator.fail_all("Client connection closed");
            }
            ExitReason::Exhausted => {}
        }
        self.shared.opened.store(false, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        info!("client reactor stopped");
    }

    fn event_loop(&mut self) -> ExitReason {
        while self.shared.running.load(Ordering::SeqCst) {
            if self.need_reconnect && !self.step_reconnect() {
                return ExitReason::Exhausted;
            }

            let readable = match self.poll_once() {
                Ok(readable) => readable,
                Err(_e) => {
                    error!(error = %_e, "reactor poll failed");
                    return ExitReason::SocketError;
                }
            };

            if readable.control {
                self.control.drain();
                return ExitReason::Stopped;
            }
            if readable.relay {
                self.forward_requests();
            }
            if readable.dealer {
                self.handle_dealer();
            }
            if readable.subscriber {
                self.handle_subscriber();
            }
            self.check_receive_timeout();
        }
        ExitReason::Stopped
    }

    fn poll_once(&self) -> Result<Readable, zmq::Error> {
        let mut items = [
            self.dealer.as_poll_item(zmq::POLLIN),
            self.subscriber.as_poll_item(zmq::POLLIN),
            self.relay.as_poll_item(zmq::POLLIN),
            self.control.socket().as_poll_item(zmq::POLLIN),
        ];
        zmq::poll(&mut items, self.poll_timeout())?;
        Ok(Readable {
            dealer: items[0].is_readable(),
            subscriber: items[1].is_readable(),
            relay: items[2].is_readable(),
            control: items[3].is_readable(),
        })
    }

    /// Infinite unless a deadline is pending: the receive timeout while
    /// requests are outstanding, or the backoff delay while reconnecting.
    fn poll_timeout(&self) -> i64 {
        let mut deadline: Option<Duration> = None;
        if self.need_reconnect {
            deadline = Some(
                self.policy
                    .current_delay()
                    .saturating_sub(self.last_attempt.elapsed()),
            );
        } else if self.shared.correlator.outstanding() > 0 {
            deadline = Some(
                self.config
                    .request_timeout
                    .saturating_sub(self.last_activity.elapsed()),
            );
        }
        match deadline {
            Some(remaining) => i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX),
            None => -1,
        }
    }

    /// Drains caller requests from the relay and forwards each on the
    /// dealer. A request that cannot be sent fails immediately through
    /// the correlator; send failures do not trigger reconnect.
    fn forward_requests(&mut self) {
        loop {
            let parts = match self.relay.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => return,
                Err(_e) => {
                    warn!(error = %_e, "request relay receive failed");
                    return;
                }
            };
            if parts.len() != 2 {
                warn!(frames = parts.len(), "malformed relay request dropped");
                continue;
            }
            let Some(command_id) = frames::decode_command_id(&parts[0]) else {
                warn!("relay request with bad id prefix dropped");
                continue;
            };
            match frames::send_dealer(&self.dealer, &parts[1]) {
                Ok(()) => {
                    self.last_activity = Instant::now();
                }
                Err(zmq::Error::EAGAIN) => {
                    warn!(command_id, "send timeout on dealer socket");
                    self.fail_command(command_id, "Send timeout");
                }
                Err(e) => {
                    warn!(command_id, error = %e, "dealer send failed");
                    self.fail_command(command_id, &format!("ZeroMQ error: {e}"));
                }
            }
        }
    }

    fn handle_dealer(&mut self) {
        match frames::recv_dealer(&self.dealer) {
            Ok(Some(payload)) => {
                self.last_activity = Instant::now();
                match ResponseMessage::decode(payload.as_slice()) {
                    Ok(response) => {
                        let _command_id = response.command_id;
                        if !self.shared.correlator.deliver(response) {
                            debug!(command_id = _command_id, "response for unknown command id dropped");
                        }
                    }
                    Err(_e) => warn!(error = %_e, "dropping undecodable response"),
                }
            }
            Ok(None) => {}
            Err(zmq::Error::EAGAIN) => {
                warn!("receive timeout on dealer socket");
                self.begin_reconnect();
            }
            Err(_e) => {
                warn!(error = %_e, "dealer receive failed");
                self.begin_reconnect();
            }
        }
    }

    fn handle_subscriber(&mut self) {
        let message = match self.subscriber.recv_bytes(0) {
            Ok(message) => message,
            Err(zmq::Error::EAGAIN) => {
                // Subscriber timeouts alone are not fatal.
                debug!("receive timeout on subscriber socket");
                return;
            }
            Err(_e) => {
                warn!(error = %_e, "subscriber receive failed");
                self.begin_reconnect();
                return;
            }
        };

        let Ok(update) = VariableMessage::decode(message.as_slice()) else {
            warn!("dropping undecodable publication");
            return;
        };
        let Some(value) = update.value() else {
            debug!(variable = %update.name, "dropping publication with unset value");
            return;
        };

        let callback = {
            let mut slots = self.shared.slots.lock().expect("slots poisoned");
            let Some(slot) = slots.get_mut(&update.name) else {
                return;
            };
            // Deliver only when the value differs from the last delivered
            // one; this breaks feedback cycles in bidirectional bindings.
            if slot.last_delivered.as_ref() == Some(&value) {
                return;
            }
            slot.last_delivered = Some(value.clone());
            Arc::clone(&slot.callback)
        };
        callback(&value);
    }

    fn check_receive_timeout(&mut self) {
        if self.need_reconnect || self.shared.correlator.outstanding() == 0 {
            return;
        }
        if self.last_activity.elapsed() >= self.config.request_timeout {
            warn!("receive timeout on dealer socket");
            self.begin_reconnect();
        }
    }

    fn begin_reconnect(&mut self) {
        if !self.need_reconnect {
            self.need_reconnect = true;
            self.last_attempt = Instant::now();
        }
    }

    /// One pass of the reconnect machine. Returns false when the policy
    /// is exhausted and the reactor must exit.
    fn step_reconnect(&mut self) -> bool {
        if self.policy.exhausted() {
            error!("max reconnection attempts reached, giving up");
            // Mark closed before failing the waiters so a caller woken by
            // the failure response observes a closed client.
            self.shared.opened.store(false, Ordering::SeqCst);
            self.shared
                .correlator
                .fail_all("Failed to reconnect after maximum attempts");
            return false;
        }
        if self.last_attempt.elapsed() < self.policy.current_delay() {
            return true; // not due yet; the poll timeout brings us back
        }

        info!(
            attempt = self.policy.next_attempt(),
            max = MAX_RECONNECT_ATTEMPTS,
            "attempting to reconnect"
        );
        self.last_attempt = Instant::now();
        match self.try_reconnect() {
            Ok(()) => {
                info!("reconnection successful");
                self.policy.reset();
                self.need_reconnect = false;
                self.shared.opened.store(true, Ordering::SeqCst);
                self.last_activity = Instant::now();
                self.shared
                    .correlator
                    .fail_all("Connection reset during operation");
            }
            Err(_e) => {
                warn!(error = %_e, "reconnect attempt failed");
                self.policy.record_failure();
            }
        }
        true
    }

    /// Recreates both sockets and verifies the server actually answers.
    /// Transport connects are asynchronous and succeed even with no
    /// server, so liveness is probed with a throwaway command.
    fn try_reconnect(&mut self) -> Result<(), ReconnectError> {
        self.dealer = open_dealer(
            &self.context,
            &self.config.dealer_endpoint,
            self.config.request_timeout,
        )?;
        self.subscriber = open_subscriber(
            &self.context,
            &self.config.sub_endpoint,
            self.config.request_timeout,
        )?;

        let probe_id = self.shared.next_command_id.fetch_add(1, Ordering::SeqCst);
        let probe = CommandMessage::get_all_variables(probe_id);
        frames::send_dealer(&self.dealer, &probe.encode_to_vec())?;
        // Any reply on the fresh socket proves the server is back; the
        // socket's receive timeout bounds the wait.
        match self.dealer.recv_multipart(0) {
            Ok(_) => Ok(()),
            Err(zmq::Error::EAGAIN) => Err(ReconnectError::ProbeTimeout),
            Err(e) => Err(ReconnectError::Transport(e)),
        }
    }

    fn fail_command(&self, command_id: u64, error_message: &str) {
        self.shared
            .correlator
            .deliver(ResponseMessage::failed(command_id, error_message));
    }
}
