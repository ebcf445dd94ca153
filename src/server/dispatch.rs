//! The dispatcher: a single thread polling the request socket(s) and the
//! control socket, offloading command handling to the worker pool.
//!
//! Workers cannot send on the ROUTER directly (`zmq::Socket` is not
//! `Sync`), so each completed response travels back over an in-process
//! PUSH/PULL relay as `[router_index][identity][payload]`; the dispatcher
//! forwards it on the originating router with the identity frame echoed.
//! The PUSH side is shared by all workers under a mutex, which is what
//! serializes concurrent response sends. Responses may leave in a
//! different order than their requests arrived; peers correlate by
//! `command_id`, never by frame order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use prost::Message;

use crate::net::control::ControlSocket;
use crate::net::frames;
use crate::pool::WorkerPool;
use crate::trace::{debug, error, info, warn};
use crate::wire::message::{CommandKind, CommandMessage, ResponseMessage, VariableMessage};

use super::registry::{PeerSetOutcome, Registry};

pub(crate) struct Dispatcher {
    routers: Vec<zmq::Socket>,
    reply_pull: zmq::Socket,
    reply_push: Arc<Mutex<zmq::Socket>>,
    control: ControlSocket,
    pool: Arc<WorkerPool>,
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub(crate) fn new(
        routers: Vec<zmq::Socket>,
        reply_pull: zmq::Socket,
        reply_push: Arc<Mutex<zmq::Socket>>,
        control: ControlSocket,
        pool: Arc<WorkerPool>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            routers,
            reply_pull,
            reply_push,
            control,
            pool,
            registry,
        }
    }

    /// Runs until the control socket signals shutdown or a socket error
    /// terminates the loop.
    pub(crate) fn run(self) {
        if let Err(_e) = self.poll_loop() {
            error!(error = %_e, "dispatcher terminated on socket error");
        }
    }

    fn poll_loop(&self) -> Result<(), zmq::Error> {
        let router_count = self.routers.len();
        loop {
            let (routers_ready, replies_ready, control_ready) = {
                let mut items: Vec<zmq::PollItem<'_>> = self
                    .routers
                    .iter()
                    .map(|router| router.as_poll_item(zmq::POLLIN))
                    .collect();
                items.push(self.reply_pull.as_poll_item(zmq::POLLIN));
                items.push(self.control.socket().as_poll_item(zmq::POLLIN));

                zmq::poll(&mut items, -1)?;

                let routers_ready: Vec<bool> =
                    items[..router_count].iter().map(zmq::PollItem::is_readable).collect();
                (
                    routers_ready,
                    items[router_count].is_readable(),
                    items[router_count + 1].is_readable(),
                )
            };

            for (index, ready) in routers_ready.into_iter().enumerate() {
                if ready {
                    self.handle_request(index)?;
                }
            }
            if replies_ready {
                self.forward_replies()?;
            }
            if control_ready {
                self.control.drain();
                info!("dispatcher received shutdown signal");
                return Ok(());
            }
        }
    }

    /// Receives one request from `routers[index]` and offloads it.
    fn handle_request(&self, router_index: usize) -> Result<(), zmq::Error> {
        let Some(request) = frames::recv_routed(&self.routers[router_index])? else {
            return Ok(());
        };

        let command = match CommandMessage::decode(request.payload.as_slice()) {
            Ok(command) => command,
            Err(_e) => {
                warn!(error = %_e, "dropping undecodable request");
                return Ok(());
            }
        };
        debug!(
            command_id = command.command_id,
            kind = ?command.command_kind(),
            "command received"
        );

        let registry = Arc::clone(&self.registry);
        let reply_push = Arc::clone(&self.reply_push);
        let identity = request.identity;
        let submitted = self.pool.execute(move || {
            let response = handle_command(&registry, &command);
            let payload = response.encode_to_vec();
            let push = reply_push.lock().expect("reply push poisoned");
            let index_frame = [router_index as u8];
            let result = push
                .send(&index_frame[..], zmq::SNDMORE)
                .and_then(|()| push.send(identity.as_slice(), zmq::SNDMORE))
                .and_then(|()| push.send(payload.as_slice(), 0));
            if let Err(_e) = result {
                warn!(
                    command_id = response.command_id,
                    error = %_e,
                    "failed to relay response; peer will time out"
                );
            }
        });
        if submitted.is_err() {
            warn!("worker pool stopped; dropping request");
        }
        Ok(())
    }

    /// Drains completed responses from the relay and sends each on its
    /// originating router.
    fn forward_replies(&self) -> Result<(), zmq::Error> {
        loop {
            let parts = match self.reply_pull.recv_multipart(zmq::DONTWAIT) {
                Ok(parts) => parts,
                Err(zmq::Error::EAGAIN) => return Ok(()),
                Err(e) => return Err(e),
            };
            if parts.len() != 3 || parts[0].len() != 1 {
                warn!(frames = parts.len(), "malformed relay reply dropped");
                continue;
            }
            let index = parts[0][0] as usize;
            let Some(router) = self.routers.get(index) else {
                warn!(router = index, "relay reply for unknown router dropped");
                continue;
            };
            frames::send_routed(router, &parts[1], &parts[2])?;
        }
    }
}

/// Computes the response for one decoded command. Pure with respect to
/// sockets, so every command semantics test can run without a transport.
pub(crate) fn handle_command(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    match command.command_kind() {
        Some(CommandKind::GetVariable) => handle_get_variable(registry, command),
        Some(CommandKind::SetVariable) => handle_set_variable(registry, command),
        Some(CommandKind::GetAllVariables) => handle_get_all_variables(registry, command),
        Some(CommandKind::GetAllTriggers) => handle_get_all_triggers(registry, command),
        Some(CommandKind::ExecuteTrigger) => handle_execute_trigger(registry, command),
        None => ResponseMessage::failed(command.command_id, "Unknown command type"),
    }
}

fn handle_get_variable(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    let name = command.variable_name.as_deref().unwrap_or_default();
    match registry.variable(name) {
        Some((value, read_only)) => {
            let mut response = ResponseMessage::ok(command.command_id);
            response.variable = Some(VariableMessage::from_parts(name, &value, read_only));
            response
        }
        None => ResponseMessage::failed(
            command.command_id,
            format!("Variable not found: {name}"),
        ),
    }
}

fn handle_set_variable(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    let id = command.command_id;
    let Some(variable) = command.variable.as_ref() else {
        return ResponseMessage::failed(id, "Variable not specified");
    };
    let name = variable.name.as_str();

    match registry.apply_peer_set(name, variable.value()) {
        PeerSetOutcome::NotFound => {
            ResponseMessage::failed(id, format!("Variable not found: {name}"))
        }
        PeerSetOutcome::ReadOnly => {
            ResponseMessage::failed(id, format!("Variable {name} is READ ONLY"))
        }
        PeerSetOutcome::KindMismatch { expected } => ResponseMessage::failed(
            id,
            format!(
                "Type mismatch: Variable '{name}' is {expected}, but received non-{expected} value"
            ),
        ),
        PeerSetOutcome::Unchanged => {
            ResponseMessage::ok(id).with_note(format!("Variable updated: {name}"))
        }
        PeerSetOutcome::Updated { value, callback } => {
            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(&value))).is_err() {
                    error!(variable = %name, "change callback panicked");
                    return ResponseMessage::failed(
                        id,
                        "Exception occured in server-side callback",
                    );
                }
            }
            ResponseMessage::ok(id).with_note(format!("Variable updated: {name}"))
        }
    }
}

fn handle_get_all_variables(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    let mut response = ResponseMessage::ok(command.command_id);
    response.variables = registry
        .variables_snapshot()
        .into_iter()
        .map(|(name, value, read_only)| VariableMessage::from_parts(name, &value, read_only))
        .collect();
    response
}

fn handle_get_all_triggers(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    let mut response = ResponseMessage::ok(command.command_id);
    response.triggers = registry
        .trigger_names()
        .into_iter()
        .map(|name| crate::wire::message::TriggerMessage { name })
        .collect();
    response
}

fn handle_execute_trigger(registry: &Registry, command: &CommandMessage) -> ResponseMessage {
    let id = command.command_id;
    let Some(trigger) = command.trigger.as_ref() else {
        return ResponseMessage::failed(id, "Trigger name not specified");
    };
    let name = trigger.name.as_str();

    match registry.trigger_callback(name) {
        Some(callback) => {
            callback();
            ResponseMessage::ok(id).with_note(format!("Trigger executed: {name}"))
        }
        None => ResponseMessage::failed(id, format!("Failed to execute trigger: {name}")),
    }
}
