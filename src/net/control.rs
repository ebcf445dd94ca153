//! PAIR control socket used to break a polling thread out of its poll.
//!
//! A stop flag alone is not enough: the poll would not observe it until
//! another frame arrives. Sending a sentinel frame on the control PAIR is
//! the single sanctioned wake-up path.

use crate::trace::debug;

/// Sentinel frame sent to request shutdown. Any frame on the control
/// socket is treated as a shutdown request; the sentinel exists for logs.
pub(crate) const STOP_SENTINEL: &[u8] = b"STOP";

/// Returns a process-unique `inproc://` address for a role's plumbing
/// socket, so several roles (and several instances of one role) can
/// coexist in one process.
pub(crate) fn unique_inproc_endpoint(role: &str) -> String {
    format!(
        "inproc://tether-{role}-{}-{:08x}",
        std::process::id(),
        rand::random::<u32>()
    )
}

/// The poll-loop end of the control channel: a PAIR socket bound to a
/// process-unique inproc address.
pub(crate) struct ControlSocket {
    socket: zmq::Socket,
    endpoint: String,
}

impl ControlSocket {
    /// Creates and binds the control PAIR for `role`.
    pub(crate) fn bind(context: &zmq::Context, role: &str) -> Result<Self, zmq::Error> {
        let socket = context.socket(zmq::PAIR)?;
        socket.set_linger(0)?;
        let endpoint = unique_inproc_endpoint(role);
        socket.bind(&endpoint)?;
        Ok(Self { socket, endpoint })
    }

    /// The bound inproc address, for [`signal_stop`].
    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The underlying socket, for inclusion in a pollset.
    pub(crate) fn socket(&self) -> &zmq::Socket {
        &self.socket
    }

    /// Receives and discards the pending control frame.
    pub(crate) fn drain(&self) {
        if let Ok(_frame) = self.socket.recv_bytes(zmq::DONTWAIT) {
            debug!(sentinel = ?_frame, "control signal received");
        }
    }
}

/// Connects a short-lived PAIR to `endpoint` and sends the stop sentinel.
pub(crate) fn signal_stop(context: &zmq::Context, endpoint: &str) -> Result<(), zmq::Error> {
    let socket = context.socket(zmq::PAIR)?;
    socket.set_linger(0)?;
    socket.connect(endpoint)?;
    socket.send(STOP_SENTINEL, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wakes_a_poller() {
        let context = zmq::Context::new();
        let control = ControlSocket::bind(&context, "test").unwrap();

        signal_stop(&context, control.endpoint()).unwrap();

        let mut items = [control.socket().as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, 1000).unwrap();
        assert!(items[0].is_readable());
        control.drain();
    }

    #[test]
    fn endpoints_are_process_unique() {
        assert_ne!(unique_inproc_endpoint("a"), unique_inproc_endpoint("a"));
    }
}
