//! Multipart framing helpers for the dealer/router channel and the
//! in-process relays.
//!
//! Router-side requests arrive as `[identity][empty][payload]`; replies
//! must echo the identity frame or the transport silently misroutes them.
//! Dealer-side the transport supplies the identity, so the client sends
//! and receives `[empty][payload]`.

use crate::trace::warn;

/// A request received on a router socket, with the identity frame
/// captured by value so the reply can be routed back.
pub(crate) struct RoutedRequest {
    pub identity: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Receives one routed request. Returns `None` (after logging) when the
/// peer sent a malformed frame sequence; extra trailing frames are
/// discarded so a bad peer cannot desynchronize the stream.
pub(crate) fn recv_routed(socket: &zmq::Socket) -> Result<Option<RoutedRequest>, zmq::Error> {
    let mut parts = socket.recv_multipart(0)?;
    if parts.len() < 3 {
        warn!(frames = parts.len(), "malformed routed request dropped");
        return Ok(None);
    }
    if parts.len() > 3 {
        warn!(frames = parts.len(), "extra frames on routed request discarded");
    }
    let payload = parts.swap_remove(2);
    let identity = parts.swap_remove(0);
    Ok(Some(RoutedRequest { identity, payload }))
}

/// Sends `[identity][empty][payload]` on a router socket.
pub(crate) fn send_routed(
    socket: &zmq::Socket,
    identity: &[u8],
    payload: &[u8],
) -> Result<(), zmq::Error> {
    socket.send(identity, zmq::SNDMORE)?;
    socket.send(&b""[..], zmq::SNDMORE)?;
    socket.send(payload, 0)
}

/// Sends `[empty][payload]` on a dealer socket.
pub(crate) fn send_dealer(socket: &zmq::Socket, payload: &[u8]) -> Result<(), zmq::Error> {
    socket.send(&b""[..], zmq::SNDMORE)?;
    socket.send(payload, 0)
}

/// Receives one `[empty][payload]` reply on a dealer socket. Returns
/// `None` (after logging) on a malformed frame sequence.
pub(crate) fn recv_dealer(socket: &zmq::Socket) -> Result<Option<Vec<u8>>, zmq::Error> {
    let mut parts = socket.recv_multipart(0)?;
    if parts.len() < 2 {
        warn!(frames = parts.len(), "malformed dealer reply dropped");
        return Ok(None);
    }
    if parts.len() > 2 {
        warn!(frames = parts.len(), "extra frames on dealer reply discarded");
    }
    Ok(Some(parts.swap_remove(1)))
}

/// Encodes a command id for the request-relay prefix frame.
pub(crate) fn encode_command_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decodes a request-relay prefix frame back into a command id.
pub(crate) fn decode_command_id(frame: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(frame.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::control::unique_inproc_endpoint;

    #[test]
    fn dealer_router_roundtrip() {
        let context = zmq::Context::new();
        let endpoint = unique_inproc_endpoint("frames");

        let router = context.socket(zmq::ROUTER).unwrap();
        router.bind(&endpoint).unwrap();
        let dealer = context.socket(zmq::DEALER).unwrap();
        dealer.connect(&endpoint).unwrap();

        send_dealer(&dealer, b"ping").unwrap();

        let request = recv_routed(&router).unwrap().expect("well-formed request");
        assert_eq!(request.payload, b"ping");

        send_routed(&router, &request.identity, b"pong").unwrap();

        let reply = recv_dealer(&dealer).unwrap().expect("well-formed reply");
        assert_eq!(reply, b"pong");
    }

    #[test]
    fn malformed_routed_request_is_dropped() {
        let context = zmq::Context::new();
        let endpoint = unique_inproc_endpoint("frames");

        let router = context.socket(zmq::ROUTER).unwrap();
        router.bind(&endpoint).unwrap();
        let dealer = context.socket(zmq::DEALER).unwrap();
        dealer.connect(&endpoint).unwrap();

        // A bare payload with no empty delimiter arrives at the router as
        // two frames instead of three.
        dealer.send(&b"oops"[..], 0).unwrap();
        assert!(recv_routed(&router).unwrap().is_none());
    }

    #[test]
    fn command_id_prefix_roundtrip() {
        let bytes = encode_command_id(0xDEAD_BEEF_0042);
        assert_eq!(decode_command_id(&bytes), Some(0xDEAD_BEEF_0042));
        assert_eq!(decode_command_id(b"short"), None);
    }
}
