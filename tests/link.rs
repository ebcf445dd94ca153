//! End-to-end tests over live sockets: one server, one or more clients,
//! real publications.
//!
//! Every test binds its own ipc endpoints (pid + random nonce) so tests
//! can run in parallel without clashing.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=tether=debug cargo test --features tracing -- --nocapture
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

use tether::{
    Client, ConnectionOptions, ResponseMessage, Server, ServerConfig, Value, Variable,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(tether::init_tracing);
}

/// Fresh ipc endpoint pair (router, publisher) for one test.
fn unique_endpoints() -> (String, String) {
    let nonce: u32 = rand::random();
    let pid = std::process::id();
    (
        format!("ipc:///tmp/tether-test-{pid}-{nonce:08x}-req"),
        format!("ipc:///tmp/tether-test-{pid}-{nonce:08x}-pub"),
    )
}

/// Captures sync/async responses from a send path.
fn response_capture() -> (
    Box<dyn FnOnce(&ResponseMessage) + Send>,
    Receiver<ResponseMessage>,
) {
    let (sender, receiver): (Sender<ResponseMessage>, _) = bounded(1);
    (
        Box::new(move |response: &ResponseMessage| {
            let _ = sender.send(response.clone());
        }),
        receiver,
    )
}

/// Publications need a moment after `open` before the SUB socket is
/// actually joined; anything published earlier is dropped by design.
fn settle() {
    std::thread::sleep(Duration::from_millis(300));
}

#[test]
fn typed_set_happy_path() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    server.register_variable(
        Variable::new("exposure", 100.0),
        Some(Arc::new(move |value: &Value| {
            sink.lock().unwrap().push(value.clone());
        })),
    );
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let (callback, response_rx) = response_capture();
    client
        .set_variable("exposure", 250.0, ConnectionOptions::Sync, Some(callback))
        .unwrap();

    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync response");
    assert!(response.success);
    assert_eq!(response.message.as_deref(), Some("Variable updated: exposure"));
    assert_eq!(*observed.lock().unwrap(), vec![Value::Double(250.0)]);
    assert_eq!(client.get_variable("exposure"), Some(Value::Double(250.0)));
    assert_eq!(server.variable("exposure"), Some(Value::Double(250.0)));

    client.close();
    server.stop();
}

#[test]
fn type_mismatch_leaves_value_unchanged() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.register_variable(Variable::new("n", 0i64), None);
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let (callback, response_rx) = response_capture();
    client
        .set_variable("n", 0.3, ConnectionOptions::Sync, Some(callback))
        .unwrap();

    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync response");
    assert!(!response.success);
    assert!(response.error_text().contains("Type mismatch"));
    assert_eq!(client.get_variable("n"), Some(Value::Int(0)));

    client.close();
    server.stop();
}

#[test]
fn read_only_rejects_peers_but_not_the_server() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.register_variable(Variable::read_only("fw_ver", "1.2"), None);
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let (update_tx, update_rx) = unbounded();
    client.register_callback(
        "fw_ver",
        Arc::new(move |value: &Value| {
            let _ = update_tx.send(value.clone());
        }),
    );
    settle();

    let (callback, response_rx) = response_capture();
    client
        .set_variable("fw_ver", "1.3", ConnectionOptions::Sync, Some(callback))
        .unwrap();
    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync response");
    assert!(!response.success);
    assert_eq!(response.error_text(), "Variable fw_ver is READ ONLY");
    assert_eq!(server.variable("fw_ver"), Some(Value::Str("1.2".into())));

    // The authoritative side may still change it, and the change is
    // published.
    server.set_variable("fw_ver", "1.3");
    let published = update_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("publication");
    assert_eq!(published, Value::Str("1.3".into()));
    assert!(update_rx.recv_timeout(Duration::from_millis(300)).is_err());

    client.close();
    server.stop();
}

#[test]
fn duplicate_publications_are_suppressed() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.register_variable(Variable::new("status", "idle"), None);
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let (update_tx, update_rx) = unbounded();
    let hits_in_cb = Arc::clone(&hits);
    client.register_callback(
        "status",
        Arc::new(move |value: &Value| {
            hits_in_cb.fetch_add(1, Ordering::Relaxed);
            let _ = update_tx.send(value.clone());
        }),
    );
    settle();

    server.set_variable("status", "running");
    server.set_variable("status", "running");

    let first = update_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first publication");
    assert_eq!(first, Value::Str("running".into()));
    // The equal second write is a no-op server-side and would be
    // suppressed client-side even if it were not.
    assert!(update_rx.recv_timeout(Duration::from_millis(500)).is_err());
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    client.close();
    server.stop();
}

#[test]
fn concurrent_peer_sets_serialize_per_variable() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    let transitions = Arc::new(AtomicU32::new(0));
    let transitions_in_cb = Arc::clone(&transitions);
    server.register_variable(
        Variable::new("x", 0i64),
        Some(Arc::new(move |_value: &Value| {
            transitions_in_cb.fetch_add(1, Ordering::Relaxed);
        })),
    );
    server.start().unwrap();

    let client = Arc::new(Client::new(&req, &publ));
    client.open(Duration::from_secs(2)).unwrap();

    let writers: Vec<_> = [1i64, 2i64]
        .into_iter()
        .map(|value| {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                let (callback, response_rx) = response_capture();
                client
                    .set_variable("x", value, ConnectionOptions::Sync, Some(callback))
                    .unwrap();
                response_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("sync response")
            })
        })
        .collect();

    let responses: Vec<ResponseMessage> =
        writers.into_iter().map(|t| t.join().unwrap()).collect();
    assert!(responses.iter().all(|r| r.success));
    assert_ne!(responses[0].command_id, responses[1].command_id);

    let stored = server.variable("x").expect("registered");
    assert!(stored == Value::Int(1) || stored == Value::Int(2));
    // 0 -> {1,2} in either order is always two real transitions.
    assert_eq!(transitions.load(Ordering::Relaxed), 2);

    client.close();
    server.stop();
}

#[test]
fn triggers_execute_once_per_request() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    let hits = Arc::new(AtomicU32::new(0));
    let hits_in_cb = Arc::clone(&hits);
    server.register_trigger(
        "capture",
        Arc::new(move || {
            hits_in_cb.fetch_add(1, Ordering::Relaxed);
        }),
    );
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    assert_eq!(client.get_all_triggers(), vec!["capture".to_string()]);

    for _ in 0..3 {
        let (callback, response_rx) = response_capture();
        client
            .execute_trigger("capture", ConnectionOptions::Sync, Some(callback))
            .unwrap();
        let response = response_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("sync response");
        assert!(response.success);
        assert_eq!(response.message.as_deref(), Some("Trigger executed: capture"));
    }
    assert_eq!(hits.load(Ordering::Relaxed), 3);

    let (callback, response_rx) = response_capture();
    client
        .execute_trigger("missing", ConnectionOptions::Sync, Some(callback))
        .unwrap();
    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync response");
    assert!(!response.success);
    assert_eq!(response.error_text(), "Failed to execute trigger: missing");

    client.close();
    server.stop();
}

#[test]
fn async_set_invokes_continuation_on_reactor() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.register_variable(Variable::new("gain", 1i64), None);
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let (callback, response_rx) = response_capture();
    client
        .set_variable("gain", 4i64, ConnectionOptions::Async, Some(callback))
        .unwrap();

    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("async response");
    assert!(response.success);
    assert_eq!(client.get_variable("gain"), Some(Value::Int(4)));

    client.close();
    server.stop();
}

#[test]
fn unknown_variable_is_reported() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_secs(2)).unwrap();

    let (callback, response_rx) = response_capture();
    client
        .set_variable("ghost", 1i64, ConnectionOptions::Sync, Some(callback))
        .unwrap();
    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync response");
    assert!(!response.success);
    assert_eq!(response.error_text(), "Variable not found: ghost");
    assert_eq!(client.get_variable("ghost"), None);

    client.close();
    server.stop();
}

#[test]
fn reconnect_gives_up_after_max_attempts() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();

    let server = Server::new(ServerConfig::new(&req, &publ));
    server.register_variable(Variable::new("x", 0i64), None);
    server.start().unwrap();

    let client = Client::new(&req, &publ);
    client.open(Duration::from_millis(500)).unwrap();
    assert_eq!(client.get_variable("x"), Some(Value::Int(0)));

    server.stop();

    // 500 ms receive timeout, then five probed attempts with exponential
    // backoff (100..1600 ms); the request resolves when the policy is
    // exhausted.
    let (callback, response_rx) = response_capture();
    client
        .set_variable("x", 1i64, ConnectionOptions::Sync, Some(callback))
        .unwrap();
    let response = response_rx
        .recv_timeout(Duration::from_secs(20))
        .expect("failure response");
    assert!(!response.success);
    assert_eq!(
        response.error_text(),
        "Failed to reconnect after maximum attempts"
    );
    assert!(!client.is_opened());

    client.close();
}

#[test]
fn close_fails_outstanding_requests() {
    init_test_tracing();
    // Endpoints nobody serves: requests stay outstanding until close.
    let (req, publ) = unique_endpoints();

    let client = Arc::new(Client::new(&req, &publ));
    // Generous timeout so the reconnect machine stays out of the way.
    client.open(Duration::from_secs(30)).unwrap();

    let sync_client = Arc::clone(&client);
    let (sync_callback, sync_rx) = response_capture();
    let sync_caller = std::thread::spawn(move || {
        sync_client
            .set_variable("x", 1i64, ConnectionOptions::Sync, Some(sync_callback))
            .unwrap();
    });

    let (async_callback, async_rx) = response_capture();
    client
        .execute_trigger("t", ConnectionOptions::Async, Some(async_callback))
        .unwrap();

    // Let both requests reach the reactor before pulling the plug.
    std::thread::sleep(Duration::from_millis(300));
    client.close();

    let sync_response = sync_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync failure");
    assert!(!sync_response.success);
    assert_eq!(sync_response.error_text(), "Client connection closed");

    let async_response = async_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("async failure");
    assert!(!async_response.success);
    assert_eq!(async_response.error_text(), "Client connection closed");

    sync_caller.join().unwrap();
    assert!(!client.is_opened());
}

#[test]
fn external_endpoint_pair_is_served_identically() {
    init_test_tracing();
    let (req, publ) = unique_endpoints();
    let (ext_req, ext_publ) = unique_endpoints();

    let server = Server::new(
        ServerConfig::new(&req, &publ).with_external(&ext_req, &ext_publ),
    );
    server.register_variable(Variable::new("shared", 5i64), None);
    server.start().unwrap();

    let internal = Client::new(&req, &publ);
    internal.open(Duration::from_secs(2)).unwrap();
    let external = Client::new(&ext_req, &ext_publ);
    external.open(Duration::from_secs(2)).unwrap();

    let (update_tx, update_rx) = unbounded();
    external.register_callback(
        "shared",
        Arc::new(move |value: &Value| {
            let _ = update_tx.send(value.clone());
        }),
    );
    settle();

    let (callback, response_rx) = response_capture();
    internal
        .set_variable("shared", 6i64, ConnectionOptions::Sync, Some(callback))
        .unwrap();
    assert!(
        response_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("sync response")
            .success
    );
    assert_eq!(external.get_variable("shared"), Some(Value::Int(6)));

    // Peer writes are not republished; only the authoritative write is.
    assert!(update_rx.recv_timeout(Duration::from_millis(300)).is_err());
    server.set_variable("shared", 7i64);
    assert_eq!(
        update_rx.recv_timeout(Duration::from_secs(5)).expect("publication"),
        Value::Int(7)
    );

    internal.close();
    external.close();
    server.stop();
}
