//! Demo host: exposes a few variables and a trigger, then periodically
//! mutates a status variable so subscribed clients see publications.
//!
//! ```bash
//! cargo run --bin server_demo [router_endpoint pub_endpoint]
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tether::{Server, ServerConfig, Value, Variable};

fn main() {
    tether::init_tracing();

    let mut args = std::env::args().skip(1);
    let router = args
        .next()
        .unwrap_or_else(|| "ipc:///tmp/tether-demo-router".to_owned());
    let publisher = args
        .next()
        .unwrap_or_else(|| "ipc:///tmp/tether-demo-pub".to_owned());

    let server = Server::new(ServerConfig::new(&router, &publisher));

    server.register_variable(
        Variable::new("exposure", 100.0),
        Some(Arc::new(|value: &Value| {
            println!("peer changed exposure to {value}");
        })),
    );
    server.register_variable(
        Variable::new("gain", 1i64),
        Some(Arc::new(|value: &Value| {
            println!("peer changed gain to {value}");
        })),
    );
    server.register_variable(Variable::new("armed", false), None);
    server.register_variable(Variable::read_only("fw_ver", "1.2"), None);
    server.register_variable(Variable::new("frames_captured", 0i64), None);

    let captures = Arc::new(AtomicU32::new(0));
    let captures_in_cb = Arc::clone(&captures);
    server.register_trigger(
        "capture",
        Arc::new(move || {
            let n = captures_in_cb.fetch_add(1, Ordering::Relaxed) + 1;
            println!("capture trigger executed ({n} so far)");
        }),
    );

    if let Err(e) = server.start() {
        eprintln!("failed to start server: {e}");
        std::process::exit(1);
    }
    println!("serving on {router} (requests) and {publisher} (publications); ctrl-c to quit");

    // Adopt the trigger count as authoritative state; subscribers see
    // each transition exactly once.
    loop {
        std::thread::sleep(Duration::from_secs(2));
        let count = i64::from(captures.load(Ordering::Relaxed));
        server.set_variable("frames_captured", count);
    }
}
