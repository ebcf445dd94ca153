//! Demo peer: dumps the server's variables, watches one of them, and
//! reads simple commands from stdin.
//!
//! ```bash
//! cargo run --bin client_demo [dealer_endpoint sub_endpoint]
//! ```
//!
//! Commands: `get <name>`, `set <name> <value>`, `trigger <name>`,
//! `list`, `quit`. Values parse as bool, then integer, then double, and
//! fall back to string, mirroring the server's type pinning.

use std::io::BufRead;
use std::sync::Arc;

use tether::{Client, ConnectionOptions, Value};

fn parse_value(token: &str) -> Value {
    if let Ok(v) = token.parse::<bool>() {
        return Value::Bool(v);
    }
    if let Ok(v) = token.parse::<i64>() {
        return Value::Int(v);
    }
    if let Ok(v) = token.parse::<f64>() {
        return Value::Double(v);
    }
    Value::Str(token.to_owned())
}

fn main() {
    tether::init_tracing();

    let mut args = std::env::args().skip(1);
    let dealer = args
        .next()
        .unwrap_or_else(|| "ipc:///tmp/tether-demo-router".to_owned());
    let subscriber = args
        .next()
        .unwrap_or_else(|| "ipc:///tmp/tether-demo-pub".to_owned());

    let client = Client::new(&dealer, &subscriber);
    if let Err(e) = client.open(tether::DEFAULT_REQUEST_TIMEOUT) {
        eprintln!("failed to open client: {e}");
        std::process::exit(1);
    }

    println!("variables:");
    for (name, value) in client.get_all_variables() {
        println!("  {name} = {value}");
    }
    println!("triggers: {:?}", client.get_all_triggers());

    client.register_callback(
        "frames_captured",
        Arc::new(|value: &Value| println!("<- frames_captured is now {value}")),
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("get"), Some(name), _) => match client.get_variable(name) {
                Some(value) => println!("{name} = {value}"),
                None => println!("{name}: not found"),
            },
            (Some("set"), Some(name), Some(token)) => {
                let result = client.set_variable(
                    name,
                    parse_value(token),
                    ConnectionOptions::Sync,
                    Some(Box::new(|response| {
                        if response.success {
                            println!("ok: {}", response.message.as_deref().unwrap_or(""));
                        } else {
                            println!("failed: {}", response.error_text());
                        }
                    })),
                );
                if let Err(e) = result {
                    println!("send failed: {e}");
                }
            }
            (Some("trigger"), Some(name), _) => {
                let result = client.execute_trigger(
                    name,
                    ConnectionOptions::Async,
                    Some(Box::new(|response| {
                        if response.success {
                            println!("ok: {}", response.message.as_deref().unwrap_or(""));
                        } else {
                            println!("failed: {}", response.error_text());
                        }
                    })),
                );
                if let Err(e) = result {
                    println!("send failed: {e}");
                }
            }
            (Some("list"), ..) => {
                for (name, value) in client.get_all_variables() {
                    println!("  {name} = {value}");
                }
            }
            (Some("quit"), ..) => break,
            (Some(other), ..) => println!("unknown command: {other}"),
            (None, ..) => {}
        }
    }

    client.close();
}
