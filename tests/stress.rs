//! Mixed sync/async load over several clients and handlers.

mod fixtures;

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use urpc::Client;
use urpc::Server;

use fixtures::init_logging;
use fixtures::socket_path;

const CLIENTS: usize = 5;
const OPS_PER_CLIENT: usize = 20;
const DEADLINE: Duration = Duration::from_secs(30);

/// Deterministic pseudo-random integers so every run exercises the same
/// payloads.
fn scrambled(seed: u64, count: usize) -> Vec<i64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % 1000) as i64
        })
        .collect()
}

fn matrix_product(a: &[Vec<i64>], b: &[Vec<i64>]) -> Vec<Vec<i64>> {
    (0..3)
        .map(|row| {
            (0..3)
                .map(|col| (0..3).map(|k| a[row][k] * b[k][col]).sum())
                .collect()
        })
        .collect()
}

fn reversed_upper(text: &str) -> String {
    text.chars().rev().collect::<String>().to_uppercase()
}

/// Request params and the response the handlers must produce for them.
fn operation(client_id: usize, op: usize) -> (&'static str, Value, Value) {
    match op % 3 {
        0 => {
            let input = scrambled((client_id * OPS_PER_CLIENT + op) as u64, 20);
            let mut expected = input.clone();
            expected.sort_unstable();
            ("sort", json!(input), json!(expected))
        }
        1 => {
            let text: String = (0..128)
                .map(|i| char::from(b'a' + ((client_id + op + i) % 26) as u8))
                .collect();
            let expected = reversed_upper(&text);
            ("process", json!({"text": text}), json!(expected))
        }
        _ => {
            let a: Vec<Vec<i64>> = (0..3)
                .map(|r| scrambled((client_id + r) as u64, 3))
                .collect();
            let b: Vec<Vec<i64>> = (0..3)
                .map(|r| scrambled((op + r) as u64, 3))
                .collect();
            let expected = matrix_product(&a, &b);
            ("multiply", json!([a, b]), json!(expected))
        }
    }
}

fn register_handlers(server: &Server) {
    server.register("sort", |params| {
        let mut values: Vec<i64> = params
            .as_array()?
            .iter()
            .map(|v| v.as_i64())
            .collect::<Option<_>>()?;
        values.sort_unstable();
        Some(json!(values))
    });
    server.register("process", |params| {
        let text = params.get("text")?.as_str()?;
        Some(json!(reversed_upper(text)))
    });
    server.register("multiply", |params| {
        let operands = params.as_array()?;
        let parse = |v: &Value| -> Option<Vec<Vec<i64>>> {
            v.as_array()?
                .iter()
                .map(|row| row.as_array()?.iter().map(|n| n.as_i64()).collect())
                .collect()
        };
        let a = parse(&operands[0])?;
        let b = parse(&operands[1])?;
        Some(json!(matrix_product(&a, &b)))
    });
}

#[test]
fn five_clients_twenty_ops_half_sync_half_async() {
    init_logging();
    let (_dir, path) = socket_path("stress.sock");
    let mut server = Server::new(&path).unwrap();
    register_handlers(&server);
    server.start().unwrap();

    let runners: Vec<_> = (0..CLIENTS)
        .map(|client_id| {
            let path = path.clone();
            thread::spawn(move || {
                let client = Arc::new(Client::connect(&path).unwrap());
                let (tx, rx) = mpsc::channel();
                let mut pending = Vec::new();

                for op in 0..OPS_PER_CLIENT {
                    let (method, params, expected) = operation(client_id, op);
                    if op % 2 == 0 {
                        let result = client.call(method, params);
                        assert_eq!(result, Some(expected), "sync {method} for client {client_id}");
                    } else {
                        let tx = tx.clone();
                        client.call_async(
                            method,
                            params,
                            Some(Box::new(move |result| {
                                let _ = tx.send((op, result));
                            })),
                        );
                        pending.push((op, expected));
                    }
                }

                // Every asynchronous call must complete with the right
                // value within the deadline.
                let mut outcomes = Vec::new();
                for _ in 0..pending.len() {
                    outcomes.push(rx.recv_timeout(DEADLINE).unwrap());
                }
                outcomes.sort_by_key(|(op, _)| *op);
                for ((op, result), (expected_op, expected)) in outcomes.into_iter().zip(pending) {
                    assert_eq!(op, expected_op);
                    assert_eq!(result, Some(expected), "async op {op} for client {client_id}");
                }
            })
        })
        .collect();

    for runner in runners {
        runner.join().unwrap();
    }
}
