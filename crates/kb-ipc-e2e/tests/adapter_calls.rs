//! Full round-trip behaviour of the adapter-call transport: real client,
//! real server, throwaway socket.

#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kb_ipc_client::{AdapterTransport, ConnectionState, SocketTransport, TransportError};
use kb_ipc_e2e::TestPlatform;
use kb_ipc_types::{AdapterCall, AdapterKind, Value};

#[test]
fn cache_get_round_trip() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let result = client
        .send(AdapterCall::new(
            AdapterKind::Cache,
            "get",
            vec![Value::from("k1")],
        ))
        .expect("cache get");

    let object = result.as_object().expect("object result");
    assert_eq!(object.get("value"), Some(&Value::from("v1")));
}

#[test]
fn special_values_survive_the_full_round_trip() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let payload = Value::Array(vec![
        Value::binary(vec![0_u8, 159, 146, 150]),
        Value::from("plain"),
        Value::from(42_i64),
    ]);
    let result = client
        .send(AdapterCall::new(
            AdapterKind::Storage,
            "echo",
            vec![payload.clone()],
        ))
        .expect("echo call");
    assert_eq!(result, payload);
}

#[test]
fn concurrent_calls_correlate_by_request_id() {
    let platform = TestPlatform::start();
    let client = Arc::new(platform.connect_client());

    // Later calls finish earlier: each sleeps less than the one before it,
    // so responses come back in reverse send order.
    let workers: Vec<_> = [400_i64, 300, 200, 100]
        .into_iter()
        .enumerate()
        .map(|(index, delay_ms)| {
            let client = Arc::clone(&client);
            let tag = format!("call-{index}");
            thread::spawn(move || {
                let result = client.send(AdapterCall::new(
                    AdapterKind::Invoke,
                    "delay",
                    vec![Value::from(delay_ms), Value::from(tag.as_str())],
                ));
                (tag, result)
            })
        })
        .collect();

    for worker in workers {
        let (tag, result) = worker.join().expect("join worker");
        assert_eq!(result.expect("call result"), Value::from(tag.as_str()));
    }
}

#[test]
fn handler_failure_is_contained_and_connection_stays_usable() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let error = client
        .send(AdapterCall::new(AdapterKind::Llm, "fail", vec![]))
        .expect_err("handler failure");
    let remote = error.as_remote().expect("remote error");
    assert_eq!(remote.name(), "Error");
    assert_eq!(remote.message(), "boom");

    let result = client
        .send(AdapterCall::new(
            AdapterKind::Llm,
            "echo",
            vec![Value::from("still alive")],
        ))
        .expect("call after failure");
    assert_eq!(result, Value::from("still alive"));
}

#[test]
fn timeouts_reject_one_call_without_disturbing_another() {
    let platform = TestPlatform::start();
    let client = Arc::new(platform.connect_client());

    let slow_client = Arc::clone(&client);
    let unanswered = thread::spawn(move || {
        let started = Instant::now();
        let outcome = slow_client.send(
            AdapterCall::new(AdapterKind::VectorStore, "never", vec![])
                .with_timeout(Duration::from_millis(50)),
        );
        (outcome, started.elapsed())
    });

    let sibling_client = Arc::clone(&client);
    let sibling = thread::spawn(move || {
        sibling_client.send(AdapterCall::new(
            AdapterKind::VectorStore,
            "delay",
            vec![Value::from(300_i64), Value::from("done")],
        ))
    });

    let (outcome, elapsed) = unanswered.join().expect("join unanswered");
    let error = outcome.expect_err("must time out");
    assert!(error.is_timeout());
    assert!(
        elapsed < Duration::from_millis(500),
        "timeout must fire near its deadline, took {elapsed:?}"
    );

    // The sibling call outlives the sibling's failure and resolves normally.
    let result = sibling.join().expect("join sibling").expect("sibling call");
    assert_eq!(result, Value::from("done"));
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[test]
fn short_timeout_beats_a_slow_handler() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let error = client
        .send(
            AdapterCall::new(
                AdapterKind::Embeddings,
                "delay",
                vec![Value::from(100_i64), Value::from("late")],
            )
            .with_timeout(Duration::from_millis(10)),
        )
        .expect_err("short timeout must win");
    assert!(error.is_timeout());
}

#[test]
fn unknown_methods_surface_as_typed_remote_errors() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let error = client
        .send(AdapterCall::new(AdapterKind::Artifacts, "frobnicate", vec![]))
        .expect_err("unknown method");
    let remote = error.as_remote().expect("remote error");
    assert_eq!(remote.name(), "TypeError");
    assert!(remote.message().contains("frobnicate"));
}

#[test]
fn client_reconnects_across_a_server_restart() {
    let platform = TestPlatform::start();
    let client = platform.connect_client();

    let result = client
        .send(AdapterCall::new(
            AdapterKind::Cache,
            "echo",
            vec![Value::from("before")],
        ))
        .expect("call before restart");
    assert_eq!(result, Value::from("before"));

    platform.stop();
    platform.restart();

    // The transport notices the dropped connection and re-dials with
    // backoff; within the window a fresh call goes through again.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut last = None;
    while Instant::now() < deadline {
        match client.send(AdapterCall::new(
            AdapterKind::Cache,
            "echo",
            vec![Value::from("after")],
        )) {
            Ok(result) => {
                assert_eq!(result, Value::from("after"));
                return;
            }
            Err(error) => {
                last = Some(error);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
    panic!("client never recovered after restart: {last:?}");
}

#[test]
fn sends_on_a_fresh_transport_fail_fast_until_connected() {
    let platform = TestPlatform::start();
    let transport = SocketTransport::new(platform.client_config());

    let error = transport
        .send(AdapterCall::new(AdapterKind::Cache, "get", vec![]))
        .expect_err("not connected yet");
    assert!(matches!(error, TransportError::NotConnected));

    transport.connect().expect("connect");
    let result = transport
        .send(AdapterCall::new(
            AdapterKind::Cache,
            "echo",
            vec![Value::from(1_i64)],
        ))
        .expect("call after connect");
    assert_eq!(result, Value::from(1_i64));
}
