//! Request-level failure delivery: timeouts, unknown methods, late replies.

use bytes::Bytes;
use crossbar::{EndpointManager, Options, ProtoBus, RpcError, TcpOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn tcp_opts(port: u16) -> TcpOptions {
    TcpOptions {
        port,
        fixed_pool_size: 1,
        max_message_size: 16 * 1024,
        ..TcpOptions::default()
    }
}

fn start_pair() -> (ProtoBus, ProtoBus, u64) {
    let port = portpicker::pick_unused_port().unwrap();
    let server = ProtoBus::new(
        Options {
            tcp: tcp_opts(port),
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    // Method 1 swallows the request; method 2 echoes.
    server.register_handler(1, |_endpoint, _data, _replier| {
        // Dropping the replier without replying leaves the client to its
        // timeout.
    });
    server.register_handler(2, |_endpoint, data, replier| {
        replier.reply(data.to_bytes());
    });
    server.start().unwrap();

    let client = ProtoBus::new(
        Options {
            tcp: tcp_opts(0),
            split_executor: true,
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    client.start().unwrap();
    let target = client.endpoints().register(([127, 0, 0, 1], port).into());
    (server, client, target)
}

#[test]
fn unanswered_request_resolves_with_timeout() {
    let (_server, client, target) = start_pair();

    let started = Instant::now();
    let result = client
        .request(target, 1, Bytes::from_static(b"void"), Duration::from_secs(1))
        .wait();
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RpcError::TimeoutExceeded)));
    assert!(elapsed >= Duration::from_millis(900), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "fired late: {elapsed:?}");
}

#[test]
fn unknown_method_times_out_without_teardown() {
    let (_server, client, target) = start_pair();

    let result = client
        .request(target, 9, Bytes::from_static(b"?"), Duration::from_secs(1))
        .wait();
    assert!(matches!(result, Err(RpcError::TimeoutExceeded)));

    // The connection survives the bus error: a valid method still works.
    let result = client
        .request(target, 2, Bytes::from_static(b"still here"), Duration::from_secs(4))
        .wait();
    assert_eq!(result.unwrap().as_slice(), b"still here");
}

#[test]
fn late_reply_is_dropped_without_panic() {
    let port = portpicker::pick_unused_port().unwrap();
    let server = ProtoBus::new(
        Options {
            tcp: tcp_opts(port),
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    // Replies well after the client stopped waiting.
    server.register_handler(1, |_endpoint, _data, replier| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(1500));
            replier.reply(Bytes::from_static(b"late"));
        });
    });
    server.register_handler(2, |_endpoint, data, replier| {
        replier.reply(data.to_bytes());
    });
    server.start().unwrap();

    let client = ProtoBus::new(
        Options {
            tcp: tcp_opts(0),
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    client.start().unwrap();
    let target = client.endpoints().register(([127, 0, 0, 1], port).into());

    let result = client
        .request(target, 1, Bytes::from_static(b"early"), Duration::from_millis(400))
        .wait();
    assert!(matches!(result, Err(RpcError::TimeoutExceeded)));

    // Let the stale response arrive and be discarded.
    std::thread::sleep(Duration::from_secs(2));

    let result = client
        .request(target, 2, Bytes::from_static(b"alive"), Duration::from_secs(4))
        .wait();
    assert_eq!(result.unwrap().as_slice(), b"alive");
}
