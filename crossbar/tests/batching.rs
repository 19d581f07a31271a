//! Batch flush bounds: size-triggered and delay-triggered.

use bytes::Bytes;
use crossbar::{BatchOptions, EndpointManager, Options, ProtoBus, TcpOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn tcp_opts(port: u16) -> TcpOptions {
    TcpOptions {
        port,
        fixed_pool_size: 2,
        max_message_size: 16 * 1024,
        ..TcpOptions::default()
    }
}

fn start_echo_server(port: u16) -> ProtoBus {
    let server = ProtoBus::new(
        Options {
            tcp: tcp_opts(port),
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    server.register_handler(1, |_endpoint, data, replier| {
        replier.reply(data.to_bytes());
    });
    server.start().unwrap();
    server
}

#[test]
fn lone_request_flushes_within_max_delay() {
    let port = portpicker::pick_unused_port().unwrap();
    let _server = start_echo_server(port);

    let client = ProtoBus::new(
        Options {
            tcp: tcp_opts(0),
            batch: BatchOptions {
                max_batch: 2,
                max_delay: Duration::from_secs(1),
            },
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    client.start().unwrap();
    let target = client.endpoints().register(([127, 0, 0, 1], port).into());

    // One request cannot fill the batch; only the periodic flusher moves it.
    let started = Instant::now();
    let result = client
        .request(target, 1, Bytes::from_static(b"lone"), Duration::from_secs(10))
        .wait();
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap().as_slice(), b"lone");
    assert!(elapsed < Duration::from_secs(5), "flush overdue: {elapsed:?}");
}

#[test]
fn full_batch_flushes_synchronously() {
    let port = portpicker::pick_unused_port().unwrap();
    let _server = start_echo_server(port);

    // The periodic flusher is effectively disabled; only the size
    // threshold can move these.
    let client = ProtoBus::new(
        Options {
            tcp: tcp_opts(0),
            batch: BatchOptions {
                max_batch: 2,
                max_delay: Duration::from_secs(3600),
            },
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    client.start().unwrap();
    let target = client.endpoints().register(([127, 0, 0, 1], port).into());

    let first = client.request(target, 1, Bytes::from_static(b"one"), Duration::from_secs(10));
    let second = client.request(target, 1, Bytes::from_static(b"two"), Duration::from_secs(10));

    assert_eq!(first.wait().unwrap().as_slice(), b"one");
    assert_eq!(second.wait().unwrap().as_slice(), b"two");
}
