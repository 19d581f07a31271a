//! End-to-end request/response over loopback.

use bytes::Bytes;
use crossbar::{EndpointManager, Event, Options, ProtoBus, RpcResult, TcpOptions};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RPC_TIMEOUT: Duration = Duration::from_secs(4);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn tcp_opts(port: u16) -> TcpOptions {
    TcpOptions {
        port,
        fixed_pool_size: 2,
        max_message_size: 64 * 1024,
        ..TcpOptions::default()
    }
}

/// Mirror server: method 1 echoes `key|value` as `key - mirrored|value`.
fn start_mirror_server(port: u16) -> ProtoBus {
    let server = ProtoBus::new(
        Options {
            tcp: tcp_opts(port),
            ..Options::default()
        },
        Arc::new(EndpointManager::new()),
    )
    .unwrap();
    server.register_handler(1, |_endpoint, data, replier| {
        let raw = data.as_slice();
        let split = raw.iter().position(|&b| b == b'|').unwrap_or(raw.len());
        let mut out = Vec::with_capacity(raw.len() + 11);
        out.extend_from_slice(&raw[..split]);
        out.extend_from_slice(b" - mirrored");
        out.extend_from_slice(&raw[split..]);
        replier.reply(Bytes::from(out));
    });
    server.start().unwrap();
    server
}

fn start_client(opts: Options) -> ProtoBus {
    let client = ProtoBus::new(opts, Arc::new(EndpointManager::new())).unwrap();
    client.start().unwrap();
    client
}

#[test]
fn ping_pong_mirrors_the_key() {
    init_tracing();
    let port = portpicker::pick_unused_port().unwrap();
    let _server = start_mirror_server(port);

    let client = start_client(Options {
        tcp: tcp_opts(0),
        ..Options::default()
    });
    let target = client
        .endpoints()
        .register(([127, 0, 0, 1], port).into());

    let reply = client
        .request(target, 1, Bytes::from_static(b"key|value"), RPC_TIMEOUT)
        .wait();
    assert_eq!(reply.unwrap().as_slice(), b"key - mirrored|value");
}

#[test]
fn subscribe_delivers_off_the_io_thread_when_split() {
    init_tracing();
    let port = portpicker::pick_unused_port().unwrap();
    let _server = start_mirror_server(port);

    let client = start_client(Options {
        tcp: tcp_opts(0),
        split_executor: true,
        ..Options::default()
    });
    let target = client
        .endpoints()
        .register(([127, 0, 0, 1], port).into());

    let done = Arc::new(Event::new());
    let outcome: Arc<Mutex<Option<(RpcResult, Option<String>)>>> = Arc::new(Mutex::new(None));

    let signal = Arc::clone(&done);
    let slot = Arc::clone(&outcome);
    client
        .request(target, 1, Bytes::from_static(b"key|value"), RPC_TIMEOUT)
        .subscribe(move |result| {
            let thread = std::thread::current().name().map(String::from);
            *slot.lock().unwrap() = Some((result, thread));
            signal.notify();
        });

    assert!(done.wait_for(Duration::from_secs(10)));
    let (result, thread) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(result.unwrap().as_slice(), b"key - mirrored|value");
    assert_ne!(thread.as_deref(), Some("crossbar-io"));
}

#[test]
fn concurrent_requests_never_cross_correlate() {
    init_tracing();
    let port = portpicker::pick_unused_port().unwrap();
    let _server = start_mirror_server(port);

    let client = Arc::new(start_client(Options {
        tcp: tcp_opts(0),
        ..Options::default()
    }));
    let target = client
        .endpoints()
        .register(([127, 0, 0, 1], port).into());

    let futures: Vec<_> = (0..64u32)
        .map(|i| {
            let payload = format!("k{i}|v{i}");
            (i, client.request(target, 1, Bytes::from(payload), RPC_TIMEOUT))
        })
        .collect();

    for (i, future) in futures {
        let reply = future.wait().unwrap();
        let expected = format!("k{i} - mirrored|v{i}");
        assert_eq!(reply.as_slice(), expected.as_bytes());
    }
}

#[test]
fn forced_endpoint_greeting_routes_responses() {
    init_tracing();
    // One registry shared by both buses, so the forced id means the same
    // thing on each side.
    let manager = Arc::new(EndpointManager::new());
    let server_port = portpicker::pick_unused_port().unwrap();
    let client_port = portpicker::pick_unused_port().unwrap();

    let server = ProtoBus::new(
        Options {
            tcp: tcp_opts(server_port),
            ..Options::default()
        },
        Arc::clone(&manager),
    )
    .unwrap();
    server.register_handler(1, |_endpoint, data, replier| {
        replier.reply(data.to_bytes());
    });
    server.start().unwrap();

    let client_id = manager.register(([127, 0, 0, 1], client_port).into());
    let client = ProtoBus::new(
        Options {
            tcp: tcp_opts(client_port),
            greeter: Some(client_id),
            ..Options::default()
        },
        Arc::clone(&manager),
    )
    .unwrap();
    client.start().unwrap();

    let target = manager.register(([127, 0, 0, 1], server_port).into());
    let reply = client
        .request(target, 1, Bytes::from_static(b"hello"), RPC_TIMEOUT)
        .wait();
    assert_eq!(reply.unwrap().as_slice(), b"hello");
}
