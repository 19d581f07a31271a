//! Connection loss and pool refill: the bus reopens connections and
//! later requests succeed.

use bytes::Bytes;
use crossbar::{EndpointManager, Options, ProtoBus, TcpOptions};
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
fn requests_succeed_after_peer_restart() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let port = portpicker::pick_unused_port().unwrap();
    let server = start_echo_server(port);

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

    let reply = client
        .request(target, 1, Bytes::from_static(b"before"), Duration::from_secs(4))
        .wait();
    assert_eq!(reply.unwrap().as_slice(), b"before");

    // Kill every connection by restarting the peer on the same port.
    drop(server);
    let _server = start_echo_server(port);

    // The first attempts may ride on half-dead sockets; the bus closes
    // them, requeues and reopens. Within the deadline one must succeed.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let reply = client
            .request(target, 1, Bytes::from_static(b"after"), Duration::from_secs(2))
            .wait();
        match reply {
            Ok(data) => {
                assert_eq!(data.as_slice(), b"after");
                break;
            }
            Err(_) => assert!(Instant::now() < deadline, "bus never recovered"),
        }
    }
}
