//! End-to-end relay through the real server: monoio reactors, real TCP
//! sockets on both sides, no mocking.

use gatewayd_core::config::{ClientConfig, ProxyConfig, ServerConfig};
use gatewayd_observability::MetricsCollector;
use gatewayd_plugin::registry::{CompatibilityPolicy, HookRegistry, VerificationPolicy};
use gatewayd_proxy::pool::EMPTY_POOL_CAPACITY;
use gatewayd_proxy::{Client, Pool, Proxy, Server};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn spawn_echo() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    std::thread::spawn(move || {
        while let Ok((mut stream, _)) = listener.accept() {
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn free_port_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn connect_with_retry(addr: &str) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    panic!("server never came up on {addr}: {err}");
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

fn start_server(upstream: &str, pool_size: usize, hard_limit: usize) -> (Server, Arc<Proxy>, String) {
    let client_config = ClientConfig {
        address: upstream.to_string(),
        receive_buffer_size: 4096,
        receive_chunk_size: 512,
        receive_deadline_ms: 1000,
        send_deadline_ms: 1000,
        ..ClientConfig::default()
    };

    let pool = Pool::new(EMPTY_POOL_CAPACITY);
    for _ in 0..pool_size {
        let client = Arc::new(Client::connect(&client_config).unwrap());
        pool.put(client.id(), client).unwrap();
    }

    let registry = Arc::new(HookRegistry::new(
        CompatibilityPolicy::Loose,
        VerificationPolicy::PassDown,
    ));
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let proxy = Arc::new(Proxy::new(
        pool,
        Arc::clone(&registry),
        &ProxyConfig::default(),
        client_config,
        Arc::clone(&metrics),
    ));

    let frontend_addr = free_port_addr();
    let server_config = ServerConfig {
        address: frontend_addr.clone(),
        soft_limit: 8,
        hard_limit,
        multi_core: false,
        workers: 1,
        enable_ticker: false,
        ..ServerConfig::default()
    };

    let server = Server::new(server_config, Arc::clone(&proxy), registry, metrics);
    server.run().unwrap();
    (server, proxy, frontend_addr)
}

#[test]
fn relay_round_trip_through_the_server() {
    let upstream = spawn_echo();
    let (server, proxy, frontend_addr) = start_server(&upstream, 1, 16);

    let mut frontend = connect_with_retry(&frontend_addr);
    frontend.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    frontend.write_all(b"PING").unwrap();
    let mut buf = [0u8; 64];
    let n = frontend.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"PING");

    // strictly sequential cycles on the same frontend connection
    frontend.write_all(b"second").unwrap();
    let n = frontend.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"second");

    drop(frontend);
    // the client returns to the pool once the frontend closes
    let deadline = Instant::now() + Duration::from_secs(5);
    while proxy.available_size() != 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(proxy.available_size(), 1);
    assert_eq!(proxy.busy_size(), 0);

    server.shutdown();
}

#[test]
fn exhausted_pool_closes_the_second_frontend() {
    let upstream = spawn_echo();
    let (server, _proxy, frontend_addr) = start_server(&upstream, 1, 16);

    let mut first = connect_with_retry(&frontend_addr);
    first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    first.write_all(b"hold").unwrap();
    let mut buf = [0u8; 16];
    let n = first.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hold");

    // the only pooled client is busy; the second frontend is closed
    let mut second = connect_with_retry(&frontend_addr);
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let n = second.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "second frontend must see EOF");

    drop(first);
    drop(second);
    server.shutdown();
}

#[test]
fn hard_limit_refuses_connections() {
    let upstream = spawn_echo();
    // hard limit 0: every accept is over the limit
    let (server, _proxy, frontend_addr) = start_server(&upstream, 1, 0);

    let mut frontend = connect_with_retry(&frontend_addr);
    frontend.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 16];
    let n = frontend.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "refused connection must see EOF");

    server.shutdown();
}
