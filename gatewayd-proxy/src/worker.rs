use crate::proxy::{ConnId, Proxy};
use gatewayd_core::GatewayError;
use gatewayd_core::config::ServerConfig;
use gatewayd_observability::MetricsCollector;
use gatewayd_plugin::event::{ConnectionInfo, EventKind, Payload, TrafficPayload};
use gatewayd_plugin::registry::HookRegistry;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Frontend read buffer per connection; one relay cycle moves at most this
/// many request bytes at a time.
const FRONTEND_BUFFER_SIZE: usize = 64 * 1024;

/// How long `shutdown` waits for in-flight relays to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state across all reactor threads.
pub struct ServerState {
    pub config: ServerConfig,
    pub proxy: Arc<Proxy>,
    pub registry: Arc<HookRegistry>,
    pub metrics: Arc<MetricsCollector>,

    active: AtomicUsize,
    next_conn: AtomicU64,
    shutdown: AtomicBool,
    started_at: Instant,
}

/// The frontend server: one monoio reactor per worker thread, each with
/// its own listener on the same address (SO_REUSEPORT). Each reactor
/// processes its accepted connections serially per connection, so the relay
/// needs no per-connection locking.
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        proxy: Arc<Proxy>,
        registry: Arc<HookRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                proxy,
                registry,
                metrics,
                active: AtomicUsize::new(0),
                next_conn: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Spawn the reactor threads and the ticker. Returns the join handles;
    /// the caller decides whether to wait on them.
    pub fn run(&self) -> Result<Vec<std::thread::JoinHandle<()>>, GatewayError> {
        let config = &self.state.config;
        let addr = config.address.clone();

        self.dispatch(EventKind::OnRun, Payload::new());
        self.dispatch(EventKind::OnBooting, server_payload(config));

        // Fail fast on an unusable address before any reactor spawns.
        std::net::TcpListener::bind(&addr)
            .map(drop)
            .map_err(|err| GatewayError::Fatal(format!("cannot bind {addr}: {err}")))?;

        let workers = config.effective_workers();
        let mut handles = Vec::with_capacity(workers + 1);

        for worker_id in 0..workers {
            let state = Arc::clone(&self.state);
            let addr = addr.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gatewayd-worker-{worker_id}"))
                .spawn(move || {
                    let mut rt = match monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(err) => {
                            error!(worker = worker_id, error = %err, "Runtime build failed");
                            return;
                        }
                    };
                    rt.block_on(worker_loop(worker_id, state, addr));
                })
                .map_err(|err| GatewayError::Fatal(format!("cannot spawn worker: {err}")))?;
            handles.push(handle);
        }

        if config.enable_ticker {
            handles.push(self.spawn_ticker());
        }

        self.dispatch(EventKind::OnBooted, server_payload(config));
        info!(workers = workers, addr = %addr, "Server is ready — accepting connections");
        Ok(handles)
    }

    /// Graceful stop: refuse new work, drain in-flight relays, close every
    /// pooled client.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.dispatch(EventKind::OnShutdown, Payload::new());

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.state.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        let leftover = self.state.active.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!(connections = leftover, "Drain timeout expired with connections in flight");
        }

        self.state.proxy.shutdown();
        info!("Server stopped");
    }

    fn spawn_ticker(&self) -> std::thread::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let tick = Duration::from_secs(state.config.tick_interval_secs.max(1));
        std::thread::Builder::new()
            .name("gatewayd-ticker".to_string())
            .spawn(move || {
                let mut last_tick = Instant::now();
                while !state.shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(100));
                    if last_tick.elapsed() < tick {
                        continue;
                    }
                    last_tick = Instant::now();

                    let mut payload = Payload::new();
                    payload.insert(
                        "connections".to_string(),
                        json!(state.active.load(Ordering::SeqCst)),
                    );
                    payload.insert(
                        "uptimeSecs".to_string(),
                        json!(state.started_at.elapsed().as_secs()),
                    );
                    if let Err(err) =
                        state
                            .registry
                            .run(EventKind::OnTick, payload, state.registry.verification)
                    {
                        error!(error = %err, "Failed to run OnTick hooks");
                    }
                }
            })
            .expect("failed to spawn ticker thread")
    }

    fn dispatch(&self, event: EventKind, payload: Payload) {
        if let Err(err) = self
            .state
            .registry
            .run(event, payload, self.state.registry.verification)
        {
            error!(event = %event, error = %err, "Failed to run hooks");
        }
    }
}

fn server_payload(config: &ServerConfig) -> Payload {
    let mut payload = Payload::new();
    payload.insert("network".to_string(), json!(config.network));
    payload.insert("address".to_string(), json!(config.address));
    payload
}

/// Accept loop for one reactor thread.
async fn worker_loop(worker_id: usize, state: Arc<ServerState>, addr: String) {
    let listener = match monoio::net::TcpListener::bind(&addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(worker = worker_id, addr = %addr, error = %err, "Bind failed");
            return;
        }
    };
    info!(worker = worker_id, addr = %addr, "Worker listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if state.shutdown.load(Ordering::SeqCst) {
                    // stopping: refuse without relaying
                    drop(stream);
                    continue;
                }

                let open = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                state.metrics.connections_total.inc();

                if open > state.config.hard_limit {
                    warn!(open = open, limit = state.config.hard_limit,
                        "Hard limit reached, refusing connection");
                    state.metrics.connections_refused_total.inc();
                    state.active.fetch_sub(1, Ordering::SeqCst);
                    drop(stream);
                    continue;
                }
                if open > state.config.soft_limit {
                    warn!(open = open, limit = state.config.soft_limit, "Soft limit reached");
                }

                let _ = stream.set_nodelay(true);
                state.metrics.active_connections.inc();
                let conn = ConnId(state.next_conn.fetch_add(1, Ordering::SeqCst));
                let state = Arc::clone(&state);

                monoio::spawn(async move {
                    handle_connection(state, stream, peer_addr, conn).await;
                });
            }
            Err(err) => {
                error!(worker = worker_id, error = %err, "Accept error");
            }
        }
    }
}

/// One frontend connection: acquire an upstream, relay request/response
/// cycles strictly sequentially, release on close.
async fn handle_connection(
    state: Arc<ServerState>,
    mut stream: monoio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    conn: ConnId,
) {
    let info = ConnectionInfo { connection: conn.0, remote_addr: peer_addr.to_string() };
    dispatch(&state, EventKind::OnOpening, info.into_payload());

    if let Err(err) = state.proxy.connect(conn) {
        // no upstream for this frontend: close it immediately
        error!(%conn, remote = %peer_addr, error = %err, "No upstream available");
        state
            .metrics
            .relay_errors_total
            .with_label_values(&[err.kind()])
            .inc();
        finish_connection(&state, None, conn);
        return;
    }
    dispatch(&state, EventKind::OnOpened, info.into_payload());
    debug!(%conn, remote = %peer_addr, "Connection opened");

    // Buffer allocated once, reused across relay cycles.
    let mut read_buf = vec![0u8; FRONTEND_BUFFER_SIZE];

    loop {
        let (result, returned_buf) = stream.read(read_buf).await;
        read_buf = returned_buf;
        let n = match result {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(%conn, error = %err, "Frontend read error");
                break;
            }
        };

        // Traffic notification, then the relay itself.
        dispatch(
            &state,
            EventKind::OnTraffic,
            TrafficPayload::incoming(&read_buf[..n]).into_payload(),
        );

        match state.proxy.pass_through(conn, &read_buf[..n]) {
            Ok(response) => {
                if response.is_empty() {
                    continue;
                }
                let (result, _) = stream.write_all(response).await;
                if let Err(err) = result {
                    let err = GatewayError::FrontendWriteFailed(err.to_string());
                    error!(%conn, error = %err, "Frontend write failed");
                    state
                        .metrics
                        .relay_errors_total
                        .with_label_values(&[err.kind()])
                        .inc();
                    break;
                }
            }
            Err(err) => {
                state
                    .metrics
                    .relay_errors_total
                    .with_label_values(&[err.kind()])
                    .inc();
                match err {
                    // upstream was replaced; the frontend stays open
                    GatewayError::UpstreamClosed => {
                        error!(%conn, "Upstream closed during relay, client reconnected");
                    }
                    GatewayError::ClientNotFound => {
                        error!(%conn, "No client assigned, dropping connection");
                        break;
                    }
                    err => {
                        warn!(%conn, error = %err, "Relay cycle failed");
                    }
                }
            }
        }

        if state.shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    dispatch(&state, EventKind::OnClosing, info.into_payload());
    state.proxy.disconnect(conn);
    finish_connection(&state, Some(info), conn);
}

fn finish_connection(state: &Arc<ServerState>, opened: Option<ConnectionInfo>, conn: ConnId) {
    if let Some(info) = opened {
        dispatch(state, EventKind::OnClosed, info.into_payload());
    }
    state.metrics.active_connections.dec();
    state.active.fetch_sub(1, Ordering::SeqCst);
    debug!(%conn, "Connection finished");
}

fn dispatch(state: &Arc<ServerState>, event: EventKind, payload: Payload) {
    if let Err(err) = state.registry.run(event, payload, state.registry.verification) {
        error!(event = %event, error = %err, "Failed to run hooks");
    }
}
