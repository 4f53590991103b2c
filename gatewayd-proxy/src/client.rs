use bytes::BytesMut;
use gatewayd_core::GatewayError;
use gatewayd_core::config::ClientConfig;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An owned upstream connection.
///
/// I/O is blocking with OS-level deadlines, the way the relay drives it
/// from a reactor thread: the only waits are send (bounded by the send
/// deadline) and receive (bounded by the receive deadline). Keeping the
/// stream blocking also keeps the client `Send`, so one pool serves every
/// reactor.
///
/// A client is either connected (non-empty id, open socket) or dead (empty
/// id, no socket — the zero value). `close` moves it to dead and is
/// idempotent.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    state: Mutex<ClientState>,
}

#[derive(Debug)]
struct ClientState {
    id: String,
    stream: Option<TcpStream>,
    /// Receive buffer, reused across receives within a relay cycle.
    buffer: BytesMut,
    last_activity: Instant,
}

impl Client {
    /// Dial `(network, address)` from the config and apply deadlines,
    /// nodelay, and keepalive.
    pub fn connect(config: &ClientConfig) -> Result<Self, GatewayError> {
        let stream = dial(config)?;

        if config.send_deadline_ms > 0 {
            stream
                .set_write_timeout(Some(Duration::from_millis(config.send_deadline_ms)))
                .map_err(GatewayError::Io)?;
        }
        if config.receive_deadline_ms > 0 {
            stream
                .set_read_timeout(Some(Duration::from_millis(config.receive_deadline_ms)))
                .map_err(GatewayError::Io)?;
        }
        let _ = stream.set_nodelay(true);
        if config.tcp_keep_alive {
            if let Err(err) = set_keepalive(&stream, config.tcp_keep_alive_period_secs) {
                warn!(address = %config.address, error = %err, "Failed to enable keepalive");
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        debug!(id = %id, address = %config.address, "Upstream connected");

        Ok(Self {
            config: config.clone(),
            state: Mutex::new(ClientState {
                id,
                stream: Some(stream),
                buffer: BytesMut::with_capacity(config.receive_chunk_size),
                last_activity: Instant::now(),
            }),
        })
    }

    /// The zero-value client: empty identifier, no socket.
    pub fn dead(config: &ClientConfig) -> Self {
        Self {
            config: config.clone(),
            state: Mutex::new(ClientState {
                id: String::new(),
                stream: None,
                buffer: BytesMut::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Stable identifier; empty when the client is dead.
    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn is_alive(&self) -> bool {
        let state = self.lock();
        !state.id.is_empty() && state.stream.is_some()
    }

    /// Time since the last send/receive on this client.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    /// Write the entire buffer upstream.
    pub fn send(&self, buf: &[u8]) -> Result<usize, GatewayError> {
        let mut state = self.lock();
        let stream = state.stream.as_mut().ok_or(GatewayError::ClientNotConnected)?;

        stream.write_all(buf).map_err(|err| match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                GatewayError::SendTimeout
            }
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                GatewayError::BrokenPipe
            }
            _ => GatewayError::UpstreamSendFailed(err.to_string()),
        })?;

        state.last_activity = Instant::now();
        Ok(buf.len())
    }

    /// Read the upstream reply: chunks of `receive_chunk_size` until EOF, a
    /// short read, a full buffer, or the receive deadline.
    ///
    /// EOF before any byte surfaces as `UpstreamClosed` so the caller can
    /// reconnect. The returned bytes are copied out of the reused buffer.
    pub fn receive(&self) -> Result<Vec<u8>, GatewayError> {
        let buffer_size = self.config.receive_buffer_size;
        let chunk_size = self.config.receive_chunk_size.max(1);

        let mut guard = self.lock();
        let state = &mut *guard;
        let stream = state.stream.as_mut().ok_or(GatewayError::ClientNotConnected)?;

        state.buffer.resize(buffer_size, 0);
        let mut received = 0usize;

        loop {
            let end = (received + chunk_size).min(buffer_size);
            if received == end {
                // buffer full
                break;
            }
            let want = end - received;
            match stream.read(&mut state.buffer[received..end]) {
                Ok(0) => {
                    if received == 0 {
                        return Err(GatewayError::UpstreamClosed);
                    }
                    break;
                }
                Ok(n) => {
                    received += n;
                    if n < want {
                        // short read: the reply is complete
                        break;
                    }
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if received == 0 {
                        return Err(GatewayError::UpstreamReceiveFailed(
                            "receive deadline exceeded".to_string(),
                        ));
                    }
                    break;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
                    ) =>
                {
                    return Err(GatewayError::UpstreamClosed);
                }
                Err(err) => {
                    return Err(GatewayError::UpstreamReceiveFailed(err.to_string()));
                }
            }
        }

        state.last_activity = Instant::now();
        Ok(state.buffer[..received].to_vec())
    }

    /// Nonblocking liveness probe: peek one byte and interpret the result.
    /// EOF or a hard error means the socket is gone; pending data or
    /// `WouldBlock` means it is usable.
    pub fn probe(&self) -> bool {
        let mut state = self.lock();
        let Some(stream) = state.stream.as_mut() else { return false };

        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let healthy = match stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        let _ = stream.set_nonblocking(false);
        healthy
    }

    /// Idempotent close; zeroes the identifier.
    pub fn close(&self) {
        let mut state = self.lock();
        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(id = %state.id, "Upstream connection closed");
        }
        state.id.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn dial(config: &ClientConfig) -> Result<TcpStream, GatewayError> {
    if config.network != "tcp" {
        return Err(GatewayError::DialFailed {
            address: config.address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("unsupported network: {}", config.network),
            ),
        });
    }

    let candidates = resolve_addrs(&config.address);
    if candidates.is_empty() {
        return Err(GatewayError::DialFailed {
            address: config.address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address did not resolve",
            ),
        });
    }

    let mut last_error = None;
    for addr in &candidates {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(address = %config.address, resolved = %addr, error = %err,
                    "Upstream candidate failed, trying next");
                last_error = Some(err);
            }
        }
    }

    Err(GatewayError::DialFailed {
        address: config.address.clone(),
        source: last_error
            .unwrap_or_else(|| std::io::Error::other("connect failed")),
    })
}

/// Resolve an address string to socket addresses, IPv4 first: `localhost`
/// often resolves to `::1` before `127.0.0.1`, and most upstreams listen on
/// IPv4 only.
fn resolve_addrs(address: &str) -> Vec<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return vec![addr];
    }
    let all: Vec<SocketAddr> = match address.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut sorted: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    sorted.extend(all.iter().copied().filter(|a| a.is_ipv6()));
    sorted
}

fn set_keepalive(stream: &TcpStream, period_secs: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;
    // SAFETY: fd is a valid open socket owned by `stream`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&enable as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    {
        let idle: libc::c_int = period_secs.min(libc::c_int::MAX as u64) as libc::c_int;
        // SAFETY: as above.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_KEEPIDLE,
                (&idle as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = period_secs;

    Ok(())
}
