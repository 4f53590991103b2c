use crate::event::{EventKind, Payload};
use crate::registry::HookCallable;
use gatewayd_core::GatewayError;
use prost::Message;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Reserved event name for the manifest request sent right after handshake.
pub const GET_PLUGIN_CONFIG: &str = "GetPluginConfig";

/// Upper bound on a single RPC frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One request frame: event-kind selector plus the payload map.
#[derive(Clone, PartialEq, Message)]
pub struct HookRequest {
    #[prost(string, tag = "1")]
    pub event: String,

    #[prost(message, optional, tag = "2")]
    pub payload: Option<prost_types::Struct>,
}

/// One response frame: the payload delta, or an in-band error.
#[derive(Clone, PartialEq, Message)]
pub struct HookResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<prost_types::Struct>,

    #[prost(string, tag = "2")]
    pub error: String,
}

// ── Payload ⇄ protobuf Struct ─────────────────────────────────

pub fn payload_to_struct(payload: &Payload) -> prost_types::Struct {
    prost_types::Struct {
        fields: payload
            .iter()
            .map(|(key, value)| (key.clone(), json_to_proto(value)))
            .collect(),
    }
}

pub fn struct_to_payload(pb: &prost_types::Struct) -> Payload {
    pb.fields
        .iter()
        .map(|(key, value)| (key.clone(), proto_to_json(value)))
        .collect()
}

fn json_to_proto(value: &serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_proto).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map
                .iter()
                .map(|(key, value)| (key.clone(), json_to_proto(value)))
                .collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json(value: &prost_types::Value) -> serde_json::Value {
    use prost_types::value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.iter().map(proto_to_json).collect())
        }
        Some(Kind::StructValue(pb)) => {
            serde_json::Value::Object(struct_to_payload(pb))
        }
    }
}

// ── Frame codec: 4-byte big-endian length prefix ──────────────

pub fn write_frame<M: Message, W: Write>(writer: &mut W, message: &M) -> io::Result<()> {
    let body = message.encode_to_vec();
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

pub fn read_frame<M: Message + Default, R: Read>(reader: &mut R) -> io::Result<M> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    M::decode(body.as_slice()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

// ── Handshake ─────────────────────────────────────────────────

/// The line a plugin prints on stdout once its RPC listener is up:
/// `<protocol_version>|<network>|<address>|<tls>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub network: String,
    pub address: String,
    pub tls: bool,
}

impl std::str::FromStr for Handshake {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.trim().split('|');
        let version = parts.next().ok_or("missing protocol version")?;
        let network = parts.next().ok_or("missing network")?;
        let address = parts.next().ok_or("missing address")?;
        let tls = parts.next().ok_or("missing tls flag")?;
        if parts.next().is_some() {
            return Err(format!("trailing fields in handshake: {line}"));
        }

        Ok(Handshake {
            protocol_version: version
                .parse()
                .map_err(|_| format!("bad protocol version: {version}"))?,
            network: network.to_string(),
            address: address.to_string(),
            tls: tls.parse().map_err(|_| format!("bad tls flag: {tls}"))?,
        })
    }
}

// ── Blocking RPC client ───────────────────────────────────────

enum RpcStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RpcStream {
    fn connect(network: &str, address: &str, timeout: Duration) -> io::Result<Self> {
        match network {
            "unix" => {
                let stream = UnixStream::connect(address)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(RpcStream::Unix(stream))
            }
            _ => {
                let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved")
                })?;
                let stream = TcpStream::connect_timeout(&addr, timeout)?;
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(RpcStream::Tcp(stream))
            }
        }
    }
}

impl Read for RpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RpcStream::Tcp(s) => s.read(buf),
            RpcStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RpcStream::Tcp(s) => s.write(buf),
            RpcStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RpcStream::Tcp(s) => s.flush(),
            RpcStream::Unix(s) => s.flush(),
        }
    }
}

/// Synchronous RPC client for one plugin subprocess.
///
/// Calls are serialized on the stream; the socket deadlines bound every
/// call by the configured hook timeout. Any transport failure leaves the
/// stream desynchronized, so the client latches broken and fails fast from
/// then on.
pub struct RpcClient {
    plugin: String,
    stream: Mutex<RpcStream>,
    broken: AtomicBool,
}

impl RpcClient {
    pub fn connect(
        plugin: &str,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> io::Result<Self> {
        let stream = RpcStream::connect(network, address, timeout)?;
        Ok(Self {
            plugin: plugin.to_string(),
            stream: Mutex::new(stream),
            broken: AtomicBool::new(false),
        })
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Issue one request/response exchange for `event`.
    pub fn call_raw(&self, event: &str, payload: &Payload) -> Result<Payload, GatewayError> {
        if self.broken.load(Ordering::Acquire) {
            return Err(GatewayError::PluginCrashed(self.plugin.clone()));
        }

        let request = HookRequest {
            event: event.to_string(),
            payload: Some(payload_to_struct(payload)),
        };

        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = write_frame(&mut *stream, &request) {
            drop(stream);
            return Err(self.transport_error(err));
        }
        let response: HookResponse = match read_frame(&mut *stream) {
            Ok(response) => response,
            Err(err) => {
                drop(stream);
                return Err(self.transport_error(err));
            }
        };
        drop(stream);

        if !response.error.is_empty() {
            warn!(plugin = %self.plugin, event = event, error = %response.error,
                "Plugin returned an error");
            return Ok(Payload::new());
        }

        Ok(response
            .payload
            .as_ref()
            .map(struct_to_payload)
            .unwrap_or_default())
    }

    fn transport_error(&self, err: io::Error) -> GatewayError {
        self.broken.store(true, Ordering::Release);
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                GatewayError::PluginTimeout(self.plugin.clone())
            }
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => GatewayError::PluginCrashed(self.plugin.clone()),
            _ => GatewayError::Io(err),
        }
    }
}

impl HookCallable for RpcClient {
    fn call(&self, event: EventKind, payload: &Payload) -> Result<Payload, GatewayError> {
        self.call_raw(event.as_str(), payload)
    }
}
