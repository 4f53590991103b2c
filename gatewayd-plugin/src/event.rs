use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle and traffic events dispatched through the hook registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    OnConfigLoaded,
    OnNewLogger,
    OnNewPool,
    OnNewClient,
    OnNewProxy,
    OnNewServer,
    OnSignal,
    OnRun,
    OnBooting,
    OnBooted,
    OnOpening,
    OnOpened,
    OnClosing,
    OnClosed,
    OnTraffic,
    OnIncomingTraffic,
    OnOutgoingTraffic,
    OnShutdown,
    OnTick,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OnConfigLoaded => "OnConfigLoaded",
            EventKind::OnNewLogger => "OnNewLogger",
            EventKind::OnNewPool => "OnNewPool",
            EventKind::OnNewClient => "OnNewClient",
            EventKind::OnNewProxy => "OnNewProxy",
            EventKind::OnNewServer => "OnNewServer",
            EventKind::OnSignal => "OnSignal",
            EventKind::OnRun => "OnRun",
            EventKind::OnBooting => "OnBooting",
            EventKind::OnBooted => "OnBooted",
            EventKind::OnOpening => "OnOpening",
            EventKind::OnOpened => "OnOpened",
            EventKind::OnClosing => "OnClosing",
            EventKind::OnClosed => "OnClosed",
            EventKind::OnTraffic => "OnTraffic",
            EventKind::OnIncomingTraffic => "OnIncomingTraffic",
            EventKind::OnOutgoingTraffic => "OnOutgoingTraffic",
            EventKind::OnShutdown => "OnShutdown",
            EventKind::OnTick => "OnTick",
        }
    }

    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::OnConfigLoaded,
            EventKind::OnNewLogger,
            EventKind::OnNewPool,
            EventKind::OnNewClient,
            EventKind::OnNewProxy,
            EventKind::OnNewServer,
            EventKind::OnSignal,
            EventKind::OnRun,
            EventKind::OnBooting,
            EventKind::OnBooted,
            EventKind::OnOpening,
            EventKind::OnOpened,
            EventKind::OnClosing,
            EventKind::OnClosed,
            EventKind::OnTraffic,
            EventKind::OnIncomingTraffic,
            EventKind::OnOutgoingTraffic,
            EventKind::OnShutdown,
            EventKind::OnTick,
        ]
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event kind: {s}"))
    }
}

/// Hook payloads are string-keyed maps of dynamically typed values; they
/// cross the plugin boundary as a protobuf `Struct`.
pub type Payload = serde_json::Map<String, Value>;

fn to_payload<T: Serialize>(record: &T) -> Payload {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

/// Payload record for `OnNewClient` (one per pooled upstream client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub network: String,
    pub address: String,
    pub receive_buffer_size: usize,
    pub receive_chunk_size: usize,
    pub receive_deadline_ms: u64,
    pub send_deadline_ms: u64,
    pub tcp_keep_alive: bool,
    pub tcp_keep_alive_period_secs: u64,
}

/// Payload record for `OnNewPool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub size: usize,
}

/// Payload record for `OnNewProxy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
    pub elastic: bool,
    pub reuse_elastic_clients: bool,
    pub health_check_period_secs: u64,
    pub client_address: String,
}

/// Payload record for `OnNewServer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub network: String,
    pub address: String,
    pub soft_limit: usize,
    pub hard_limit: usize,
    pub tick_interval_secs: u64,
    pub multi_core: bool,
    pub workers: usize,
}

/// Payload record for `OnNewLogger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggerInfo {
    pub output: String,
    pub level: String,
    pub no_color: bool,
}

/// Payload record for `OnSignal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalInfo {
    pub signal: String,
}

/// Payload record for the connection lifecycle events
/// (`OnOpening`/`OnOpened`/`OnClosing`/`OnClosed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection: u64,
    pub remote_addr: String,
}

/// Traffic payload for `OnTraffic`/`OnIncomingTraffic`/`OnOutgoingTraffic`.
///
/// Buffers travel base64-encoded so they survive the `Struct` conversion at
/// the plugin boundary. A hook that sets `terminate` rejects the relay; any
/// `response` it leaves behind is written back to the frontend instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficPayload {
    #[serde(default)]
    pub request: String,

    #[serde(default)]
    pub response: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub terminate: bool,
}

impl TrafficPayload {
    pub fn incoming(request: &[u8]) -> Self {
        Self { request: encode_bytes(request), ..Self::default() }
    }

    pub fn outgoing(request: &[u8], response: &[u8], error: Option<String>) -> Self {
        Self {
            request: encode_bytes(request),
            response: encode_bytes(response),
            error,
            terminate: false,
        }
    }

    pub fn request_bytes(&self) -> Option<Vec<u8>> {
        decode_bytes(&self.request)
    }

    pub fn response_bytes(&self) -> Option<Vec<u8>> {
        decode_bytes(&self.response)
    }
}

macro_rules! impl_into_payload {
    ($($record:ty),* $(,)?) => {
        $(
            impl $record {
                pub fn into_payload(&self) -> Payload {
                    to_payload(self)
                }
            }

            impl From<&$record> for Payload {
                fn from(record: &$record) -> Payload {
                    record.into_payload()
                }
            }
        )*
    };
}

impl_into_payload!(
    ClientInfo,
    PoolInfo,
    ProxyInfo,
    ServerInfo,
    LoggerInfo,
    SignalInfo,
    ConnectionInfo,
    TrafficPayload,
);

impl TrafficPayload {
    /// Rebuild a traffic record from a (possibly hook-modified) payload.
    /// Unknown keys added by hooks are dropped; missing keys default.
    pub fn from_payload(payload: &Payload) -> Self {
        serde_json::from_value(Value::Object(payload.clone())).unwrap_or_default()
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}
