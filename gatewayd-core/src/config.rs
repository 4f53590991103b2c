use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Name of the profile every section must carry.
pub const DEFAULT_PROFILE: &str = "default";

/// Top-level configuration for gatewayd.
///
/// Every section is a map of named profiles; the gateway reads the
/// `default` profile of each. Extra profiles are tolerated so operators can
/// keep alternatives in the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Logger profiles
    #[serde(default = "default_loggers")]
    pub loggers: HashMap<String, LoggerConfig>,

    /// Upstream connection pool profiles
    #[serde(default = "default_pools")]
    pub pools: HashMap<String, PoolConfig>,

    /// Upstream client profiles
    #[serde(default = "default_clients")]
    pub clients: HashMap<String, ClientConfig>,

    /// Proxy behavior profiles
    #[serde(default = "default_proxies")]
    pub proxy: HashMap<String, ProxyConfig>,

    /// Frontend server profiles
    #[serde(default = "default_servers")]
    pub server: HashMap<String, ServerConfig>,

    /// Metrics endpoint profiles
    #[serde(default = "default_metrics")]
    pub metrics: HashMap<String, MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Log sink: "console" or "stderr"
    #[serde(default = "default_log_output")]
    pub output: String,

    /// Log level: trace | debug | info | warn | error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Disable ANSI colors
    #[serde(default)]
    pub no_color: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of upstream clients dialed at startup.
    /// 0 means an unbounded pool with no pre-dialed clients.
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Network family; only "tcp" is dialable ("udp" is reserved)
    #[serde(default = "default_network")]
    pub network: String,

    /// Upstream address, host:port
    #[serde(default = "default_client_address")]
    pub address: String,

    /// Total receive buffer per relay cycle (bytes)
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// Read chunk per syscall (bytes)
    #[serde(default = "default_receive_chunk_size")]
    pub receive_chunk_size: usize,

    /// Upstream read deadline (milliseconds, 0 = none)
    #[serde(default)]
    pub receive_deadline_ms: u64,

    /// Upstream write deadline (milliseconds, 0 = none)
    #[serde(default)]
    pub send_deadline_ms: u64,

    /// Enable TCP keepalive on the upstream socket
    #[serde(default)]
    pub tcp_keep_alive: bool,

    /// Keepalive idle period (seconds)
    #[serde(default = "default_keep_alive_period")]
    pub tcp_keep_alive_period_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Create upstream clients on demand when the pool runs dry
    #[serde(default)]
    pub elastic: bool,

    /// Return elastic clients to the pool instead of closing them
    #[serde(default)]
    pub reuse_elastic_clients: bool,

    /// Idle time after which a pooled client is health-probed (seconds)
    #[serde(default = "default_health_check_period")]
    pub health_check_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Frontend network family
    #[serde(default = "default_network")]
    pub network: String,

    /// Frontend listen address
    #[serde(default = "default_server_address")]
    pub address: String,

    /// Connection count that triggers warnings
    #[serde(default = "default_soft_limit")]
    pub soft_limit: usize,

    /// Connection count at which new accepts are refused
    #[serde(default = "default_hard_limit")]
    pub hard_limit: usize,

    /// OnTick dispatch interval (seconds)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Dispatch OnTick events
    #[serde(default = "default_true")]
    pub enable_ticker: bool,

    /// One reactor per core; overrides `workers`
    #[serde(default = "default_true")]
    pub multi_core: bool,

    /// Reactor count when `multi_core` is off (0 = 1)
    #[serde(default)]
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve the metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics listen address
    #[serde(default = "default_metrics_address")]
    pub address: String,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl GlobalConfig {
    /// Load configuration from a YAML file merged with environment
    /// variables. Env keys nest with double underscores:
    /// `GATEWAYD_SERVER__DEFAULT__ADDRESS=0.0.0.0:15432`.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if config_path.exists() {
            figment = figment.merge(Yaml::file(config_path));
        } else {
            tracing::warn!(path = %config_path.display(), "Config file not found, using defaults");
        }

        figment = figment.merge(Env::prefixed("GATEWAYD_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// The fully resolved config as a nested JSON mapping, the shape the
    /// `OnConfigLoaded` hook payload carries.
    pub fn to_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild the config from a (possibly hook-modified) payload mapping.
    /// Unknown keys are ignored; missing sections fall back to defaults.
    pub fn from_payload(
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> anyhow::Result<Self> {
        let config = serde_json::from_value(serde_json::Value::Object(payload))?;
        Ok(config)
    }

    pub fn logger(&self) -> LoggerConfig {
        self.loggers.get(DEFAULT_PROFILE).cloned().unwrap_or_default()
    }

    pub fn pool(&self) -> PoolConfig {
        self.pools.get(DEFAULT_PROFILE).copied().unwrap_or_default()
    }

    pub fn client(&self) -> ClientConfig {
        self.clients.get(DEFAULT_PROFILE).cloned().unwrap_or_default()
    }

    pub fn proxy(&self) -> ProxyConfig {
        self.proxy.get(DEFAULT_PROFILE).copied().unwrap_or_default()
    }

    pub fn server(&self) -> ServerConfig {
        self.server.get(DEFAULT_PROFILE).cloned().unwrap_or_default()
    }

    pub fn metrics(&self) -> MetricsConfig {
        self.metrics.get(DEFAULT_PROFILE).cloned().unwrap_or_default()
    }
}

impl ServerConfig {
    /// Number of reactor threads to spawn.
    pub fn effective_workers(&self) -> usize {
        if self.multi_core {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers.max(1)
        }
    }
}

// Default implementations

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            loggers: default_loggers(),
            pools: default_pools(),
            clients: default_clients(),
            proxy: default_proxies(),
            server: default_servers(),
            metrics: default_metrics(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            level: default_log_level(),
            no_color: false,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: default_pool_size() }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_client_address(),
            receive_buffer_size: default_receive_buffer_size(),
            receive_chunk_size: default_receive_chunk_size(),
            receive_deadline_ms: 0,
            send_deadline_ms: 0,
            tcp_keep_alive: false,
            tcp_keep_alive_period_secs: default_keep_alive_period(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            elastic: false,
            reuse_elastic_clients: false,
            health_check_period_secs: default_health_check_period(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            address: default_server_address(),
            soft_limit: default_soft_limit(),
            hard_limit: default_hard_limit(),
            tick_interval_secs: default_tick_interval(),
            enable_ticker: true,
            multi_core: true,
            workers: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

// Serde default functions

fn default_loggers() -> HashMap<String, LoggerConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), LoggerConfig::default())])
}

fn default_pools() -> HashMap<String, PoolConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), PoolConfig::default())])
}

fn default_clients() -> HashMap<String, ClientConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), ClientConfig::default())])
}

fn default_proxies() -> HashMap<String, ProxyConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), ProxyConfig::default())])
}

fn default_servers() -> HashMap<String, ServerConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), ServerConfig::default())])
}

fn default_metrics() -> HashMap<String, MetricsConfig> {
    HashMap::from([(DEFAULT_PROFILE.to_string(), MetricsConfig::default())])
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_client_address() -> String {
    "localhost:5432".to_string()
}

fn default_receive_buffer_size() -> usize {
    1 << 24 // 16MB
}

fn default_receive_chunk_size() -> usize {
    8192
}

fn default_keep_alive_period() -> u64 {
    30
}

fn default_health_check_period() -> u64 {
    60
}

fn default_server_address() -> String {
    "0.0.0.0:15432".to_string()
}

fn default_soft_limit() -> usize {
    4096
}

fn default_hard_limit() -> usize {
    8192
}

fn default_tick_interval() -> u64 {
    5
}

fn default_metrics_address() -> String {
    "127.0.0.1:2112".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}
