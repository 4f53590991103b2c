use thiserror::Error;

/// Unified error type for gatewayd.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Failed to dial upstream {address}: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pool is full (capacity {0})")]
    PoolFull(usize),

    #[error("Pool is exhausted")]
    PoolExhausted,

    #[error("Client is not connected")]
    ClientNotConnected,

    #[error("No client assigned to this connection")]
    ClientNotFound,

    #[error("Send deadline exceeded")]
    SendTimeout,

    #[error("Upstream connection broken")]
    BrokenPipe,

    #[error("Failed to send to upstream: {0}")]
    UpstreamSendFailed(String),

    #[error("Failed to receive from upstream: {0}")]
    UpstreamReceiveFailed(String),

    #[error("Upstream closed the connection")]
    UpstreamClosed,

    #[error("Failed to write to frontend: {0}")]
    FrontendWriteFailed(String),

    #[error("Failed to launch plugin {0}: {1}")]
    PluginLaunchFailed(String, String),

    #[error("Plugin verification failed for {0}: {1}")]
    PluginVerificationFailed(String, String),

    #[error("Plugin {0} timed out")]
    PluginTimeout(String),

    #[error("Plugin {0} crashed")]
    PluginCrashed(String),

    #[error("A hook is already registered on {event} at priority {priority}")]
    HookPriorityCollision { event: String, priority: i32 },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Process exit codes for startup failures. Relay-time errors never exit.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const FAILED_TO_LOAD_PLUGIN_CONFIG: i32 = 2;
    pub const FAILED_TO_LOAD_GLOBAL_CONFIG: i32 = 3;
    pub const FAILED_TO_INITIALIZE_POOL: i32 = 4;
    pub const FAILED_TO_START_SERVER: i32 = 5;
}

impl GatewayError {
    /// True for errors that only occur during startup and carry an exit code.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::ConfigError(_)
                | GatewayError::Fatal(_)
                | GatewayError::PluginLaunchFailed(_, _)
                | GatewayError::PluginVerificationFailed(_, _)
        )
    }

    /// True for receive-side errors that call for an upstream reconnect.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamClosed | GatewayError::BrokenPipe
        )
    }

    /// Stable variant name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConfigError(_) => "ConfigError",
            GatewayError::DialFailed { .. } => "DialFailed",
            GatewayError::PoolFull(_) => "PoolFull",
            GatewayError::PoolExhausted => "PoolExhausted",
            GatewayError::ClientNotConnected => "ClientNotConnected",
            GatewayError::ClientNotFound => "ClientNotFound",
            GatewayError::SendTimeout => "SendTimeout",
            GatewayError::BrokenPipe => "BrokenPipe",
            GatewayError::UpstreamSendFailed(_) => "UpstreamSendFailed",
            GatewayError::UpstreamReceiveFailed(_) => "UpstreamReceiveFailed",
            GatewayError::UpstreamClosed => "UpstreamClosed",
            GatewayError::FrontendWriteFailed(_) => "FrontendWriteFailed",
            GatewayError::PluginLaunchFailed(_, _) => "PluginLaunchFailed",
            GatewayError::PluginVerificationFailed(_, _) => "PluginVerificationFailed",
            GatewayError::PluginTimeout(_) => "PluginTimeout",
            GatewayError::PluginCrashed(_) => "PluginCrashed",
            GatewayError::HookPriorityCollision { .. } => "HookPriorityCollision",
            GatewayError::Fatal(_) => "Fatal",
            GatewayError::Io(_) => "Io",
            GatewayError::Serde(_) => "Serde",
        }
    }
}
