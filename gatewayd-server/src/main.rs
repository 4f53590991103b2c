// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  gatewayd — pluggable TCP gateway
//
//  Data plane:  monoio thread-per-core reactors relaying opaque TCP
//  Plugins:     out-of-process, framed RPC, ordered hook chains
//  Metrics:     prometheus endpoint on a dedicated tokio thread
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::{Parser, Subcommand};
use gatewayd_core::config::{ClientConfig, GlobalConfig, LoggerConfig};
use gatewayd_core::error::exit;
use gatewayd_observability::exporter::{self, MetricsEndpoint};
use gatewayd_observability::{MetricsCollector, MetricsMerger};
use gatewayd_plugin::event::{
    ClientInfo, EventKind, LoggerInfo, PoolInfo, ProxyInfo, ServerInfo, SignalInfo,
};
use gatewayd_plugin::manifest::PluginManifest;
use gatewayd_plugin::registry::HookRegistry;
use gatewayd_plugin::{Payload, PluginManager};
use gatewayd_proxy::{Client, Pool, Proxy, Server};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Signal bookkeeping for the graceful/forced shutdown split.
static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[derive(Parser, Debug)]
#[command(name = "gatewayd", version, about = "gatewayd — pluggable TCP gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a gatewayd instance
    Run {
        /// Path to the global configuration file
        #[arg(short, long, default_value = "./gatewayd.yaml")]
        config: PathBuf,

        /// Path to the plugin configuration file
        #[arg(short, long, default_value = "./gatewayd_plugins.yaml")]
        plugin_config: PathBuf,
    },
    /// Print the version and exit
    Version,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => println!("gatewayd {}", env!("CARGO_PKG_VERSION")),
        Commands::Run { config, plugin_config } => run(config, plugin_config),
    }
}

fn run(config_path: PathBuf, plugin_config_path: PathBuf) {
    // ── Global config (parsed first so logging can come up) ──
    let config = match GlobalConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration from {}: {err}", config_path.display());
            std::process::exit(exit::FAILED_TO_LOAD_GLOBAL_CONFIG);
        }
    };

    init_tracing(&config.logger());
    info!(version = env!("CARGO_PKG_VERSION"), "gatewayd starting — monoio thread-per-core engine");

    // ── Plugin manifest ──
    let manifest = if plugin_config_path.exists() {
        match PluginManifest::load(&plugin_config_path) {
            Ok(manifest) => manifest,
            Err(err) => {
                error!(path = %plugin_config_path.display(), error = %err,
                    "Failed to load plugin configuration");
                std::process::exit(exit::FAILED_TO_LOAD_PLUGIN_CONFIG);
            }
        }
    } else {
        info!(path = %plugin_config_path.display(), "No plugin config found, running without plugins");
        PluginManifest::default()
    };

    // ── Plugins: registry, merger, host ──
    let registry = Arc::new(HookRegistry::new(
        manifest.compatibility_policy,
        manifest.verification_policy,
    ));
    let merger = Arc::new(MetricsMerger::new(Duration::from_secs(
        manifest.metrics_merger_period_secs,
    )));
    let plugin_manager = Arc::new(PluginManager::new(
        manifest,
        Arc::clone(&registry),
        Some(Arc::clone(&merger)),
    ));
    if let Err(err) = plugin_manager.load_plugins() {
        error!(error = %err, "Failed to load plugins");
        plugin_manager.shutdown();
        std::process::exit(exit::FAILED_TO_LOAD_PLUGIN_CONFIG);
    }

    // ── OnConfigLoaded: hooks may return a modified config ──
    let config = match registry.run(
        EventKind::OnConfigLoaded,
        config.to_payload(),
        registry.verification,
    ) {
        Ok(payload) => match GlobalConfig::from_payload(payload) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(error = %err, "Hook-modified config does not parse, keeping the loaded one");
                config
            }
        },
        Err(err) => {
            error!(error = %err, "Failed to run OnConfigLoaded hooks");
            config
        }
    };

    // ── OnNewLogger (notification only) ──
    let logger = config.logger();
    dispatch(
        &registry,
        EventKind::OnNewLogger,
        LoggerInfo { output: logger.output.clone(), level: logger.level.clone(), no_color: logger.no_color }
            .into_payload(),
    );

    // ── Metrics collector ──
    let metrics = match MetricsCollector::new() {
        Ok(collector) => Arc::new(collector),
        Err(err) => {
            error!(error = %err, "Failed to build metrics registry");
            plugin_manager.shutdown();
            std::process::exit(exit::FAILED_TO_START_SERVER);
        }
    };

    // ── Connection pool ──
    let pool_size = config.pool().size;
    let client_config = config.client();
    let pool: Pool<String, Arc<Client>> = Pool::new(pool_size);

    for _ in 0..pool_size {
        match Client::connect(&client_config) {
            Ok(client) => {
                let client = Arc::new(client);
                dispatch(
                    &registry,
                    EventKind::OnNewClient,
                    client_info(&client.id(), &client_config).into_payload(),
                );
                if let Err(err) = pool.put(client.id(), client) {
                    error!(error = %err, "Failed to add client to the pool");
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to create client");
            }
        }
    }

    info!(count = pool.size(), "There are clients available in the pool");
    if pool.size() != pool_size {
        error!(
            "The pool size is incorrect, either because the clients cannot connect due to \
             no network connectivity or the server is not running. exiting..."
        );
        plugin_manager.shutdown();
        std::process::exit(exit::FAILED_TO_INITIALIZE_POOL);
    }
    dispatch(&registry, EventKind::OnNewPool, PoolInfo { size: pool_size }.into_payload());

    // ── Proxy ──
    let proxy_config = config.proxy();
    let proxy = Arc::new(Proxy::new(
        pool,
        Arc::clone(&registry),
        &proxy_config,
        client_config.clone(),
        Arc::clone(&metrics),
    ));
    dispatch(
        &registry,
        EventKind::OnNewProxy,
        ProxyInfo {
            elastic: proxy_config.elastic,
            reuse_elastic_clients: proxy_config.reuse_elastic_clients,
            health_check_period_secs: proxy_config.health_check_period_secs,
            client_address: client_config.address.clone(),
        }
        .into_payload(),
    );

    // ── Server ──
    let server_config = config.server();
    let server = Server::new(
        server_config.clone(),
        Arc::clone(&proxy),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    );
    dispatch(
        &registry,
        EventKind::OnNewServer,
        ServerInfo {
            network: server_config.network.clone(),
            address: server_config.address.clone(),
            soft_limit: server_config.soft_limit,
            hard_limit: server_config.hard_limit,
            tick_interval_secs: server_config.tick_interval_secs,
            multi_core: server_config.multi_core,
            workers: server_config.workers,
        }
        .into_payload(),
    );

    // ── Metrics merger + endpoint on a dedicated tokio thread ──
    merger.start();
    let metrics_config = config.metrics();
    if metrics_config.enabled {
        let endpoint = Arc::new(MetricsEndpoint {
            collector: Arc::clone(&metrics),
            merger: Some(Arc::clone(&merger)),
        });
        let addr = metrics_config.address.clone();
        let path = metrics_config.path.clone();
        std::thread::Builder::new()
            .name("gatewayd-metrics".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(error = %err, "Failed to build metrics runtime");
                        return;
                    }
                };
                rt.block_on(async {
                    if let Err(err) = exporter::serve(&addr, &path, endpoint).await {
                        error!(error = %err, "Metrics endpoint failed");
                    }
                });
            })
            .expect("failed to spawn metrics thread");
    }

    // ── Signals: first one is graceful, a second forces exit ──
    setup_signal_handlers();
    spawn_force_exit_watchdog();

    // ── Run the reactors ──
    let worker_handles = match server.run() {
        Ok(handles) => handles,
        Err(err) => {
            error!(error = %err, "Failed to start server");
            plugin_manager.shutdown();
            std::process::exit(exit::FAILED_TO_START_SERVER);
        }
    };

    // ── Wait for the first signal, reaping crashed plugins meanwhile ──
    while SIGNAL_COUNT.load(Ordering::SeqCst) == 0 {
        plugin_manager.reap_crashed();
        std::thread::sleep(Duration::from_millis(100));
    }

    let signal = signal_name(LAST_SIGNAL.load(Ordering::SeqCst));
    info!(signal = signal, "Shutdown signal received, stopping...");
    dispatch(
        &registry,
        EventKind::OnSignal,
        SignalInfo { signal: signal.to_string() }.into_payload(),
    );

    server.shutdown();
    merger.stop();
    plugin_manager.shutdown();
    info!("gatewayd stopped");

    // Reactor threads sit in accept loops; let the OS reclaim them.
    drop(worker_handles);
    std::process::exit(exit::SUCCESS);
}

fn dispatch(registry: &Arc<HookRegistry>, event: EventKind, payload: Payload) {
    if let Err(err) = registry.run(event, payload, registry.verification) {
        error!(event = %event, error = %err, "Failed to run hooks");
    }
}

fn client_info(id: &str, config: &ClientConfig) -> ClientInfo {
    ClientInfo {
        id: id.to_string(),
        network: config.network.clone(),
        address: config.address.clone(),
        receive_buffer_size: config.receive_buffer_size,
        receive_chunk_size: config.receive_chunk_size,
        receive_deadline_ms: config.receive_deadline_ms,
        send_deadline_ms: config.send_deadline_ms,
        tcp_keep_alive: config.tcp_keep_alive,
        tcp_keep_alive_period_secs: config.tcp_keep_alive_period_secs,
    }
}

fn init_tracing(logger: &LoggerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logger.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!logger.no_color);
    if logger.output == "stderr" {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

const SHUTDOWN_SIGNALS: [libc::c_int; 5] =
    [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT, libc::SIGHUP, libc::SIGABRT];

fn setup_signal_handlers() {
    for signal in SHUTDOWN_SIGNALS {
        // SAFETY: installing an async-signal-safe handler that only touches
        // atomics.
        unsafe {
            libc::signal(signal, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(signal: libc::c_int) {
    LAST_SIGNAL.store(signal, Ordering::SeqCst);
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// A second signal must not wait for the graceful path.
fn spawn_force_exit_watchdog() {
    std::thread::Builder::new()
        .name("gatewayd-force-exit".to_string())
        .spawn(|| {
            loop {
                if SIGNAL_COUNT.load(Ordering::SeqCst) >= 2 {
                    eprintln!("second signal received, terminating immediately");
                    std::process::exit(exit::SUCCESS);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        })
        .expect("failed to spawn force-exit watchdog");
}

fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGINT => "SIGINT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGHUP => "SIGHUP",
        libc::SIGABRT => "SIGABRT",
        _ => "UNKNOWN",
    }
}
