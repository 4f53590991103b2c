use crate::event::{EventKind, Payload};
use crate::manifest::{PluginEntry, PluginManifest};
use crate::registry::{CompatibilityPolicy, HookCallable, HookRegistry};
use crate::rpc::{GET_PLUGIN_CONFIG, Handshake, RpcClient};
use gatewayd_core::GatewayError;
use gatewayd_observability::merger::MetricsMerger;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Hook API version this host speaks.
pub const PLUGIN_API_VERSION: &str = "0.1.0";

/// Handshake cookie passed to children so stray executions of a plugin
/// binary can detect they were not launched by a gateway.
pub const MAGIC_COOKIE_KEY: &str = "GATEWAYD_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "f14a9016-4b2e-4a3a-8458-f3f4e7d2e0c4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Declared,
    Verified,
    Launched,
    Handshaked,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

/// One hook a plugin declares in its `GetPluginConfig` manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredHook {
    pub event: String,
    pub priority: i32,
    #[serde(default)]
    pub signature: String,
}

/// The manifest a plugin reports after handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub requires_api_version: String,
    #[serde(default)]
    pub hooks: Vec<DeclaredHook>,
    #[serde(default)]
    pub metrics_socket: Option<PathBuf>,
}

/// Supervisor record for one plugin child process.
pub struct PluginSupervisor {
    pub entry: PluginEntry,
    pub state: PluginState,
    pub info: Option<PluginInfo>,
    pub rpc: Option<Arc<RpcClient>>,
    child: Option<Child>,
}

impl PluginSupervisor {
    fn new(entry: PluginEntry) -> Self {
        Self { entry, state: PluginState::Declared, info: None, rpc: None, child: None }
    }

    fn pid(&self) -> Option<i32> {
        self.child.as_ref().map(|child| child.id() as i32)
    }
}

/// Launches, gates, and supervises the out-of-process plugins.
pub struct PluginManager {
    manifest: PluginManifest,
    registry: Arc<HookRegistry>,
    merger: Option<Arc<MetricsMerger>>,
    supervisors: Mutex<Vec<PluginSupervisor>>,
}

impl PluginManager {
    pub fn new(
        manifest: PluginManifest,
        registry: Arc<HookRegistry>,
        merger: Option<Arc<MetricsMerger>>,
    ) -> Self {
        Self { manifest, registry, merger, supervisors: Mutex::new(Vec::new()) }
    }

    pub fn registry(&self) -> Arc<HookRegistry> {
        Arc::clone(&self.registry)
    }

    /// Launch every enabled plugin and register its hooks.
    ///
    /// Only verification and compatibility rejections under the `strict`
    /// policy abort startup; a plugin that fails to launch or handshake is
    /// logged, marked crashed, and skipped.
    pub fn load_plugins(&self) -> Result<(), GatewayError> {
        for entry in self.manifest.enabled_plugins() {
            let mut supervisor = PluginSupervisor::new(entry.clone());
            match self.load_one(&mut supervisor) {
                Ok(()) => {
                    info!(plugin = %supervisor.entry.name, "Plugin is ready");
                    supervisor.state = PluginState::Ready;
                }
                Err(err @ GatewayError::PluginVerificationFailed(_, _)) if self.strict() => {
                    self.terminate(&mut supervisor, Duration::from_secs(0));
                    return Err(err);
                }
                Err(err) => {
                    error!(plugin = %supervisor.entry.name, error = %err,
                        "Plugin failed to load, skipping");
                    self.terminate(&mut supervisor, Duration::from_secs(0));
                    supervisor.state = PluginState::Crashed;
                }
            }
            self.supervisors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(supervisor);
        }
        Ok(())
    }

    fn strict(&self) -> bool {
        self.manifest.compatibility_policy == CompatibilityPolicy::Strict
    }

    fn load_one(&self, supervisor: &mut PluginSupervisor) -> Result<(), GatewayError> {
        let entry = supervisor.entry.clone();
        let name = entry.name.as_str();

        // 1. Checksum gate
        let checksum = match checksum_file(&entry.local_path) {
            Ok(sum) => sum,
            Err(err) => {
                return Err(GatewayError::PluginVerificationFailed(
                    name.to_string(),
                    format!("cannot read {}: {err}", entry.local_path.display()),
                ));
            }
        };
        if !entry.checksum.is_empty() && !checksum.eq_ignore_ascii_case(&entry.checksum) {
            let err = GatewayError::PluginVerificationFailed(
                name.to_string(),
                format!("checksum mismatch: expected {}, got {checksum}", entry.checksum),
            );
            if self.strict() {
                return Err(err);
            }
            warn!(plugin = name, error = %err, "Continuing under loose policy");
        }
        supervisor.state = PluginState::Verified;

        // 2. Spawn with piped stdio
        let mut command = Command::new(&entry.local_path);
        command
            .args(&entry.args)
            .envs(entry.env_pairs())
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|err| {
            GatewayError::PluginLaunchFailed(name.to_string(), err.to_string())
        })?;
        supervisor.state = PluginState::Launched;

        // 3. Handshake: first stdout line, remaining output becomes log
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::PluginLaunchFailed(name.to_string(), "stdout not captured".into())
        })?;
        let (handshake_tx, handshake_rx) = crossbeam_channel::bounded::<String>(1);
        spawn_stdout_forwarder(name.to_string(), stdout, handshake_tx);
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_forwarder(name.to_string(), stderr);
        }
        supervisor.child = Some(child);

        let start_timeout = Duration::from_secs(self.manifest.start_timeout_secs);
        let line = handshake_rx.recv_timeout(start_timeout).map_err(|_| {
            GatewayError::PluginLaunchFailed(name.to_string(), "no handshake line".into())
        })?;
        let handshake: Handshake = line.parse().map_err(|err| {
            GatewayError::PluginLaunchFailed(name.to_string(), err)
        })?;
        debug!(plugin = name, network = %handshake.network, address = %handshake.address,
            protocol = handshake.protocol_version, "Plugin handshake complete");
        supervisor.state = PluginState::Handshaked;

        // 4. RPC client + manifest request
        let hook_timeout = Duration::from_secs(self.manifest.hook_timeout_secs);
        let rpc = Arc::new(
            RpcClient::connect(name, &handshake.network, &handshake.address, hook_timeout)
                .map_err(|err| {
                    GatewayError::PluginLaunchFailed(name.to_string(), err.to_string())
                })?,
        );
        let raw_info = rpc.call_raw(GET_PLUGIN_CONFIG, &Payload::new())?;
        let info: PluginInfo =
            serde_json::from_value(serde_json::Value::Object(raw_info)).map_err(|err| {
                GatewayError::PluginLaunchFailed(
                    name.to_string(),
                    format!("bad plugin manifest: {err}"),
                )
            })?;

        // 5. Compatibility gate
        if info.requires_api_version != PLUGIN_API_VERSION {
            let err = GatewayError::PluginVerificationFailed(
                name.to_string(),
                format!(
                    "requires API {}, host speaks {PLUGIN_API_VERSION}",
                    info.requires_api_version
                ),
            );
            if self.strict() {
                return Err(err);
            }
            warn!(plugin = name, error = %err, "Continuing under loose policy");
        }

        // 6. Register hooks under the plugin's checksum
        self.registry.set_plugin_checksum(name, &checksum);
        for hook in &info.hooks {
            let event: EventKind = match hook.event.parse() {
                Ok(event) => event,
                Err(err) => {
                    warn!(plugin = name, error = %err, "Skipping unknown hook");
                    continue;
                }
            };
            if let Err(err) = self.registry.register(
                event,
                hook.priority,
                name,
                &hook.signature,
                Arc::clone(&rpc) as Arc<dyn HookCallable>,
            ) {
                warn!(plugin = name, event = %event, priority = hook.priority, error = %err,
                    "Hook rejected");
            }
        }

        // 7. Metrics side-channel
        if let (Some(merger), Some(socket)) = (&self.merger, &info.metrics_socket) {
            merger.add(name, socket);
        }

        supervisor.rpc = Some(rpc);
        supervisor.info = Some(info);
        Ok(())
    }

    /// Mark plugins whose child exited as crashed and drop their hooks.
    pub fn reap_crashed(&self) {
        let mut supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        for supervisor in supervisors.iter_mut() {
            if supervisor.state != PluginState::Ready {
                continue;
            }
            let exited = supervisor
                .child
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten());
            if let Some(status) = exited {
                error!(plugin = %supervisor.entry.name, status = %status,
                    "Plugin exited unexpectedly");
                supervisor.state = PluginState::Crashed;
                supervisor.rpc = None;
                self.registry.unregister_plugin(&supervisor.entry.name);
            }
        }
    }

    /// Notify plugins and terminate children: SIGTERM, grace, SIGKILL.
    pub fn shutdown(&self) {
        let grace = Duration::from_secs(self.manifest.shutdown_grace_secs);
        let mut supervisors = self.supervisors.lock().unwrap_or_else(|e| e.into_inner());
        for supervisor in supervisors.iter_mut() {
            if matches!(supervisor.state, PluginState::Stopped | PluginState::Crashed) {
                continue;
            }
            supervisor.state = PluginState::Stopping;

            if let Some(rpc) = &supervisor.rpc {
                if let Err(err) = rpc.call(EventKind::OnShutdown, &Payload::new()) {
                    debug!(plugin = %supervisor.entry.name, error = %err,
                        "OnShutdown notification failed");
                }
            }

            self.terminate(supervisor, grace);
            supervisor.state = PluginState::Stopped;
            info!(plugin = %supervisor.entry.name, "Plugin stopped");
        }
    }

    fn terminate(&self, supervisor: &mut PluginSupervisor, grace: Duration) {
        let pid = supervisor.pid();
        let Some(child) = supervisor.child.as_mut() else { return };

        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(None) => {
                    warn!(plugin = %supervisor.entry.name, "Grace expired, sending SIGKILL");
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                Err(err) => {
                    warn!(plugin = %supervisor.entry.name, error = %err, "Wait failed");
                    break;
                }
            }
        }
        supervisor.child = None;
    }

    /// Snapshot of (name, state) pairs.
    pub fn states(&self) -> Vec<(String, PluginState)> {
        self.supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|supervisor| (supervisor.entry.name.clone(), supervisor.state))
            .collect()
    }
}

fn spawn_stdout_forwarder(
    plugin: String,
    stdout: std::process::ChildStdout,
    handshake_tx: crossbeam_channel::Sender<String>,
) {
    std::thread::Builder::new()
        .name(format!("plugin-stdout-{plugin}"))
        .spawn(move || {
            let reader = BufReader::new(stdout);
            let mut first = true;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if first {
                    first = false;
                    let _ = handshake_tx.send(line);
                } else {
                    info!(plugin = %plugin, "{line}");
                }
            }
        })
        .expect("failed to spawn plugin stdout forwarder");
}

fn spawn_stderr_forwarder(plugin: String, stderr: std::process::ChildStderr) {
    std::thread::Builder::new()
        .name(format!("plugin-stderr-{plugin}"))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                warn!(plugin = %plugin, "{line}");
            }
        })
        .expect("failed to spawn plugin stderr forwarder");
}

/// Hex SHA-256 of a file's contents.
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        std::fs::write(&path, b"abc").unwrap();
        // SHA-256("abc")
        assert_eq!(
            checksum_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_missing_file_errors() {
        assert!(checksum_file(Path::new("/nonexistent/plugin")).is_err());
    }

    #[test]
    fn plugin_info_parses_from_payload_shape() {
        let raw = serde_json::json!({
            "version": "1.2.3",
            "requiresApiVersion": "0.1.0",
            "hooks": [
                {"event": "OnIncomingTraffic", "priority": 10, "signature": "aa"},
                {"event": "OnTick", "priority": -1}
            ],
            "metricsSocket": "/tmp/p.sock"
        });
        let info: PluginInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.hooks.len(), 2);
        assert_eq!(info.hooks[1].priority, -1);
        assert_eq!(info.hooks[1].signature, "");
        assert_eq!(info.metrics_socket.as_deref(), Some(Path::new("/tmp/p.sock")));
    }
}
