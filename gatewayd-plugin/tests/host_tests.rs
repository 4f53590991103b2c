//! Plugin host lifecycle against a real child process. The "plugin" is a
//! shell script that prints the handshake line; its RPC side is served by
//! an in-test listener thread speaking the framed protocol.

use gatewayd_core::GatewayError;
use gatewayd_plugin::event::{EventKind, Payload};
use gatewayd_plugin::host::{PLUGIN_API_VERSION, PluginManager, PluginState, checksum_file};
use gatewayd_plugin::manifest::{PluginEntry, PluginManifest};
use gatewayd_plugin::registry::{
    CompatibilityPolicy, HookRegistry, VerificationPolicy, hook_signature,
};
use gatewayd_plugin::rpc::{GET_PLUGIN_CONFIG, HookRequest, HookResponse, read_frame, write_frame};
use serde_json::json;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── Helpers ──────────────────────────────────────────────────

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn manifest_with(entry: PluginEntry) -> PluginManifest {
    PluginManifest {
        compatibility_policy: CompatibilityPolicy::Strict,
        verification_policy: VerificationPolicy::Abort,
        hook_timeout_secs: 2,
        start_timeout_secs: 3,
        shutdown_grace_secs: 1,
        plugins: vec![entry],
        ..PluginManifest::default()
    }
}

fn registry() -> Arc<HookRegistry> {
    Arc::new(HookRegistry::new(CompatibilityPolicy::Strict, VerificationPolicy::Abort))
}

/// Serve the plugin's RPC side: answer `GetPluginConfig` with the given
/// manifest payload, then answer every hook call by echoing the payload
/// plus a marker.
fn spawn_plugin_rpc(listener: TcpListener, plugin_info: serde_json::Value) {
    std::thread::spawn(move || {
        while let Ok((mut stream, _)) = listener.accept() {
            let plugin_info = plugin_info.clone();
            std::thread::spawn(move || {
                loop {
                    let request: HookRequest = match read_frame(&mut stream) {
                        Ok(request) => request,
                        Err(_) => break,
                    };
                    let payload = if request.event == GET_PLUGIN_CONFIG {
                        match &plugin_info {
                            serde_json::Value::Object(map) => map.clone(),
                            _ => Payload::new(),
                        }
                    } else {
                        let mut payload = request
                            .payload
                            .as_ref()
                            .map(gatewayd_plugin::rpc::struct_to_payload)
                            .unwrap_or_default();
                        payload.insert("handledBy".to_string(), json!(request.event));
                        payload
                    };
                    let response = HookResponse {
                        payload: Some(gatewayd_plugin::rpc::payload_to_struct(&payload)),
                        error: String::new(),
                    };
                    if write_frame(&mut stream, &response).is_err() {
                        break;
                    }
                }
            });
        }
    });
}

// ── Full lifecycle ───────────────────────────────────────────

#[test]
fn plugin_lifecycle_end_to_end() {
    let dir = tempfile::tempdir().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let script = write_script(
        dir.path(),
        "plugin.sh",
        &format!("#!/bin/sh\necho \"1|tcp|127.0.0.1:{port}|false\"\nsleep 30\n"),
    );
    let checksum = checksum_file(&script).unwrap();

    spawn_plugin_rpc(
        listener,
        json!({
            "version": "1.0.0",
            "requiresApiVersion": PLUGIN_API_VERSION,
            "hooks": [{
                "event": "OnTick",
                "priority": 5,
                "signature": hook_signature(&checksum, EventKind::OnTick, 5),
            }],
        }),
    );

    let registry = registry();
    let manager = PluginManager::new(
        manifest_with(PluginEntry {
            name: "test-plugin".to_string(),
            enabled: true,
            local_path: script,
            args: vec![],
            env: vec!["PLUGIN_MODE=test".to_string()],
            checksum,
        }),
        Arc::clone(&registry),
        None,
    );

    manager.load_plugins().unwrap();
    assert_eq!(manager.states(), vec![("test-plugin".to_string(), PluginState::Ready)]);
    assert_eq!(registry.hook_count(), 1);

    // dispatch goes through the child's RPC endpoint; the declared
    // signature is valid, so even Abort-level verification passes
    let mut payload = Payload::new();
    payload.insert("n".to_string(), json!(1.0));
    let out = registry
        .run(EventKind::OnTick, payload, VerificationPolicy::Abort)
        .unwrap();
    assert_eq!(out["handledBy"], "OnTick");
    assert_eq!(out["n"], 1.0);

    manager.shutdown();
    assert_eq!(manager.states(), vec![("test-plugin".to_string(), PluginState::Stopped)]);
}

// ── Launch failures are contained ────────────────────────────

#[test]
fn silent_plugin_is_marked_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "mute.sh", "#!/bin/sh\nsleep 30\n");
    let checksum = checksum_file(&script).unwrap();

    let mut manifest = manifest_with(PluginEntry {
        name: "mute".to_string(),
        enabled: true,
        local_path: script,
        args: vec![],
        env: vec![],
        checksum,
    });
    manifest.start_timeout_secs = 1;
    manifest.compatibility_policy = CompatibilityPolicy::Loose;

    let manager = PluginManager::new(manifest, registry(), None);
    manager.load_plugins().unwrap();
    assert_eq!(manager.states(), vec![("mute".to_string(), PluginState::Crashed)]);

    manager.shutdown();
}

#[test]
fn disabled_plugins_are_not_launched() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "off.sh", "#!/bin/sh\nsleep 30\n");

    let mut manifest = manifest_with(PluginEntry {
        name: "off".to_string(),
        enabled: false,
        local_path: script,
        args: vec![],
        env: vec![],
        checksum: String::new(),
    });
    manifest.compatibility_policy = CompatibilityPolicy::Loose;

    let manager = PluginManager::new(manifest, registry(), None);
    manager.load_plugins().unwrap();
    assert!(manager.states().is_empty());
}

// ── Checksum gate ────────────────────────────────────────────

#[test]
fn strict_checksum_mismatch_prevents_startup() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "tampered.sh", "#!/bin/sh\nsleep 30\n");

    let manifest = manifest_with(PluginEntry {
        name: "tampered".to_string(),
        enabled: true,
        local_path: script,
        args: vec![],
        env: vec![],
        checksum: "deadbeef".to_string(),
    });

    let manager = PluginManager::new(manifest, registry(), None);
    let err = manager.load_plugins().unwrap_err();
    assert!(matches!(err, GatewayError::PluginVerificationFailed(_, _)));
}

#[test]
fn loose_checksum_mismatch_continues() {
    let dir = tempfile::tempdir().unwrap();
    // handshake never comes, so the plugin ends up crashed, but startup
    // itself is not prevented
    let script = write_script(dir.path(), "tampered.sh", "#!/bin/sh\nsleep 30\n");

    let mut manifest = manifest_with(PluginEntry {
        name: "tampered".to_string(),
        enabled: true,
        local_path: script,
        args: vec![],
        env: vec![],
        checksum: "deadbeef".to_string(),
    });
    manifest.compatibility_policy = CompatibilityPolicy::Loose;
    manifest.start_timeout_secs = 1;

    let manager = PluginManager::new(manifest, registry(), None);
    manager.load_plugins().unwrap();
    assert_eq!(manager.states(), vec![("tampered".to_string(), PluginState::Crashed)]);

    manager.shutdown();
}

// ── Compatibility gate ───────────────────────────────────────

#[test]
fn strict_api_version_mismatch_prevents_startup() {
    let dir = tempfile::tempdir().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let script = write_script(
        dir.path(),
        "old.sh",
        &format!("#!/bin/sh\necho \"1|tcp|127.0.0.1:{port}|false\"\nsleep 30\n"),
    );
    let checksum = checksum_file(&script).unwrap();

    spawn_plugin_rpc(
        listener,
        json!({
            "version": "0.0.1",
            "requiresApiVersion": "99.0.0",
            "hooks": [],
        }),
    );

    let manager = PluginManager::new(
        manifest_with(PluginEntry {
            name: "old".to_string(),
            enabled: true,
            local_path: script,
            args: vec![],
            env: vec![],
            checksum,
        }),
        registry(),
        None,
    );
    let err = manager.load_plugins().unwrap_err();
    assert!(matches!(err, GatewayError::PluginVerificationFailed(_, _)));
}
