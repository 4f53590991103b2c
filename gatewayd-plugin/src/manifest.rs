use crate::registry::{CompatibilityPolicy, VerificationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The plugin manifest file (`gatewayd_plugins.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// How API-version mismatches are treated
    #[serde(default)]
    pub compatibility_policy: CompatibilityPolicy,

    /// How hook signature mismatches are treated
    #[serde(default)]
    pub verification_policy: VerificationPolicy,

    /// Per-event RPC timeout (seconds)
    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,

    /// How long to wait for a plugin's handshake line (seconds)
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// SIGTERM-to-SIGKILL grace interval at shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Metrics merger scrape interval (seconds)
    #[serde(default = "default_merger_period")]
    pub metrics_merger_period_secs: u64,

    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

/// One declared plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the plugin executable
    pub local_path: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment, `KEY=VALUE` entries
    #[serde(default)]
    pub env: Vec<String>,

    /// Expected hex SHA-256 of the executable
    #[serde(default)]
    pub checksum: String,
}

impl PluginManifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let manifest: Self = serde_yaml::from_str(&text)?;
        Ok(manifest)
    }

    /// Plugins that are enabled, in declaration order.
    pub fn enabled_plugins(&self) -> impl Iterator<Item = &PluginEntry> {
        self.plugins.iter().filter(|entry| entry.enabled)
    }
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            compatibility_policy: CompatibilityPolicy::default(),
            verification_policy: VerificationPolicy::default(),
            hook_timeout_secs: default_hook_timeout(),
            start_timeout_secs: default_start_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            metrics_merger_period_secs: default_merger_period(),
            plugins: Vec::new(),
        }
    }
}

impl PluginEntry {
    /// `env` entries parsed into pairs; malformed entries are dropped.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn default_hook_timeout() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_merger_period() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_with_defaults() {
        let yaml = r#"
compatibilityPolicy: strict
verificationPolicy: abort
plugins:
  - name: gatewayd-plugin-test
    localPath: ./plugins/test
    args: ["--log-level", "debug"]
    env:
      - MAGIC=1
      - MODE=fast
    checksum: deadbeef
  - name: disabled-one
    enabled: false
    localPath: ./plugins/disabled
"#;
        let manifest: PluginManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.compatibility_policy, CompatibilityPolicy::Strict);
        assert_eq!(manifest.verification_policy, VerificationPolicy::Abort);
        assert_eq!(manifest.hook_timeout_secs, 10);
        assert_eq!(manifest.plugins.len(), 2);

        let enabled: Vec<_> = manifest.enabled_plugins().collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "gatewayd-plugin-test");
        assert_eq!(
            enabled[0].env_pairs(),
            vec![("MAGIC".to_string(), "1".to_string()), ("MODE".to_string(), "fast".to_string())]
        );
    }

    #[test]
    fn empty_manifest_uses_loose_passdown() {
        let manifest: PluginManifest = serde_yaml::from_str("{}").unwrap();
        assert_eq!(manifest.compatibility_policy, CompatibilityPolicy::Loose);
        assert_eq!(manifest.verification_policy, VerificationPolicy::PassDown);
        assert!(manifest.plugins.is_empty());
    }

    #[test]
    fn policy_names_are_lowercase() {
        let manifest: PluginManifest =
            serde_yaml::from_str("verificationPolicy: remove").unwrap();
        assert_eq!(manifest.verification_policy, VerificationPolicy::Remove);
        assert!(serde_yaml::from_str::<PluginManifest>("verificationPolicy: Remove").is_err());
    }

    #[test]
    fn malformed_env_entries_are_dropped() {
        let entry = PluginEntry {
            name: "p".into(),
            enabled: true,
            local_path: "/bin/true".into(),
            args: vec![],
            env: vec!["GOOD=1".into(), "NO_EQUALS_SIGN".into()],
            checksum: String::new(),
        };
        assert_eq!(entry.env_pairs(), vec![("GOOD".to_string(), "1".to_string())]);
    }
}
