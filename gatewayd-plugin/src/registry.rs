use crate::event::{EventKind, Payload};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use gatewayd_core::GatewayError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// How the registry treats a hook whose signature does not match the
/// digest recomputed from its plugin's checksum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    /// Invoke the hook anyway
    #[default]
    PassDown,
    /// Skip the hook for this dispatch
    Ignore,
    /// Unregister the hook and continue
    Remove,
    /// Fail the whole dispatch
    Abort,
}

/// How the plugin host treats an API-version mismatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityPolicy {
    /// Reject any plugin whose declared API version differs from the host's
    Strict,
    /// Accept any plugin
    #[default]
    Loose,
}

/// A hook callable. Out-of-process plugins implement this through their RPC
/// client; tests register plain closures.
pub trait HookCallable: Send + Sync {
    fn call(&self, event: EventKind, payload: &Payload) -> Result<Payload, GatewayError>;
}

impl<F> HookCallable for F
where
    F: Fn(EventKind, &Payload) -> Result<Payload, GatewayError> + Send + Sync,
{
    fn call(&self, event: EventKind, payload: &Payload) -> Result<Payload, GatewayError> {
        self(event, payload)
    }
}

/// A registered hook.
#[derive(Clone)]
pub struct Hook {
    pub plugin: String,
    pub priority: i32,
    pub signature: String,
    pub callable: Arc<dyn HookCallable>,
}

type HookTable = HashMap<EventKind, BTreeMap<i32, Hook>>;

/// The signature a well-behaved plugin declares for one of its hooks:
/// hex SHA-256 over `"<plugin_checksum>:<event>:<priority>"`.
pub fn hook_signature(checksum: &str, event: EventKind, priority: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(checksum.as_bytes());
    hasher.update(b":");
    hasher.update(event.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(priority.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Ordered, verified dispatch of events to plugin hooks.
///
/// The hook table is copy-on-write: writers clone and swap under a mutex,
/// dispatch loads an immutable snapshot and holds no lock across hook RPCs.
pub struct HookRegistry {
    hooks: ArcSwap<HookTable>,
    write_lock: Mutex<()>,

    /// Executable checksum per plugin, the anchor for signature checks.
    checksums: DashMap<String, String>,

    pub compatibility: CompatibilityPolicy,
    pub verification: VerificationPolicy,
}

impl HookRegistry {
    pub fn new(compatibility: CompatibilityPolicy, verification: VerificationPolicy) -> Self {
        Self {
            hooks: ArcSwap::from_pointee(HookTable::new()),
            write_lock: Mutex::new(()),
            checksums: DashMap::new(),
            compatibility,
            verification,
        }
    }

    /// Record a plugin's executable checksum. Hooks of plugins without a
    /// recorded checksum are dispatched unverified.
    pub fn set_plugin_checksum(&self, plugin: &str, checksum: &str) {
        self.checksums.insert(plugin.to_string(), checksum.to_string());
    }

    /// Register a hook. Fails when the (event, priority) slot is taken.
    pub fn register(
        &self,
        event: EventKind,
        priority: i32,
        plugin: &str,
        signature: &str,
        callable: Arc<dyn HookCallable>,
    ) -> Result<(), GatewayError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.hooks.load_full();
        if current.get(&event).is_some_and(|chain| chain.contains_key(&priority)) {
            return Err(GatewayError::HookPriorityCollision {
                event: event.as_str().to_string(),
                priority,
            });
        }

        let mut next = (*current).clone();
        next.entry(event).or_default().insert(
            priority,
            Hook {
                plugin: plugin.to_string(),
                priority,
                signature: signature.to_string(),
                callable,
            },
        );
        self.hooks.store(Arc::new(next));

        debug!(plugin = plugin, event = %event, priority = priority, "Registered hook");
        Ok(())
    }

    /// Remove a single hook slot.
    pub fn unregister(&self, event: EventKind, priority: i32) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.hooks.load_full()).clone();
        if let Some(chain) = next.get_mut(&event) {
            chain.remove(&priority);
            if chain.is_empty() {
                next.remove(&event);
            }
        }
        self.hooks.store(Arc::new(next));
    }

    /// Remove every hook a plugin registered (crash cleanup).
    pub fn unregister_plugin(&self, plugin: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (*self.hooks.load_full()).clone();
        for chain in next.values_mut() {
            chain.retain(|_, hook| hook.plugin != plugin);
        }
        next.retain(|_, chain| !chain.is_empty());
        self.hooks.store(Arc::new(next));
        self.checksums.remove(plugin);
        warn!(plugin = plugin, "Unregistered all hooks for plugin");
    }

    /// The chain registered on an event, ascending by priority.
    pub fn chain(&self, event: EventKind) -> Vec<Hook> {
        self.hooks
            .load()
            .get(&event)
            .map(|chain| chain.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.load().values().map(|chain| chain.len()).sum()
    }

    /// Run the chain registered on `event` as a left-fold over `payload`.
    ///
    /// Each hook sees the output of its predecessor; the returned delta is
    /// unioned in with delta keys overwriting. Verification failures and
    /// hook errors follow `policy`; only `Abort` fails the dispatch.
    pub fn run(
        &self,
        event: EventKind,
        payload: Payload,
        policy: VerificationPolicy,
    ) -> Result<Payload, GatewayError> {
        let chain = self.chain(event);
        if chain.is_empty() {
            return Ok(payload);
        }

        let mut current = payload;
        for hook in chain {
            if !self.verify(&hook, event) {
                match policy {
                    VerificationPolicy::Abort => {
                        return Err(GatewayError::PluginVerificationFailed(
                            hook.plugin.clone(),
                            format!("signature mismatch on {event}"),
                        ));
                    }
                    VerificationPolicy::Remove => {
                        warn!(plugin = %hook.plugin, event = %event, priority = hook.priority,
                            "Hook signature mismatch, removing hook");
                        self.unregister(event, hook.priority);
                        continue;
                    }
                    VerificationPolicy::Ignore => {
                        warn!(plugin = %hook.plugin, event = %event, priority = hook.priority,
                            "Hook signature mismatch, skipping hook");
                        continue;
                    }
                    VerificationPolicy::PassDown => {
                        debug!(plugin = %hook.plugin, event = %event,
                            "Hook signature mismatch, passing down");
                    }
                }
            }

            let result = catch_unwind(AssertUnwindSafe(|| hook.callable.call(event, &current)));
            match result {
                Ok(Ok(delta)) => {
                    for (key, value) in delta {
                        current.insert(key, value);
                    }
                }
                Ok(Err(err)) => {
                    error!(plugin = %hook.plugin, event = %event, error = %err,
                        "Hook invocation failed");
                    match policy {
                        VerificationPolicy::Abort => return Err(err),
                        VerificationPolicy::Remove => self.unregister(event, hook.priority),
                        _ => {}
                    }
                }
                Err(_) => {
                    error!(plugin = %hook.plugin, event = %event, "Hook panicked");
                    if policy == VerificationPolicy::Abort {
                        return Err(GatewayError::PluginCrashed(hook.plugin.clone()));
                    }
                }
            }
        }

        Ok(current)
    }

    fn verify(&self, hook: &Hook, event: EventKind) -> bool {
        match self.checksums.get(&hook.plugin) {
            Some(checksum) => {
                hook.signature == hook_signature(checksum.value(), event, hook.priority)
            }
            // No checksum on record (host-internal hooks): nothing to check.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn noop_registry() -> HookRegistry {
        HookRegistry::new(CompatibilityPolicy::Loose, VerificationPolicy::PassDown)
    }

    #[test]
    fn empty_chain_returns_payload_unchanged() {
        let registry = noop_registry();
        let input = payload(&[("key", json!("value"))]);
        let out = registry
            .run(EventKind::OnTick, input.clone(), VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn single_hook_sees_and_extends_payload() {
        let registry = noop_registry();
        registry
            .register(
                EventKind::OnNewPool,
                0,
                "test",
                "",
                Arc::new(|_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                    assert_eq!(p["size"], 4);
                    Ok(payload(&[("seen", json!(true))]))
                }),
            )
            .unwrap();

        let out = registry
            .run(EventKind::OnNewPool, payload(&[("size", json!(4))]), VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(out["size"], 4);
        assert_eq!(out["seen"], true);
    }

    #[test]
    fn chain_is_a_left_fold_in_priority_order() {
        let registry = noop_registry();
        // Registered out of order on purpose; must run 1 then 5 then 10.
        registry
            .register(EventKind::OnTraffic, 10, "p", "", Arc::new(
                |_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                    let trail = format!("{}-ten", p["trail"].as_str().unwrap());
                    Ok(payload(&[("trail", json!(trail))]))
                },
            ))
            .unwrap();
        registry
            .register(EventKind::OnTraffic, 1, "p", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Ok(payload(&[("trail", json!("one"))]))
                },
            ))
            .unwrap();
        registry
            .register(EventKind::OnTraffic, 5, "p", "", Arc::new(
                |_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                    let trail = format!("{}-five", p["trail"].as_str().unwrap());
                    Ok(payload(&[("trail", json!(trail))]))
                },
            ))
            .unwrap();

        let out = registry
            .run(
                EventKind::OnTraffic,
                payload(&[("trail", json!("start"))]),
                VerificationPolicy::PassDown,
            )
            .unwrap();
        assert_eq!(out["trail"], "one-five-ten");
    }

    #[test]
    fn chain_is_deterministic() {
        let registry = noop_registry();
        registry
            .register(EventKind::OnSignal, 3, "p", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Ok(payload(&[("a", json!(1))]))
                },
            ))
            .unwrap();
        registry
            .register(EventKind::OnSignal, 7, "p", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Ok(payload(&[("b", json!(2))]))
                },
            ))
            .unwrap();

        let input = payload(&[("signal", json!("SIGTERM"))]);
        let first = registry
            .run(EventKind::OnSignal, input.clone(), VerificationPolicy::PassDown)
            .unwrap();
        let second = registry
            .run(EventKind::OnSignal, input, VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn priority_collision_is_rejected() {
        let registry = noop_registry();
        let ok: Arc<dyn HookCallable> =
            Arc::new(|_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                Ok(p.clone())
            });
        registry
            .register(EventKind::OnTraffic, 10, "first", "", Arc::clone(&ok))
            .unwrap();
        let err = registry
            .register(EventKind::OnTraffic, 10, "second", "", ok)
            .unwrap_err();
        assert!(matches!(err, GatewayError::HookPriorityCollision { priority: 10, .. }));
        // same priority on a different event is fine
        assert_eq!(registry.hook_count(), 1);
    }

    #[test]
    fn failing_hook_preserves_payload_and_continues() {
        let registry = noop_registry();
        registry
            .register(EventKind::OnTick, 1, "bad", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Err(GatewayError::PluginTimeout("bad".into()))
                },
            ))
            .unwrap();
        registry
            .register(EventKind::OnTick, 2, "good", "", Arc::new(
                |_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                    // must still see the original payload, not a poisoned one
                    assert_eq!(p["n"], 1);
                    Ok(payload(&[("ok", json!(true))]))
                },
            ))
            .unwrap();

        let out = registry
            .run(EventKind::OnTick, payload(&[("n", json!(1))]), VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(out["ok"], true);
    }

    #[test]
    fn failing_hook_aborts_under_abort_policy() {
        let registry = noop_registry();
        registry
            .register(EventKind::OnTick, 1, "bad", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Err(GatewayError::PluginTimeout("bad".into()))
                },
            ))
            .unwrap();
        let err = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::Abort)
            .unwrap_err();
        assert!(matches!(err, GatewayError::PluginTimeout(_)));
    }

    #[test]
    fn panicking_hook_is_caught() {
        let registry = noop_registry();
        registry
            .register(EventKind::OnTick, 1, "explosive", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    panic!("boom")
                },
            ))
            .unwrap();
        registry
            .register(EventKind::OnTick, 2, "calm", "", Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Ok(payload(&[("after", json!(true))]))
                },
            ))
            .unwrap();

        let out = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(out["after"], true);
    }

    #[test]
    fn signature_mismatch_policies() {
        let checksum = "abc123";
        let register_bad_hook = |registry: &HookRegistry| {
            registry.set_plugin_checksum("p", checksum);
            registry
                .register(EventKind::OnTick, 1, "p", "tampered", Arc::new(
                    |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                        Ok(payload(&[("ran", json!(true))]))
                    },
                ))
                .unwrap();
        };

        // Ignore: hook skipped, dispatch succeeds
        let registry = noop_registry();
        register_bad_hook(&registry);
        let out = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::Ignore)
            .unwrap();
        assert!(!out.contains_key("ran"));
        assert_eq!(registry.hook_count(), 1);

        // Remove: hook skipped and unregistered
        let registry = noop_registry();
        register_bad_hook(&registry);
        registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::Remove)
            .unwrap();
        assert_eq!(registry.hook_count(), 0);

        // Abort: dispatch fails
        let registry = noop_registry();
        register_bad_hook(&registry);
        let err = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::Abort)
            .unwrap_err();
        assert!(matches!(err, GatewayError::PluginVerificationFailed(_, _)));

        // PassDown: invoked anyway
        let registry = noop_registry();
        register_bad_hook(&registry);
        let out = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::PassDown)
            .unwrap();
        assert_eq!(out["ran"], true);
    }

    #[test]
    fn valid_signature_passes_strict_policies() {
        let registry = noop_registry();
        registry.set_plugin_checksum("p", "abc123");
        let signature = hook_signature("abc123", EventKind::OnTick, 1);
        registry
            .register(EventKind::OnTick, 1, "p", &signature, Arc::new(
                |_: EventKind, _: &Payload| -> Result<Payload, GatewayError> {
                    Ok(payload(&[("ran", json!(true))]))
                },
            ))
            .unwrap();
        let out = registry
            .run(EventKind::OnTick, Payload::new(), VerificationPolicy::Abort)
            .unwrap();
        assert_eq!(out["ran"], true);
    }

    #[test]
    fn unregister_plugin_removes_all_its_hooks() {
        let registry = noop_registry();
        let ok: Arc<dyn HookCallable> =
            Arc::new(|_: EventKind, p: &Payload| -> Result<Payload, GatewayError> {
                Ok(p.clone())
            });
        registry.register(EventKind::OnTick, 1, "a", "", Arc::clone(&ok)).unwrap();
        registry.register(EventKind::OnTraffic, 1, "a", "", Arc::clone(&ok)).unwrap();
        registry.register(EventKind::OnTick, 2, "b", "", ok).unwrap();

        registry.unregister_plugin("a");
        assert_eq!(registry.hook_count(), 1);
        assert_eq!(registry.chain(EventKind::OnTick).len(), 1);
        assert!(registry.chain(EventKind::OnTraffic).is_empty());
    }

    #[test]
    fn hook_signature_is_stable_and_distinct() {
        let a = hook_signature("sum", EventKind::OnTraffic, 10);
        let b = hook_signature("sum", EventKind::OnTraffic, 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hook_signature("sum", EventKind::OnTraffic, 11));
        assert_ne!(a, hook_signature("sum", EventKind::OnTick, 10));
        assert_ne!(a, hook_signature("other", EventKind::OnTraffic, 10));
    }
}
