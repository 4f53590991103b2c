use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Metrics collector for the gateway itself.
///
/// Plugin metrics are not collected here; they arrive through the
/// [`crate::merger::MetricsMerger`] side-channel and are appended to this
/// registry's exposition by the metrics endpoint.
pub struct MetricsCollector {
    registry: Registry,

    /// Frontend connections currently open
    pub active_connections: IntGauge,

    /// Frontend connections accepted since start
    pub connections_total: IntCounter,

    /// Frontend connections refused at the hard limit
    pub connections_refused_total: IntCounter,

    /// Completed request/response relay cycles
    pub traffic_relayed_total: IntCounter,

    /// Bytes moved, labeled by direction (ingress = frontend→upstream)
    pub traffic_bytes_total: IntCounterVec,

    /// Relay errors by error kind
    pub relay_errors_total: IntCounterVec,

    /// Hook dispatches by event kind
    pub hook_runs_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let active_connections = IntGauge::with_opts(
            Opts::new("active_connections", "Frontend connections currently open")
                .namespace("gatewayd"),
        )?;

        let connections_total = IntCounter::with_opts(
            Opts::new("connections_total", "Frontend connections accepted")
                .namespace("gatewayd"),
        )?;

        let connections_refused_total = IntCounter::with_opts(
            Opts::new("connections_refused_total", "Connections refused at the hard limit")
                .namespace("gatewayd"),
        )?;

        let traffic_relayed_total = IntCounter::with_opts(
            Opts::new("traffic_relayed_total", "Completed relay cycles").namespace("gatewayd"),
        )?;

        let traffic_bytes_total = IntCounterVec::new(
            Opts::new("traffic_bytes_total", "Bytes relayed by direction").namespace("gatewayd"),
            &["direction"],
        )?;

        let relay_errors_total = IntCounterVec::new(
            Opts::new("relay_errors_total", "Relay errors by kind").namespace("gatewayd"),
            &["kind"],
        )?;

        let hook_runs_total = IntCounterVec::new(
            Opts::new("hook_runs_total", "Hook dispatches by event").namespace("gatewayd"),
            &["event"],
        )?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_refused_total.clone()))?;
        registry.register(Box::new(traffic_relayed_total.clone()))?;
        registry.register(Box::new(traffic_bytes_total.clone()))?;
        registry.register(Box::new(relay_errors_total.clone()))?;
        registry.register(Box::new(hook_runs_total.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            connections_total,
            connections_refused_total,
            traffic_relayed_total,
            traffic_bytes_total,
            relay_errors_total,
            hook_runs_total,
        })
    }

    /// The gateway's own metrics in Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&families, &mut buf) {
            tracing::error!(error = %err, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let collector = MetricsCollector::new().unwrap();
        collector.connections_total.inc();
        collector.active_connections.set(3);
        collector.traffic_bytes_total.with_label_values(&["ingress"]).inc_by(128);
        collector.relay_errors_total.with_label_values(&["UpstreamClosed"]).inc();

        let text = collector.gather_text();
        assert!(text.contains("gatewayd_connections_total 1"));
        assert!(text.contains("gatewayd_active_connections 3"));
        assert!(text.contains(r#"gatewayd_traffic_bytes_total{direction="ingress"} 128"#));
        assert!(text.contains(r#"gatewayd_relay_errors_total{kind="UpstreamClosed"} 1"#));
    }

    #[test]
    fn fresh_collector_encodes_cleanly() {
        let collector = MetricsCollector::new().unwrap();
        // untouched vectors have no samples; encoding must not fail
        let text = collector.gather_text();
        assert!(text.contains("gatewayd_active_connections"));
    }
}
