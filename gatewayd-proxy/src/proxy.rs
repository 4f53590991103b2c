use crate::client::Client;
use crate::pool::Pool;
use gatewayd_core::GatewayError;
use gatewayd_core::config::{ClientConfig, ProxyConfig};
use gatewayd_observability::MetricsCollector;
use gatewayd_plugin::event::{EventKind, TrafficPayload};
use gatewayd_plugin::registry::HookRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handle for one frontend connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-instance relay engine: assigns pooled upstream clients to frontend
/// connections and shuttles request/response traffic through the hook
/// chains.
///
/// The two pools are the only shared mutable state on the hot path; every
/// access goes through [`Pool`]'s atomic operations, so the relay runs
/// without extra locking on any reactor.
pub struct Proxy {
    available: Pool<String, Arc<Client>>,
    busy: Pool<ConnId, Arc<Client>>,
    registry: Arc<HookRegistry>,
    metrics: Arc<MetricsCollector>,

    pub elastic: bool,
    pub reuse_elastic_clients: bool,
    health_check_period: Duration,

    /// Used for elastic growth and reconnection.
    client_config: ClientConfig,
}

impl Proxy {
    pub fn new(
        available: Pool<String, Arc<Client>>,
        registry: Arc<HookRegistry>,
        config: &ProxyConfig,
        client_config: ClientConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            available,
            busy: Pool::new(crate::pool::EMPTY_POOL_CAPACITY),
            registry,
            metrics,
            elastic: config.elastic,
            reuse_elastic_clients: config.reuse_elastic_clients,
            health_check_period: Duration::from_secs(config.health_check_period_secs),
            client_config,
        }
    }

    /// Assign an upstream client to a frontend connection.
    pub fn connect(&self, conn: ConnId) -> Result<(), GatewayError> {
        let ids = self.available.keys();

        let client = if ids.is_empty() {
            if !self.elastic {
                return Err(GatewayError::PoolExhausted);
            }
            match Client::connect(&self.client_config) {
                Ok(client) => {
                    debug!(%conn, id = %client.id(), "Elastic client created");
                    Arc::new(client)
                }
                Err(err) => {
                    error!(%conn, error = %err, "Elastic dial failed");
                    return Err(GatewayError::ClientNotConnected);
                }
            }
        } else {
            // Bounded by the snapshot: every dead candidate is closed and
            // dropped, and the scan never revisits a key.
            let mut found = None;
            for id in ids {
                let Some(candidate) = self.available.pop(&id) else { continue };
                if self.is_healthy(&candidate) {
                    found = Some(candidate);
                    break;
                }
                warn!(id = %id, "Pooled client failed health check, closing");
                candidate.close();
            }
            found.ok_or(GatewayError::PoolExhausted)?
        };

        if client.id().is_empty() {
            return Err(GatewayError::ClientNotConnected);
        }

        let id = client.id();
        self.busy.put(conn, client)?;
        debug!(%conn, id = %id, "Client assigned");
        debug!(available = self.available.size(), busy = self.busy.size(), "[C] Pool state");
        Ok(())
    }

    /// Release the upstream client assigned to a frontend connection.
    ///
    /// Non-elastic proxies always recycle the client through a reconnect;
    /// elastic proxies recycle only when `reuse_elastic_clients` is set and
    /// close the client otherwise.
    pub fn disconnect(&self, conn: ConnId) {
        let Some(client) = self.busy.pop(&conn) else {
            warn!(%conn, "Disconnect without an assigned client");
            return;
        };

        if !self.elastic || self.reuse_elastic_clients {
            let client = self.reconnect(client);
            if !client.id().is_empty() {
                let id = client.id();
                if let Err(err) = self.available.put(id.clone(), client) {
                    warn!(id = %id, error = %err, "Could not return client to the pool");
                }
            }
        } else {
            client.close();
        }

        debug!(available = self.available.size(), busy = self.busy.size(), "[D] Pool state");
    }

    /// Relay one request/response cycle for a frontend connection.
    ///
    /// The incoming chain may rewrite the request or terminate the relay;
    /// the outgoing chain may rewrite the reply. The returned bytes are
    /// what the server writes back to the frontend.
    pub fn pass_through(&self, conn: ConnId, request: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let client = self.busy.get(&conn).ok_or(GatewayError::ClientNotFound)?;

        self.metrics
            .traffic_bytes_total
            .with_label_values(&["ingress"])
            .inc_by(request.len() as u64);

        // Incoming chain
        let incoming = self.run_traffic_chain(
            EventKind::OnIncomingTraffic,
            TrafficPayload::incoming(request),
        );
        if incoming.terminate {
            info!(%conn, "Relay terminated by hook");
            return Ok(incoming.response_bytes().unwrap_or_default());
        }
        let outbound = incoming
            .request_bytes()
            .unwrap_or_else(|| request.to_vec());

        // Upstream send
        if let Err(err) = client.send(&outbound) {
            error!(%conn, error = %err, "Upstream send failed, reconnecting");
            let fresh = self.reconnect(client);
            let _ = self.busy.put(conn, fresh);
            return Err(GatewayError::UpstreamSendFailed(err.to_string()));
        }
        debug!(%conn, bytes = outbound.len(), "Request sent upstream");

        // Upstream receive
        let (response, receive_error) = match client.receive() {
            Ok(bytes) => (bytes, None),
            Err(err) => (Vec::new(), Some(err)),
        };

        // Outgoing chain sees the reply even when the receive failed, so
        // observers get a shot at logging the failure.
        let outgoing = self.run_traffic_chain(
            EventKind::OnOutgoingTraffic,
            TrafficPayload::outgoing(
                &outbound,
                &response,
                receive_error.as_ref().map(|err| err.to_string()),
            ),
        );

        if let Some(err) = receive_error {
            if err.needs_reconnect() {
                error!(%conn, "Upstream closed mid-relay, reconnecting");
                let fresh = self.reconnect(client);
                let _ = self.busy.put(conn, fresh);
                return Err(GatewayError::UpstreamClosed);
            }
            return Err(err);
        }

        let reply = outgoing.response_bytes().unwrap_or(response);
        self.metrics
            .traffic_bytes_total
            .with_label_values(&["egress"])
            .inc_by(reply.len() as u64);
        self.metrics.traffic_relayed_total.inc();
        Ok(reply)
    }

    /// Close `old` (when live) and dial a replacement with the same config.
    /// Never fails: on persistent dial failure the returned client is the
    /// zero value, which callers detect through its empty identifier.
    pub fn reconnect(&self, old: Arc<Client>) -> Arc<Client> {
        if !old.id().is_empty() {
            old.close();
        }
        match Client::connect(&self.client_config) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                error!(error = %err, "Reconnect failed");
                Arc::new(Client::dead(&self.client_config))
            }
        }
    }

    /// Low-cost liveness check: a client that was active within the
    /// health-check period is trusted; an idle one gets a socket probe.
    pub fn is_healthy(&self, client: &Client) -> bool {
        if !client.is_alive() {
            return false;
        }
        if client.idle_for() < self.health_check_period {
            return true;
        }
        client.probe()
    }

    /// True when a non-elastic proxy has no available clients left.
    pub fn is_exhausted(&self) -> bool {
        !self.elastic && self.available.is_empty()
    }

    /// Close every pooled client and clear both pools.
    pub fn shutdown(&self) {
        self.available.for_each(|_, client| {
            client.close();
            true
        });
        self.available.clear();
        debug!("All available connections have been closed");

        self.busy.for_each(|_, client| {
            client.close();
            true
        });
        self.busy.clear();
        debug!("All busy connections have been closed");
    }

    pub fn available_size(&self) -> usize {
        self.available.size()
    }

    pub fn busy_size(&self) -> usize {
        self.busy.size()
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }

    fn run_traffic_chain(&self, event: EventKind, traffic: TrafficPayload) -> TrafficPayload {
        self.metrics
            .hook_runs_total
            .with_label_values(&[event.as_str()])
            .inc();

        let payload = traffic.into_payload();
        match self.registry.run(event, payload.clone(), self.registry.verification) {
            Ok(merged) => TrafficPayload::from_payload(&merged),
            Err(err) => {
                // Hook failures do not abort the relay; the pre-chain
                // payload stays in effect.
                error!(event = %event, error = %err, "Traffic chain failed");
                TrafficPayload::from_payload(&payload)
            }
        }
    }
}
