//! Connection stream supervisor.
//!
//! Owns every endpoint connection for the process: resolves endpoints (SRV
//! queries or literal addresses), runs one reconnection loop per endpoint,
//! routes outbound metrics through the lowest-latency connection, and fans
//! committed check preparations out to the per-zone schedulers.

use crate::checks::{MetricsSink, ResultSet, SinkError};
use crate::config::Config;
use crate::connection::Connection;
use crate::metrics::PollerMetrics;
use crate::preparation::{ChecksPreparation, ChecksReconciler, ValidationError};
use crate::scheduler::ZoneScheduler;
use crate::session::SessionConfig;
use crate::tls::TlsClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zp_protocol::{methods, Frame};

type ConnRegistry = Arc<Mutex<HashMap<String, Arc<Connection>>>>;

/// Pick the authenticated connection with the smallest measured latency.
fn choose_best_from(conns: &ConnRegistry) -> Option<Arc<Connection>> {
    let guard = conns.lock().ok()?;
    guard
        .values()
        .filter(|c| c.is_authenticated() && c.has_measurements())
        .min_by_key(|c| c.latency())
        .cloned()
}

// ---------------------------------------------------------------------------
// Metrics routing
// ---------------------------------------------------------------------------

struct StreamMetricsSink {
    conns: ConnRegistry,
}

impl MetricsSink for StreamMetricsSink {
    fn send_metrics(&self, crs: &ResultSet) -> Result<(), SinkError> {
        let Some(conn) = choose_best_from(&self.conns) else {
            return Err(SinkError::NoConnections);
        };
        let params = crs.to_post_params(conn.clock_offset());
        let frame = Frame::request(methods::CHECK_METRICS_POST_MULTI, &params)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        // Fire and forget; the session's outbound queue absorbs bursts.
        conn.session().send(frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconcile fan-out
// ---------------------------------------------------------------------------

struct StreamReconciler {
    schedulers: HashMap<String, ZoneScheduler>,
}

impl ChecksReconciler for StreamReconciler {
    fn validate_checks(&self, cp: &ChecksPreparation) -> Result<(), ValidationError> {
        match self.schedulers.get(cp.zone_id()) {
            Some(scheduler) => scheduler.validate_checks(cp),
            None => Err(ValidationError::UnknownZone(cp.zone_id().to_owned())),
        }
    }

    fn reconcile_checks(&self, cp: ChecksPreparation) {
        match self.schedulers.get(cp.zone_id()) {
            Some(scheduler) => scheduler.reconcile_checks(cp),
            None => warn!(zone = %cp.zone_id(), "no scheduler for committed preparation"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection stream
// ---------------------------------------------------------------------------

pub struct ConnectionStream {
    config: Config,
    tls: Arc<TlsClient>,
    conns: ConnRegistry,
    schedulers: HashMap<String, ZoneScheduler>,
    reconciler: Arc<StreamReconciler>,
    sink: Arc<StreamMetricsSink>,
    cancel: CancellationToken,
}

impl ConnectionStream {
    /// Build the stream: one scheduler per configured zone, wired to a
    /// metrics sink that routes through the best available connection.
    pub fn new(
        config: Config,
        tls: TlsClient,
        metrics: Arc<PollerMetrics>,
        parent: &CancellationToken,
    ) -> ConnectionStream {
        let cancel = parent.child_token();
        let conns: ConnRegistry = Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::new(StreamMetricsSink {
            conns: conns.clone(),
        });

        let mut schedulers = HashMap::new();
        for zone in &config.zones {
            schedulers.insert(
                zone.clone(),
                ZoneScheduler::start(
                    zone,
                    config.checks,
                    sink.clone() as Arc<dyn MetricsSink>,
                    metrics.clone(),
                    &cancel,
                ),
            );
        }
        let reconciler = Arc::new(StreamReconciler {
            schedulers: schedulers.clone(),
        });

        ConnectionStream {
            config,
            tls: Arc::new(tls),
            conns,
            schedulers,
            reconciler,
            sink,
            cancel,
        }
    }

    /// Start one reconnection loop per configured endpoint.
    ///
    /// With `use_srv` each query is resolved before every connection
    /// attempt; otherwise the literal addresses are dialed directly.
    pub fn connect(&self) {
        let targets: Vec<EndpointTarget> = if self.config.endpoints.use_srv {
            self.config
                .endpoints
                .srv_queries
                .iter()
                .map(|q| EndpointTarget::Srv(q.clone()))
                .collect()
        } else {
            self.config
                .endpoints
                .addresses
                .iter()
                .map(|a| EndpointTarget::Literal(a.clone()))
                .collect()
        };

        for target in targets {
            let ctx = EndpointCtx {
                tls: self.tls.clone(),
                conns: self.conns.clone(),
                schedulers: self.schedulers.clone(),
                reconciler: self.reconciler.clone(),
                session_cfg: SessionConfig::from_config(&self.config),
                dial_timeout: self.config.timeouts.dial,
                reconnect_delay: self.config.timeouts.reconnect,
                cancel: self.cancel.clone(),
            };
            tokio::spawn(run_endpoint(target, ctx));
        }
    }

    /// The authenticated connection with the lowest measured latency.
    pub fn choose_best(&self) -> Option<Arc<Connection>> {
        choose_best_from(&self.conns)
    }

    /// Route a result set through the best connection.
    pub fn send_metrics(&self, crs: &ResultSet) -> Result<(), SinkError> {
        self.sink.send_metrics(crs)
    }

    /// The scheduler serving `zone`, if configured.
    pub fn scheduler(&self, zone: &str) -> Option<&ZoneScheduler> {
        self.schedulers.get(zone)
    }

    /// The reconciler handle sessions use for prepare/commit.
    pub fn reconciler(&self) -> Arc<dyn ChecksReconciler> {
        self.reconciler.clone()
    }

    /// Number of currently-registered connections.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Cancel everything owned by the stream: reconnection loops, sessions,
    /// schedulers, and check drivers.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Per-endpoint reconnection loop
// ---------------------------------------------------------------------------

enum EndpointTarget {
    Literal(String),
    Srv(String),
}

struct EndpointCtx {
    tls: Arc<TlsClient>,
    conns: ConnRegistry,
    schedulers: HashMap<String, ZoneScheduler>,
    reconciler: Arc<StreamReconciler>,
    session_cfg: SessionConfig,
    dial_timeout: std::time::Duration,
    reconnect_delay: std::time::Duration,
    cancel: CancellationToken,
}

async fn run_endpoint(target: EndpointTarget, ctx: EndpointCtx) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }

        let address = match &target {
            EndpointTarget::Literal(addr) => Some(addr.clone()),
            EndpointTarget::Srv(query) => resolve_srv(query).await,
        };

        if let Some(address) = address {
            info!(address = %address, "connecting");
            match Connection::establish(
                &address,
                &ctx.tls,
                ctx.session_cfg.clone(),
                ctx.dial_timeout,
                ctx.reconciler.clone() as Arc<dyn ChecksReconciler>,
                &ctx.cancel,
            )
            .await
            {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    if let Ok(mut conns) = ctx.conns.lock() {
                        conns.insert(address.clone(), conn.clone());
                        debug!(
                            connections = ?conns.keys().collect::<Vec<_>>(),
                            "currently registered connections"
                        );
                    }
                    conn.wait_terminated().await;
                    if let Ok(mut conns) = ctx.conns.lock() {
                        conns.remove(&address);
                    }
                    info!(address = %address, "connection terminated");
                    reset_schedulers_if_unrouted(&ctx);
                }
                Err(e) => {
                    error!(address = %address, error = %e, "connection attempt failed");
                }
            }
        }

        debug!(delay = ?ctx.reconnect_delay, "connection sleeping before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(ctx.reconnect_delay) => {}
            _ = ctx.cancel.cancelled() => return,
        }
    }
}

/// With no authenticated connection left there is no route for results, so
/// stale work is torn down rather than driven into the void.
fn reset_schedulers_if_unrouted(ctx: &EndpointCtx) {
    let any_authenticated = ctx
        .conns
        .lock()
        .map(|conns| conns.values().any(|c| c.is_authenticated()))
        .unwrap_or(false);
    if !any_authenticated {
        info!("no authenticated connections remain, resetting zone schedulers");
        for scheduler in ctx.schedulers.values() {
            scheduler.reset();
        }
    }
}

/// Resolve an SRV query to `host:port`, taking the first returned target.
async fn resolve_srv(query: &str) -> Option<String> {
    let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            error!(error = %e, "unable to construct resolver from system configuration");
            return None;
        }
    };
    match resolver.srv_lookup(query).await {
        Ok(lookup) => match lookup.iter().next() {
            Some(srv) => {
                let host = srv.target().to_string();
                let address = format!("{}:{}", host.trim_end_matches('.'), srv.port());
                debug!(query, address = %address, "srv record resolved");
                Some(address)
            }
            None => {
                error!(query, "no addresses returned for srv query");
                None
            }
        },
        Err(e) => {
            error!(query, error = %e, "srv lookup failure");
            None
        }
    }
}
