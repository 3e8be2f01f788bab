//! Per-zone check scheduler.
//!
//! A single reconciler task owns the authoritative map of live checks; every
//! mutation is serialized through it.  Each live, enabled check gets a driver
//! task that sleeps a start jitter, then executes the check once per period
//! and forwards the result set to the metrics sink.

use crate::checks::{Check, MetricsSink};
use crate::config::ChecksPolicy;
use crate::metrics::PollerMetrics;
use crate::preparation::{ChecksPreparation, ChecksReconciler, ValidationError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zp_protocol::{ManifestEntry, PrepareAction};

const PREPARATION_BUFFER: usize = 10;
const RESET_BUFFER: usize = 1;
const SCHEDULED_LOG_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Handle to one zone's scheduler.
///
/// Cheap to clone; the reconciler task runs until the parent scope cancels.
#[derive(Clone)]
pub struct ZoneScheduler {
    zone_id: String,
    preparations_tx: mpsc::Sender<ChecksPreparation>,
    resets_tx: mpsc::Sender<()>,
    /// Mirror of live check ids (id -> check_type), maintained by the
    /// reconciler so pre-validation never touches the reconciler-owned map.
    live: Arc<RwLock<HashMap<String, String>>>,
    cancel: CancellationToken,
}

impl ZoneScheduler {
    /// Start the reconciler task for one zone.
    pub fn start(
        zone_id: &str,
        policy: ChecksPolicy,
        sink: Arc<dyn MetricsSink>,
        metrics: Arc<PollerMetrics>,
        parent: &CancellationToken,
    ) -> ZoneScheduler {
        let (preparations_tx, preparations_rx) = mpsc::channel(PREPARATION_BUFFER);
        let (resets_tx, resets_rx) = mpsc::channel(RESET_BUFFER);
        let live = Arc::new(RwLock::new(HashMap::new()));
        let cancel = parent.child_token();

        let state = ReconcilerState {
            zone_id: zone_id.to_owned(),
            checks: HashMap::new(),
            live: live.clone(),
            policy,
            sink,
            metrics,
            last_type_counts: HashMap::new(),
            cancel: cancel.clone(),
        };
        tokio::spawn(state.run(preparations_rx, resets_rx));

        ZoneScheduler {
            zone_id: zone_id.to_owned(),
            preparations_tx,
            resets_tx,
            live,
            cancel,
        }
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    /// Cancel every driver and clear the live set.
    pub fn reset(&self) {
        // A full reset channel already has a reset pending.
        let _ = self.resets_tx.try_send(());
    }

    /// Stop the reconciler and all drivers.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Currently-live check ids, sorted.
    pub fn live_check_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.live.read() {
            Ok(live) => live.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }
}

impl ChecksReconciler for ZoneScheduler {
    fn validate_checks(&self, cp: &ChecksPreparation) -> Result<(), ValidationError> {
        if cp.zone_id() != self.zone_id {
            return Err(ValidationError::UnknownZone(cp.zone_id().to_owned()));
        }
        let live = match self.live.read() {
            Ok(live) => live,
            Err(_) => return Ok(()),
        };
        for entry in cp.actionable_entries() {
            match entry.action {
                PrepareAction::Restart if !live.contains_key(&entry.check_id) => {
                    return Err(ValidationError::RestartUnknown(entry.check_id.clone()));
                }
                PrepareAction::Continue if !live.contains_key(&entry.check_id) => {
                    return Err(ValidationError::ContinueUnknown(entry.check_id.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn reconcile_checks(&self, cp: ChecksPreparation) {
        if cp.zone_id() != self.zone_id {
            warn!(
                zone = %self.zone_id,
                preparation_zone = %cp.zone_id(),
                "dropping preparation for foreign zone"
            );
            return;
        }
        if self.preparations_tx.try_send(cp).is_err() {
            warn!(zone = %self.zone_id, "preparation queue full, dropping preparation");
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler task
// ---------------------------------------------------------------------------

struct ReconcilerState {
    zone_id: String,
    checks: HashMap<String, Arc<Check>>,
    live: Arc<RwLock<HashMap<String, String>>>,
    policy: ChecksPolicy,
    sink: Arc<dyn MetricsSink>,
    metrics: Arc<PollerMetrics>,
    /// Per-type counts from the last gauge update, so vanished types drop
    /// back to zero instead of going stale.
    last_type_counts: HashMap<String, i64>,
    cancel: CancellationToken,
}

impl ReconcilerState {
    async fn run(
        mut self,
        mut preparations_rx: mpsc::Receiver<ChecksPreparation>,
        mut resets_rx: mpsc::Receiver<()>,
    ) {
        debug!(zone = %self.zone_id, "reconciler starting");
        let start = tokio::time::Instant::now() + SCHEDULED_LOG_PERIOD;
        let mut log_tick = tokio::time::interval_at(start, SCHEDULED_LOG_PERIOD);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.reset();
                    debug!(zone = %self.zone_id, "reconciler exiting");
                    return;
                }
                Some(cp) = preparations_rx.recv() => {
                    self.reconcile(cp);
                    self.log_scheduled_checks();
                }
                Some(_) = resets_rx.recv() => {
                    self.reset();
                }
                _ = log_tick.tick() => {
                    self.log_scheduled_checks();
                }
            }
        }
    }

    fn reconcile(&mut self, cp: ChecksPreparation) {
        debug!(
            zone = %self.zone_id,
            version = cp.version(),
            "reconciling prepared checks"
        );

        // Ids left in the remainder at the end were implicitly removed.
        let mut remainder: HashSet<String> = self.checks.keys().cloned().collect();

        let entries: Vec<ManifestEntry> = cp.actionable_entries().cloned().collect();
        for entry in &entries {
            remainder.remove(&entry.check_id);

            match entry.action {
                PrepareAction::Start => {
                    if let Some(existing) = self.checks.remove(&entry.check_id) {
                        warn!(
                            zone = %self.zone_id,
                            check_id = %entry.check_id,
                            "told to start a check that already exists"
                        );
                        existing.cancel();
                    }
                    self.schedule_definition(&cp, entry);
                }
                PrepareAction::Restart => {
                    match self.checks.remove(&entry.check_id) {
                        Some(existing) => existing.cancel(),
                        None => warn!(
                            zone = %self.zone_id,
                            check_id = %entry.check_id,
                            "told to restart a check that does not exist"
                        ),
                    }
                    self.schedule_definition(&cp, entry);
                }
                PrepareAction::Continue => {
                    if !self.checks.contains_key(&entry.check_id) {
                        warn!(
                            zone = %self.zone_id,
                            check_id = %entry.check_id,
                            "told to continue a check that does not exist"
                        );
                    }
                }
                PrepareAction::End => {}
            }
        }

        for check_id in remainder {
            info!(
                zone = %self.zone_id,
                check_id = %check_id,
                "removing check implicitly due to absence in preparation"
            );
            if let Some(removed) = self.checks.remove(&check_id) {
                removed.cancel();
            }
        }

        self.publish_live_set();
    }

    fn schedule_definition(&mut self, cp: &ChecksPreparation, entry: &ManifestEntry) {
        let Some(def) = cp.definition_for(&entry.check_id) else {
            warn!(
                zone = %self.zone_id,
                check_id = %entry.check_id,
                "no definition received for manifest entry"
            );
            return;
        };
        match Check::from_definition(def, &self.policy, &self.cancel) {
            Ok(check) => {
                let check = Arc::new(check);
                self.checks.insert(check.id().to_owned(), check.clone());
                if !check.is_disabled() {
                    let sink = self.sink.clone();
                    let spread_ms = self.policy.spread_ms;
                    tokio::spawn(run_check_driver(check, sink, spread_ms));
                }
            }
            Err(e) => {
                warn!(
                    zone = %self.zone_id,
                    check_id = %entry.check_id,
                    error = %e,
                    "unable to initiate check"
                );
            }
        }
    }

    fn reset(&mut self) {
        if !self.checks.is_empty() {
            info!(
                zone = %self.zone_id,
                checks = self.checks.len(),
                "cancelling and de-scheduling checks due to reset"
            );
        }
        for (_, check) in self.checks.drain() {
            check.cancel();
        }
        self.publish_live_set();
    }

    /// Refresh the live-id mirror and the scheduled-checks gauge.
    fn publish_live_set(&mut self) {
        let snapshot: HashMap<String, String> = self
            .checks
            .iter()
            .map(|(id, check)| (id.clone(), check.check_type().to_owned()))
            .collect();

        let mut type_counts: HashMap<String, i64> = HashMap::new();
        for check_type in snapshot.values() {
            *type_counts.entry(check_type.clone()).or_insert(0) += 1;
        }
        for stale_type in self.last_type_counts.keys() {
            if !type_counts.contains_key(stale_type) {
                self.metrics
                    .set_scheduled_checks(&self.zone_id, stale_type, 0);
            }
        }
        for (check_type, count) in &type_counts {
            self.metrics
                .set_scheduled_checks(&self.zone_id, check_type, *count);
        }
        self.last_type_counts = type_counts;

        if let Ok(mut live) = self.live.write() {
            *live = snapshot;
        }
    }

    fn log_scheduled_checks(&self) {
        if self.checks.is_empty() {
            info!(zone = %self.zone_id, "no checks are scheduled to run");
            return;
        }
        let mut type_counts: HashMap<&str, usize> = HashMap::new();
        for check in self.checks.values() {
            *type_counts.entry(check.check_type()).or_insert(0) += 1;
        }
        info!(
            zone = %self.zone_id,
            total = self.checks.len(),
            type_counts = ?type_counts,
            "checks scheduled to run"
        );
    }
}

// ---------------------------------------------------------------------------
// Per-check driver
// ---------------------------------------------------------------------------

/// Drive one check: start jitter, then run once per wait period until
/// cancelled.  Cancellation reaches here both from the check's own token and
/// from any ancestor scope.
async fn run_check_driver(check: Arc<Check>, sink: Arc<dyn MetricsSink>, spread_ms: u64) {
    let jitter_ms = if spread_ms == 0 {
        0
    } else {
        rand::rng().random_range(0..=spread_ms)
    };
    info!(
        check_id = %check.id(),
        check_type = %check.check_type(),
        entity_id = %check.entity_id(),
        period_secs = check.period().as_secs(),
        jitter_ms,
        "starting check"
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
        _ = check.cancelled() => return,
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(check.wait_period()) => {
                debug!(check_id = %check.id(), "running check");
                match check.run().await {
                    Ok(crs) => {
                        if let Err(e) = sink.send_metrics(&crs) {
                            warn!(check_id = %check.id(), error = %e, "failed to route metrics");
                        }
                    }
                    Err(e) => warn!(check_id = %check.id(), error = %e, "error running check"),
                }
            }
            _ = check.cancelled() => {
                info!(check_id = %check.id(), "check or session has been cancelled");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::{loose_policy, tcp_definition};
    use crate::checks::{ResultSet, SinkError};
    use zp_protocol::CheckDefinition;

    struct ChannelSink(mpsc::UnboundedSender<ResultSet>);

    impl MetricsSink for ChannelSink {
        fn send_metrics(&self, crs: &ResultSet) -> Result<(), SinkError> {
            self.0
                .send(crs.clone())
                .map_err(|_| SinkError::NoConnections)
        }
    }

    fn start_scheduler(
        zone: &str,
    ) -> (
        ZoneScheduler,
        mpsc::UnboundedReceiver<ResultSet>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let parent = CancellationToken::new();
        let scheduler = ZoneScheduler::start(
            zone,
            loose_policy(),
            Arc::new(ChannelSink(tx)),
            Arc::new(PollerMetrics::new()),
            &parent,
        );
        (scheduler, rx, parent)
    }

    fn manifest_entry(action: PrepareAction, check_id: &str) -> ManifestEntry {
        ManifestEntry {
            action,
            zone_id: "zn1".to_owned(),
            entity_id: format!("en-{check_id}"),
            check_id: check_id.to_owned(),
            check_type: crate::checks::CHECK_TYPE_TCP.to_owned(),
        }
    }

    fn start_preparation(version: u64, definitions: Vec<CheckDefinition>) -> ChecksPreparation {
        let manifest = definitions
            .iter()
            .map(|d| manifest_entry(PrepareAction::Start, &d.check_id))
            .collect();
        let mut cp = ChecksPreparation::new("zn1", version, manifest).expect("preparation");
        cp.add_definitions(definitions);
        cp
    }

    async fn wait_for_live_set(scheduler: &ZoneScheduler, expected: &[&str]) {
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        for _ in 0..100 {
            if scheduler.live_check_ids() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "live set never became {:?}, last seen {:?}",
            expected,
            scheduler.live_check_ids()
        );
    }

    #[tokio::test]
    async fn reconcile_makes_the_live_set_match_the_manifest() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        let cp = start_preparation(
            1,
            vec![
                tcp_definition("ch1", "zn1", "127.0.0.1", 1),
                tcp_definition("ch2", "zn1", "127.0.0.1", 1),
            ],
        );
        scheduler.reconcile_checks(cp);
        wait_for_live_set(&scheduler, &["ch1", "ch2"]).await;
    }

    #[tokio::test]
    async fn applying_the_same_preparation_twice_is_idempotent() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        let cp = start_preparation(
            1,
            vec![
                tcp_definition("ch1", "zn1", "127.0.0.1", 1),
                tcp_definition("ch2", "zn1", "127.0.0.1", 1),
            ],
        );
        scheduler.reconcile_checks(cp.clone());
        wait_for_live_set(&scheduler, &["ch1", "ch2"]).await;
        scheduler.reconcile_checks(cp);
        // Give the reconciler time to process the duplicate.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.live_check_ids(), vec!["ch1", "ch2"]);
    }

    #[tokio::test]
    async fn absent_checks_are_implicitly_removed() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        scheduler.reconcile_checks(start_preparation(
            1,
            vec![
                tcp_definition("ch1", "zn1", "127.0.0.1", 1),
                tcp_definition("ch2", "zn1", "127.0.0.1", 1),
                tcp_definition("ch3", "zn1", "127.0.0.1", 1),
            ],
        ));
        wait_for_live_set(&scheduler, &["ch1", "ch2", "ch3"]).await;

        let cp = ChecksPreparation::new(
            "zn1",
            2,
            vec![manifest_entry(PrepareAction::Continue, "ch1")],
        )
        .expect("preparation");
        scheduler.reconcile_checks(cp);
        wait_for_live_set(&scheduler, &["ch1"]).await;
    }

    #[tokio::test]
    async fn unknown_check_types_are_dropped_with_the_rest_scheduled() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        let mut bogus = tcp_definition("ch-bogus", "zn1", "127.0.0.1", 1);
        bogus.check_type = "remote.carrier_pigeon".to_owned();
        let good = tcp_definition("ch1", "zn1", "127.0.0.1", 1);

        let manifest = vec![
            manifest_entry(PrepareAction::Start, "ch1"),
            ManifestEntry {
                check_type: "remote.carrier_pigeon".to_owned(),
                ..manifest_entry(PrepareAction::Start, "ch-bogus")
            },
        ];
        let mut cp = ChecksPreparation::new("zn1", 1, manifest).expect("preparation");
        cp.add_definitions(vec![good, bogus]);

        scheduler.reconcile_checks(cp);
        wait_for_live_set(&scheduler, &["ch1"]).await;
    }

    #[tokio::test]
    async fn validate_rejects_restart_and_continue_of_unknown_checks() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        let cp = ChecksPreparation::new(
            "zn1",
            1,
            vec![manifest_entry(PrepareAction::Restart, "ch-ghost")],
        )
        .expect("preparation");
        assert!(matches!(
            scheduler.validate_checks(&cp),
            Err(ValidationError::RestartUnknown(id)) if id == "ch-ghost"
        ));

        let cp = ChecksPreparation::new(
            "zn1",
            1,
            vec![manifest_entry(PrepareAction::Continue, "ch-ghost")],
        )
        .expect("preparation");
        assert!(matches!(
            scheduler.validate_checks(&cp),
            Err(ValidationError::ContinueUnknown(id)) if id == "ch-ghost"
        ));
    }

    #[tokio::test]
    async fn validate_accepts_start_of_new_checks() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        let cp = ChecksPreparation::new(
            "zn1",
            1,
            vec![manifest_entry(PrepareAction::Start, "ch-new")],
        )
        .expect("preparation");
        scheduler.validate_checks(&cp).expect("start is always valid");
    }

    #[tokio::test]
    async fn reset_cancels_and_clears_everything() {
        let (scheduler, _rx, _parent) = start_scheduler("zn1");
        scheduler.reconcile_checks(start_preparation(
            1,
            vec![tcp_definition("ch1", "zn1", "127.0.0.1", 1)],
        ));
        wait_for_live_set(&scheduler, &["ch1"]).await;

        scheduler.reset();
        wait_for_live_set(&scheduler, &[]).await;
    }

    #[tokio::test]
    async fn enabled_checks_run_and_forward_metrics() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local_addr").port();
        // Keep accepting so connects keep succeeding.
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (scheduler, mut rx, _parent) = start_scheduler("zn1");
        scheduler.reconcile_checks(start_preparation(
            1,
            vec![tcp_definition("ch-live", "zn1", "127.0.0.1", port)],
        ));

        let crs = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("metric within one period")
            .expect("sink open");
        assert_eq!(crs.check_id, "ch-live");
        assert!(crs.available);
    }

    #[tokio::test]
    async fn disabled_checks_are_live_but_never_driven() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local_addr").port();

        let (scheduler, mut rx, _parent) = start_scheduler("zn1");
        let mut def = tcp_definition("ch-off", "zn1", "127.0.0.1", port);
        def.disabled = true;
        scheduler.reconcile_checks(start_preparation(1, vec![def]));
        wait_for_live_set(&scheduler, &["ch-off"]).await;

        let outcome = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
        assert!(outcome.is_err(), "disabled check must not produce metrics");
    }

    #[tokio::test]
    async fn cancelling_the_parent_scope_resets_the_zone() {
        let (scheduler, _rx, parent) = start_scheduler("zn1");
        scheduler.reconcile_checks(start_preparation(
            1,
            vec![tcp_definition("ch1", "zn1", "127.0.0.1", 1)],
        ));
        wait_for_live_set(&scheduler, &["ch1"]).await;

        parent.cancel();
        wait_for_live_set(&scheduler, &[]).await;
    }
}
