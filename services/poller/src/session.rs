//! Per-connection protocol session.
//!
//! One session per connection.  The session owns the frame codec, the
//! pending-request (completion) table, the heartbeat loop, the auth timer,
//! and the prepare/commit handler; it hands committed preparations to the
//! reconciler capability.
//!
//! Task layout, all children of the session's cancellation scope:
//! - reader: deadline-bounded frame decode, forwards to the handler
//! - handler: dispatches on method, owns the prepare state
//! - writer: drains the bounded send queue FIFO, records completions
//! - heartbeat driver: started once after a successful handshake
//! - short-lived tasks for `host_info.get` and `check_test`

use crate::checks::Check;
use crate::config::{ChecksPolicy, Config};
use crate::hostinfo;
use crate::preparation::{ChecksPreparation, ChecksReconciler};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use zp_protocol::{
    codec, methods, now_timestamp_millis, CheckTestParams, Frame, HandshakeParams,
    HandshakeResult, HeartbeatParams, HeartbeatResult, PollerCommitParams,
    PollerPrepareBlockParams, PollerPrepareEndParams, PollerPrepareParams, PrepareDirective,
    PrepareResult, PrepareStatus,
};

const SEND_CHANNEL_SIZE: usize = 128;
const READ_CHANNEL_SIZE: usize = 256;
const EVENTS_CHANNEL_SIZE: usize = 16;

/// Terminal or notable session conditions surfaced to the supervisor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SendError(String),
    ReadError(String),
    AuthTimeout,
    HandshakeError(String),
}

/// Everything the session needs from the agent configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_id: String,
    pub agent_name: String,
    pub token: String,
    pub process_version: String,
    pub features: Vec<zp_protocol::Feature>,
    pub auth_timeout: Duration,
    pub prepare_end_timeout: Duration,
    pub read_slack: Duration,
    pub write_slack: Duration,
    pub checks_policy: ChecksPolicy,
}

impl SessionConfig {
    pub fn from_config(cfg: &Config) -> SessionConfig {
        SessionConfig {
            agent_id: cfg.agent_id.clone(),
            agent_name: cfg.agent_name.clone(),
            token: cfg.token.clone(),
            process_version: env!("CARGO_PKG_VERSION").to_owned(),
            features: cfg.features.clone(),
            auth_timeout: cfg.timeouts.auth,
            prepare_end_timeout: cfg.timeouts.prepare_end,
            read_slack: cfg.timeouts.read_slack,
            write_slack: cfg.timeouts.write_slack,
            checks_policy: cfg.checks,
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat measurement
// ---------------------------------------------------------------------------

/// The four timestamps of one heartbeat round trip, all epoch milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeLatencyTracking {
    pub poller_send: i64,
    pub poller_recv: i64,
    pub server_recv: i64,
    pub server_resp: i64,
}

impl TimeLatencyTracking {
    /// NTP-style skew estimate: (clock offset, one-way latency), both ms.
    pub fn compute_skew(&self) -> (i64, i64) {
        let offset =
            ((self.server_recv - self.poller_send) + (self.server_resp - self.poller_recv)) / 2;
        let latency =
            ((self.poller_recv - self.poller_send) - (self.server_resp - self.server_recv)) / 2;
        (offset, latency)
    }
}

#[derive(Debug, Default)]
struct HeartbeatMeasurement {
    expected_seq_id: u64,
    poller_send_ts: i64,
    offset: i64,
    latency: i64,
    observations: u64,
}

// ---------------------------------------------------------------------------
// Completion table
// ---------------------------------------------------------------------------

/// A pending request awaiting its response.
#[derive(Debug, Clone)]
pub struct CompletionEntry {
    pub id: u64,
    pub method: String,
}

struct SessionShared {
    agent_id: String,
    seq: AtomicU64,
    completions: Mutex<HashMap<u64, CompletionEntry>>,
    heartbeat: Mutex<HeartbeatMeasurement>,
    authenticated: AtomicBool,
}

impl SessionShared {
    fn next_id(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn add_completion(&self, id: u64, method: &str) {
        if let Ok(mut completions) = self.completions.lock() {
            completions.insert(
                id,
                CompletionEntry {
                    id,
                    method: method.to_owned(),
                },
            );
        }
    }

    fn take_completion(&self, id: u64) -> Option<CompletionEntry> {
        self.completions.lock().ok()?.remove(&id)
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct Session {
    send_tx: mpsc::Sender<Frame>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
    done_rx: watch::Receiver<bool>,
}

impl Session {
    /// Start a session over an established byte stream and immediately send
    /// the handshake.  The session's scope is a child of `parent`.
    pub fn start<S>(
        stream: S,
        cfg: SessionConfig,
        reconciler: Arc<dyn ChecksReconciler>,
        parent: &CancellationToken,
    ) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cancel = parent.child_token();
        let (read_half, write_half) = tokio::io::split(stream);

        let (send_tx, send_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
        let (read_tx, read_rx) = mpsc::channel(READ_CHANNEL_SIZE);
        let (hb_resp_tx, hb_resp_rx) = mpsc::channel(1);
        let (hb_interval_tx, hb_interval_rx) = watch::channel(Duration::ZERO);
        let (events_tx, _) = broadcast::channel(EVENTS_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            agent_id: cfg.agent_id.clone(),
            seq: AtomicU64::new(0),
            completions: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(HeartbeatMeasurement::default()),
            authenticated: AtomicBool::new(false),
        });

        let session = Session {
            send_tx,
            shared: shared.clone(),
            cancel: cancel.clone(),
            events_tx: events_tx.clone(),
            done_rx,
        };

        let tracker = TaskTracker::new();
        let auth_done = CancellationToken::new();

        tracker.spawn(run_reader(
            BufReader::new(read_half),
            read_tx,
            hb_interval_rx.clone(),
            cfg.read_slack,
            cancel.clone(),
            events_tx.clone(),
        ));
        tracker.spawn(run_writer(
            write_half,
            send_rx,
            shared.clone(),
            hb_interval_rx,
            cfg.write_slack,
            cancel.clone(),
            events_tx.clone(),
        ));
        tracker.spawn(run_auth_timer(
            cfg.auth_timeout,
            auth_done.clone(),
            cancel.clone(),
            events_tx.clone(),
        ));

        let handler = FrameHandler {
            session: session.clone(),
            cfg: cfg.clone(),
            reconciler,
            shared,
            cancel: cancel.clone(),
            events_tx,
            hb_interval_tx,
            hb_resp_tx,
            hb_resp_rx: Some(hb_resp_rx),
            heartbeat_started: false,
            auth_done,
            tracker: tracker.clone(),
            prep: PrepState {
                active: None,
                newest_committed_version: 0,
            },
        };
        tracker.spawn(handler.run(read_rx));

        // Supervisor: once the scope cancels, wait for every child before
        // signalling done.
        tokio::spawn({
            let cancel = cancel.clone();
            let tracker = tracker.clone();
            async move {
                cancel.cancelled().await;
                tracker.close();
                tracker.wait().await;
                let _ = done_tx.send(true);
            }
        });

        session.authenticate(&cfg);
        session
    }

    /// Send the handshake request carrying token, agent id, name, and
    /// process version.
    fn authenticate(&self, cfg: &SessionConfig) {
        let params = HandshakeParams {
            token: cfg.token.clone(),
            agent_id: cfg.agent_id.clone(),
            agent_name: cfg.agent_name.clone(),
            process_version: cfg.process_version.clone(),
            features: cfg.features.clone(),
        };
        match Frame::request(methods::HANDSHAKE_HELLO, &params) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                error!(error = %e, "unable to encode handshake request");
                self.cancel.cancel();
            }
        }
    }

    /// Stage a frame for sending.  Allocates an id for method-bearing frames
    /// whose id is still zero.  Fire and forget: a full queue drops the
    /// frame with a warning.
    pub fn send(&self, mut frame: Frame) {
        if frame.method.is_some() && frame.id == 0 {
            frame.id = self.shared.next_id();
        }
        self.stamp_and_enqueue(frame);
    }

    /// Like [`Session::send`] but never allocates an id; emphasizes that the
    /// poller is answering a server request.
    pub fn respond(&self, frame: Frame) {
        self.stamp_and_enqueue(frame);
    }

    fn stamp_and_enqueue(&self, mut frame: Frame) {
        frame.target = "endpoint".to_owned();
        frame.source = self.shared.agent_id.clone();
        if self.send_tx.try_send(frame).is_err() {
            warn!("send queue full or closed, dropping frame");
        }
    }

    /// Cancel the session scope; all child tasks unwind.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves after every child task has terminated.
    pub async fn wait_terminated(&self) {
        let mut done_rx = self.done_rx.clone();
        while !*done_rx.borrow() {
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self.done_rx.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Estimated server-minus-poller clock difference in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        self.shared
            .heartbeat
            .lock()
            .map(|m| m.offset)
            .unwrap_or(0)
    }

    /// Estimated one-way latency in milliseconds.
    pub fn latency(&self) -> i64 {
        self.shared
            .heartbeat
            .lock()
            .map(|m| m.latency)
            .unwrap_or(i64::MAX)
    }

    pub fn has_measurements(&self) -> bool {
        self.shared
            .heartbeat
            .lock()
            .map(|m| m.observations > 0)
            .unwrap_or(false)
    }

    /// Number of requests awaiting a response.
    pub fn pending_completions(&self) -> usize {
        self.shared
            .completions
            .lock()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

fn emit(events_tx: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let _ = events_tx.send(event);
}

// ---------------------------------------------------------------------------
// Reader / writer / auth timer tasks
// ---------------------------------------------------------------------------

async fn run_reader<R>(
    mut reader: BufReader<R>,
    read_tx: mpsc::Sender<Frame>,
    hb_interval_rx: watch::Receiver<Duration>,
    read_slack: Duration,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    debug!("read starting");
    loop {
        let deadline = read_slack + *hb_interval_rx.borrow();
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(deadline, codec::read_frame(&mut reader)) => match result {
                Ok(Ok(Some(frame))) => {
                    if read_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(Ok(None)) => {
                    debug!("far end closed connection");
                    cancel.cancel();
                    break;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "session exiting with read error");
                    emit(&events_tx, SessionEvent::ReadError(e.to_string()));
                    cancel.cancel();
                    break;
                }
                Err(_) => {
                    warn!("read deadline expired");
                    emit(&events_tx, SessionEvent::ReadError("read deadline expired".to_owned()));
                    cancel.cancel();
                    break;
                }
            }
        }
    }
    debug!("read exiting");
}

async fn run_writer<W>(
    mut writer: W,
    mut send_rx: mpsc::Receiver<Frame>,
    shared: Arc<SessionShared>,
    hb_interval_rx: watch::Receiver<Duration>,
    write_slack: Duration,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    debug!("send starting");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = send_rx.recv() => {
                let Some(frame) = maybe else { break };
                if let Some(method) = &frame.method {
                    shared.add_completion(frame.id, method);
                }
                if tracing::enabled!(tracing::Level::DEBUG) {
                    if let Ok(data) = codec::encode_frame(&frame) {
                        debug!(payload = %String::from_utf8_lossy(&data).trim_end(), "socket send");
                    }
                }
                let deadline = write_slack + *hb_interval_rx.borrow();
                match timeout(deadline, codec::write_frame(&mut writer, &frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "session exiting with send error");
                        emit(&events_tx, SessionEvent::SendError(e.to_string()));
                        cancel.cancel();
                        break;
                    }
                    Err(_) => {
                        warn!("write deadline expired");
                        emit(&events_tx, SessionEvent::SendError("write deadline expired".to_owned()));
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    }
    debug!("send exiting");
}

/// Fires once: closes the session unless the handshake completes in time.
async fn run_auth_timer(
    auth_timeout: Duration,
    auth_done: CancellationToken,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = auth_done.cancelled() => {}
        _ = tokio::time::sleep(auth_timeout) => {
            warn!("closing connection due to expired auth");
            emit(&events_tx, SessionEvent::AuthTimeout);
            cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Frame handler
// ---------------------------------------------------------------------------

struct PrepState {
    active: Option<ActivePrep>,
    newest_committed_version: u64,
}

struct ActivePrep {
    prep: ChecksPreparation,
    /// The originating `poller.prepare` frame, answered at prepare end.
    src: Frame,
    deadline: Instant,
    prepared: bool,
}

struct FrameHandler {
    session: Session,
    cfg: SessionConfig,
    reconciler: Arc<dyn ChecksReconciler>,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    events_tx: broadcast::Sender<SessionEvent>,
    hb_interval_tx: watch::Sender<Duration>,
    hb_resp_tx: mpsc::Sender<(u64, HeartbeatResult)>,
    hb_resp_rx: Option<mpsc::Receiver<(u64, HeartbeatResult)>>,
    heartbeat_started: bool,
    auth_done: CancellationToken,
    tracker: TaskTracker,
    prep: PrepState,
}

/// Sleeps until the deadline, or forever when there is none.
async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl FrameHandler {
    async fn run(mut self, mut read_rx: mpsc::Receiver<Frame>) {
        debug!("frame handling starting");
        loop {
            let prepare_deadline = self
                .prep
                .active
                .as_ref()
                .filter(|a| !a.prepared)
                .map(|a| a.deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = read_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    self.handle_frame(frame);
                }
                _ = maybe_sleep_until(prepare_deadline) => {
                    self.expire_prepare_timer();
                }
            }
        }
        debug!("frame handling exiting");
    }

    fn handle_frame(&mut self, frame: Frame) {
        if tracing::enabled!(tracing::Level::DEBUG) {
            if let Ok(data) = codec::encode_frame(&frame) {
                debug!(payload = %String::from_utf8_lossy(&data).trim_end(), "socket receive");
            }
        }
        match frame.method.as_deref() {
            None => self.handle_response(frame),
            Some(methods::HOST_INFO_GET) => self.spawn_host_info(frame),
            Some(methods::CHECK_TEST) => self.spawn_check_test(frame),
            Some(methods::POLLER_PREPARE) => self.handle_poller_prepare(frame),
            Some(methods::POLLER_PREPARE_BLOCK) => self.handle_poller_prepare_block(frame),
            Some(methods::POLLER_PREPARE_END) => self.handle_poller_prepare_end(frame),
            Some(methods::POLLER_COMMIT) => self.handle_poller_commit(frame),
            Some(other) => {
                error!(method = other, "no handler for method");
            }
        }
    }

    // -- responses ----------------------------------------------------------

    fn handle_response(&mut self, frame: Frame) {
        let Some(entry) = self.shared.take_completion(frame.id) else {
            debug!(id = frame.id, "response for unknown id, discarding");
            return;
        };
        match entry.method.as_str() {
            methods::HANDSHAKE_HELLO => self.handle_handshake_response(frame),
            methods::HEARTBEAT_POST => {
                if let Some(err) = &frame.error {
                    warn!(error = %err.message, "heartbeat error response");
                    return;
                }
                match frame.decode_result::<HeartbeatResult>() {
                    Ok(result) => {
                        let _ = self.hb_resp_tx.try_send((frame.id, result));
                    }
                    Err(e) => warn!(error = %e, "undecodable heartbeat response"),
                }
            }
            methods::CHECK_METRICS_POST_MULTI => {}
            other => {
                error!(method = other, "unexpected method in completed response");
            }
        }
    }

    fn handle_handshake_response(&mut self, frame: Frame) {
        self.auth_done.cancel();
        if let Some(err) = &frame.error {
            error!(error = %err.message, "handshake error");
            emit(&self.events_tx, SessionEvent::HandshakeError(err.message.clone()));
            self.cancel.cancel();
            return;
        }
        let result = match frame.decode_result::<HandshakeResult>() {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "undecodable handshake response");
                emit(&self.events_tx, SessionEvent::HandshakeError(e.to_string()));
                self.cancel.cancel();
                return;
            }
        };
        let interval = Duration::from_millis(result.heartbeat_interval);
        let _ = self.hb_interval_tx.send(interval);
        self.shared.authenticated.store(true, Ordering::SeqCst);
        info!(
            heartbeat_interval_ms = result.heartbeat_interval,
            "session authenticated"
        );
        // Guard against a duplicate handshake response starting a second loop.
        if !self.heartbeat_started {
            self.heartbeat_started = true;
            if let Some(hb_resp_rx) = self.hb_resp_rx.take() {
                self.tracker.spawn(run_heartbeats(
                    self.session.clone(),
                    self.shared.clone(),
                    interval,
                    hb_resp_rx,
                    self.cancel.clone(),
                ));
            }
        }
    }

    // -- server-initiated short-lived requests ------------------------------

    fn spawn_host_info(&self, frame: Frame) {
        let session = self.session.clone();
        let process_version = self.cfg.process_version.clone();
        self.tracker.spawn(async move {
            let info = hostinfo::collect(&process_version);
            match Frame::response_to(&frame, &info) {
                Ok(resp) => session.respond(resp),
                Err(e) => error!(error = %e, "unable to encode host info response"),
            }
        });
    }

    fn spawn_check_test(&self, frame: Frame) {
        let session = self.session.clone();
        let policy = self.cfg.checks_policy;
        let scope = self.cancel.clone();
        self.tracker.spawn(handle_check_test(session, frame, policy, scope));
    }

    // -- prepare / commit ---------------------------------------------------

    fn respond_prepare_result(
        &self,
        src: &Frame,
        zone_id: &str,
        version: u64,
        status: PrepareStatus,
        details: Option<&str>,
    ) {
        if let Some(details) = details {
            warn!(zone = zone_id, version, ?status, details, "prepare status");
        }
        let result = PrepareResult {
            zone_id: zone_id.to_owned(),
            version,
            status,
            details: details.map(str::to_owned),
        };
        match Frame::response_to(src, &result) {
            Ok(resp) => self.session.respond(resp),
            Err(e) => error!(error = %e, "unable to encode prepare response"),
        }
    }

    fn handle_poller_prepare(&mut self, frame: Frame) {
        let req: PollerPrepareParams = match frame.decode_params() {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "undecodable poller prepare request");
                self.session
                    .respond(Frame::error_response_to(&frame, 1, "unable to decode prepare request"));
                return;
            }
        };

        if req.version <= self.prep.newest_committed_version {
            self.respond_prepare_result(
                &frame,
                &req.zone_id,
                req.version,
                PrepareStatus::Ignored,
                Some("request contains version older than newest committed version"),
            );
            return;
        }

        let active_version = self.prep.active.as_ref().map(|a| a.prep.version());
        if let Some(version) = active_version {
            if version >= req.version {
                self.respond_prepare_result(
                    &frame,
                    &req.zone_id,
                    req.version,
                    PrepareStatus::Ignored,
                    Some("request contains version older than active preparation"),
                );
                return;
            }
            // The new preparation supersedes the in-progress one.
            if let Some(active) = self.prep.active.take() {
                self.respond_prepare_result(
                    &active.src,
                    active.prep.zone_id(),
                    active.prep.version(),
                    PrepareStatus::Ignored,
                    Some("request supersedes a previous preparation"),
                );
            }
        }

        let cp = match ChecksPreparation::new(&req.zone_id, req.version, req.manifest) {
            Ok(cp) => cp,
            Err(e) => {
                self.respond_prepare_result(
                    &frame,
                    &req.zone_id,
                    req.version,
                    PrepareStatus::Failed,
                    Some(&e.to_string()),
                );
                return;
            }
        };

        if let Err(e) = self.reconciler.validate_checks(&cp) {
            self.respond_prepare_result(
                &frame,
                &req.zone_id,
                req.version,
                PrepareStatus::Failed,
                Some(&e.to_string()),
            );
            return;
        }

        self.prep.active = Some(ActivePrep {
            prep: cp,
            src: frame,
            deadline: Instant::now() + self.cfg.prepare_end_timeout,
            prepared: false,
        });
    }

    fn handle_poller_prepare_block(&mut self, frame: Frame) {
        let req: PollerPrepareBlockParams = match frame.decode_params() {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "undecodable poller prepare block");
                return;
            }
        };
        match &mut self.prep.active {
            Some(active) if active.prep.version_applies(req.version) && !active.prepared => {
                active.prep.add_definitions(req.block);
                active.deadline = Instant::now() + self.cfg.prepare_end_timeout;
            }
            _ => {
                warn!(
                    version = req.version,
                    "ignoring prepare block with no applicable preparation"
                );
            }
        }
    }

    fn handle_poller_prepare_end(&mut self, frame: Frame) {
        let req: PollerPrepareEndParams = match frame.decode_params() {
            Ok(req) => req,
            Err(_) => {
                // An unrecognized directive decodes as an error.
                match self.prep.active.take() {
                    Some(active) => self.respond_prepare_result(
                        &active.src,
                        active.prep.zone_id(),
                        active.prep.version(),
                        PrepareStatus::Failed,
                        Some("unexpected directive during poller prepare end"),
                    ),
                    None => self.respond_prepare_result(
                        &frame,
                        "",
                        0,
                        PrepareStatus::Failed,
                        Some("unexpected directive during poller prepare end"),
                    ),
                }
                return;
            }
        };

        match req.directive {
            PrepareDirective::Abort => match self.prep.active.take() {
                Some(active) => self.respond_prepare_result(
                    &active.src,
                    active.prep.zone_id(),
                    active.prep.version(),
                    PrepareStatus::Aborted,
                    Some("aborting poller prepare per request of the server"),
                ),
                None => self.respond_prepare_result(
                    &frame,
                    "",
                    req.version,
                    PrepareStatus::Aborted,
                    Some("aborting poller prepare per request of the server"),
                ),
            },
            PrepareDirective::Prepare => {
                let Some(active) = self.prep.active.as_mut() else {
                    self.respond_prepare_result(
                        &frame,
                        "",
                        req.version,
                        PrepareStatus::Failed,
                        Some("no active checks preparation"),
                    );
                    return;
                };
                if let Err(e) = active.prep.validate(req.version) {
                    let src = active.src.clone();
                    let zone_id = active.prep.zone_id().to_owned();
                    self.respond_prepare_result(
                        &src,
                        &zone_id,
                        req.version,
                        PrepareStatus::Failed,
                        Some(&e.to_string()),
                    );
                    return;
                }
                active.prepared = true;
                let src = active.src.clone();
                let zone_id = active.prep.zone_id().to_owned();
                debug!(zone = %zone_id, version = req.version, "responding to end of poller prepare");
                self.respond_prepare_result(&src, &zone_id, req.version, PrepareStatus::Prepared, None);
            }
        }
    }

    fn handle_poller_commit(&mut self, frame: Frame) {
        let req: PollerCommitParams = match frame.decode_params() {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "undecodable poller commit request");
                self.session
                    .respond(Frame::error_response_to(&frame, 1, "unable to decode commit request"));
                return;
            }
        };
        let applies = self
            .prep
            .active
            .as_ref()
            .map(|a| a.prep.version_applies(req.version))
            .unwrap_or(false);
        if !applies {
            self.respond_prepare_result(
                &frame,
                &req.zone_id,
                req.version,
                PrepareStatus::Ignored,
                Some("poller commit request specified non-applicable version"),
            );
            return;
        }
        self.respond_prepare_result(&frame, &req.zone_id, req.version, PrepareStatus::Committed, None);
        if let Some(active) = self.prep.active.take() {
            self.prep.newest_committed_version = active.prep.version();
            self.reconciler.reconcile_checks(active.prep);
        }
    }

    fn expire_prepare_timer(&mut self) {
        if let Some(active) = self.prep.active.take() {
            self.respond_prepare_result(
                &active.src,
                active.prep.zone_id(),
                active.prep.version(),
                PrepareStatus::Failed,
                Some("prepare-to-end timer expired"),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat driver
// ---------------------------------------------------------------------------

async fn run_heartbeats(
    session: Session,
    shared: Arc<SessionShared>,
    interval: Duration,
    mut resp_rx: mpsc::Receiver<(u64, HeartbeatResult)>,
    cancel: CancellationToken,
) {
    debug!("heartbeat starting");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                let timestamp = now_timestamp_millis();
                let mut frame = match Frame::request(
                    methods::HEARTBEAT_POST,
                    &HeartbeatParams { timestamp },
                ) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "unable to encode heartbeat");
                        continue;
                    }
                };
                frame.id = shared.next_id();
                if let Ok(mut m) = shared.heartbeat.lock() {
                    m.expected_seq_id = frame.id;
                    m.poller_send_ts = timestamp;
                }
                debug!(id = frame.id, "sending heartbeat");
                session.send(frame);
            }
            maybe = resp_rx.recv() => {
                let Some((id, result)) = maybe else { break };
                update_heartbeat_measurement(&shared, id, &result);
            }
        }
    }
    debug!("heartbeat exiting");
}

fn update_heartbeat_measurement(shared: &SessionShared, id: u64, result: &HeartbeatResult) {
    let Ok(mut m) = shared.heartbeat.lock() else {
        return;
    };
    if m.expected_seq_id != id {
        warn!(
            expected = m.expected_seq_id,
            received = id,
            "received out of sequence heartbeat response, unable to compute latency from it"
        );
        return;
    }
    let tracking = TimeLatencyTracking {
        poller_send: m.poller_send_ts,
        poller_recv: now_timestamp_millis(),
        server_recv: result.timestamp,
        server_resp: result.timestamp,
    };
    let (offset, latency) = tracking.compute_skew();
    m.observations += 1;
    m.offset = offset;
    m.latency = latency;
    debug!(offset, latency, "computed poller-server latencies");
}

// ---------------------------------------------------------------------------
// check_test
// ---------------------------------------------------------------------------

/// Runs a one-off check and responds with its metrics.
async fn handle_check_test(
    session: Session,
    frame: Frame,
    policy: ChecksPolicy,
    scope: CancellationToken,
) {
    let req: CheckTestParams = match frame.decode_params() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "unable to interpret the given check for testing");
            session.respond(Frame::error_response_to(
                &frame,
                1,
                "unable to interpret the given check for testing",
            ));
            return;
        }
    };

    let mut def = req.check;
    if def.check_id.is_empty() {
        def.check_id = format!("tch{:06}", rand::rng().random_range(0..=999_999u32));
    }

    let check = match Check::from_definition(&def, &policy, &scope) {
        Ok(check) => check,
        Err(e) => {
            warn!(error = %e, "unable to interpret the given check for testing");
            session.respond(Frame::error_response_to(
                &frame,
                1,
                "unable to interpret the given check for testing",
            ));
            return;
        }
    };

    match check.run().await {
        Ok(crs) => {
            let content = crs.to_post_params(0);
            match Frame::response_to(&frame, &content) {
                Ok(resp) => session.respond(resp),
                Err(e) => error!(error = %e, "unable to encode check test response"),
            }
        }
        Err(e) => {
            warn!(error = %e, "running test check failed");
            session.respond(Frame::error_response_to(&frame, 2, &e.to_string()));
        }
    }
}
