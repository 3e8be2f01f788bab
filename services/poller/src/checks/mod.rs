//! Check capability: the contract every check type satisfies, the tagged
//! factory over the closed type set, and the result-set model carried to the
//! metrics pipeline.

use crate::config::ChecksPolicy;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use zp_protocol::{
    now_timestamp_millis, AvailabilityState, CheckDefinition, CheckMetricsPostParams,
    MetricPayload,
};

pub mod http;
pub mod tcp;

pub use http::HttpCheck;
pub use tcp::TcpCheck;

pub const CHECK_TYPE_TCP: &str = "remote.tcp";
pub const CHECK_TYPE_HTTP: &str = "remote.http";

// ---------------------------------------------------------------------------
// Metric model
// ---------------------------------------------------------------------------

/// A single typed metric value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl MetricValue {
    /// The wire name of the value type.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::String(_) => "string",
            MetricValue::Bool(_) => "bool",
            MetricValue::Int(_) => "int64",
            MetricValue::Float(_) => "double",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            MetricValue::String(s) => serde_json::Value::String(s.clone()),
            MetricValue::Bool(b) => serde_json::Value::Bool(*b),
            MetricValue::Int(i) => serde_json::Value::from(*i),
            MetricValue::Float(f) => serde_json::Value::from(*f),
        }
    }
}

/// A named metric with an optional unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub unit: Option<String>,
    pub value: MetricValue,
}

impl Metric {
    pub fn new(name: &str, value: MetricValue, unit: Option<&str>) -> Metric {
        Metric {
            name: name.to_owned(),
            unit: unit.map(str::to_owned),
            value,
        }
    }
}

/// One result of a check execution (a bag of metrics).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    metrics: Vec<Metric>,
}

impl CheckResult {
    pub fn new() -> CheckResult {
        CheckResult::default()
    }

    pub fn add_metric(&mut self, metric: Metric) {
        self.metrics.push(metric);
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }
}

/// The bundle a check produces per execution: one or more results plus the
/// overall availability state and a status string.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub check_id: String,
    pub entity_id: String,
    pub zone_id: String,
    pub check_type: String,
    pub available: bool,
    pub status: String,
    pub timestamp: i64,
    results: Vec<CheckResult>,
}

impl ResultSet {
    pub fn new(base: &CheckBase) -> ResultSet {
        ResultSet {
            check_id: base.check_id.clone(),
            entity_id: base.entity_id.clone(),
            zone_id: base.zone_id.clone(),
            check_type: base.check_type.clone(),
            available: false,
            status: String::new(),
            timestamp: now_timestamp_millis(),
            results: Vec::new(),
        }
    }

    pub fn set_available(&mut self) {
        self.available = true;
    }

    pub fn set_unavailable(&mut self) {
        self.available = false;
    }

    pub fn set_status(&mut self, status: &str) {
        self.status = status.to_owned();
    }

    pub fn add_result(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    /// Build the `check_metrics.post_multi` payload, shifting the timestamp
    /// by the sending connection's clock offset so the server sees its own
    /// timeline.
    pub fn to_post_params(&self, clock_offset_ms: i64) -> CheckMetricsPostParams {
        let metrics = self
            .results
            .iter()
            .flat_map(|r| r.metrics.iter())
            .map(|m| MetricPayload {
                name: m.name.clone(),
                metric_type: m.value.type_name().to_owned(),
                unit: m.unit.clone(),
                value: m.value.to_json(),
            })
            .collect();
        CheckMetricsPostParams {
            zone_id: self.zone_id.clone(),
            entity_id: self.entity_id.clone(),
            check_id: self.check_id.clone(),
            check_type: self.check_type.clone(),
            state: if self.available {
                AvailabilityState::Available
            } else {
                AvailabilityState::Unavailable
            },
            status: self.status.clone(),
            timestamp: self.timestamp + clock_offset_ms,
            metrics,
        }
    }
}

/// Downstream consumer of result sets (implemented by the connection stream).
pub trait MetricsSink: Send + Sync {
    fn send_metrics(&self, crs: &ResultSet) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("no connections available")]
    NoConnections,
    #[error("send queue rejected the frame: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Check capability
// ---------------------------------------------------------------------------

/// Fields common to all check types, parsed out of the definition.
#[derive(Debug)]
pub struct CheckBase {
    pub check_id: String,
    pub entity_id: String,
    pub zone_id: String,
    pub check_type: String,
    pub period: Duration,
    pub timeout: Duration,
    pub disabled: bool,
    cancel: CancellationToken,
}

/// A parsed, runnable check.  Construction goes through
/// [`Check::from_definition`]; unknown types are a recognized error.
#[derive(Debug)]
pub struct Check {
    base: CheckBase,
    kind: CheckKind,
}

#[derive(Debug)]
enum CheckKind {
    Tcp(TcpCheck),
    Http(HttpCheck),
}

impl Check {
    /// Parse a definition into a runnable check.
    ///
    /// The check's cancellation token is a child of `parent`, so cancelling
    /// the owning scope unwinds the check's driver as well.
    pub fn from_definition(
        def: &CheckDefinition,
        policy: &ChecksPolicy,
        parent: &CancellationToken,
    ) -> Result<Check, CheckError> {
        if def.check_id.is_empty() {
            return Err(CheckError::MissingId);
        }
        let period = Duration::from_secs(def.period);
        if period < policy.period_min || period > policy.period_max {
            return Err(CheckError::PeriodOutOfBounds {
                check_id: def.check_id.clone(),
                period_secs: def.period,
            });
        }
        let timeout = Duration::from_secs(def.timeout);
        if timeout > period {
            return Err(CheckError::TimeoutExceedsPeriod {
                check_id: def.check_id.clone(),
                timeout_secs: def.timeout,
                period_secs: def.period,
            });
        }

        let base = CheckBase {
            check_id: def.check_id.clone(),
            entity_id: def.entity_id.clone(),
            zone_id: def.zone_id.clone(),
            check_type: def.check_type.clone(),
            period,
            timeout,
            disabled: def.disabled,
            cancel: parent.child_token(),
        };

        let kind = match def.check_type.as_str() {
            CHECK_TYPE_TCP => CheckKind::Tcp(TcpCheck::parse(&def.details)?),
            CHECK_TYPE_HTTP => CheckKind::Http(HttpCheck::parse(&def.details)?),
            other => return Err(CheckError::UnknownType(other.to_owned())),
        };

        Ok(Check { base, kind })
    }

    pub fn id(&self) -> &str {
        &self.base.check_id
    }

    pub fn entity_id(&self) -> &str {
        &self.base.entity_id
    }

    pub fn zone_id(&self) -> &str {
        &self.base.zone_id
    }

    pub fn check_type(&self) -> &str {
        &self.base.check_type
    }

    pub fn period(&self) -> Duration {
        self.base.period
    }

    /// Delay between executions; currently the plain period.
    pub fn wait_period(&self) -> Duration {
        self.base.period
    }

    pub fn is_disabled(&self) -> bool {
        self.base.disabled
    }

    /// Resolves when the check has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.base.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.base.cancel.is_cancelled()
    }

    /// Cancel this check's driver.
    pub fn cancel(&self) {
        self.base.cancel.cancel();
    }

    /// Execute the check once.
    ///
    /// Target-level failures (unreachable, timeout) come back as an
    /// `unavailable` result set with a status string, not as an error.
    pub async fn run(&self) -> Result<ResultSet, CheckError> {
        match &self.kind {
            CheckKind::Tcp(tcp) => tcp.run(&self.base).await,
            CheckKind::Http(http) => http.run(&self.base).await,
        }
    }
}

/// Failure to parse or execute a check.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("check definition has no id")]
    MissingId,
    #[error("unknown check type: {0}")]
    UnknownType(String),
    #[error("check {check_id}: period {period_secs}s outside configured bounds")]
    PeriodOutOfBounds { check_id: String, period_secs: u64 },
    #[error("check {check_id}: timeout {timeout_secs}s exceeds period {period_secs}s")]
    TimeoutExceedsPeriod {
        check_id: String,
        timeout_secs: u64,
        period_secs: u64,
    },
    #[error("invalid check details: {0}")]
    InvalidDetails(#[from] serde_json::Error),
    #[error("http client: {0}")]
    HttpClient(String),
}
