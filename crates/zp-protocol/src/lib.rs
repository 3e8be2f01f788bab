// zp-protocol: Zone poller wire protocol types and serialization.
//
// Every frame on the wire is a single JSON object terminated by CRLF,
// carrying the envelope {v, id, source, target, method?, params?, result?,
// error?}.  Payloads stay as raw JSON in the envelope and are decoded by the
// handler selected via `method`.

use serde::{Deserialize, Serialize};

pub mod codec;

/// Envelope protocol version carried in every frame's `v` field.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

/// Frozen method names of the poller protocol.
pub mod methods {
    /// poller -> server: authenticate; result carries the heartbeat interval.
    pub const HANDSHAKE_HELLO: &str = "handshake.hello";
    /// poller -> server: liveness + clock-skew probe.
    pub const HEARTBEAT_POST: &str = "heartbeat.post";
    /// poller -> server: deliver a check result set.
    pub const CHECK_METRICS_POST_MULTI: &str = "check_metrics.post_multi";
    /// server -> poller: request host facts.
    pub const HOST_INFO_GET: &str = "host_info.get";
    /// server -> poller: run a one-off check and respond with its metrics.
    pub const CHECK_TEST: &str = "check_test";
    /// server -> poller: begin a check-set preparation with a manifest.
    pub const POLLER_PREPARE: &str = "poller.prepare";
    /// server -> poller: deliver check definitions for the active preparation.
    pub const POLLER_PREPARE_BLOCK: &str = "poller.prepare.block";
    /// server -> poller: finish the preparation (`prepare` or `abort`).
    pub const POLLER_PREPARE_END: &str = "poller.prepare.end";
    /// server -> poller: make the prepared version live.
    pub const POLLER_COMMIT: &str = "poller.commit";
}

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// Error payload of a failed response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorField {
    pub code: i64,
    pub message: String,
}

/// The wire envelope.
///
/// A frame is either a *request* (`method` present, `id` allocated by the
/// sender) or a *response* (`method` absent, `id` echoing the request it
/// answers).  `params`/`result` are carried undecoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub v: u32,
    pub id: u64,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorField>,
}

impl Frame {
    /// Build a request frame with `id` left at 0 for the session to allocate.
    ///
    /// Source and target are likewise stamped by the session at send time.
    pub fn request<P: Serialize>(method: &str, params: &P) -> Result<Frame, serde_json::Error> {
        Ok(Frame {
            v: PROTOCOL_VERSION,
            id: 0,
            source: String::new(),
            target: String::new(),
            method: Some(method.to_owned()),
            params: Some(serde_json::to_value(params)?),
            result: None,
            error: None,
        })
    }

    /// Build a success response echoing the request's id.
    pub fn response_to<R: Serialize>(req: &Frame, result: &R) -> Result<Frame, serde_json::Error> {
        Ok(Frame {
            v: PROTOCOL_VERSION,
            id: req.id,
            source: String::new(),
            target: String::new(),
            method: None,
            params: None,
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Build an error response echoing the request's id.
    pub fn error_response_to(req: &Frame, code: i64, message: &str) -> Frame {
        Frame {
            v: PROTOCOL_VERSION,
            id: req.id,
            source: String::new(),
            target: String::new(),
            method: None,
            params: None,
            result: None,
            error: Some(ErrorField {
                code,
                message: message.to_owned(),
            }),
        }
    }

    /// True when the frame carries a method (a request).
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Decode the `params` payload into a typed struct.
    pub fn decode_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        match &self.params {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(PayloadError::Missing("params")),
        }
    }

    /// Decode the `result` payload into a typed struct.
    pub fn decode_result<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        match &self.result {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(PayloadError::Missing("result")),
        }
    }
}

/// Failure to decode a frame payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("frame has no {0} payload")]
    Missing(&'static str),
    #[error("payload decode: {0}")]
    Decode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Handshake and heartbeat payloads
// ---------------------------------------------------------------------------

/// A named feature flag advertised during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub disabled: bool,
}

/// `handshake.hello` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub token: String,
    pub agent_id: String,
    pub agent_name: String,
    pub process_version: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// `handshake.hello` result.  `heartbeat_interval` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub heartbeat_interval: u64,
}

/// `heartbeat.post` params; `timestamp` is poller epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatParams {
    pub timestamp: i64,
}

/// `heartbeat.post` result; `timestamp` is server epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Prepare / commit payloads
// ---------------------------------------------------------------------------

/// Action requested for one check in a preparation manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareAction {
    Start,
    Restart,
    Continue,
    End,
}

/// One entry of a preparation manifest.
///
/// `continue` entries never carry a definition body; `start` and `restart`
/// entries expect a matching definition in a later prepare block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub action: PrepareAction,
    pub zone_id: String,
    pub entity_id: String,
    pub check_id: String,
    pub check_type: String,
}

/// A full check definition delivered in a prepare block (or `check_test`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDefinition {
    /// May be empty on `check_test` requests for not-yet-created checks.
    #[serde(default)]
    pub check_id: String,
    pub entity_id: String,
    pub zone_id: String,
    pub check_type: String,
    /// Seconds between executions.
    pub period: u64,
    /// Seconds allowed for a single execution; must not exceed `period`.
    pub timeout: u64,
    #[serde(default)]
    pub disabled: bool,
    /// Type-specific details, decoded by the check factory.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// `poller.prepare` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerPrepareParams {
    pub zone_id: String,
    pub version: u64,
    pub manifest: Vec<ManifestEntry>,
}

/// `poller.prepare.block` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerPrepareBlockParams {
    pub zone_id: String,
    pub version: u64,
    pub block: Vec<CheckDefinition>,
}

/// Directive carried by `poller.prepare.end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareDirective {
    Prepare,
    Abort,
}

/// `poller.prepare.end` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerPrepareEndParams {
    pub version: u64,
    pub directive: PrepareDirective,
}

/// `poller.commit` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerCommitParams {
    pub zone_id: String,
    pub version: u64,
}

/// Status reported in prepare/commit responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareStatus {
    Prepared,
    Committed,
    Ignored,
    Aborted,
    Failed,
}

/// Result payload of every prepare-family and commit response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResult {
    pub zone_id: String,
    pub version: u64,
    pub status: PrepareStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ---------------------------------------------------------------------------
// Metrics payloads
// ---------------------------------------------------------------------------

/// Overall availability of the checked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    Available,
    Unavailable,
}

/// One named metric inside a metrics post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub name: String,
    /// One of "string", "bool", "int64", "double".
    #[serde(rename = "type")]
    pub metric_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub value: serde_json::Value,
}

/// `check_metrics.post_multi` params (also the `check_test` result body).
///
/// `timestamp` is poller epoch milliseconds adjusted by the sending
/// connection's clock offset so the server sees its own timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckMetricsPostParams {
    pub zone_id: String,
    pub entity_id: String,
    pub check_id: String,
    pub check_type: String,
    pub state: AvailabilityState,
    pub status: String,
    pub timestamp: i64,
    pub metrics: Vec<MetricPayload>,
}

// ---------------------------------------------------------------------------
// Host info payloads
// ---------------------------------------------------------------------------

/// `host_info.get` params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfoParams {
    /// Requested fact groups; an empty list means everything.
    #[serde(default)]
    pub types: Vec<String>,
}

/// `host_info.get` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfoResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub os: String,
    pub arch: String,
    pub cpus: u32,
    pub pid: u32,
    pub process_version: String,
    pub timestamp: i64,
}

/// `check_test` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckTestParams {
    pub check: CheckDefinition,
}

// ---------------------------------------------------------------------------
// Time helper
// ---------------------------------------------------------------------------

/// Current wall-clock time as epoch milliseconds.
pub fn now_timestamp_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_carry_method_and_zero_id() {
        let frame = Frame::request(
            methods::HEARTBEAT_POST,
            &HeartbeatParams { timestamp: 12345 },
        )
        .unwrap();
        assert!(frame.is_request());
        assert_eq!(frame.id, 0);
        assert_eq!(frame.v, PROTOCOL_VERSION);
        let params: HeartbeatParams = frame.decode_params().unwrap();
        assert_eq!(params.timestamp, 12345);
    }

    #[test]
    fn responses_echo_the_request_id_without_method() {
        let mut req = Frame::request(methods::POLLER_COMMIT, &serde_json::json!({})).unwrap();
        req.id = 77;
        let resp = Frame::response_to(
            &req,
            &PrepareResult {
                zone_id: "zn1".to_owned(),
                version: 4,
                status: PrepareStatus::Committed,
                details: None,
            },
        )
        .unwrap();
        assert!(!resp.is_request());
        assert_eq!(resp.id, 77);
        let result: PrepareResult = resp.decode_result().unwrap();
        assert_eq!(result.status, PrepareStatus::Committed);
    }

    #[test]
    fn manifest_actions_use_snake_case_strings() {
        let entry = ManifestEntry {
            action: PrepareAction::Continue,
            zone_id: "zn1".to_owned(),
            entity_id: "en1".to_owned(),
            check_id: "ch1".to_owned(),
            check_type: "remote.tcp".to_owned(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "continue");

        let bogus = serde_json::json!({
            "action": "BOGUS ACTION",
            "zone_id": "zn1",
            "entity_id": "en1",
            "check_id": "ch1",
            "check_type": "remote.tcp",
        });
        assert!(serde_json::from_value::<ManifestEntry>(bogus).is_err());
    }

    #[test]
    fn prepare_statuses_serialize_to_protocol_strings() {
        for (status, expected) in [
            (PrepareStatus::Prepared, "prepared"),
            (PrepareStatus::Committed, "committed"),
            (PrepareStatus::Ignored, "ignored"),
            (PrepareStatus::Aborted, "aborted"),
            (PrepareStatus::Failed, "failed"),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), expected);
        }
    }

    #[test]
    fn check_definition_tolerates_missing_id_and_details() {
        let json = serde_json::json!({
            "entity_id": "en1",
            "zone_id": "zn1",
            "check_type": "remote.tcp",
            "period": 60,
            "timeout": 15,
        });
        let def: CheckDefinition = serde_json::from_value(json).unwrap();
        assert!(def.check_id.is_empty());
        assert!(!def.disabled);
        assert!(def.details.is_null());
    }
}
