//! Poller configuration loading.
//!
//! TOML is the sole config source.  Default config path:
//! `/etc/zone-poller/poller.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `zones` with at least one zone id
//! - `auth.token_file`
//! - `endpoints.addresses` (or `endpoints.srv_queries` when `use_srv = true`)
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use zp_protocol::Feature;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level poller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    /// Unique agent identifier; a v4 GUID is generated when absent.
    pub agent_id: String,
    /// Human-readable agent name sent in the handshake.
    pub agent_name: String,
    /// The bearer token (read from the token file, not the file path).
    pub token: String,
    /// Zones this poller serves; one scheduler per zone.
    pub zones: Vec<String>,
    pub endpoints: EndpointsConfig,
    pub timeouts: TimeoutsConfig,
    pub tls: TlsSettings,
    pub checks: ChecksPolicy,
    /// Feature flags advertised during the handshake.
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone)]
pub struct EndpointsConfig {
    /// When true, `srv_queries` are resolved via SRV lookups; otherwise
    /// `addresses` are dialed literally.
    pub use_srv: bool,
    pub srv_queries: Vec<String>,
    pub addresses: Vec<String>,
}

/// All durations are configured in seconds.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutsConfig {
    pub auth: Duration,
    pub prepare_end: Duration,
    /// Added to the heartbeat interval to form the read deadline.
    pub read_slack: Duration,
    /// Added to the heartbeat interval to form the write deadline.
    pub write_slack: Duration,
    pub dial: Duration,
    /// Fixed delay between reconnection attempts per endpoint.
    pub reconnect: Duration,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// PEM bundle of root CAs; overridden by `POLLER_DEV_CA` when set.
    pub ca_file: Option<String>,
    /// Skip certificate verification (explicit dev mode).
    pub insecure: bool,
    /// Skip TLS entirely and dial plain TCP (test/dev harnesses only).
    pub cleartext: bool,
}

/// Bounds applied when parsing check definitions, plus the start jitter.
#[derive(Debug, Clone, Copy)]
pub struct ChecksPolicy {
    pub period_min: Duration,
    pub period_max: Duration,
    /// Upper bound of the uniform start jitter, in milliseconds.
    pub spread_ms: u64,
}

impl Default for ChecksPolicy {
    fn default() -> Self {
        ChecksPolicy {
            period_min: Duration::from_secs(30),
            period_max: Duration::from_secs(1800),
            spread_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    agent_id: Option<String>,
    agent_name: Option<String>,
    zones: Option<Vec<String>>,
    auth: Option<RawAuthConfig>,
    endpoints: Option<RawEndpointsConfig>,
    timeouts: Option<RawTimeoutsConfig>,
    tls: Option<RawTlsConfig>,
    checks: Option<RawChecksConfig>,
    features: Option<Vec<RawFeature>>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointsConfig {
    use_srv: Option<bool>,
    srv_queries: Option<Vec<String>>,
    addresses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawTimeoutsConfig {
    auth_secs: Option<u64>,
    prepare_end_secs: Option<u64>,
    read_slack_secs: Option<u64>,
    write_slack_secs: Option<u64>,
    dial_secs: Option<u64>,
    reconnect_secs: Option<u64>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTlsConfig {
    ca_file: Option<String>,
    insecure: Option<bool>,
    cleartext: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawChecksConfig {
    period_min_secs: Option<u64>,
    period_max_secs: Option<u64>,
    spread_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    name: Option<String>,
    disabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load poller config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load poller config from the default path `/etc/zone-poller/poller.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/zone-poller/poller.toml"))
}

/// Load poller config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    // Agent identity: generate a GUID when none is configured
    let agent_id = match raw.agent_id {
        Some(id) if !id.is_empty() => id,
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let agent_name = raw.agent_name.unwrap_or_else(|| "zone-poller".to_owned());

    // Validate zones
    let zones = raw
        .zones
        .ok_or_else(|| ConfigError::MissingField("zones".to_owned()))?;
    if zones.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one zone id is required".to_owned(),
        ));
    }

    // Validate auth + read token file
    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let token_file_path = raw_auth
        .token_file
        .ok_or_else(|| ConfigError::MissingField("auth.token_file".to_owned()))?;
    let token = read_token_file(&token_file_path)?;

    // Validate endpoints
    let raw_endpoints = raw
        .endpoints
        .ok_or_else(|| ConfigError::MissingField("endpoints".to_owned()))?;
    let use_srv = raw_endpoints.use_srv.unwrap_or(false);
    let srv_queries = raw_endpoints.srv_queries.unwrap_or_default();
    let addresses = raw_endpoints.addresses.unwrap_or_default();
    if use_srv && srv_queries.is_empty() {
        return Err(ConfigError::InvalidValue(
            "endpoints.use_srv requires at least one entry in endpoints.srv_queries".to_owned(),
        ));
    }
    if !use_srv && addresses.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one entry in endpoints.addresses is required".to_owned(),
        ));
    }

    // Timeout defaults
    let raw_timeouts = raw.timeouts;
    let secs = |v: Option<u64>, default: u64| Duration::from_secs(v.unwrap_or(default));
    let timeouts = TimeoutsConfig {
        auth: secs(raw_timeouts.as_ref().and_then(|t| t.auth_secs), 30),
        prepare_end: secs(raw_timeouts.as_ref().and_then(|t| t.prepare_end_secs), 60),
        read_slack: secs(raw_timeouts.as_ref().and_then(|t| t.read_slack_secs), 20),
        write_slack: secs(raw_timeouts.as_ref().and_then(|t| t.write_slack_secs), 10),
        dial: secs(raw_timeouts.as_ref().and_then(|t| t.dial_secs), 15),
        reconnect: secs(raw_timeouts.as_ref().and_then(|t| t.reconnect_secs), 25),
        graceful_shutdown: secs(
            raw_timeouts.as_ref().and_then(|t| t.graceful_shutdown_secs),
            5,
        ),
    };

    // TLS defaults
    let tls = match raw.tls {
        Some(t) => TlsSettings {
            ca_file: t.ca_file,
            insecure: t.insecure.unwrap_or(false),
            cleartext: t.cleartext.unwrap_or(false),
        },
        None => TlsSettings {
            ca_file: None,
            insecure: false,
            cleartext: false,
        },
    };

    // Checks policy defaults
    let defaults = ChecksPolicy::default();
    let checks = match raw.checks {
        Some(c) => ChecksPolicy {
            period_min: c
                .period_min_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.period_min),
            period_max: c
                .period_max_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.period_max),
            spread_ms: c.spread_ms.unwrap_or(defaults.spread_ms),
        },
        None => defaults,
    };
    if checks.period_min > checks.period_max {
        return Err(ConfigError::InvalidValue(format!(
            "checks.period_min_secs ({:?}) exceeds checks.period_max_secs ({:?})",
            checks.period_min, checks.period_max
        )));
    }

    // Feature flags
    let mut features = vec![Feature {
        name: "poller".to_owned(),
        disabled: false,
    }];
    for (i, f) in raw.features.unwrap_or_default().into_iter().enumerate() {
        let name = f
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("features[{}].name", i)))?;
        features.push(Feature {
            name,
            disabled: f.disabled.unwrap_or(false),
        });
    }

    Ok(Config {
        schema_version,
        agent_id,
        agent_name,
        token,
        zones,
        endpoints: EndpointsConfig {
            use_srv,
            srv_queries,
            addresses,
        },
        timeouts,
        tls,
        checks,
        features,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", path, e)))?;
    let token = content.trim().to_owned();
    if token.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "token file '{}' is empty",
            path
        )));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_token_file(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("token");
        let mut f = std::fs::File::create(&path).expect("create token file");
        writeln!(f, "tkn-secret  ").expect("write token");
        path.display().to_string()
    }

    fn minimal_toml(token_file: &str) -> String {
        format!(
            r#"
schema_version = 1
zones = ["zn1"]

[auth]
token_file = "{token_file}"

[endpoints]
addresses = ["ep.example.com:50041"]
"#
        )
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let cfg = load_config_from_str(&minimal_toml(&token_file)).expect("load");

        assert_eq!(cfg.token, "tkn-secret");
        assert_eq!(cfg.zones, vec!["zn1".to_owned()]);
        assert!(!cfg.endpoints.use_srv);
        assert_eq!(cfg.timeouts.auth, Duration::from_secs(30));
        assert_eq!(cfg.timeouts.reconnect, Duration::from_secs(25));
        assert_eq!(cfg.checks.period_min, Duration::from_secs(30));
        assert!(!cfg.tls.insecure);
        // generated GUID parses as a UUID
        uuid::Uuid::parse_str(&cfg.agent_id).expect("generated agent id");
        // the implicit poller feature is always advertised
        assert_eq!(cfg.features[0].name, "poller");
    }

    #[test]
    fn explicit_agent_id_is_preserved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let toml = format!(
            "agent_id = \"agent-007\"\n{}",
            minimal_toml(&token_file)
        );
        let cfg = load_config_from_str(&toml).expect("load");
        assert_eq!(cfg.agent_id, "agent-007");
    }

    #[test]
    fn srv_mode_requires_queries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let toml = format!(
            r#"
schema_version = 1
zones = ["zn1"]

[auth]
token_file = "{token_file}"

[endpoints]
use_srv = true
"#
        );
        match load_config_from_str(&toml) {
            Err(ConfigError::InvalidValue(msg)) => assert!(msg.contains("srv_queries")),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("zones = [\"zn1\"]").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn empty_zone_list_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let toml = format!(
            r#"
schema_version = 1
zones = []

[auth]
token_file = "{token_file}"

[endpoints]
addresses = ["ep:1"]
"#
        );
        assert!(matches!(
            load_config_from_str(&toml),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn timeouts_and_checks_policy_are_overridable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let toml = format!(
            r#"
schema_version = 1
zones = ["zn1"]

[auth]
token_file = "{token_file}"

[endpoints]
addresses = ["ep:1"]

[timeouts]
auth_secs = 5
prepare_end_secs = 7

[checks]
period_min_secs = 1
spread_ms = 10
"#
        );
        let cfg = load_config_from_str(&toml).expect("load");
        assert_eq!(cfg.timeouts.auth, Duration::from_secs(5));
        assert_eq!(cfg.timeouts.prepare_end, Duration::from_secs(7));
        assert_eq!(cfg.checks.period_min, Duration::from_secs(1));
        assert_eq!(cfg.checks.spread_ms, 10);
    }

    #[test]
    fn inverted_period_bounds_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let token_file = write_token_file(&dir);
        let toml = format!(
            r#"
schema_version = 1
zones = ["zn1"]

[auth]
token_file = "{token_file}"

[endpoints]
addresses = ["ep:1"]

[checks]
period_min_secs = 100
period_max_secs = 50
"#
        );
        assert!(matches!(
            load_config_from_str(&toml),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn missing_token_file_is_an_io_error() {
        let toml = r#"
schema_version = 1
zones = ["zn1"]

[auth]
token_file = "/nonexistent/token"

[endpoints]
addresses = ["ep:1"]
"#;
        assert!(matches!(
            load_config_from_str(toml),
            Err(ConfigError::Io(_))
        ));
    }
}
