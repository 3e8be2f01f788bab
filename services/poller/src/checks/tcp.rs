//! TCP connect check (`remote.tcp`).

use super::{CheckBase, CheckError, CheckResult, Metric, MetricValue, ResultSet};
use serde::Deserialize;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TcpDetails {
    host: String,
    port: u16,
}

/// Connects to `host:port` within the check timeout and reports the connect
/// duration.  Refused or timed-out connects yield an unavailable result set.
#[derive(Debug)]
pub struct TcpCheck {
    details: TcpDetails,
}

impl TcpCheck {
    pub(super) fn parse(details: &serde_json::Value) -> Result<TcpCheck, CheckError> {
        let details: TcpDetails = serde_json::from_value(details.clone())?;
        Ok(TcpCheck { details })
    }

    pub(super) async fn run(&self, base: &CheckBase) -> Result<ResultSet, CheckError> {
        debug!(
            check_id = %base.check_id,
            host = %self.details.host,
            port = self.details.port,
            "running tcp check"
        );

        let mut crs = ResultSet::new(base);
        let target = (self.details.host.as_str(), self.details.port);
        let start = Instant::now();

        match timeout(base.timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                let duration_ms = start.elapsed().as_millis() as i64;
                let mut result = CheckResult::new();
                result.add_metric(Metric::new(
                    "duration",
                    MetricValue::Int(duration_ms),
                    Some("milliseconds"),
                ));
                result.add_metric(Metric::new("connected", MetricValue::Bool(true), None));
                crs.add_result(result);
                crs.set_available();
                crs.set_status("success");
            }
            Ok(Err(e)) => {
                crs.set_unavailable();
                crs.set_status(&format!("connection failed: {}", e));
            }
            Err(_) => {
                crs.set_unavailable();
                crs.set_status("connection timed out");
            }
        }

        Ok(crs)
    }
}

#[cfg(test)]
mod tests {
    use crate::checks::test_support::{loose_policy, tcp_definition};
    use crate::checks::Check;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn connect_to_listening_socket_is_available() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("local_addr").port();

        let def = tcp_definition("ch-tcp", "zn1", "127.0.0.1", port);
        let check = Check::from_definition(&def, &loose_policy(), &CancellationToken::new())
            .expect("parse");

        let crs = check.run().await.expect("run");
        assert!(crs.available);
        assert_eq!(crs.status, "success");
        let metrics = crs.results()[0].metrics();
        assert!(metrics.iter().any(|m| m.name == "duration"));
        assert!(metrics.iter().any(|m| m.name == "connected"));
    }

    #[tokio::test]
    async fn refused_connect_is_unavailable_not_an_error() {
        // Port 1 on loopback is almost certainly closed.
        let def = tcp_definition("ch-tcp", "zn1", "127.0.0.1", 1);
        let check = Check::from_definition(&def, &loose_policy(), &CancellationToken::new())
            .expect("parse");

        let crs = check.run().await.expect("run must not error");
        assert!(!crs.available);
        assert!(!crs.status.is_empty());
        assert!(crs.results().is_empty());
    }

    #[tokio::test]
    async fn malformed_details_fail_parsing() {
        let mut def = tcp_definition("ch-tcp", "zn1", "127.0.0.1", 1);
        def.details = serde_json::json!({ "host": "127.0.0.1" }); // port missing
        assert!(Check::from_definition(&def, &loose_policy(), &CancellationToken::new()).is_err());
    }
}
