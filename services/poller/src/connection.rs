//! One endpoint connection: TCP dial, TLS negotiation, and the session on
//! top, tagged by the endpoint address.

use crate::preparation::ChecksReconciler;
use crate::session::{Session, SessionConfig};
use crate::tls::{TlsClient, TlsError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("dial {address}: {error}")]
    Dial { address: String, error: String },
    #[error("dial {0}: timed out")]
    DialTimeout(String),
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// An established connection and its session.
pub struct Connection {
    address: String,
    session: Session,
}

impl Connection {
    /// Dial the endpoint, negotiate TLS, and start the session (which sends
    /// the handshake immediately).
    pub async fn establish(
        address: &str,
        tls: &TlsClient,
        session_cfg: SessionConfig,
        dial_timeout: Duration,
        reconciler: Arc<dyn ChecksReconciler>,
        parent: &CancellationToken,
    ) -> Result<Connection, ConnectError> {
        // Server name for TLS verification is the endpoint host.
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address)
            .to_owned();

        debug!(address, "dialing");
        let tcp = timeout(dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ConnectError::DialTimeout(address.to_owned()))?
            .map_err(|e| ConnectError::Dial {
                address: address.to_owned(),
                error: e.to_string(),
            })?;
        let stream = tls.connect(&host, tcp).await?;

        let session = Session::start(stream, session_cfg, reconciler, parent);
        Ok(Connection {
            address: address.to_owned(),
            session,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn has_measurements(&self) -> bool {
        self.session.has_measurements()
    }

    /// Measured one-way latency in milliseconds.
    pub fn latency(&self) -> i64 {
        self.session.latency()
    }

    /// Estimated server-minus-poller clock offset in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        self.session.clock_offset()
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub async fn wait_terminated(&self) {
        self.session.wait_terminated().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::test_support::loose_policy;
    use crate::preparation::{ChecksPreparation, ValidationError};

    struct NullReconciler;

    impl ChecksReconciler for NullReconciler {
        fn validate_checks(&self, _cp: &ChecksPreparation) -> Result<(), ValidationError> {
            Ok(())
        }
        fn reconcile_checks(&self, _cp: ChecksPreparation) {}
    }

    fn session_cfg() -> SessionConfig {
        SessionConfig {
            agent_id: "agent-test".to_owned(),
            agent_name: "zone-poller".to_owned(),
            token: "tkn".to_owned(),
            process_version: "0.0.0-test".to_owned(),
            features: vec![],
            auth_timeout: Duration::from_secs(2),
            prepare_end_timeout: Duration::from_secs(1),
            read_slack: Duration::from_secs(2),
            write_slack: Duration::from_secs(2),
            checks_policy: loose_policy(),
        }
    }

    #[tokio::test]
    async fn refused_dial_is_a_dial_error() {
        let result = Connection::establish(
            "127.0.0.1:1",
            &TlsClient::Cleartext,
            session_cfg(),
            Duration::from_secs(1),
            Arc::new(NullReconciler),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ConnectError::Dial { .. })));
    }

    #[tokio::test]
    async fn unanswered_dial_does_not_hang() {
        // RFC 5737 TEST-NET address: either times out against the dial
        // deadline or fails fast with no route, depending on the host.
        let result = Connection::establish(
            "192.0.2.1:50041",
            &TlsClient::Cleartext,
            session_cfg(),
            Duration::from_millis(200),
            Arc::new(NullReconciler),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
