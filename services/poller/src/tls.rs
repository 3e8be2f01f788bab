//! TLS client setup for endpoint connections.
//!
//! Roots come from the configured CA file, overridden by the `POLLER_DEV_CA`
//! environment variable when present.  `insecure = true` installs a verifier
//! that accepts any certificate (explicit dev mode).  `cleartext = true`
//! skips TLS entirely for test and dev harnesses.

use crate::config::TlsSettings;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;

/// Environment variable that overrides the configured CA bundle.
pub const DEV_CA_ENV: &str = "POLLER_DEV_CA";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no CA roots configured; set tls.ca_file, {DEV_CA_ENV}, or tls.insecure")]
    NoRoots,
    #[error("reading CA bundle '{path}': {error}")]
    CaRead { path: String, error: String },
    #[error("CA bundle '{0}' contains no usable certificates")]
    EmptyCaBundle(String),
    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
    #[error("tls handshake: {0}")]
    Handshake(String),
}

/// How the stream dials endpoints.
pub enum TlsClient {
    /// Plain TCP, no TLS.
    Cleartext,
    Secure(TlsConnector),
}

impl TlsClient {
    /// Build the client from the TLS settings, honoring the dev-CA override.
    pub fn build(settings: &TlsSettings) -> Result<TlsClient, TlsError> {
        if settings.cleartext {
            return Ok(TlsClient::Cleartext);
        }

        let ca_path = std::env::var(DEV_CA_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| settings.ca_file.clone());

        let config = match ca_path {
            Some(path) => {
                let roots = load_root_store(&path)?;
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            None if settings.insecure => {
                let mut config = rustls::ClientConfig::builder()
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(NoVerification::new()));
                config
            }
            None => return Err(TlsError::NoRoots),
        };

        Ok(TlsClient::Secure(TlsConnector::from(Arc::new(config))))
    }

    /// Wrap an established TCP stream, negotiating TLS unless cleartext.
    pub async fn connect(&self, host: &str, tcp: TcpStream) -> Result<PollerStream, TlsError> {
        match self {
            TlsClient::Cleartext => Ok(PollerStream::Cleartext(tcp)),
            TlsClient::Secure(connector) => {
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|_| TlsError::InvalidServerName(host.to_owned()))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| TlsError::Handshake(e.to_string()))?;
                Ok(PollerStream::Tls(Box::new(stream)))
            }
        }
    }
}

fn load_root_store(path: &str) -> Result<RootCertStore, TlsError> {
    let pem = std::fs::read(path).map_err(|e| TlsError::CaRead {
        path: path.to_owned(),
        error: e.to_string(),
    })?;
    let mut reader = std::io::BufReader::new(&pem[..]);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TlsError::CaRead {
            path: path.to_owned(),
            error: e.to_string(),
        })?;
        roots
            .add(cert)
            .map_err(|e| TlsError::CaRead {
                path: path.to_owned(),
                error: e.to_string(),
            })?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyCaBundle(path.to_owned()));
    }
    Ok(roots)
}

// ---------------------------------------------------------------------------
// Verification-skipping verifier (dev mode)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct NoVerification {
    provider: rustls::crypto::CryptoProvider,
}

impl NoVerification {
    fn new() -> NoVerification {
        NoVerification {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Stream wrapper
// ---------------------------------------------------------------------------

/// A negotiated endpoint byte stream, TLS or plain.
pub enum PollerStream {
    Cleartext(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PollerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PollerStream::Cleartext(s) => Pin::new(s).poll_read(cx, buf),
            PollerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PollerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PollerStream::Cleartext(s) => Pin::new(s).poll_write(cx, buf),
            PollerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PollerStream::Cleartext(s) => Pin::new(s).poll_flush(cx),
            PollerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PollerStream::Cleartext(s) => Pin::new(s).poll_shutdown(cx),
            PollerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;

    fn settings(ca_file: Option<&str>, insecure: bool, cleartext: bool) -> TlsSettings {
        TlsSettings {
            ca_file: ca_file.map(str::to_owned),
            insecure,
            cleartext,
        }
    }

    #[test]
    fn cleartext_settings_build_a_cleartext_client() {
        let client = TlsClient::build(&settings(None, false, true)).expect("build");
        assert!(matches!(client, TlsClient::Cleartext));
    }

    #[test]
    fn insecure_settings_build_without_roots() {
        let client = TlsClient::build(&settings(None, true, false)).expect("build");
        assert!(matches!(client, TlsClient::Secure(_)));
    }

    #[test]
    fn no_roots_and_not_insecure_is_an_error() {
        assert!(matches!(
            TlsClient::build(&settings(None, false, false)),
            Err(TlsError::NoRoots)
        ));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        assert!(matches!(
            TlsClient::build(&settings(Some("/nonexistent/ca.pem"), false, false)),
            Err(TlsError::CaRead { .. })
        ));
    }

    #[test]
    fn empty_ca_bundle_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a pem\n").expect("write");
        let result = TlsClient::build(&settings(Some(&path.display().to_string()), false, false));
        assert!(matches!(result, Err(TlsError::EmptyCaBundle(_))));
    }
}
