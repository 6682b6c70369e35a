//! TLS configuration for administrative PostgreSQL connections

use crate::crd::SslMode;
use crate::error::{OperatorError, Result};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio_postgres::config::SslMode as PgSslMode;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::warn;

/// Driver-level SSL negotiation for a configured mode
///
/// The verifying modes require TLS; verification itself is carried by the
/// rustls configuration from [`make_tls_connector`].
pub fn driver_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
    }
}

/// Build the rustls connector for a configured mode
///
/// `prefer` and `require` encrypt without verifying the server certificate.
/// `verify-ca` and `verify-full` both verify the chain and hostname against
/// the webpki roots.
pub fn make_tls_connector(mode: SslMode) -> Result<MakeRustlsConnect> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| OperatorError::Tls(e.to_string()))?;

    let config = match mode {
        SslMode::Disable | SslMode::Prefer | SslMode::Require => {
            if mode == SslMode::Require {
                warn!("sslMode require does not verify the server certificate; consider verify-full");
            }
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    danger::NoCertificateVerification::new(provider),
                ))
                .with_no_client_auth()
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    };

    Ok(MakeRustlsConnect::new(config))
}

/// Verifier that accepts any server certificate
///
/// Backs the `prefer` and `require` modes, which only ask for encryption.
mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_ssl_mode() {
        assert_eq!(driver_ssl_mode(SslMode::Disable), PgSslMode::Disable);
        assert_eq!(driver_ssl_mode(SslMode::Prefer), PgSslMode::Prefer);
        assert_eq!(driver_ssl_mode(SslMode::Require), PgSslMode::Require);
        assert_eq!(driver_ssl_mode(SslMode::VerifyFull), PgSslMode::Require);
    }

    #[test]
    fn test_connector_builds_for_every_mode() {
        for mode in [
            SslMode::Disable,
            SslMode::Prefer,
            SslMode::Require,
            SslMode::VerifyCa,
            SslMode::VerifyFull,
        ] {
            assert!(make_tls_connector(mode).is_ok(), "mode {mode}");
        }
    }
}
