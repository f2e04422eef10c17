//! TLS connector construction for IProto over SSL.

use crate::config::TlsClientConfig;
use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Creates a verifying TLS connector from client configuration.
pub fn create_tls_connector(
    config: &TlsClientConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(config)?);

    let client_config = match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ClientError::TlsConfig(
                "client certificate and key must be set together".to_string(),
            ))
        }
    };

    Ok((
        TlsConnector::from(Arc::new(client_config)),
        server_name(config, host)?,
    ))
}

/// Creates a TLS connector that accepts any server certificate.
/// WARNING: Only use for development/testing.
pub fn create_insecure_tls_connector(
    config: &TlsClientConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();

    Ok((
        TlsConnector::from(Arc::new(client_config)),
        server_name(config, host)?,
    ))
}

fn root_store(config: &TlsClientConfig) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match &config.ca_cert_path {
        Some(ca_path) => {
            for cert in load_certs(ca_path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn server_name(config: &TlsClientConfig, host: &str) -> Result<ServerName<'static>, ClientError> {
    let name = config.server_name.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let mut reader = open(path, "cert")?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let mut reader = open(path, "key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ClientError::TlsConfig(format!("no private key found in {:?}", path)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, ClientError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open {} file {:?}: {}", what, path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_invalid_cert_path() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open cert file"));
    }

    #[test]
    fn test_load_invalid_key_path() {
        let result = load_private_key(Path::new("/nonexistent/key.pem"));
        assert!(result.unwrap_err().to_string().contains("cannot open key file"));
    }

    #[test]
    fn test_empty_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();
        let err = load_private_key(&path).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_half_configured_mtls_rejected() {
        let config = TlsClientConfig {
            enabled: true,
            client_cert_path: Some("/tmp/cert.pem".into()),
            ..Default::default()
        };
        let err = create_tls_connector(&config, "localhost").err().unwrap();
        assert!(err.to_string().contains("must be set together"));
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsClientConfig::new().with_server_name("db.internal");
        let (_, name) = create_insecure_tls_connector(&config, "10.0.0.1").unwrap();
        assert_eq!(name.to_str(), "db.internal");
    }
}
