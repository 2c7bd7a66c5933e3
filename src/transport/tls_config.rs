use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Builds the server-side TLS configuration from PEM files.
///
/// `cert_path` holds the server's certificate chain and `key_path` its private
/// key. When `ca_cert_path` is given, clients are asked for a certificate
/// signed by one of those CAs; clients that present none are still accepted.
pub fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
    ca_cert_path: Option<&str>,
) -> Result<ServerConfig, Error> {
    let cert_chain = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = match ca_cert_path {
        Some(ca_cert_path) => {
            let roots = load_trust_store(ca_cert_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    builder
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))
}

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;

    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "No certificates found in {path}"
        )));
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("No private key found in {path}")))
}

fn load_trust_store(path: &str) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }
    Ok(roots)
}
