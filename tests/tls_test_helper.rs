#![allow(dead_code)]

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::Write;
use std::sync::{Arc, Once};
use tempfile::NamedTempFile;

static INIT: Once = Once::new();

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test record_path -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("tlswire={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    _cert_file: NamedTempFile,
    _key_file: NamedTempFile,
    _ca_cert_file: NamedTempFile,
}

/// Self-signed credentials shared by a test's server and client.
pub struct TestCredentials {
    pub cert: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
}

pub fn generate_credentials() -> TestCredentials {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    TestCredentials {
        cert: certified_key.cert.der().clone(),
        cert_pem: certified_key.cert.pem(),
        key_der: certified_key.key_pair.serialize_der(),
        key_pem: certified_key.key_pair.serialize_pem(),
    }
}

/// Generate a TLS server config backed by temporary PEM files.
/// Returns (config, cleanup_guard, credentials)
pub fn generate_test_tls_config() -> (config::Config, TlsCertGuard, TestCredentials) {
    let credentials = generate_credentials();
    let (cert_file, key_file, ca_cert_file) = create_temp_cert_files(&credentials);

    let config = config::Config::builder()
        .set_default("transport_type", "tls")
        .unwrap()
        .set_default("tls_server_cert", cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_server_key", key_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_ca_cert", ca_cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_handshake_timeout_ms", 10_000)
        .unwrap()
        .build()
        .unwrap();

    (
        config,
        TlsCertGuard {
            _cert_file: cert_file,
            _key_file: key_file,
            _ca_cert_file: ca_cert_file,
        },
        credentials,
    )
}

/// Server config without client authentication.
pub fn server_config(credentials: &TestCredentials) -> Arc<ServerConfig> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(credentials.key_der.clone()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![credentials.cert.clone()], key)
        .unwrap();
    Arc::new(config)
}

/// Client config trusting the self-signed server certificate.
pub fn client_config(credentials: &TestCredentials) -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(credentials))
        .with_no_client_auth();
    Arc::new(config)
}

/// Like [`client_config`], restricted to TLS 1.2.
pub fn client_config_tls12(credentials: &TestCredentials) -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        .with_root_certificates(root_store(credentials))
        .with_no_client_auth();
    Arc::new(config)
}

fn root_store(credentials: &TestCredentials) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(credentials.cert.clone()).unwrap();
    roots
}

/// Create temporary certificate files with self-signed cert
fn create_temp_cert_files(
    credentials: &TestCredentials,
) -> (NamedTempFile, NamedTempFile, NamedTempFile) {
    // Create temporary files that will auto-delete on drop
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    let mut ca_cert_file = NamedTempFile::new().unwrap();

    cert_file.write_all(credentials.cert_pem.as_bytes()).unwrap();
    key_file.write_all(credentials.key_pem.as_bytes()).unwrap();
    // For testing, CA cert is the same as server cert (self-signed)
    ca_cert_file.write_all(credentials.cert_pem.as_bytes()).unwrap();

    // Flush to ensure files are written before use
    cert_file.flush().unwrap();
    key_file.flush().unwrap();
    ca_cert_file.flush().unwrap();

    (cert_file, key_file, ca_cert_file)
}
