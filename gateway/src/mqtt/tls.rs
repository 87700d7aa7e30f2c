use crate::errors::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Builds the listener's TLS configuration.
///
/// The server presents `cert_path`/`key_path` and requires every client to
/// present a certificate that chains to a CA in `ca_path`. TLS 1.2 is the
/// oldest accepted version.
pub fn load_server_config(cert_path: &Path, key_path: &Path, ca_path: &Path) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(Error::Configuration(format!(
            "no certificate found in {}",
            cert_path.display()
        )));
    }
    let key = load_private_key(key_path)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(ca_path)?);
    if added == 0 {
        return Err(Error::Configuration(format!(
            "CA bundle {} contains no usable certificate",
            ca_path.display()
        )));
    }
    info!(added, ignored, "Loaded client CA certificates");

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| Error::Configuration(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Configuration(format!("server certificate: {}", e)))?;

    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Configuration(format!("malformed PEM in {}: {}", path.display(), e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Configuration(format!("malformed PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Configuration(format!("no private key found in {}", path.display())))
}
