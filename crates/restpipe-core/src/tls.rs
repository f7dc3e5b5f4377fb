use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// PEM file locations for one side of the pipe.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub key: PathBuf,
    pub crt: PathBuf,
    pub ca_crt: PathBuf,
}

/// Builds the client-side connector: the server certificate must chain to
/// the CA, and our own certificate is presented for client auth.
pub fn client_connector(material: &TlsMaterial) -> Result<TlsConnector> {
    let roots = load_ca_roots(&material.ca_crt)?;
    let certs = load_certs(&material.crt)?;
    let key = load_key(&material.key)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("failed to build client TLS config")?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Builds the server-side acceptor: clients must present a certificate
/// anchored at the CA.
pub fn server_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor> {
    let roots = load_ca_roots(&material.ca_crt)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("failed to build client certificate verifier")?;

    let certs = load_certs(&material.crt)?;
    let key = load_key(&material.key)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("failed to build server TLS config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_ca_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("invalid CA certificate in {}", path.display()))?;
    }

    if roots.is_empty() {
        anyhow::bail!("no CA certificates found in {}", path.display());
    }

    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open certificate {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to parse certificate {}", path.display()))?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open private key {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}
