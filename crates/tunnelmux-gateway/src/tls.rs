//! Server-side TLS: PEM loading and development certificates.

use rustls::pki_types::CertificateDer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tunnelmux_core::{TunnelError, TunnelResult};

/// Build an acceptor from a PEM certificate chain and private key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> TunnelResult<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| TunnelError::Tls(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| TunnelError::Tls(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Tls(format!("bad PEM in {}: {e}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| TunnelError::Tls(format!("bad PEM in {}: {e}", key_path.display())))?
        .ok_or_else(|| TunnelError::Tls(format!("no private key in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Write a self-signed certificate for `localhost` into `dir`.
///
/// Returns the certificate and key paths.
pub fn generate_self_signed_cert(dir: &Path) -> TunnelResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let tls_err = |e: rcgen::Error| TunnelError::Tls(format!("certificate generation failed: {e}"));
    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(tls_err)?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "tunnelmux-gateway dev cert");

    let key_pair = rcgen::KeyPair::generate().map_err(tls_err)?;
    let cert = params.self_signed(&key_pair).map_err(tls_err)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}
