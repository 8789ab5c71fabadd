use anyhow::Context;
use protocol::config::SslConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Loads the PEM certificate chain and private key the config points at.
/// The same certificate doubles as the CA the client trusts.
pub fn load_identity(ssl: &SslConfig) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_pem = std::fs::read(&ssl.certificate).with_context(|| format!("read certificate {}", ssl.certificate.display()))?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate {}", ssl.certificate.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", ssl.certificate.display());

    let key_pem = std::fs::read(&ssl.private_key).with_context(|| format!("read private key {}", ssl.private_key.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .with_context(|| format!("parse private key {}", ssl.private_key.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", ssl.private_key.display()))?;

    Ok((certs, key))
}
