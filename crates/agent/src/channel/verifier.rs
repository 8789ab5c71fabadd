use std::sync::Arc;

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::VerifierBuilderError,
    DigitallySignedStruct, RootCertStore,
};

/// Verifies the control server against the configured CA while tolerating a
/// name mismatch: tunnel certificates rarely carry the dialed hostname.
/// With `accept_any` (reject_unauthorized = false) verification is skipped
/// entirely.
#[derive(Debug)]
pub struct TunnelServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    accept_any: bool,
}

impl TunnelServerVerifier {
    pub fn new(roots: RootCertStore, accept_any: bool) -> Result<Self, VerifierBuilderError> {
        Ok(Self {
            inner: WebPkiServerVerifier::builder(Arc::new(roots)).build()?,
            accept_any,
        })
    }
}

impl ServerCertVerifier for TunnelServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.accept_any {
            return Ok(ServerCertVerified::assertion());
        }

        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp, now) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(&self, message: &[u8], cert: &CertificateDer<'_>, dss: &DigitallySignedStruct) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
