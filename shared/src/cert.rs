use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{SignatureScheme, pki_types::*};
use tracing::trace;

use rustls::pki_types::ServerName;

/// Origin-side verifier that accepts every presented chain and records it.
/// Chain building, revocation and hostname checks are deliberately skipped:
/// the proxy's job is to observe the traffic, and the client decides whether
/// to trust the re-originated session.
#[derive(Debug)]
pub struct CapturingServerVerifier {
    certs: std::sync::Mutex<Vec<Bytes>>,
}

impl CapturingServerVerifier {
    pub fn new() -> Self {
        CapturingServerVerifier {
            certs: std::sync::Mutex::new(vec![]),
        }
    }

    /// The DER certificates observed during the handshake, end entity first.
    pub fn captured(&self) -> Vec<Bytes> {
        match self.certs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for CapturingServerVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for CapturingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        trace!("Observing server certificate for: {:?}", server_name);

        let mut guard = self
            .certs
            .lock()
            .map_err(|e| rustls::Error::General(format!("Failed to gain lock on certs {e}")))?;
        guard.push(end_entity.to_vec().into());
        for cert in intermediates.iter() {
            guard.push(cert.to_vec().into());
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
