use std::sync::Arc;

use rustls::{
    ClientConfig, ServerConfig, SupportedCipherSuite,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    version::{TLS12, TLS13},
};

use crate::{cert::CapturingServerVerifier, crypto::init_crypto};

/// Crypto-provider wrapper from which both sides of an intercepted
/// connection build their rustls configs.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    crypto_provider: Arc<CryptoProvider>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        init_crypto();
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        TlsConfig::from_provider(provider)
    }
}

/// The origin-facing client config together with the verifier that captures
/// whatever certificates the origin presents.
pub struct PermissiveClientConfig {
    pub verifier: Arc<CapturingServerVerifier>,
    pub client_config: ClientConfig,
}

impl TlsConfig {
    pub fn from_provider(provider: CryptoProvider) -> Self {
        Self {
            crypto_provider: Arc::new(provider),
        }
    }

    pub fn crypto_provider(&self) -> Arc<CryptoProvider> {
        self.crypto_provider.clone()
    }

    /// Server config for the client-facing side of an intercepted tunnel:
    /// TLS 1.2 and 1.3, no client certificate request, the minted leaf as
    /// the only identity.
    pub fn server_config(
        &self,
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<ServerConfig, rustls::Error> {
        let versions = self
            .crypto_provider
            .cipher_suites
            .iter()
            .map(|cs| match cs {
                SupportedCipherSuite::Tls12(_) => &TLS12,
                SupportedCipherSuite::Tls13(_) => &TLS13,
            })
            .collect::<Vec<_>>();

        ServerConfig::builder_with_provider(self.crypto_provider.clone())
            .with_protocol_versions(versions.as_slice())?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
    }

    /// Client config for the origin-facing side: SNI on, certificate
    /// verification replaced by the capturing verifier.
    pub fn client_config(&self) -> PermissiveClientConfig {
        let verifier = Arc::new(CapturingServerVerifier::new());

        let mut client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();
        client_config.enable_sni = true;

        PermissiveClientConfig {
            verifier,
            client_config,
        }
    }
}
