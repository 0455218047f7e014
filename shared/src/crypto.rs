use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;
use tracing::debug;

static PROVIDER_INSTALLED: OnceCell<()> = OnceCell::new();

/// Makes aws-lc-rs the process-default rustls provider. Safe to call from
/// every component that builds a TLS config; a provider already installed
/// by the host (or a racing caller) is left in place.
pub fn init_crypto() {
    PROVIDER_INSTALLED.get_or_init(|| {
        if CryptoProvider::get_default().is_some() {
            debug!("A process-default crypto provider is already installed");
            return;
        }
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Lost the crypto provider install race; keeping the winner");
        }
    });
}
