#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
pub mod flow;
pub mod h1;
pub mod http;
pub mod interceptor;
pub mod proxy;
pub mod replay_stream;
pub mod upstream;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT_LOGGER: OnceCell<()> = OnceCell::new();

/// Host-side logging wiring; `debug` picks the fallback level when RUST_LOG
/// is unset.
pub fn init_logging(debug: bool) {
    INIT_LOGGER.get_or_init(|| {
        let fallback = if debug { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
            )
            .init();
    });
}

pub fn init_test_logging() {
    INIT_LOGGER.get_or_init(|| {
        tracing_subscriber::fmt()
            .without_time()
            .with_line_number(true)
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}
