use std::{sync::OnceLock, time::Duration};

use tracing::debug;

use crate::{Error, Result};

const USER_AGENT: &str = concat!("auction-notify/", env!("CARGO_PKG_VERSION"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client` used by every transport.
///
/// A zero `request_timeout` leaves requests unbounded.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(4);

    if request_timeout > Duration::ZERO {
        builder = builder
            .timeout(request_timeout)
            .connect_timeout(request_timeout);
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}
