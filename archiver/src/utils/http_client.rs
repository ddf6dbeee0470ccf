use std::{sync::OnceLock, time::Duration};

use tracing::debug;

/// Install the aws-lc-rs rustls provider once per process.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build a client for platform API calls.
pub fn build_client(timeout: Duration) -> crate::Result<reqwest::Client> {
    install_rustls_provider();
    let client = reqwest::Client::builder()
        .user_agent(concat!("vod-archiver/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}
