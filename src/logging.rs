//! Logger initialisation.

use crate::config::LoggingConfig;

/// Environment variable overriding the configured filter string.
pub const LOG_ENV: &str = "CALL_RESILIENCE_LOG";

/// Install an `env_logger` backend for the `log` facade.
///
/// Third-party WebRTC crates are very chatty at `info`, so their ICE/DTLS/mDNS
/// modules are clamped to errors. Calling this more than once is harmless.
pub fn init(config: &LoggingConfig) {
    let filters = std::env::var(LOG_ENV).unwrap_or_else(|_| config.level.clone());
    let _ = env_logger::Builder::new()
        .parse_filters(&filters)
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .try_init();
}

#[cfg(test)]
pub(crate) fn init_for_tests() {
    let _ = env_logger::Builder::new()
        .parse_filters("debug")
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .is_test(true)
        .try_init();
}
