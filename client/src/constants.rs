pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";
pub const LOCAL_API_URL: &str = "http://localhost:3005";

/// Drift (seconds) a viewer tolerates before being forced to the host position
pub const SYNC_TOLERANCE_SECS: f64 = 0.5;

/// Consecutive forced corrections before drift is reported as a warning
pub const DRIFT_WARN_STREAK: u32 = 3;

/// How often the media element is polled for `timeupdate`
pub const MEDIA_POLL_INTERVAL_MS: u64 = 250;

pub const KEEPALIVE_INTERVAL_SECS: u64 = 12;

/// Access tokens are refreshed this long before they expire
pub const TOKEN_REFRESH_SKEW_MS: u64 = 30_000;

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
