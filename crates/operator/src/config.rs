use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RESYNC_SECS: u64 = 300;
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// `None` watches every namespace.
    pub watch_namespace: Option<String>,
    pub resync_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self { watch_namespace: None, resync_secs: DEFAULT_RESYNC_SECS, error_backoff_secs: DEFAULT_ERROR_BACKOFF_SECS }
    }
}

impl OperatorConfig {
    /// Read `AMP_WATCH_NAMESPACE`, `AMP_RESYNC_SECS` and `AMP_ERROR_BACKOFF_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |k: &str, default: u64| get(k).and_then(|s| s.trim().parse::<u64>().ok()).filter(|n| *n > 0).unwrap_or(default);
        Self {
            watch_namespace: get("AMP_WATCH_NAMESPACE").map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            resync_secs: secs("AMP_RESYNC_SECS", DEFAULT_RESYNC_SECS),
            error_backoff_secs: secs("AMP_ERROR_BACKOFF_SECS", DEFAULT_ERROR_BACKOFF_SECS),
        }
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}
