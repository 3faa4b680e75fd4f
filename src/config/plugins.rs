//! Plugin registration settings.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Interval between liveness checks of registered plugins. Tokens expire
    /// after twice this period.
    pub ping_period_secs: u64,
    /// Timeout applied to every callback request.
    pub callback_timeout_secs: u64,
    /// Tolerated clock skew when checking token lifetimes.
    pub token_clock_skew_secs: u64,
    /// PKCS#8 PEM of the P-256 token signing key. Generated at startup when
    /// absent.
    pub signing_key_pem: Option<String>,
    /// Base64 encoded 32-byte AES key for the token envelope. Generated at
    /// startup when absent.
    pub encryption_key: Option<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            ping_period_secs: 300,
            callback_timeout_secs: 5,
            token_clock_skew_secs: 60,
            signing_key_pem: None,
            encryption_key: None,
        }
    }
}

impl PluginsConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}
