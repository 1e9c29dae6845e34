//! Session configuration - passed once into `Session::new`, never global.

use std::path::PathBuf;
use std::time::Duration;

/// Reconnect schedule: `base_delay * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(8) }
    }
}

impl RetryPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root for persisted wallet state. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// How often the notification poller drains server pushes.
    pub poll_interval: Duration,
    /// Unused scripts watched past the cursor, and the discovery batch size.
    pub gap_limit: u32,
    /// BIP84 accounts loaded at login: subaccounts `0..accounts`.
    pub accounts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(5),
            gap_limit: 20,
            accounts: 1,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self { Self::default() }
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self { self.data_dir = Some(path.into()); self }
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self { self.request_timeout = timeout; self }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }
    pub fn with_poll_interval(mut self, interval: Duration) -> Self { self.poll_interval = interval; self }
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self { self.gap_limit = gap_limit.max(1); self }
    pub fn with_accounts(mut self, accounts: u32) -> Self { self.accounts = accounts.max(1); self }

    /// Platform data directory (`~/.local/share/electrum-session` on Linux).
    pub fn with_default_data_dir(mut self) -> Self {
        self.data_dir = dirs::data_dir().map(|d| d.join("electrum-session"));
        self
    }
}
