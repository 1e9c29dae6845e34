use serde::Serialize;
use std::fmt;

/// Session lifecycle. `Closed` is terminal.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Authenticating -> Active
///                                   ^                            |
///                                   └──── ConnectionLost ────────┘
/// any -> Closed (disconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
