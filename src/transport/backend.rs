//! Backend seam - the Electrum calls the session core needs, as async traits.

use crate::network::Endpoint;
use async_trait::async_trait;
use bitcoin::{ScriptBuf, Transaction, Txid};
use std::sync::Arc;

/// One unspent output of a watched script. `height == 0` means mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUnspent {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    pub height: u32,
}

/// One history entry of a watched script. `height <= 0` means mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptHistory {
    pub txid: Txid,
    pub height: i32,
}

/// Server push, drained by the notification poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewBlock { height: u32 },
    ScriptActivity { script: ScriptBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Socket-level failure; the connection is gone.
    #[error("transport: {0}")]
    Transport(String),
    /// Server answered with an error object.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

/// A live connection. Batch calls answer in request order.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Current tip height; also subscribes to header pushes.
    async fn tip(&self) -> Result<u32, BackendError>;
    async fn list_unspent(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptUnspent>>, BackendError>;
    async fn history(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptHistory>>, BackendError>;
    async fn transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, BackendError>;
    /// Header timestamps for the given heights.
    async fn block_times(&self, heights: &[u32]) -> Result<Vec<u32>, BackendError>;
    /// Minimum relay fee in BTC/kB.
    async fn relay_fee(&self) -> Result<f64, BackendError>;
    /// BTC/kB per confirmation target; negative when the server has no estimate.
    /// May return fewer entries than requested.
    async fn estimate_fees(&self, targets: &[usize]) -> Result<Vec<f64>, BackendError>;
    async fn subscribe_scripts(&self, scripts: &[ScriptBuf]) -> Result<(), BackendError>;
    async fn poll_notifications(&self) -> Result<Vec<Notification>, BackendError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Backend>, BackendError>;
}
