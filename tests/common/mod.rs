//! Scripted in-memory Electrum server for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use electrum_session::transport::{Notification, ScriptHistory, ScriptUnspent};
use electrum_session::{Backend, BackendError, Connector, Endpoint, RetryPolicy, SessionConfig};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// BIP84 testnet vector for TEST_MNEMONIC, m/84'/1'/0'/0/0.
pub const TESTNET_ADDR_0: &str = "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl";

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Short timings so reconnect exhaustion takes milliseconds.
pub fn test_config() -> SessionConfig {
    SessionConfig::default()
        .with_request_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        })
        .with_poll_interval(Duration::from_millis(10))
        .with_gap_limit(5)
}

#[derive(Default)]
pub struct ServerState {
    pub online: bool,
    pub connects: u32,
    pub connect_attempts: u32,
    /// Fail this many backend calls with a transport error, then recover.
    pub fail_next: u32,
    pub tip: u32,
    pub utxos: HashMap<ScriptBuf, Vec<ScriptUnspent>>,
    pub history: HashMap<ScriptBuf, Vec<ScriptHistory>>,
    pub txs: HashMap<Txid, Transaction>,
    pub block_times: HashMap<u32, u32>,
    pub relay_fee: f64,
    pub fees: Vec<f64>,
    pub rejected: HashSet<&'static str>,
    /// Keyed by backend method, plus `"connect"` for the connector.
    pub delays: HashMap<&'static str, Duration>,
    /// Batch methods that answer one item short.
    pub short: HashSet<&'static str>,
    pub notifications: Vec<Notification>,
    pub subscribed: HashSet<ScriptBuf>,
    pub calls: Vec<&'static str>,
    pub nonce: u32,
}

#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        let state = ServerState {
            online: true,
            tip: 1_000,
            relay_fee: 0.00001,
            fees: vec![0.0002; 24],
            ..Default::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("mock state")
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { server: self.clone() })
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn set_tip(&self, tip: u32) {
        self.state().tip = tip;
    }

    pub fn connects(&self) -> u32 {
        self.state().connects
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn calls_of(&self, method: &str) -> usize {
        self.state().calls.iter().filter(|c| **c == method).count()
    }

    pub fn reject(&self, method: &'static str) {
        self.state().rejected.insert(method);
    }

    pub fn delay(&self, method: &'static str, delay: Duration) {
        self.state().delays.insert(method, delay);
    }

    pub fn answer_short(&self, method: &'static str) {
        self.state().short.insert(method);
    }

    pub fn set_fees(&self, relay_fee: f64, fees: Vec<f64>) {
        let mut state = self.state();
        state.relay_fee = relay_fee;
        state.fees = fees;
    }

    pub fn push(&self, note: Notification) {
        self.state().notifications.push(note);
    }

    /// Pay `value` to `script` from a foreign coin; `height == 0` = mempool.
    /// The foreign coin is `value + fee`, so the fee is resolvable.
    pub fn fund(&self, script: &ScriptBuf, value: u64, fee: u64, height: u32) -> Txid {
        let mut state = self.state();
        state.nonce += 1;
        let nonce = state.nonce;

        let source = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(nonce.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(value + fee), script_pubkey: foreign_script() }],
        };
        let funding = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: source.compute_txid(), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: script.clone() }],
        };
        let txid = funding.compute_txid();
        state.txs.insert(source.compute_txid(), source);
        state.txs.insert(txid, funding);
        state.utxos.entry(script.clone()).or_default().push(ScriptUnspent { txid, vout: 0, value, height });
        state.history.entry(script.clone()).or_default().push(ScriptHistory { txid, height: height as i32 });
        if height > 0 {
            state.block_times.insert(height, 1_600_000_000 + height);
        }
        txid
    }

    /// Spend output `vout` of `prev` (owned by `from`) to a foreign script,
    /// returning `change` to `change_script`.
    pub fn spend(
        &self,
        prev: Txid,
        from: &ScriptBuf,
        pay: u64,
        change_script: &ScriptBuf,
        change: u64,
        height: u32,
    ) -> Txid {
        let mut state = self.state();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: prev, vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut { value: Amount::from_sat(pay), script_pubkey: foreign_script() },
                TxOut { value: Amount::from_sat(change), script_pubkey: change_script.clone() },
            ],
        };
        let txid = tx.compute_txid();
        state.txs.insert(txid, tx);
        if let Some(utxos) = state.utxos.get_mut(from) {
            utxos.retain(|u| u.txid != prev);
        }
        state.utxos.entry(change_script.clone()).or_default().push(ScriptUnspent { txid, vout: 1, value: change, height });
        for script in [from, change_script] {
            state.history.entry(script.clone()).or_default().push(ScriptHistory { txid, height: height as i32 });
        }
        if height > 0 {
            state.block_times.insert(height, 1_600_000_000 + height);
        }
        txid
    }

    /// Publish an arbitrary transaction in the history of `owners`.
    pub fn insert_tx(&self, tx: Transaction, owners: &[ScriptBuf], height: u32) -> Txid {
        let mut state = self.state();
        let txid = tx.compute_txid();
        state.txs.insert(txid, tx);
        for script in owners {
            state.history.entry(script.clone()).or_default().push(ScriptHistory { txid, height: height as i32 });
        }
        txid
    }
}

/// Coinbase-shaped transaction paying `values` to `script`.
pub fn minted(script: &ScriptBuf, values: &[u64]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: values
            .iter()
            .map(|v| TxOut { value: Amount::from_sat(*v), script_pubkey: script.clone() })
            .collect(),
    }
}

/// A P2WPKH program nobody in the tests owns.
pub fn foreign_script() -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend([0x11u8; 20]);
    ScriptBuf::from_bytes(bytes)
}

struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Backend>, BackendError> {
        let delay = self.server.state().delays.get("connect").copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.server.state();
        state.connect_attempts += 1;
        if !state.online {
            return Err(BackendError::Transport("connection refused".into()));
        }
        state.connects += 1;
        Ok(Arc::new(MockBackend { server: self.server.clone() }))
    }
}

struct MockBackend {
    server: MockServer,
}

impl MockBackend {
    /// Bookkeeping shared by every call: availability, rejection, delay.
    async fn enter(&self, method: &'static str) -> Result<(), BackendError> {
        let delay = {
            let mut state = self.server.state();
            state.calls.push(method);
            if !state.online {
                return Err(BackendError::Transport("connection reset".into()));
            }
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(BackendError::Transport("broken pipe".into()));
            }
            if state.rejected.contains(method) {
                return Err(BackendError::Rejected(format!("{} not allowed", method)));
            }
            state.delays.get(method).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn tip(&self) -> Result<u32, BackendError> {
        self.enter("tip").await?;
        Ok(self.server.state().tip)
    }

    async fn list_unspent(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptUnspent>>, BackendError> {
        self.enter("list_unspent").await?;
        let state = self.server.state();
        Ok(scripts.iter().map(|s| state.utxos.get(s).cloned().unwrap_or_default()).collect())
    }

    async fn history(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptHistory>>, BackendError> {
        self.enter("history").await?;
        let state = self.server.state();
        Ok(scripts.iter().map(|s| state.history.get(s).cloned().unwrap_or_default()).collect())
    }

    async fn transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, BackendError> {
        self.enter("transactions").await?;
        let state = self.server.state();
        let mut txs = txids
            .iter()
            .map(|txid| {
                state
                    .txs
                    .get(txid)
                    .cloned()
                    .ok_or_else(|| BackendError::Rejected(format!("unknown transaction {}", txid)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if state.short.contains("transactions") {
            txs.pop();
        }
        Ok(txs)
    }

    async fn block_times(&self, heights: &[u32]) -> Result<Vec<u32>, BackendError> {
        self.enter("block_times").await?;
        let state = self.server.state();
        let mut times: Vec<u32> =
            heights.iter().map(|h| state.block_times.get(h).copied().unwrap_or(1_600_000_000 + h)).collect();
        if state.short.contains("block_times") {
            times.pop();
        }
        Ok(times)
    }

    async fn relay_fee(&self) -> Result<f64, BackendError> {
        self.enter("relay_fee").await?;
        Ok(self.server.state().relay_fee)
    }

    async fn estimate_fees(&self, targets: &[usize]) -> Result<Vec<f64>, BackendError> {
        self.enter("estimate_fees").await?;
        let state = self.server.state();
        Ok(state.fees.iter().take(targets.len()).copied().collect())
    }

    async fn subscribe_scripts(&self, scripts: &[ScriptBuf]) -> Result<(), BackendError> {
        self.enter("subscribe_scripts").await?;
        self.server.state().subscribed.extend(scripts.iter().cloned());
        Ok(())
    }

    async fn poll_notifications(&self) -> Result<Vec<Notification>, BackendError> {
        let mut state = self.server.state();
        if !state.online {
            return Err(BackendError::Transport("connection reset".into()));
        }
        Ok(std::mem::take(&mut state.notifications))
    }
}
