//! Session state machine - the single serialization point.
//!
//! All state lives behind one `tokio::sync::Mutex`. Foreground operations and
//! transport events (drained from the mpsc channel at the start of every
//! operation) mutate it only while holding the lock, so pushes never race
//! queries. A reconnect runs inside whichever operation needed it; other
//! callers queue on the lock until it completes or fails.

mod options;
mod state;

pub use options::{
    BalanceOptions, ReceiveAddressOptions, TransactionFilters, TransactionsOptions, DEFAULT_TRANSACTION_COUNT,
};
pub use state::SessionState;

use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::keys::WalletKeys;
use crate::network::{NetworkParameters, NetworkProfile};
use crate::transport::{Connector, ElectrumConnector, Transport, TransportEvent};
use crate::wallet::{AddressRecord, Balance, FeeEstimates, TransactionRecord, UnspentOutput, WalletState};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: SessionState,
    params: Option<NetworkParameters>,
    profile: Option<NetworkProfile>,
    transport: Option<Transport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    wallet: Option<WalletState>,
}

impl Session {
    /// Session backed by a real Electrum server.
    pub fn new(config: SessionConfig) -> Self {
        let connector = Arc::new(ElectrumConnector::new(config.request_timeout));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                params: None,
                profile: None,
                transport: None,
                events: None,
                wallet: None,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig { &self.config }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn network(&self) -> Option<NetworkProfile> {
        self.inner.lock().await.profile.clone()
    }

    pub async fn parameters(&self) -> Option<NetworkParameters> {
        self.inner.lock().await.params.clone()
    }

    /// Hex wallet identifier while logged in.
    pub async fn wallet_id(&self) -> Option<String> {
        self.inner.lock().await.wallet.as_ref().map(|w| w.wallet_id().to_string())
    }

    /// Resolve `params` and open the transport. Parameters bind once: only a
    /// `Disconnected` session can connect.
    pub async fn connect(&self, params: NetworkParameters) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.state != SessionState::Disconnected {
            return Err(Error::invalid_state("connect", guard.state));
        }
        let profile = params.resolve()?;

        let mut step = Transition::begin(&mut guard, SessionState::Connecting, SessionState::Disconnected);
        info!("Connecting to {} ({})", profile.name, profile.endpoint);
        match Transport::open(self.connector.clone(), profile.endpoint.clone(), &self.config).await {
            Ok((transport, events)) => {
                step.inner.transport = Some(transport);
                step.inner.events = Some(events);
                step.inner.params = Some(params);
                step.inner.profile = Some(profile);
                step.finish(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                step.finish(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Derive the wallet accounts and load their state.
    ///
    /// The mnemonic is validated before anything touches the network. Backend
    /// rejection during login is reported as `Authentication`.
    pub async fn login(&self, mnemonic: &str, passphrase: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.state != SessionState::Connected {
            return Err(Error::invalid_state("login", guard.state));
        }
        let Some(profile) = guard.profile.clone() else {
            return Err(Error::invalid_state("login", guard.state));
        };
        let accounts: Vec<u32> = (0..self.config.accounts).collect();
        let keys = WalletKeys::from_mnemonic_accounts(mnemonic, passphrase, profile.network, &accounts)?;
        let wallet_id = keys.first().map(|k| k.wallet_id()).unwrap_or_default();

        guard.drain_events().await?;
        let mut step = Transition::begin(&mut guard, SessionState::Authenticating, SessionState::Connected);
        info!("Authenticating wallet {} on {}", wallet_id, profile.name);

        let opened = match step.inner.transport.as_mut() {
            Some(transport) => WalletState::open(keys, transport, &self.config, &profile.network.to_string()).await,
            None => Err(Error::invalid_state("login", SessionState::Connected)),
        };
        match opened {
            Ok(wallet) => {
                step.inner.wallet = Some(wallet);
                step.finish(SessionState::Active);
                info!("Session active");
                Ok(())
            }
            Err(e) => {
                step.inner.demote();
                step.finish(SessionState::Connected);
                Err(match e {
                    Error::Query(reason) => Error::Authentication(reason),
                    other => other,
                })
            }
        }
    }

    /// Account numbers loaded at login.
    pub async fn get_subaccounts(&self) -> Result<Vec<u32>> {
        let inner = self.inner.lock().await;
        match &inner.wallet {
            Some(wallet) if inner.state == SessionState::Active => Ok(wallet.subaccounts()),
            _ => Err(Error::invalid_state("get_subaccounts", inner.state)),
        }
    }

    pub async fn get_receive_address(&self, options: ReceiveAddressOptions) -> Result<AddressRecord> {
        let mut inner = self.inner.lock().await;
        inner.prepare("get_receive_address").await?;
        let result = match inner.parts("get_receive_address") {
            Ok((wallet, transport)) => wallet.receive_address(transport, &options).await,
            Err(e) => Err(e),
        };
        inner.settle(result)
    }

    pub async fn get_balance(&self, options: BalanceOptions) -> Result<Balance> {
        let mut inner = self.inner.lock().await;
        inner.prepare("get_balance").await?;
        let result = match inner.parts("get_balance") {
            Ok((wallet, transport)) => wallet.balance(transport, &options).await,
            Err(e) => Err(e),
        };
        inner.settle(result)
    }

    pub async fn get_unspent_outputs(&self, options: BalanceOptions) -> Result<Vec<UnspentOutput>> {
        let mut inner = self.inner.lock().await;
        inner.prepare("get_unspent_outputs").await?;
        let result = match inner.parts("get_unspent_outputs") {
            Ok((wallet, transport)) => wallet.unspent(transport, &options).await,
            Err(e) => Err(e),
        };
        inner.settle(result)
    }

    pub async fn get_transactions(&self, options: TransactionsOptions) -> Result<Vec<TransactionRecord>> {
        let mut inner = self.inner.lock().await;
        inner.prepare("get_transactions").await?;
        let result = match inner.parts("get_transactions") {
            Ok((wallet, transport)) => wallet.transactions(transport, &options).await,
            Err(e) => Err(e),
        };
        inner.settle(result)
    }

    pub async fn get_fee_estimates(&self) -> Result<FeeEstimates> {
        let mut inner = self.inner.lock().await;
        inner.prepare("get_fee_estimates").await?;
        let result = match inner.parts("get_fee_estimates") {
            Ok((wallet, transport)) => wallet.fee_estimates(transport).await,
            Err(e) => Err(e),
        };
        inner.settle(result)
    }

    /// Close the transport and drop all wallet state. Terminal; repeated
    /// calls are no-ops.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return;
        }
        if let Some(mut wallet) = inner.wallet.take() {
            wallet.close();
        }
        if let Some(mut transport) = inner.transport.take() {
            transport.close();
        }
        inner.events = None;
        inner.state = SessionState::Closed;
        info!("Session closed");
    }
}

impl SessionInner {
    /// Merge pending transport events, then require `Active`.
    async fn prepare(&mut self, operation: &'static str) -> Result<()> {
        let drained = self.drain_events().await;
        self.settle(drained)?;
        if self.state != SessionState::Active {
            return Err(Error::invalid_state(operation, self.state));
        }
        Ok(())
    }

    fn parts(&mut self, operation: &'static str) -> Result<(&mut WalletState, &mut Transport)> {
        match (self.wallet.as_mut(), self.transport.as_mut()) {
            (Some(wallet), Some(transport)) => Ok((wallet, transport)),
            _ => Err(Error::invalid_state(operation, self.state)),
        }
    }

    /// `ConnectionLost` costs the authenticated state.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::ConnectionLost {
                warn!("{} - session demoted, login required", e);
                self.demote();
            }
        }
        result
    }

    fn demote(&mut self) {
        if let Some(mut wallet) = self.wallet.take() {
            wallet.close();
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.unwatch_all();
        }
        self.state = SessionState::Connected;
    }

    async fn drain_events(&mut self) -> Result<()> {
        let Some(events) = self.events.as_mut() else { return Ok(()) };
        let mut pending = Vec::new();
        while let Ok(event) = events.try_recv() {
            pending.push(event);
        }

        let mut grow_watch = false;
        for event in pending {
            debug!("Transport event: {:?}", event);
            match event {
                TransportEvent::NewBlock { height } => {
                    if let Some(wallet) = self.wallet.as_mut() {
                        wallet.on_new_block(height);
                    }
                }
                TransportEvent::ScriptActivity { script } => {
                    if let Some(wallet) = self.wallet.as_mut() {
                        grow_watch |= wallet.on_script_activity(&script);
                    }
                }
                TransportEvent::Reconnected { generation } => {
                    if let Some(wallet) = self.wallet.as_mut() {
                        wallet.on_reconnected(generation);
                    }
                }
                TransportEvent::Disconnected { generation, reason } => {
                    if let Some(transport) = self.transport.as_mut() {
                        if transport.handle_disconnect(generation) {
                            warn!("Connection dropped: {}", reason);
                        }
                    }
                }
            }
        }

        if grow_watch {
            if let (Some(wallet), Some(transport)) = (self.wallet.as_mut(), self.transport.as_mut()) {
                wallet.try_extend_watch(transport).await?;
            }
        }
        Ok(())
    }
}

/// A lifecycle step that spans an await. Dropped before `finish` (the caller
/// gave up on the future) it rolls the session back so it stays usable.
struct Transition<'a> {
    inner: &'a mut SessionInner,
    rollback: SessionState,
    done: bool,
}

impl<'a> Transition<'a> {
    fn begin(inner: &'a mut SessionInner, state: SessionState, rollback: SessionState) -> Self {
        inner.state = state;
        Self { inner, rollback, done: false }
    }

    fn finish(mut self, state: SessionState) {
        self.inner.state = state;
        self.done = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("{} abandoned, session back to {}", self.inner.state, self.rollback);
        self.inner.demote();
        self.inner.state = self.rollback;
    }
}
