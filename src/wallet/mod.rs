//! Authenticated wallet state - exists only while the session is `Active`.
//!
//! Owns the key material and the caches derived from it. Every backend call
//! goes through the session's `Transport`, passed in per operation so the
//! session mutex stays the single owner of both.

pub mod account;
pub mod addresses;
pub mod balance;
pub mod fees;
pub mod history;

pub use account::Account;
pub use addresses::{AddressRecord, AddressRegistry};
pub use balance::{Balance, UnspentOutput, BTC};
pub use fees::{FeeEstimates, FeeEstimator, FEE_BUCKETS};
pub use history::{HistoryCache, TransactionKind, TransactionRecord, TxInputRecord, TxOutputRecord};

use crate::config::SessionConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::keys::{ChainType, WalletKeys};
use crate::session::{BalanceOptions, ReceiveAddressOptions, TransactionsOptions};
use crate::transport::Transport;
use bitcoin::ScriptBuf;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const REGISTRY_FILE: &str = "addresses.json";

pub struct WalletState {
    wallet_id: String,
    accounts: BTreeMap<u32, Account>,
    fees: FeeEstimator,
    tip: u32,
    /// Transport generation the caches were built against.
    generation: u64,
}

impl WalletState {
    /// Load persisted registry state, fetch the tip, run gap-limit discovery
    /// on every account and subscribe to every watched script.
    pub async fn open(keys: Vec<WalletKeys>, transport: &mut Transport, config: &SessionConfig, network: &str) -> Result<Self> {
        let wallet_id = keys
            .first()
            .map(|k| k.wallet_id())
            .ok_or_else(|| Error::InvalidConfig("no accounts to load".into()))?;
        let root = config.data_dir.as_ref().map(|dir| dir.join(network).join(&wallet_id));
        let tip = transport.call("tip", None, |b| async move { b.tip().await }).await?;

        let mut accounts = BTreeMap::new();
        for keys in keys {
            let store = Self::store_path(root.as_ref(), keys.account());
            let mut account = Account::open(keys, config.gap_limit, store)?;
            account.discover(transport).await?;
            account.flush()?;
            accounts.insert(account.number(), account);
        }

        let generation = transport.generation();
        let mut wallet = Self { wallet_id, accounts, fees: FeeEstimator::new(), tip, generation };
        wallet.extend_watch(transport).await?;
        transport.start_notifications();

        for account in wallet.accounts.values() {
            info!(
                "Wallet {} account {} ready at height {} (next external {}, next internal {})",
                wallet.wallet_id,
                account.number(),
                tip,
                account.registry().next_index(ChainType::External),
                account.registry().next_index(ChainType::Internal)
            );
        }
        Ok(wallet)
    }

    /// `<root>/<account>/addresses.json`
    fn store_path(root: Option<&PathBuf>, account: u32) -> Option<PathBuf> {
        root.map(|root| root.join(account.to_string()).join(REGISTRY_FILE))
    }

    pub fn wallet_id(&self) -> &str { &self.wallet_id }
    pub fn tip(&self) -> u32 { self.tip }

    pub fn subaccounts(&self) -> Vec<u32> {
        self.accounts.keys().copied().collect()
    }

    pub fn account(&self, subaccount: u32) -> Result<&Account> {
        self.accounts
            .get(&subaccount)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown subaccount {}", subaccount)))
    }

    fn account_mut(&mut self, subaccount: u32) -> Result<&mut Account> {
        self.accounts
            .get_mut(&subaccount)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown subaccount {}", subaccount)))
    }

    /// Subscribe any watch-list scripts the transport does not follow yet.
    pub async fn extend_watch(&mut self, transport: &mut Transport) -> Result<()> {
        let mut scripts: Vec<ScriptBuf> = Vec::new();
        for account in self.accounts.values_mut() {
            scripts.extend(account.watch_scripts()?);
        }
        transport.watch(&scripts).await
    }

    /// As `extend_watch`, but a server refusing the subscription only costs
    /// pushes. Connection loss and timeouts still propagate.
    pub async fn try_extend_watch(&mut self, transport: &mut Transport) -> Result<()> {
        match self.extend_watch(transport).await {
            Err(e) if e.kind() == ErrorKind::Query => {
                warn!("Watch list update refused: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn receive_address(&mut self, transport: &mut Transport, options: &ReceiveAddressOptions) -> Result<AddressRecord> {
        let record = self.account_mut(options.subaccount)?.receive_address(options)?;
        if options.index.is_none() {
            self.try_extend_watch(transport).await?;
        }
        Ok(record)
    }

    async fn refresh_tip(&mut self, transport: &mut Transport, timeout: Option<Duration>) -> Result<()> {
        let tip = transport.call("tip", timeout, |b| async move { b.tip().await }).await?;
        // The call may itself have reconnected.
        self.on_reconnected(transport.generation());
        if tip != self.tip {
            self.on_new_block(tip);
        }
        Ok(())
    }

    async fn all_unspent(&mut self, transport: &mut Transport, options: &BalanceOptions) -> Result<Vec<UnspentOutput>> {
        self.account(options.subaccount)?;
        self.refresh_tip(transport, options.timeout()).await?;
        let tip = self.tip;
        self.account_mut(options.subaccount)?
            .unspent(transport, tip, options.timeout())
            .await
    }

    pub async fn unspent(&mut self, transport: &mut Transport, options: &BalanceOptions) -> Result<Vec<UnspentOutput>> {
        let utxos = self.all_unspent(transport, options).await?;
        Ok(balance::filter(utxos, options.num_confs))
    }

    pub async fn balance(&mut self, transport: &mut Transport, options: &BalanceOptions) -> Result<Balance> {
        let utxos = self.all_unspent(transport, options).await?;
        Ok(balance::aggregate(&utxos, options.num_confs))
    }

    pub async fn transactions(&mut self, transport: &mut Transport, options: &TransactionsOptions) -> Result<Vec<TransactionRecord>> {
        self.account(options.subaccount)?;
        self.refresh_tip(transport, options.timeout()).await?;
        let tip = self.tip;
        self.account_mut(options.subaccount)?
            .transactions(transport, tip, options)
            .await
    }

    pub async fn fee_estimates(&mut self, transport: &mut Transport) -> Result<FeeEstimates> {
        self.fees.refresh(transport).await
    }

    pub fn on_new_block(&mut self, height: u32) {
        debug!("New tip {} (was {})", height, self.tip);
        self.tip = height;
        for account in self.accounts.values_mut() {
            account.invalidate_history();
        }
    }

    /// Caches built on an older connection are dropped once per generation.
    pub fn on_reconnected(&mut self, generation: u64) {
        if generation <= self.generation {
            return;
        }
        debug!("Transport generation {} (was {})", generation, self.generation);
        self.generation = generation;
        for account in self.accounts.values_mut() {
            account.reset_history();
        }
    }

    /// Returns true when the watch list may have grown.
    pub fn on_script_activity(&mut self, script: &ScriptBuf) -> bool {
        let mut changed = false;
        for account in self.accounts.values_mut() {
            account.invalidate_history();
            changed |= account.mark_used_script(script);
        }
        changed
    }

    /// Final flush before the state is dropped.
    pub fn close(&mut self) {
        for account in self.accounts.values_mut() {
            account.persist();
        }
    }
}

impl std::fmt::Debug for WalletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletState")
            .field("wallet_id", &self.wallet_id)
            .field("accounts", &self.subaccounts())
            .field("tip", &self.tip)
            .finish()
    }
}
