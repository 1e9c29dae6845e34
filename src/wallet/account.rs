//! One BIP84 account: its keys, address registry and history cache.

use super::addresses::{AddressRecord, AddressRegistry};
use super::balance::{self, UnspentOutput};
use super::history::{HistoryCache, TransactionRecord};
use crate::error::Result;
use crate::keys::{ChainType, WalletKeys};
use crate::session::{ReceiveAddressOptions, TransactionsOptions};
use crate::transport::{expect_batch, Transport};
use bitcoin::ScriptBuf;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Account {
    keys: WalletKeys,
    registry: AddressRegistry,
    history: HistoryCache,
}

impl Account {
    pub fn open(keys: WalletKeys, gap_limit: u32, store: Option<PathBuf>) -> Result<Self> {
        let registry = AddressRegistry::open(gap_limit, store)?;
        Ok(Self { keys, registry, history: HistoryCache::new() })
    }

    pub fn number(&self) -> u32 { self.keys.account() }
    pub fn keys(&self) -> &WalletKeys { &self.keys }
    pub fn registry(&self) -> &AddressRegistry { &self.registry }

    /// Scan each chain in batches of `gap_limit` until a batch has no history.
    pub async fn discover(&mut self, transport: &mut Transport) -> Result<()> {
        let gap = self.registry.gap_limit();
        for chain in ChainType::ALL {
            let mut start = 0u32;
            loop {
                let batch = (start..start.saturating_add(gap))
                    .map(|index| self.registry.peek(&self.keys, chain, index))
                    .collect::<Result<Vec<_>>>()?;
                let scripts: Arc<Vec<ScriptBuf>> = Arc::new(batch.iter().map(|r| r.script_pubkey.clone()).collect());
                let histories = transport
                    .call("history", None, move |b| {
                        let scripts = scripts.clone();
                        async move { b.history(&scripts).await }
                    })
                    .await?;
                let histories = expect_batch("history", batch.len(), histories)?;

                let mut active = false;
                for (record, history) in batch.iter().zip(histories) {
                    if !history.is_empty() {
                        self.registry.mark_used(chain, record.index);
                        active = true;
                    }
                }
                debug!("Discovery account {} {} {}..{}: active={}", self.number(), chain, start, start + gap, active);
                if !active {
                    break;
                }
                start = start.saturating_add(gap);
            }
        }
        Ok(())
    }

    pub fn watch_scripts(&mut self) -> Result<Vec<ScriptBuf>> {
        Ok(self
            .registry
            .watch_list(&self.keys)?
            .into_iter()
            .map(|r| r.script_pubkey)
            .collect())
    }

    /// Peek when an index is given, otherwise issue and persist.
    pub fn receive_address(&mut self, options: &ReceiveAddressOptions) -> Result<AddressRecord> {
        if let Some(index) = options.index {
            return self.registry.peek(&self.keys, options.chain_type, index);
        }
        let record = self.registry.issue_next(&self.keys, options.chain_type)?;
        self.registry.flush()?;
        Ok(record)
    }

    /// Full UTXO snapshot; addresses holding outputs are marked used.
    pub async fn unspent(&mut self, transport: &mut Transport, tip: u32, timeout: Option<Duration>) -> Result<Vec<UnspentOutput>> {
        let watched = self.registry.watch_list(&self.keys)?;
        let utxos = balance::fetch_unspent(transport, &watched, tip, timeout).await?;

        let mut changed = false;
        for utxo in &utxos {
            changed |= self.registry.mark_used(utxo.chain, utxo.address_index);
        }
        if changed {
            self.persist();
        }
        Ok(utxos)
    }

    pub async fn transactions(
        &mut self,
        transport: &mut Transport,
        tip: u32,
        options: &TransactionsOptions,
    ) -> Result<Vec<TransactionRecord>> {
        let watched = self.registry.watch_list(&self.keys)?;
        self.history
            .page(transport, &watched, self.keys.network(), tip, options)
            .await
    }

    pub fn invalidate_history(&mut self) {
        self.history.invalidate();
    }

    pub fn reset_history(&mut self) {
        self.history.reset();
    }

    /// Mark the owner of `script` used; true when it belongs to this account
    /// and was not known to be used yet.
    pub fn mark_used_script(&mut self, script: &ScriptBuf) -> bool {
        let changed = self.registry.mark_used_script(script);
        if changed {
            self.persist();
        }
        changed
    }

    pub fn flush(&mut self) -> Result<()> {
        self.registry.flush()
    }

    /// Flush used-flag updates; a failed write is logged, not fatal to the query.
    pub fn persist(&mut self) {
        if let Err(e) = self.registry.flush() {
            warn!("Address registry flush failed for account {}: {}", self.number(), e);
        }
    }
}
