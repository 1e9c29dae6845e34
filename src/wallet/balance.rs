//! Balance & UTXO aggregation. Always computed from a live query; a failed
//! fetch is an error, never the previous snapshot.

use super::addresses::AddressRecord;
use crate::error::Result;
use crate::keys::ChainType;
use crate::transport::{expect_batch, Transport};
use bitcoin::ScriptBuf;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const BTC: &str = "btc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub confirmations: u32,
    /// `None` while in the mempool.
    pub height: Option<u32>,
    pub subaccount: u32,
    pub chain: ChainType,
    pub address_index: u32,
    pub address: String,
}

/// Asset class -> satoshis. `"btc"` is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Balance(BTreeMap<String, u64>);

impl Balance {
    pub fn btc(&self) -> u64 {
        self.0.get(BTC).copied().unwrap_or(0)
    }

    pub fn get(&self, asset: &str) -> Option<u64> {
        self.0.get(asset).copied()
    }

    pub fn assets(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// `0` for mempool, otherwise blocks since inclusion, counting its own.
pub fn confirmations(height: u32, tip: u32) -> u32 {
    if height == 0 { 0 } else { tip.saturating_sub(height) + 1 }
}

/// Keep outputs with at least `num_confs` confirmations.
pub fn filter(utxos: Vec<UnspentOutput>, num_confs: u32) -> Vec<UnspentOutput> {
    utxos.into_iter().filter(|u| u.confirmations >= num_confs).collect()
}

pub fn aggregate(utxos: &[UnspentOutput], num_confs: u32) -> Balance {
    let total = utxos
        .iter()
        .filter(|u| u.confirmations >= num_confs)
        .fold(0u64, |acc, u| acc.saturating_add(u.value));
    Balance(BTreeMap::from([(BTC.to_string(), total)]))
}

/// Unspent outputs of every watched address, sorted by txid/vout.
pub async fn fetch_unspent(
    transport: &mut Transport,
    watched: &[AddressRecord],
    tip: u32,
    timeout: Option<Duration>,
) -> Result<Vec<UnspentOutput>> {
    let scripts: Arc<Vec<ScriptBuf>> = Arc::new(watched.iter().map(|r| r.script_pubkey.clone()).collect());
    let batches = transport
        .call("list_unspent", timeout, move |b| {
            let scripts = scripts.clone();
            async move { b.list_unspent(&scripts).await }
        })
        .await?;
    let batches = expect_batch("list_unspent", watched.len(), batches)?;

    let mut out: Vec<UnspentOutput> = watched
        .iter()
        .zip(batches)
        .flat_map(|(record, utxos)| {
            utxos.into_iter().map(move |u| UnspentOutput {
                txid: u.txid.to_string(),
                vout: u.vout,
                value: u.value,
                confirmations: confirmations(u.height, tip),
                height: (u.height > 0).then_some(u.height),
                subaccount: record.subaccount,
                chain: record.chain,
                address_index: record.index,
                address: record.address.clone(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.txid.cmp(&b.txid).then(a.vout.cmp(&b.vout)));
    out.dedup_by(|a, b| a.txid == b.txid && a.vout == b.vout);
    debug!("{} unspent outputs across {} scripts", out.len(), watched.len());
    Ok(out)
}
