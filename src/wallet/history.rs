//! Transaction history cache.
//!
//! Records are rebuilt from script histories on first use after an
//! invalidation (new block, reconnect, script activity). Raw transactions are
//! immutable by txid and outlive invalidations.

use super::addresses::AddressRecord;
use super::balance::confirmations;
use crate::error::{Error, Result};
use crate::keys::ChainType;
use crate::session::{TransactionFilters, TransactionsOptions};
use crate::transport::{expect_batch, Transport};
use bitcoin::{Address, Network, ScriptBuf, Transaction, Txid};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Incoming,
    Outgoing,
    /// Every output returns to the wallet.
    Redeposit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInputRecord {
    /// Previous output being spent.
    pub txid: String,
    pub vout: u32,
    pub address: Option<String>,
    pub value: Option<u64>,
    pub is_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutputRecord {
    pub vout: u32,
    pub address: Option<String>,
    pub value: u64,
    pub is_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub txid: String,
    /// `None` while unconfirmed.
    pub height: Option<u32>,
    pub confirmations: u32,
    /// Block time, unix seconds.
    pub timestamp: Option<u64>,
    pub inputs: Vec<TxInputRecord>,
    pub outputs: Vec<TxOutputRecord>,
    pub received: u64,
    pub sent: u64,
    /// Known only when every spent output could be resolved.
    pub fee: Option<u64>,
    pub kind: TransactionKind,
}

impl TransactionRecord {
    fn touches(&self, address: &str) -> bool {
        self.inputs.iter().any(|i| i.address.as_deref() == Some(address))
            || self.outputs.iter().any(|o| o.address.as_deref() == Some(address))
    }

    fn matches(&self, filters: &TransactionFilters, now: u64) -> bool {
        if let Some(address) = &filters.address {
            if !self.touches(address) {
                return false;
            }
        }
        let time = self.timestamp.unwrap_or(now);
        filters.from_timestamp.map_or(true, |from| time >= from)
            && filters.to_timestamp.map_or(true, |to| time <= to)
    }
}

/// Sum that refuses to wrap; backend amounts are untrusted.
fn checked_total(values: impl IntoIterator<Item = u64>) -> Option<u64> {
    values.into_iter().try_fold(0u64, |acc, v| acc.checked_add(v))
}

/// Unconfirmed first, then newest block first, ties by txid descending.
fn newest_first(a: &TransactionRecord, b: &TransactionRecord) -> Ordering {
    match (a.height, b.height) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (ha, hb) => hb.cmp(&ha).then_with(|| b.txid.cmp(&a.txid)),
    }
}

#[derive(Debug, Default)]
pub struct HistoryCache {
    records: Option<Vec<TransactionRecord>>,
    raw: HashMap<Txid, Transaction>,
    block_times: HashMap<u32, u64>,
}

impl HistoryCache {
    pub fn new() -> Self { Self::default() }

    pub fn is_valid(&self) -> bool { self.records.is_some() }

    pub fn invalidate(&mut self) {
        if self.records.take().is_some() {
            debug!("Transaction history invalidated");
        }
    }

    /// Drop block times as well; headers may have changed under a reorg.
    pub fn reset(&mut self) {
        self.invalidate();
        self.block_times.clear();
    }

    /// Paginated, filtered view; rebuilds from the backend when stale.
    pub async fn page(
        &mut self,
        transport: &mut Transport,
        watched: &[AddressRecord],
        network: Network,
        tip: u32,
        options: &TransactionsOptions,
    ) -> Result<Vec<TransactionRecord>> {
        if self.records.is_none() {
            let records = self.rebuild(transport, watched, network, tip, options.timeout()).await?;
            self.records = Some(records);
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        Ok(self
            .records
            .iter()
            .flatten()
            .filter(|r| r.matches(&options.filters, now))
            .skip(options.offset)
            .take(options.count)
            .cloned()
            .collect())
    }

    async fn rebuild(
        &mut self,
        transport: &mut Transport,
        watched: &[AddressRecord],
        network: Network,
        tip: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<TransactionRecord>> {
        let owned: HashMap<ScriptBuf, (ChainType, u32)> =
            watched.iter().map(|r| (r.script_pubkey.clone(), (r.chain, r.index))).collect();

        let scripts: Arc<Vec<ScriptBuf>> = Arc::new(watched.iter().map(|r| r.script_pubkey.clone()).collect());
        let histories = transport
            .call("history", timeout, move |b| {
                let scripts = scripts.clone();
                async move { b.history(&scripts).await }
            })
            .await?;
        let histories = expect_batch("history", watched.len(), histories)?;

        // A txid can appear under several scripts; the highest height wins.
        let mut heights: BTreeMap<Txid, u32> = BTreeMap::new();
        for entry in histories.into_iter().flatten() {
            let height = u32::try_from(entry.height).unwrap_or(0);
            let slot = heights.entry(entry.txid).or_insert(height);
            *slot = (*slot).max(height);
        }

        let wallet_txids: Vec<Txid> = heights.keys().copied().collect();
        self.fetch_missing(transport, &wallet_txids, timeout).await?;

        let prevouts: Vec<Txid> = wallet_txids
            .iter()
            .filter_map(|txid| self.raw.get(txid))
            .flat_map(|tx| tx.input.iter())
            .filter(|input| !input.previous_output.is_null())
            .map(|input| input.previous_output.txid)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.fetch_missing(transport, &prevouts, timeout).await?;

        let unknown_heights: Vec<u32> = heights
            .values()
            .copied()
            .filter(|h| *h > 0 && !self.block_times.contains_key(h))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        if !unknown_heights.is_empty() {
            let batch = Arc::new(unknown_heights.clone());
            let times = transport
                .call("block_times", timeout, move |b| {
                    let batch = batch.clone();
                    async move { b.block_times(&batch).await }
                })
                .await?;
            let times = expect_batch("block_times", unknown_heights.len(), times)?;
            for (height, time) in unknown_heights.into_iter().zip(times) {
                self.block_times.insert(height, u64::from(time));
            }
        }

        let mut records = heights
            .iter()
            .map(|(txid, height)| {
                let tx = self
                    .raw
                    .get(txid)
                    .ok_or_else(|| Error::Query(format!("transaction {} not fetched", txid)))?;
                self.describe(tx, *height, tip, network, &owned)
            })
            .collect::<Result<Vec<TransactionRecord>>>()?;
        records.sort_by(newest_first);
        debug!("Rebuilt history: {} transactions", records.len());
        Ok(records)
    }

    async fn fetch_missing(&mut self, transport: &mut Transport, txids: &[Txid], timeout: Option<Duration>) -> Result<()> {
        let missing: Vec<Txid> = txids.iter().filter(|t| !self.raw.contains_key(*t)).copied().collect();
        if missing.is_empty() {
            return Ok(());
        }
        let batch = Arc::new(missing.clone());
        let txs = transport
            .call("transactions", timeout, move |b| {
                let batch = batch.clone();
                async move { b.transactions(&batch).await }
            })
            .await?;
        for tx in expect_batch("transactions", missing.len(), txs)? {
            self.raw.insert(tx.compute_txid(), tx);
        }
        match missing.iter().find(|t| !self.raw.contains_key(*t)) {
            Some(absent) => Err(Error::Query(format!("transactions: {} not in response", absent))),
            None => Ok(()),
        }
    }

    fn describe(
        &self,
        tx: &Transaction,
        height: u32,
        tip: u32,
        network: Network,
        owned: &HashMap<ScriptBuf, (ChainType, u32)>,
    ) -> Result<TransactionRecord> {
        let txid = tx.compute_txid();
        let overflow = || Error::Query(format!("malformed transaction {}: amounts overflow", txid));
        let address_of = |script: &bitcoin::Script| Address::from_script(script, network).ok().map(|a| a.to_string());

        let inputs: Vec<TxInputRecord> = tx
            .input
            .iter()
            .map(|input| {
                let prev = input.previous_output;
                let spent = self
                    .raw
                    .get(&prev.txid)
                    .and_then(|p| p.output.get(prev.vout as usize));
                TxInputRecord {
                    txid: prev.txid.to_string(),
                    vout: prev.vout,
                    address: spent.and_then(|o| address_of(o.script_pubkey.as_script())),
                    value: spent.map(|o| o.value.to_sat()),
                    is_mine: spent.map_or(false, |o| owned.contains_key(&o.script_pubkey)),
                }
            })
            .collect();

        let outputs: Vec<TxOutputRecord> = tx
            .output
            .iter()
            .enumerate()
            .map(|(vout, o)| TxOutputRecord {
                vout: vout as u32,
                address: address_of(o.script_pubkey.as_script()),
                value: o.value.to_sat(),
                is_mine: owned.contains_key(&o.script_pubkey),
            })
            .collect();

        let received = checked_total(outputs.iter().filter(|o| o.is_mine).map(|o| o.value)).ok_or_else(overflow)?;
        let sent = checked_total(inputs.iter().filter(|i| i.is_mine).filter_map(|i| i.value)).ok_or_else(overflow)?;
        let total_out = checked_total(outputs.iter().map(|o| o.value)).ok_or_else(overflow)?;
        let total_in = match inputs.iter().map(|i| i.value).collect::<Option<Vec<u64>>>() {
            Some(values) => Some(checked_total(values).ok_or_else(overflow)?),
            None => None,
        };
        let fee = total_in
            .filter(|_| !tx.is_coinbase())
            .and_then(|total_in| total_in.checked_sub(total_out));

        let kind = if sent == 0 {
            TransactionKind::Incoming
        } else if outputs.iter().all(|o| o.is_mine) {
            TransactionKind::Redeposit
        } else {
            TransactionKind::Outgoing
        };

        Ok(TransactionRecord {
            txid: txid.to_string(),
            height: (height > 0).then_some(height),
            confirmations: confirmations(height, tip),
            timestamp: self.block_times.get(&height).copied().filter(|_| height > 0),
            inputs,
            outputs,
            received,
            sent,
            fee,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn, TxOut, Witness};

    fn wallet_script() -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend([0x22u8; 20]);
        ScriptBuf::from_bytes(bytes)
    }

    fn paying(prev: OutPoint, values: &[u64]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: prev,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: values
                .iter()
                .map(|v| TxOut { value: Amount::from_sat(*v), script_pubkey: wallet_script() })
                .collect(),
        }
    }

    fn owned() -> HashMap<ScriptBuf, (ChainType, u32)> {
        HashMap::from([(wallet_script(), (ChainType::External, 0))])
    }

    fn record(txid: &str, height: Option<u32>, timestamp: Option<u64>) -> TransactionRecord {
        TransactionRecord {
            txid: txid.to_string(),
            height,
            confirmations: 0,
            timestamp,
            inputs: vec![],
            outputs: vec![TxOutputRecord { vout: 0, address: Some("tb1qexample".into()), value: 1, is_mine: true }],
            received: 1,
            sent: 0,
            fee: None,
            kind: TransactionKind::Incoming,
        }
    }

    #[test]
    fn ordering_puts_mempool_first() {
        let mut records = vec![
            record("aa", Some(100), None),
            record("bb", None, None),
            record("cc", Some(200), None),
            record("dd", Some(100), None),
        ];
        records.sort_by(newest_first);
        let order: Vec<&str> = records.iter().map(|r| r.txid.as_str()).collect();
        assert_eq!(order, vec!["bb", "cc", "dd", "aa"]);
    }

    #[test]
    fn filters_by_address_and_time() {
        let r = record("aa", Some(100), Some(1_000));
        let by_addr = TransactionFilters { address: Some("tb1qexample".into()), ..Default::default() };
        assert!(r.matches(&by_addr, 5_000));
        let other = TransactionFilters { address: Some("tb1qother".into()), ..Default::default() };
        assert!(!r.matches(&other, 5_000));

        let window = TransactionFilters { from_timestamp: Some(500), to_timestamp: Some(1_500), ..Default::default() };
        assert!(r.matches(&window, 5_000));
        let late = TransactionFilters { from_timestamp: Some(2_000), ..Default::default() };
        assert!(!r.matches(&late, 5_000));

        // Unconfirmed counts as "now".
        let pending = record("bb", None, None);
        assert!(pending.matches(&late, 5_000));
        assert!(!pending.matches(&window, 5_000));
    }

    #[test]
    fn describe_resolves_fee_from_prevouts() {
        let mut cache = HistoryCache::new();
        let source = paying(OutPoint::null(), &[10_000]);
        let spend = paying(OutPoint { txid: source.compute_txid(), vout: 0 }, &[6_000, 3_500]);
        cache.raw.insert(source.compute_txid(), source);

        let record = cache.describe(&spend, 100, 105, Network::Testnet, &owned()).unwrap();
        assert_eq!(record.fee, Some(500));
        assert_eq!(record.sent, 10_000);
        assert_eq!(record.received, 9_500);
        assert_eq!(record.kind, TransactionKind::Redeposit);
        assert_eq!(record.confirmations, 6);
    }

    #[test]
    fn overflowing_amounts_are_malformed() {
        let cache = HistoryCache::new();
        let half = u64::MAX / 2 + 1;
        let tx = paying(OutPoint::null(), &[half, half]);
        let err = cache.describe(&tx, 100, 100, Network::Testnet, &owned()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Query);
    }
}
