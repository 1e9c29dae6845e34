//! Address registry - per-chain cursors of one account that never hand out
//! the same receive address twice in a row.
//!
//! Cursors only move forward. An index is skipped when it is already known to
//! be used. Peeking at an explicit index derives without touching the cursor.
//! With a store path the cursor/used state survives restarts as JSON.

use crate::error::{Error, Result};
use crate::keys::{ChainType, DerivedAddress, WalletKeys};
use bitcoin::ScriptBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::{debug, trace};

/// Address as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressRecord {
    pub address: String,
    pub subaccount: u32,
    pub index: u32,
    pub chain: ChainType,
    #[serde(skip)]
    pub script_pubkey: ScriptBuf,
    pub issued_at: Option<DateTime<Utc>>,
    pub used: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ChainCursor {
    next: u32,
    last_issued: Option<u32>,
    used: BTreeSet<u32>,
    issued: BTreeMap<u32, DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    chains: BTreeMap<ChainType, ChainCursor>,
}

#[derive(Debug)]
pub struct AddressRegistry {
    gap_limit: u32,
    chains: BTreeMap<ChainType, ChainCursor>,
    derived: HashMap<(ChainType, u32), DerivedAddress>,
    by_script: HashMap<ScriptBuf, (ChainType, u32)>,
    store: Option<PathBuf>,
    dirty: bool,
}

impl AddressRegistry {
    pub fn new(gap_limit: u32) -> Self {
        Self {
            gap_limit: gap_limit.max(1),
            chains: ChainType::ALL.iter().map(|c| (*c, ChainCursor::default())).collect(),
            derived: HashMap::new(),
            by_script: HashMap::new(),
            store: None,
            dirty: false,
        }
    }

    /// Registry backed by `path`; loads the previous state when present.
    pub fn open(gap_limit: u32, path: Option<PathBuf>) -> Result<Self> {
        let mut registry = Self::new(gap_limit);
        let Some(path) = path else { return Ok(registry) };

        if path.exists() {
            let raw = std::fs::read(&path)?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)
                .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
            registry.chains.extend(snapshot.chains);
            debug!("Loaded address registry from {}", path.display());
        }
        registry.store = Some(path);
        Ok(registry)
    }

    pub fn gap_limit(&self) -> u32 { self.gap_limit }

    pub fn next_index(&self, chain: ChainType) -> u32 {
        self.chains.get(&chain).map(|c| c.next).unwrap_or(0)
    }

    pub fn last_issued(&self, chain: ChainType) -> Option<u32> {
        self.chains.get(&chain).and_then(|c| c.last_issued)
    }

    pub fn is_used(&self, chain: ChainType, index: u32) -> bool {
        self.chains.get(&chain).map(|c| c.used.contains(&index)).unwrap_or(false)
    }

    /// Issue the next unused address on `chain` and advance the cursor past it.
    pub fn issue_next(&mut self, keys: &WalletKeys, chain: ChainType) -> Result<AddressRecord> {
        let cursor = self.chains.entry(chain).or_default();
        let mut index = cursor.next;
        while cursor.used.contains(&index) {
            index += 1;
        }
        self.derive(keys, chain, index)?;

        let cursor = self.chains.entry(chain).or_default();
        cursor.next = index + 1;
        cursor.last_issued = Some(index);
        cursor.issued.insert(index, Utc::now());
        self.dirty = true;
        debug!("Issued {} address {}", chain, index);
        self.record(keys, chain, index)
    }

    /// Address at `index` without marking it issued.
    pub fn peek(&mut self, keys: &WalletKeys, chain: ChainType, index: u32) -> Result<AddressRecord> {
        self.record(keys, chain, index)
    }

    /// Returns true when the flag changed.
    pub fn mark_used(&mut self, chain: ChainType, index: u32) -> bool {
        let cursor = self.chains.entry(chain).or_default();
        if !cursor.used.insert(index) {
            return false;
        }
        if index >= cursor.next {
            cursor.next = index + 1;
        }
        self.dirty = true;
        trace!("Marked {} address {} used", chain, index);
        true
    }

    pub fn mark_used_script(&mut self, script: &ScriptBuf) -> bool {
        match self.lookup(script) {
            Some((chain, index)) => self.mark_used(chain, index),
            None => false,
        }
    }

    /// Owner of a script among the addresses derived so far.
    pub fn lookup(&self, script: &ScriptBuf) -> Option<(ChainType, u32)> {
        self.by_script.get(script).copied()
    }

    /// Every address the wallet must watch: `0..next + gap_limit` on each chain.
    pub fn watch_list(&mut self, keys: &WalletKeys) -> Result<Vec<AddressRecord>> {
        let mut out = Vec::new();
        for chain in ChainType::ALL {
            let end = self.next_index(chain).saturating_add(self.gap_limit);
            for index in 0..end {
                out.push(self.record(keys, chain, index)?);
            }
        }
        Ok(out)
    }

    /// Write state to the store if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.store {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let snapshot = Snapshot { chains: self.chains.clone() };
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot).map_err(|e| Error::Storage(e.to_string()))?)?;
            std::fs::rename(&tmp, path)?;
            trace!("Flushed address registry to {}", path.display());
        }
        self.dirty = false;
        Ok(())
    }

    fn derive(&mut self, keys: &WalletKeys, chain: ChainType, index: u32) -> Result<&DerivedAddress> {
        if !self.derived.contains_key(&(chain, index)) {
            let derived = keys.derive(chain, index)?;
            self.by_script.insert(derived.script_pubkey.clone(), (chain, index));
            self.derived.insert((chain, index), derived);
        }
        self.derived
            .get(&(chain, index))
            .ok_or_else(|| Error::InvalidConfig(format!("{} address {} not derived", chain, index)))
    }

    fn record(&mut self, keys: &WalletKeys, chain: ChainType, index: u32) -> Result<AddressRecord> {
        let derived = self.derive(keys, chain, index)?;
        let (address, script_pubkey) = (derived.address.to_string(), derived.script_pubkey.clone());
        let cursor = self.chains.get(&chain);
        Ok(AddressRecord {
            address,
            subaccount: keys.account(),
            index,
            chain,
            script_pubkey,
            issued_at: cursor.and_then(|c| c.issued.get(&index).copied()),
            used: cursor.map(|c| c.used.contains(&index)).unwrap_or(false),
        })
    }
}
