//! Typed query options. Every field is optional in JSON; unknown fields are
//! rejected.

use crate::error::Result;
use crate::keys::ChainType;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TRANSACTION_COUNT: usize = 30;

fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveAddressOptions {
    pub subaccount: u32,
    pub chain_type: ChainType,
    /// Peek at this index instead of issuing the next address.
    pub index: Option<u32>,
}

impl ReceiveAddressOptions {
    pub fn from_json(json: &str) -> Result<Self> { from_json(json) }

    pub fn internal() -> Self {
        Self { chain_type: ChainType::Internal, ..Self::default() }
    }

    pub fn peek(chain_type: ChainType, index: u32) -> Self {
        Self { chain_type, index: Some(index), ..Self::default() }
    }

    pub fn for_subaccount(mut self, subaccount: u32) -> Self {
        self.subaccount = subaccount;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceOptions {
    pub subaccount: u32,
    /// Minimum confirmations; 0 includes mempool outputs.
    pub num_confs: u32,
    pub timeout_ms: Option<u64>,
}

impl BalanceOptions {
    pub fn from_json(json: &str) -> Result<Self> { from_json(json) }

    pub fn with_num_confs(num_confs: u32) -> Self {
        Self { num_confs, ..Self::default() }
    }

    pub fn for_subaccount(mut self, subaccount: u32) -> Self {
        self.subaccount = subaccount;
        self
    }

    pub fn timeout(&self) -> Option<Duration> { millis(self.timeout_ms) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionFilters {
    /// Only transactions with an input or output paying this address.
    pub address: Option<String>,
    /// Inclusive bounds on block time, unix seconds.
    pub from_timestamp: Option<u64>,
    pub to_timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionsOptions {
    pub subaccount: u32,
    #[serde(alias = "first")]
    pub offset: usize,
    pub count: usize,
    pub filters: TransactionFilters,
    pub timeout_ms: Option<u64>,
}

impl Default for TransactionsOptions {
    fn default() -> Self {
        Self {
            subaccount: 0,
            offset: 0,
            count: DEFAULT_TRANSACTION_COUNT,
            filters: TransactionFilters::default(),
            timeout_ms: None,
        }
    }
}

impl TransactionsOptions {
    pub fn from_json(json: &str) -> Result<Self> { from_json(json) }

    pub fn page(offset: usize, count: usize) -> Self {
        Self { offset, count, ..Self::default() }
    }

    pub fn for_subaccount(mut self, subaccount: u32) -> Self {
        self.subaccount = subaccount;
        self
    }

    pub fn timeout(&self) -> Option<Duration> { millis(self.timeout_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_documents_take_defaults() {
        assert_eq!(ReceiveAddressOptions::from_json("{}").unwrap(), ReceiveAddressOptions::default());
        assert_eq!(BalanceOptions::from_json("{}").unwrap().num_confs, 0);
        let tx = TransactionsOptions::from_json("{}").unwrap();
        assert_eq!((tx.offset, tx.count), (0, DEFAULT_TRANSACTION_COUNT));
    }

    #[test]
    fn recognized_fields_parse() {
        let opts = ReceiveAddressOptions::from_json(r#"{"chain_type":"internal","index":7}"#).unwrap();
        assert_eq!(opts, ReceiveAddressOptions::peek(ChainType::Internal, 7));

        let opts = BalanceOptions::from_json(r#"{"num_confs":6,"timeout_ms":1500}"#).unwrap();
        assert_eq!(opts.num_confs, 6);
        assert_eq!(opts.timeout(), Some(Duration::from_millis(1500)));

        let opts = TransactionsOptions::from_json(r#"{"first":10,"count":5,"filters":{"from_timestamp":100}}"#).unwrap();
        assert_eq!(opts.offset, 10);
        assert_eq!(opts.count, 5);
        assert_eq!(opts.filters.from_timestamp, Some(100));
    }

    #[test]
    fn subaccount_defaults_to_zero() {
        assert_eq!(BalanceOptions::default().subaccount, 0);
        let opts = ReceiveAddressOptions::from_json(r#"{"subaccount":2}"#).unwrap();
        assert_eq!(opts, ReceiveAddressOptions::default().for_subaccount(2));
        let opts = TransactionsOptions::from_json(r#"{"subaccount":1,"count":3}"#).unwrap();
        assert_eq!((opts.subaccount, opts.count), (1, 3));
        assert_eq!(BalanceOptions::from_json(r#"{"subaccount":4}"#).unwrap().subaccount, 4);
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = BalanceOptions::from_json(r#"{"num_confs":1,"asset_id":"btc"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidConfig);
        assert!(ReceiveAddressOptions::from_json(r#"{"address_type":"p2wpkh"}"#).is_err());
        assert!(TransactionsOptions::from_json(r#"{"filters":{"asset":"btc"}}"#).is_err());
    }
}
