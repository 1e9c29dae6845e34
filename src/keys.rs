//! Key derivation - BIP39 mnemonic to BIP84 accounts, addresses by chain/index.
//!
//! Pure and network-independent. The seed and private keys live only inside
//! `WalletKeys::from_mnemonic_accounts`; what survives is one xpub per account.

use crate::error::{Error, Result};
use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network, ScriptBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

const PURPOSE: u32 = 84;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    External,
    Internal,
}

impl ChainType {
    pub const ALL: [ChainType; 2] = [ChainType::External, ChainType::Internal];

    /// BIP44 `change` level.
    pub fn index(self) -> u32 {
        match self { ChainType::External => 0, ChainType::Internal => 1 }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { ChainType::External => "external", ChainType::Internal => "internal" })
    }
}

/// Public material for one derivation leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub chain: ChainType,
    pub index: u32,
    pub public_key: CompressedPublicKey,
    pub address: Address,
    pub script_pubkey: ScriptBuf,
}

#[derive(Clone)]
pub struct WalletKeys {
    network: Network,
    account: u32,
    account_path: DerivationPath,
    account_xpub: Xpub,
    secp: Secp256k1<All>,
}

impl WalletKeys {
    /// Validate the mnemonic checksum and derive account 0, `m/84'/coin'/0'`.
    pub fn from_mnemonic(mnemonic: &str, passphrase: &str, network: Network) -> Result<Self> {
        Self::from_mnemonic_accounts(mnemonic, passphrase, network, &[0])?
            .pop()
            .ok_or_else(|| Error::InvalidConfig("no account derived".into()))
    }

    /// One key set per requested account `m/84'/coin'/n'`, all from a single seed.
    pub fn from_mnemonic_accounts(
        mnemonic: &str,
        passphrase: &str,
        network: Network,
        accounts: &[u32],
    ) -> Result<Vec<Self>> {
        let mnemonic = Mnemonic::parse_normalized(mnemonic.trim())
            .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase));

        let secp = Secp256k1::new();
        let master = Xpriv::new_master(network, &seed[..])
            .map_err(|e| Error::Authentication(format!("master key: {}", e)))?;

        let coin_type = if network == Network::Bitcoin { 0 } else { 1 };
        accounts
            .iter()
            .map(|&account| -> Result<Self> {
                let account_path = DerivationPath::from(vec![
                    hardened(PURPOSE)?,
                    hardened(coin_type)?,
                    hardened(account)?,
                ]);
                let account_xprv = master
                    .derive_priv(&secp, &account_path)
                    .map_err(|e| Error::Authentication(format!("account {} key: {}", account, e)))?;
                let account_xpub = Xpub::from_priv(&secp, &account_xprv);
                Ok(Self { network, account, account_path, account_xpub, secp: secp.clone() })
            })
            .collect()
    }

    pub fn network(&self) -> Network { self.network }
    pub fn account(&self) -> u32 { self.account }
    pub fn account_path(&self) -> &DerivationPath { &self.account_path }
    pub fn account_xpub(&self) -> &Xpub { &self.account_xpub }

    /// Stable identifier of this account: hex of sha256(account xpub), 16 bytes.
    pub fn wallet_id(&self) -> String {
        let digest = Sha256::digest(self.account_xpub.to_string().as_bytes());
        hex::encode(&digest[..16])
    }

    pub fn derive(&self, chain: ChainType, index: u32) -> Result<DerivedAddress> {
        let path = [normal(chain.index())?, normal(index)?];
        let child = self
            .account_xpub
            .derive_pub(&self.secp, &path)
            .map_err(|e| Error::InvalidConfig(format!("derive {}/{}: {}", chain, index, e)))?;
        let public_key = CompressedPublicKey(child.public_key);
        let address = Address::p2wpkh(&public_key, self.network);
        let script_pubkey = address.script_pubkey();
        Ok(DerivedAddress { chain, index, public_key, address, script_pubkey })
    }
}

impl fmt::Debug for WalletKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKeys")
            .field("network", &self.network)
            .field("account", &self.account)
            .field("account_path", &self.account_path.to_string())
            .field("wallet_id", &self.wallet_id())
            .finish()
    }
}

fn hardened(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_hardened_idx(index).map_err(|e| Error::InvalidConfig(e.to_string()))
}

fn normal(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_normal_idx(index).map_err(|e| Error::InvalidConfig(e.to_string()))
}
