//! Network parameters - what `connect` consumes, and how a name + URL resolve
//! to a concrete Electrum endpoint.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default SOCKS5 proxy of a local Tor daemon.
pub const DEFAULT_TOR_PROXY: &str = "127.0.0.1:9050";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self { LogLevel::Debug => "debug", LogLevel::Info => "info", LogLevel::Warn => "warn", LogLevel::Error => "error" }
    }
}

/// Immutable connect-time configuration. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkParameters {
    pub name: String,
    /// Backend URL; the network's default when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub use_tor: bool,
    /// Overrides the protocol implied by the URL or network default.
    #[serde(default)]
    pub tls: Option<bool>,
    #[serde(default = "default_true")]
    pub validate_electrum_domain: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    /// SOCKS5 proxy used when `use_tor` is set.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_true() -> bool { true }

impl NetworkParameters {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
            use_tor: false,
            tls: None,
            validate_electrum_domain: true,
            log_level: LogLevel::default(),
            proxy: None,
        }
    }
    pub fn with_url(mut self, url: impl Into<String>) -> Self { self.url = Some(url.into()); self }
    pub fn with_tls(mut self, tls: bool) -> Self { self.tls = Some(tls); self }
    pub fn with_tor(mut self, use_tor: bool) -> Self { self.use_tor = use_tor; self }
    pub fn with_domain_validation(mut self, validate: bool) -> Self { self.validate_electrum_domain = validate; self }
    pub fn with_log_level(mut self, level: LogLevel) -> Self { self.log_level = level; self }
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self { self.proxy = Some(proxy.into()); self }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Resolve against the known-network table.
    pub fn resolve(&self) -> Result<NetworkProfile> {
        let known = KnownNetwork::lookup(&self.name)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown network '{}'", self.name)))?;

        let url = match &self.url {
            Some(url) => url.parse::<ElectrumUrl>()?,
            None => ElectrumUrl { host_port: known.default_url.to_string(), tls: known.tls, validate_domain: true },
        };
        let tls = self.tls.unwrap_or(url.tls);
        let endpoint = Endpoint {
            host_port: url.host_port,
            tls,
            validate_domain: tls && self.validate_electrum_domain && url.validate_domain,
            socks5: self.use_tor.then(|| self.proxy.clone().unwrap_or_else(|| DEFAULT_TOR_PROXY.to_string())),
        };

        Ok(NetworkProfile { name: self.name.clone(), network: known.network, endpoint })
    }
}

/// Resolved network: chain + where to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: String,
    pub network: bitcoin::Network,
    pub endpoint: Endpoint,
}

impl NetworkProfile {
    /// BIP44 coin type: 0 on mainnet, 1 on every test chain.
    pub fn coin_type(&self) -> u32 {
        if self.network == bitcoin::Network::Bitcoin { 0 } else { 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host_port: String,
    pub tls: bool,
    /// Certificate/domain checks. Off means insecure, test-only.
    pub validate_domain: bool,
    pub socks5: Option<String>,
}

impl Endpoint {
    /// URL in the form `electrum_client` accepts.
    pub fn url(&self) -> String {
        format!("{}://{}", if self.tls { "ssl" } else { "tcp" }, self.host_port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())?;
        if self.tls && !self.validate_domain { write!(f, " (unverified)")?; }
        if let Some(proxy) = &self.socks5 { write!(f, " via {}", proxy)?; }
        Ok(())
    }
}

/// Parsed backend URL.
///
/// Accepts `host:port[:t|s[:noverify]]` and `tcp://host:port` / `ssl://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectrumUrl {
    pub host_port: String,
    pub tls: bool,
    pub validate_domain: bool,
}

impl FromStr for ElectrumUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidConfig(format!("invalid electrum url '{}'", s));

        let (scheme_tls, rest) = match s.split_once("://") {
            Some(("ssl", rest)) => (Some(true), rest),
            Some(("tcp", rest)) => (Some(false), rest),
            Some(_) => return Err(bad()),
            None => (None, s),
        };

        let mut parts = rest.split(':');
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(bad)?;
        let port: u16 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let proto = parts.next();
        let noverify = match parts.next() {
            None => false,
            Some("noverify") => true,
            Some(_) => return Err(bad()),
        };
        if parts.next().is_some() { return Err(bad()); }

        let tls = match (scheme_tls, proto) {
            (Some(tls), None) => tls,
            (Some(_), Some(_)) => return Err(bad()),
            (None, None) | (None, Some("t")) => false,
            (None, Some("s")) => true,
            (None, Some(_)) => return Err(bad()),
        };

        Ok(Self { host_port: format!("{}:{}", host, port), tls, validate_domain: !noverify })
    }
}

struct KnownNetwork {
    network: bitcoin::Network,
    default_url: &'static str,
    tls: bool,
}

impl KnownNetwork {
    fn lookup(name: &str) -> Option<Self> {
        use bitcoin::Network::*;
        let (network, default_url, tls) = match name {
            "mainnet" | "electrum-mainnet" => (Bitcoin, "blockstream.info:700", true),
            "testnet" | "electrum-testnet" => (Testnet, "blockstream.info:993", true),
            "signet" | "electrum-signet" => (Signet, "mempool.space:60602", true),
            "regtest" | "electrum-regtest" => (Regtest, "localhost:50001", false),
            _ => return None,
        };
        Some(Self { network, default_url, tls })
    }
}
