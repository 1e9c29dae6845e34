//! Electrum session: a wallet session core over an Electrum backend.
//!
//! # Architecture
//!
//! ```text
//! Session (tokio Mutex, state machine)
//!   │
//!   ├── NetworkParameters -> NetworkProfile (resolved once at connect)
//!   │
//!   ├── Transport (one logical connection)
//!   │     ├── Arc<dyn Backend>  (Electrum via bdk_electrum, or a test double)
//!   │     └── poller task ──mpsc──> TransportEvent
//!   │
//!   └── WalletState (only while Active)
//!         ├── Account per subaccount (m/84'/coin'/n')
//!         │     ├── WalletKeys      (BIP39 -> BIP84 account xpub)
//!         │     ├── AddressRegistry (per-chain cursors, persisted)
//!         │     └── HistoryCache    (invalidated on block / reconnect)
//!         └── FeeEstimator    (25 buckets, back-filled)
//! ```
//!
//! # Lifecycle
//!
//! | Call | From | To |
//! |------|------|----|
//! | `connect(params)` | Disconnected | Connected |
//! | `login(mnemonic, passphrase)` | Connected | Active |
//! | connection lost | Active | Connected |
//! | `disconnect()` | any | Closed |
//!
//! # Features
//!
//! - `electrum` (default) - real backend over `electrum_client` with rustls
//!
//! # Usage
//!
//! ```ignore
//! use electrum_session::{NetworkParameters, Session, SessionConfig, BalanceOptions};
//!
//! let session = Session::new(SessionConfig::default().with_default_data_dir());
//! session.connect(NetworkParameters::new("testnet")).await?;
//! session.login("abandon abandon ... about", "").await?;
//!
//! let balance = session.get_balance(BalanceOptions::default()).await?;
//! println!("{} sat", balance.btc());
//! ```

pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod network;
pub mod session;
pub mod transport;
pub mod wallet;

pub use config::{RetryPolicy, SessionConfig};
pub use error::{Error, ErrorKind, Result};
pub use keys::{ChainType, DerivedAddress, WalletKeys};
pub use network::{ElectrumUrl, Endpoint, LogLevel, NetworkParameters, NetworkProfile};
pub use session::{
    BalanceOptions, ReceiveAddressOptions, Session, SessionState, TransactionFilters, TransactionsOptions,
};
pub use transport::{Backend, BackendError, Connector, ElectrumConnector, TransportEvent};
pub use wallet::{
    AddressRecord, Balance, FeeEstimates, TransactionKind, TransactionRecord, TxInputRecord, TxOutputRecord,
    UnspentOutput, FEE_BUCKETS,
};

pub use bitcoin::Network;
