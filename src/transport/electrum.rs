//! Electrum backend - bdk_electrum's blocking client behind the async seam.
//!
//! Every call runs on `spawn_blocking`; the client serializes requests on its
//! own socket lock, so the poller and foreground calls can share it.

use super::backend::{Backend, BackendError, Connector};
use crate::network::Endpoint;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "electrum")]
mod inner {
    use super::*;
    use crate::transport::backend::{Notification, ScriptHistory, ScriptUnspent};
    use bdk_electrum::electrum_client::{self, Client, ConfigBuilder, ElectrumApi, Socks5Config};
    use bitcoin::{ScriptBuf, Transaction, Txid};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Opens `electrum_client` connections. Retries are disabled in the client;
    /// the transport owns the reconnect policy.
    pub struct ElectrumConnector {
        timeout_secs: u8,
    }

    impl ElectrumConnector {
        pub fn new(request_timeout: Duration) -> Self {
            // Needed once per process by the rustls-backed client.
            let _ = rustls::crypto::ring::default_provider().install_default();
            let timeout_secs = request_timeout.as_secs().clamp(1, u8::MAX as u64) as u8;
            Self { timeout_secs }
        }
    }

    #[async_trait]
    impl Connector for ElectrumConnector {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Backend>, BackendError> {
            let url = endpoint.url();
            let config = ConfigBuilder::new()
                .timeout(Some(self.timeout_secs))
                .retry(0)
                .validate_domain(endpoint.validate_domain)
                .socks5(endpoint.socks5.as_ref().map(|proxy| Socks5Config::new(proxy.as_str())))
                .build();

            let client = tokio::task::spawn_blocking(move || Client::from_config(&url, config))
                .await
                .map_err(|e| BackendError::Transport(format!("connect task: {}", e)))?
                .map_err(map_err)?;

            Ok(Arc::new(ElectrumBackend {
                client: Arc::new(client),
                subscribed: Arc::new(Mutex::new(HashSet::new())),
            }))
        }
    }

    struct ElectrumBackend {
        client: Arc<Client>,
        subscribed: Arc<Mutex<HashSet<ScriptBuf>>>,
    }

    impl ElectrumBackend {
        async fn blocking<T, F>(&self, f: F) -> Result<T, BackendError>
        where
            T: Send + 'static,
            F: FnOnce(&Client) -> Result<T, electrum_client::Error> + Send + 'static,
        {
            let client = self.client.clone();
            tokio::task::spawn_blocking(move || f(&client))
                .await
                .map_err(|e| BackendError::Transport(format!("blocking task: {}", e)))?
                .map_err(map_err)
        }
    }

    fn map_err(e: electrum_client::Error) -> BackendError {
        match e {
            electrum_client::Error::Protocol(value) => BackendError::Rejected(value.to_string()),
            electrum_client::Error::JSON(e) => BackendError::Malformed(e.to_string()),
            other => BackendError::Transport(other.to_string()),
        }
    }

    #[async_trait]
    impl Backend for ElectrumBackend {
        async fn tip(&self) -> Result<u32, BackendError> {
            self.blocking(|c| c.block_headers_subscribe().map(|h| h.height as u32)).await
        }

        async fn list_unspent(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptUnspent>>, BackendError> {
            if scripts.is_empty() {
                return Ok(Vec::new());
            }
            let scripts = scripts.to_vec();
            self.blocking(move |c| {
                let refs: Vec<&bitcoin::Script> = scripts.iter().map(|s| s.as_script()).collect();
                c.batch_script_list_unspent(&refs)
            })
            .await
            .map(|batches| {
                batches
                    .into_iter()
                    .map(|utxos| {
                        utxos
                            .into_iter()
                            .map(|u| ScriptUnspent { txid: u.tx_hash, vout: u.tx_pos as u32, value: u.value, height: u.height as u32 })
                            .collect()
                    })
                    .collect()
            })
        }

        async fn history(&self, scripts: &[ScriptBuf]) -> Result<Vec<Vec<ScriptHistory>>, BackendError> {
            if scripts.is_empty() {
                return Ok(Vec::new());
            }
            let scripts = scripts.to_vec();
            self.blocking(move |c| {
                let refs: Vec<&bitcoin::Script> = scripts.iter().map(|s| s.as_script()).collect();
                c.batch_script_get_history(&refs)
            })
            .await
            .map(|batches| {
                batches
                    .into_iter()
                    .map(|items| items.into_iter().map(|h| ScriptHistory { txid: h.tx_hash, height: h.height }).collect())
                    .collect()
            })
        }

        async fn transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, BackendError> {
            if txids.is_empty() {
                return Ok(Vec::new());
            }
            let txids = txids.to_vec();
            self.blocking(move |c| {
                let refs: Vec<&Txid> = txids.iter().collect();
                c.batch_transaction_get(&refs)
            })
            .await
        }

        async fn block_times(&self, heights: &[u32]) -> Result<Vec<u32>, BackendError> {
            let heights = heights.to_vec();
            self.blocking(move |c| {
                heights.iter().map(|h| c.block_header(*h as usize).map(|header| header.time)).collect()
            })
            .await
        }

        async fn relay_fee(&self) -> Result<f64, BackendError> {
            self.blocking(|c| c.relay_fee()).await
        }

        async fn estimate_fees(&self, targets: &[usize]) -> Result<Vec<f64>, BackendError> {
            let targets = targets.to_vec();
            self.blocking(move |c| c.batch_estimate_fee(targets)).await
        }

        async fn subscribe_scripts(&self, scripts: &[ScriptBuf]) -> Result<(), BackendError> {
            let fresh: Vec<ScriptBuf> = {
                let subscribed = self.subscribed.lock().map_err(|_| BackendError::Transport("lock".into()))?;
                scripts.iter().filter(|s| !subscribed.contains(*s)).cloned().collect()
            };
            if fresh.is_empty() {
                return Ok(());
            }
            let subscribed = self.subscribed.clone();
            self.blocking(move |c| {
                for script in fresh {
                    c.script_subscribe(&script)?;
                    if let Ok(mut set) = subscribed.lock() {
                        set.insert(script);
                    }
                }
                Ok(())
            })
            .await
        }

        async fn poll_notifications(&self) -> Result<Vec<Notification>, BackendError> {
            let scripts: Vec<ScriptBuf> = self
                .subscribed
                .lock()
                .map_err(|_| BackendError::Transport("lock".into()))?
                .iter()
                .cloned()
                .collect();
            self.blocking(move |c| {
                let mut notes = Vec::new();
                while let Some(header) = c.block_headers_pop()? {
                    notes.push(Notification::NewBlock { height: header.height as u32 });
                }
                for script in scripts {
                    if c.script_pop(&script)?.is_some() {
                        notes.push(Notification::ScriptActivity { script });
                    }
                }
                Ok(notes)
            })
            .await
        }
    }
}

#[cfg(feature = "electrum")]
pub use inner::ElectrumConnector;

/// Stand-in when the `electrum` feature is off: every connect fails.
#[cfg(not(feature = "electrum"))]
pub struct ElectrumConnector;

#[cfg(not(feature = "electrum"))]
impl ElectrumConnector {
    pub fn new(_request_timeout: Duration) -> Self { Self }
}

#[cfg(not(feature = "electrum"))]
#[async_trait]
impl Connector for ElectrumConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Backend>, BackendError> {
        Err(BackendError::Transport(format!("{}: electrum support not compiled in", endpoint)))
    }
}
