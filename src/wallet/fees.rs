//! Fee estimator - 25 buckets in sat per 1000 vbytes.
//!
//! Bucket 0 is the backend's minimum relay fee, bucket `n` the estimate for
//! confirmation within `n` blocks. Holes in a refresh are back-filled, never
//! reported as negative or missing.

use crate::error::{Error, Result};
use crate::transport::Transport;
use serde::Serialize;
use tracing::{debug, warn};

pub const FEE_BUCKETS: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeEstimates {
    pub fees: Vec<u64>,
}

impl FeeEstimates {
    pub fn relay_fee(&self) -> u64 {
        self.fees.first().copied().unwrap_or(0)
    }

    /// Rate for confirmation within `blocks`, clamped to the bucket range.
    pub fn for_target(&self, blocks: usize) -> u64 {
        let idx = blocks.clamp(1, self.fees.len().saturating_sub(1).max(1));
        self.fees.get(idx).copied().unwrap_or_else(|| self.relay_fee())
    }
}

/// BTC/kB as reported by Electrum to sat/kvB. Negative or non-finite means
/// "no estimate".
pub fn btc_per_kb_to_sat(rate: f64) -> Option<u64> {
    if rate.is_finite() && rate >= 0.0 {
        Some((rate * 100_000_000.0).round() as u64)
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct FeeEstimator {
    last_valid: [Option<u64>; FEE_BUCKETS],
}

impl FeeEstimator {
    pub fn new() -> Self { Self::default() }

    /// Query the backend and normalize. Always hits the network.
    pub async fn refresh(&mut self, transport: &mut Transport) -> Result<FeeEstimates> {
        let relay = transport.call("relay_fee", None, |b| async move { b.relay_fee().await }).await?;
        let targets: Vec<usize> = (1..FEE_BUCKETS).collect();
        let targets = std::sync::Arc::new(targets);
        let estimates = transport
            .call("estimate_fees", None, move |b| {
                let targets = targets.clone();
                async move { b.estimate_fees(&targets).await }
            })
            .await?;

        if estimates.len() < FEE_BUCKETS - 1 {
            debug!("Backend returned {} of {} fee estimates", estimates.len(), FEE_BUCKETS - 1);
        }
        let raw: Vec<Option<u64>> = std::iter::once(btc_per_kb_to_sat(relay))
            .chain(estimates.into_iter().map(btc_per_kb_to_sat))
            .collect();
        self.normalize(&raw)
    }

    /// Fill every bucket from `raw` (index 0 = relay fee).
    ///
    /// Per bucket: the fresh value, else the last valid value seen for that
    /// bucket, else the nearest preceding bucket of this round (leading holes
    /// take the first value found). All buckets are floored at bucket 0.
    pub fn normalize(&mut self, raw: &[Option<u64>]) -> Result<FeeEstimates> {
        let mut merged = [None; FEE_BUCKETS];
        for (i, slot) in merged.iter_mut().enumerate() {
            *slot = raw.get(i).copied().flatten().or(self.last_valid[i]);
        }

        let first = merged.iter().flatten().next().copied().ok_or(Error::FeeDataUnavailable)?;

        let mut fees = Vec::with_capacity(FEE_BUCKETS);
        let mut carry = first;
        for (i, value) in merged.iter().enumerate() {
            let value = match value {
                Some(v) => *v,
                None => {
                    warn!("Fee bucket {} missing, back-filled with {}", i, carry);
                    carry
                }
            };
            carry = value;
            fees.push(value);
        }
        let floor = fees[0];
        for fee in fees.iter_mut().skip(1) {
            *fee = (*fee).max(floor);
        }

        for (i, fresh) in raw.iter().take(FEE_BUCKETS).enumerate() {
            if let Some(v) = fresh {
                self.last_valid[i] = Some(*v);
            }
        }
        Ok(FeeEstimates { fees })
    }
}
