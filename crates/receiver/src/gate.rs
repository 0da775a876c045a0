//! Pre-write bandwidth and circuit-breaker checks.

use crate::error::ReceiveError;
use async_trait::async_trait;
use depot_core::BandwidthConfig;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use thiserror::Error;
use tracing::{debug, warn};

/// A write refused by a [`WriteGate`].
#[derive(Clone, Debug, Error)]
#[error("{reason}")]
pub struct GateRejected {
    pub reason: String,
}

/// Gate consulted before every write a receiver performs.
#[async_trait]
pub trait WriteGate: Send + Sync {
    /// Admit `bytes` for writing, waiting if the gate throttles.
    ///
    /// `threshold` is the slowest acceptable rate in bytes per second; a gate
    /// that would have to throttle below it rejects the write instead.
    async fn check_before_write(
        &self,
        bytes: u64,
        threshold: Option<u64>,
    ) -> Result<(), GateRejected>;

    /// Called once when a stream-style receive ends, with its failure if any.
    fn finish_check(&self, _error: Option<&ReceiveError>) {}
}

/// A gate that admits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenGate;

#[async_trait]
impl WriteGate for OpenGate {
    async fn check_before_write(
        &self,
        _bytes: u64,
        _threshold: Option<u64>,
    ) -> Result<(), GateRejected> {
        Ok(())
    }
}

/// Token-bucket bandwidth limiter over bytes.
///
/// Writes larger than the burst are admitted in burst-sized slices.
pub struct BandwidthGate {
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
}

impl std::fmt::Debug for BandwidthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthGate")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl BandwidthGate {
    pub fn new(bytes_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(bytes_per_second).allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            burst,
        }
    }

    /// Build a gate from configuration, or `None` when limiting is disabled.
    pub fn from_config(config: &BandwidthConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let rate = NonZeroU32::new(config.bytes_per_second)?;
        let burst = NonZeroU32::new(config.burst_bytes)?;
        Some(Self::new(rate, burst))
    }

    async fn admit_slice(&self, slice: NonZeroU32, threshold: Option<u64>) -> Result<(), GateRejected> {
        loop {
            match self.limiter.check_n(slice) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(not_until)) => {
                    let wait = not_until.wait_time_from(Clock::now(&DefaultClock::default()));
                    if let Some(floor) = threshold
                        && !wait.is_zero()
                    {
                        let implied = slice.get() as f64 / wait.as_secs_f64();
                        if implied < floor as f64 {
                            return Err(GateRejected {
                                reason: format!(
                                    "bandwidth {implied:.0} B/s is below the {floor} B/s circuit-breaker threshold"
                                ),
                            });
                        }
                    }
                    tokio::time::sleep(wait).await;
                }
                Err(_) => {
                    return Err(GateRejected {
                        reason: format!(
                            "write slice of {slice} bytes exceeds burst capacity {}",
                            self.burst
                        ),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl WriteGate for BandwidthGate {
    async fn check_before_write(
        &self,
        bytes: u64,
        threshold: Option<u64>,
    ) -> Result<(), GateRejected> {
        let mut remaining = bytes;
        while remaining > 0 {
            let take = remaining.min(u64::from(self.burst.get()));
            let slice = u32::try_from(take)
                .ok()
                .and_then(NonZeroU32::new)
                .unwrap_or(self.burst);
            self.admit_slice(slice, threshold).await?;
            remaining -= u64::from(slice.get());
        }
        Ok(())
    }

    fn finish_check(&self, error: Option<&ReceiveError>) {
        match error {
            Some(ReceiveError::Overload { received, reason }) => {
                warn!(received, reason = %reason, "Receive stopped by bandwidth gate");
            }
            Some(_) | None => debug!("Bandwidth-gated receive finished"),
        }
    }
}
