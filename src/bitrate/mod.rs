//! Video bitrate strategies
//!
//! A session feeds [`ThroughputSample`]s to its [`BitrateStrategy`]; any
//! returned bitrate is applied to the attached video encoder.
//!
//! [`AdaptiveBitrateStrategy`] uses the writer queue as the congestion
//! signal:
//! - a non-empty queue for `downgrade_after` consecutive samples steps the
//!   bitrate down toward the measured throughput
//! - an empty queue for `upgrade_after` consecutive samples steps it up by a
//!   tenth of the maximum

use crate::stats::ThroughputSample;

/// Decides the encoder bitrate from throughput samples
pub trait BitrateStrategy: Send {
    /// Upper bound the strategy will request
    fn max_bitrate(&self) -> u32;

    /// New bitrate for `current`, or `None` to hold
    fn adjust(&mut self, current: u32, sample: &ThroughputSample) -> Option<u32>;
}

/// Never changes the bitrate
#[derive(Debug, Clone, Copy)]
pub struct FixedBitrateStrategy {
    pub bitrate: u32,
}

impl BitrateStrategy for FixedBitrateStrategy {
    fn max_bitrate(&self) -> u32 {
        self.bitrate
    }

    fn adjust(&mut self, _current: u32, _sample: &ThroughputSample) -> Option<u32> {
        None
    }
}

/// Tuning for [`AdaptiveBitrateStrategy`]
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub max_bitrate: u32,
    pub min_bitrate: u32,
    /// Congested samples in a row before stepping down
    pub downgrade_after: u32,
    /// Clear samples in a row before stepping up
    pub upgrade_after: u32,
    /// Fraction of measured throughput targeted when stepping down
    pub headroom: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_bitrate: 2_500_000,
            min_bitrate: 300_000,
            downgrade_after: 2,
            upgrade_after: 15,
            headroom: 0.8,
        }
    }
}

/// Queue-driven bitrate adaptation with hysteresis
#[derive(Debug, Clone)]
pub struct AdaptiveBitrateStrategy {
    config: AdaptiveConfig,
    congested: u32,
    clear: u32,
}

impl Default for AdaptiveBitrateStrategy {
    fn default() -> Self {
        Self::new(AdaptiveConfig::default())
    }
}

impl AdaptiveBitrateStrategy {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            congested: 0,
            clear: 0,
        }
    }

    pub fn with_max_bitrate(max_bitrate: u32) -> Self {
        Self::new(AdaptiveConfig {
            max_bitrate,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    fn step_down(&self, current: u32, sample: &ThroughputSample) -> u32 {
        let measured = sample.bytes_out_per_second as f64 * 8.0 * self.config.headroom;
        let stepped = current as f64 * 0.9;
        (measured.min(stepped) as u32).max(self.config.min_bitrate)
    }

    fn step_up(&self, current: u32) -> u32 {
        current
            .saturating_add(self.config.max_bitrate / 10)
            .min(self.config.max_bitrate)
    }
}

impl BitrateStrategy for AdaptiveBitrateStrategy {
    fn max_bitrate(&self) -> u32 {
        self.config.max_bitrate
    }

    fn adjust(&mut self, current: u32, sample: &ThroughputSample) -> Option<u32> {
        if sample.queued_bytes > 0 {
            self.clear = 0;
            self.congested += 1;
            tracing::debug!(
                queued = sample.queued_bytes,
                samples = self.congested,
                "Bitrate: downgrade pressure"
            );
            if self.congested < self.config.downgrade_after {
                return None;
            }
            self.congested = 0;
            let target = self.step_down(current, sample);
            if target >= current {
                return None;
            }
            tracing::info!(from = current, to = target, "Bitrate: downgrade");
            return Some(target);
        }

        self.congested = 0;
        if current >= self.config.max_bitrate {
            self.clear = 0;
            return None;
        }
        self.clear += 1;
        if self.clear < self.config.upgrade_after {
            return None;
        }
        self.clear = 0;
        let target = self.step_up(current);
        tracing::info!(from = current, to = target, "Bitrate: upgrade");
        Some(target)
    }
}
