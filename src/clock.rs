//! Client/server clock offset estimation
//!
//! Each time-sync round trip yields an offset sample
//! `((server_rx - client_tx) - (client_rx - server_tx)) / 2`, i.e. the
//! server clock minus the client clock assuming symmetric legs. The first
//! `min_valid_samples` are buffered and the one with the smallest round-trip
//! time seeds the estimate. Afterwards samples feed an exponential moving
//! average unless they deviate from it by more than the outlier threshold.

use crate::config::ClockConfig;
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy)]
struct OffsetSample {
    delta: Timestamp,
    rtt: Timestamp,
}

/// Online clock-offset estimator
#[derive(Debug, Clone)]
pub struct TimeStats {
    smoothing: f32,
    outlier_threshold_ms: i64,
    min_valid_samples: usize,
    max_consecutive_outliers: usize,

    reference: Option<Timestamp>,
    ema: Option<Timestamp>,
    bias: Option<Timestamp>,
    pending: Vec<OffsetSample>,
    outliers: usize,
    consecutive_outliers: usize,
}

impl Default for TimeStats {
    fn default() -> Self {
        Self::from_config(&ClockConfig::default())
    }
}

impl TimeStats {
    pub fn new(smoothing: f32, outlier_threshold_ms: i64, min_valid_samples: usize) -> Self {
        Self {
            smoothing,
            outlier_threshold_ms,
            min_valid_samples: min_valid_samples.max(1),
            max_consecutive_outliers: ClockConfig::default().max_consecutive_outliers,
            reference: None,
            ema: None,
            bias: None,
            pending: Vec::with_capacity(min_valid_samples),
            outliers: 0,
            consecutive_outliers: 0,
        }
    }

    pub fn from_config(config: &ClockConfig) -> Self {
        let mut stats = Self::new(
            config.smoothing,
            config.outlier_threshold_ms,
            config.min_valid_samples,
        );
        stats.max_consecutive_outliers = config.max_consecutive_outliers;
        stats
    }

    /// Feed one offset sample together with the round-trip time it was measured over
    pub fn add_offset(&mut self, sample: Timestamp, rtt: Timestamp) {
        let reference = *self.reference.get_or_insert(sample);
        let delta = sample - reference;

        let Some(ema) = self.ema else {
            self.pending.push(OffsetSample { delta, rtt });
            if self.pending.len() >= self.min_valid_samples {
                if let Some(best) = self.pending.iter().min_by_key(|s| s.rtt) {
                    tracing::debug!(
                        "Clock sync initialised from min-RTT sample: offset {}, rtt {}",
                        reference + best.delta,
                        best.rtt
                    );
                    self.ema = Some(best.delta);
                }
                self.pending.clear();
            }
            return;
        };

        let diff = delta - ema;
        if diff.to_millis().abs() < self.outlier_threshold_ms {
            self.ema = Some(ema + diff * self.smoothing);
            self.consecutive_outliers = 0;
            return;
        }

        self.outliers += 1;
        self.consecutive_outliers += 1;
        tracing::trace!("Clock offset outlier: diff {}", diff);

        if self.consecutive_outliers >= self.max_consecutive_outliers {
            tracing::info!(
                "{} consecutive clock outliers, re-initialising offset estimate",
                self.consecutive_outliers
            );
            self.reinitialise();
        }
    }

    /// Feed an asymmetry sample `(c2s - s2c) / 2` used as a correction term
    pub fn add_bias(&mut self, asymmetry: Timestamp) {
        match self.bias {
            None => self.bias = Some(asymmetry),
            Some(bias) => {
                let diff = asymmetry - bias;
                if diff.to_millis().abs() < self.outlier_threshold_ms {
                    self.bias = Some(bias + diff * self.smoothing);
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ema.is_some()
    }

    /// Server clock minus client clock; zero until ready
    pub fn get_estimate(&self) -> Timestamp {
        match (self.reference, self.ema) {
            (Some(reference), Some(ema)) => {
                reference + ema + self.bias.unwrap_or(Timestamp::ZERO)
            }
            _ => Timestamp::ZERO,
        }
    }

    /// Total rejected samples since the last reset
    pub fn outliers(&self) -> usize {
        self.outliers
    }

    /// Samples still needed before the estimate becomes ready
    pub fn samples_until_ready(&self) -> usize {
        if self.is_ready() {
            0
        } else {
            self.min_valid_samples - self.pending.len()
        }
    }

    /// Forget everything; required whenever the connection is replaced
    pub fn reset(&mut self) {
        self.reinitialise();
        self.bias = None;
        self.outliers = 0;
    }

    fn reinitialise(&mut self) {
        self.reference = None;
        self.ema = None;
        self.pending.clear();
        self.consecutive_outliers = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> Timestamp {
        Timestamp::from_millis(v)
    }

    fn us(v: i64) -> Timestamp {
        Timestamp::from_micros(v)
    }

    /// Deterministic symmetric jitter in -2000..=2000 us
    fn jitter(i: i64) -> i64 {
        ((i * 7919) % 41 - 20) * 100
    }

    #[test]
    fn test_not_ready_until_min_samples() {
        let mut stats = TimeStats::new(0.02, 10, 20);
        for i in 0..19 {
            stats.add_offset(ms(100), ms(5 + i));
            assert!(!stats.is_ready());
            assert_eq!(stats.get_estimate(), Timestamp::ZERO);
        }
        assert_eq!(stats.samples_until_ready(), 1);
        stats.add_offset(ms(100), ms(5));
        assert!(stats.is_ready());
        assert_eq!(stats.get_estimate(), ms(100));
    }

    #[test]
    fn test_init_picks_min_rtt_sample() {
        let mut stats = TimeStats::new(0.02, 10, 5);
        stats.add_offset(ms(100), ms(40));
        stats.add_offset(ms(104), ms(30));
        stats.add_offset(ms(98), ms(2));
        stats.add_offset(ms(110), ms(50));
        stats.add_offset(ms(90), ms(20));
        assert!(stats.is_ready());
        assert_eq!(stats.get_estimate(), ms(98));
    }

    #[test]
    fn test_converges_with_symmetric_jitter() {
        let true_offset = 250_000;
        let mut stats = TimeStats::default();
        for i in 0..400 {
            stats.add_offset(us(true_offset + jitter(i)), ms(4 + (i % 7)));
        }
        assert!(stats.is_ready());
        let error = (stats.get_estimate().to_micros() - true_offset).abs();
        assert!(error < 2_000, "estimate off by {}us", error);
        assert_eq!(stats.outliers(), 0);
    }

    #[test]
    fn test_single_outlier_does_not_move_estimate() {
        let mut stats = TimeStats::default();
        for _ in 0..30 {
            stats.add_offset(ms(-40), ms(3));
        }
        let before = stats.get_estimate();
        stats.add_offset(ms(460), ms(3));
        let moved = (stats.get_estimate() - before).to_millis().abs();
        assert!(moved < 10);
        assert_eq!(stats.outliers(), 1);
        assert!(stats.is_ready());
    }

    #[test]
    fn test_consecutive_outliers_reinitialise() {
        let mut stats = TimeStats::new(0.02, 10, 3);
        for _ in 0..3 {
            stats.add_offset(ms(0), ms(1));
        }
        assert_eq!(stats.get_estimate(), ms(0));

        for _ in 0..5 {
            stats.add_offset(ms(700), ms(1));
        }
        assert!(!stats.is_ready());
        assert_eq!(stats.outliers(), 5);

        for _ in 0..3 {
            stats.add_offset(ms(700), ms(1));
        }
        assert!(stats.is_ready());
        assert_eq!(stats.get_estimate(), ms(700));
    }

    #[test]
    fn test_bias_term() {
        let mut stats = TimeStats::new(0.5, 10, 1);
        stats.add_offset(ms(10), ms(1));
        stats.add_bias(ms(2));
        assert_eq!(stats.get_estimate(), ms(12));
        stats.add_bias(ms(4));
        assert_eq!(stats.get_estimate(), ms(13));
        stats.add_bias(ms(400));
        assert_eq!(stats.get_estimate(), ms(13));
    }

    #[test]
    fn test_reset() {
        let mut stats = TimeStats::new(0.02, 10, 1);
        stats.add_offset(ms(10), ms(1));
        stats.add_offset(ms(500), ms(1));
        assert!(stats.is_ready());
        stats.reset();
        assert!(!stats.is_ready());
        assert_eq!(stats.outliers(), 0);
        assert_eq!(stats.get_estimate(), Timestamp::ZERO);

        stats.add_offset(ms(-30), ms(1));
        assert_eq!(stats.get_estimate(), ms(-30));
    }
}
