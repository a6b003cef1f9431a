//! Per-interface latency statistics: three exponential moving averages
//! (1/5/15-minute time constants) plus an exponential running variance.

use std::time::{Duration, Instant};

const ONE_MINUTE_MS: f64 = 60_000.0;
const FIVE_MINUTE_MS: f64 = 5.0 * 60_000.0;
const FIFTEEN_MINUTE_MS: f64 = 15.0 * 60_000.0;
const VARIANCE_ALPHA: f64 = 0.01;

/// A single exponential moving average with a fixed time-constant.
///
/// Invariant: the per-sample weight is `1 − exp(−Δt_ms / timeframe_ms)`.
/// For samples arriving before `timeframe_ms` has elapsed since creation,
/// the effective timeframe is the elapsed time since creation, which
/// avoids under-weighting early samples relative to a cold average.
struct Ema {
    timeframe_ms: f64,
    value: f64,
    creation: Instant,
    last_update: Option<Instant>,
}

impl Ema {
    fn new(timeframe_ms: f64, now: Instant) -> Self {
        Self {
            timeframe_ms,
            value: 0.0,
            creation: now,
            last_update: None,
        }
    }

    fn update(&mut self, sample: f64, now: Instant) {
        let Some(last) = self.last_update else {
            self.value = sample;
            self.last_update = Some(now);
            return;
        };
        let dt_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
        let since_creation_ms = now.saturating_duration_since(self.creation).as_secs_f64() * 1000.0;
        let effective_timeframe = self.timeframe_ms.min(since_creation_ms).max(1.0);
        let alpha = 1.0 - (-dt_ms / effective_timeframe).exp();
        self.value += alpha * (sample - self.value);
        self.last_update = Some(now);
    }
}

pub struct InterfaceStatsCollector {
    ema_1m: Ema,
    ema_5m: Ema,
    ema_15m: Ema,
    variance: f64,
    variance_initialized: bool,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
}

impl InterfaceStatsCollector {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            ema_1m: Ema::new(ONE_MINUTE_MS, now),
            ema_5m: Ema::new(FIVE_MINUTE_MS, now),
            ema_15m: Ema::new(FIFTEEN_MINUTE_MS, now),
            variance: 0.0,
            variance_initialized: false,
            samples_accepted: 0,
            samples_rejected: 0,
        }
    }

    pub fn ema_1m_ms(&self) -> f64 {
        self.ema_1m.value
    }

    pub fn ema_5m_ms(&self) -> f64 {
        self.ema_5m.value
    }

    pub fn ema_15m_ms(&self) -> f64 {
        self.ema_15m.value
    }

    pub fn stddev_ms(&self) -> f64 {
        self.variance.sqrt()
    }

    fn update_variance(&mut self, sample: f64) {
        let deviation = sample - self.ema_1m.value;
        let sq = deviation * deviation;
        if !self.variance_initialized {
            self.variance = sq;
            self.variance_initialized = true;
        } else {
            self.variance += VARIANCE_ALPHA * (sq - self.variance);
        }
    }

    /// Feeds one latency sample (in milliseconds). Samples whose distance
    /// from the current 1-minute EMA exceeds `2 * stddev` are rejected
    /// (left out of the EMAs); the running variance is always updated so
    /// the acceptance window can widen after a genuine shift.
    pub fn feed_sample(&mut self, sample_ms: f64) {
        self.feed_sample_at(sample_ms, Instant::now());
    }

    fn feed_sample_at(&mut self, sample_ms: f64, now: Instant) {
        // Rejection needs a meaningful spread estimate; during warm-up
        // (fewer than two accepted samples) every sample is let through so
        // the variance has something real to settle on.
        if self.samples_accepted >= 2 {
            let bound = 2.0 * self.stddev_ms();
            if (sample_ms - self.ema_1m.value).abs() > bound {
                self.samples_rejected += 1;
                self.update_variance(sample_ms);
                return;
            }
        }
        self.ema_1m.update(sample_ms, now);
        self.ema_5m.update(sample_ms, now);
        self.ema_15m.update(sample_ms, now);
        self.update_variance(sample_ms);
        self.samples_accepted += 1;
    }
}

impl Default for InterfaceStatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_all_emas() {
        let mut c = InterfaceStatsCollector::new();
        c.feed_sample(10.0);
        assert_eq!(c.ema_1m_ms(), 10.0);
        assert_eq!(c.ema_5m_ms(), 10.0);
        assert_eq!(c.ema_15m_ms(), 10.0);
        assert_eq!(c.samples_accepted, 1);
    }

    #[test]
    fn outlier_beyond_two_stddev_is_rejected_without_moving_ema() {
        let mut c = InterfaceStatsCollector::new();
        let now = Instant::now();
        c.feed_sample_at(10.0, now);
        // seed a small variance so stddev is well defined and small.
        c.feed_sample_at(12.0, now + Duration::from_millis(100));
        let ema_before = c.ema_1m_ms();
        c.feed_sample_at(2000.0, now + Duration::from_millis(200));
        assert_eq!(c.ema_1m_ms(), ema_before, "EMA1m must remain unchanged for a rejected sample");
        assert_eq!(c.samples_rejected, 1);
    }

    #[test]
    fn accepted_sample_within_bound_updates_ema() {
        let mut c = InterfaceStatsCollector::new();
        let now = Instant::now();
        c.feed_sample_at(10.0, now);
        c.feed_sample_at(11.0, now + Duration::from_millis(500));
        assert!(c.samples_accepted >= 1);
    }
}
