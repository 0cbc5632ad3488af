// src/latency.rs

//! Round-trip latency estimation: play a short click, capture it back and
//! find the lag with the best normalized cross-correlation.

use crate::error::CalibrationError;
use chrono::{DateTime, Local};
use rayon::prelude::*;
use std::collections::VecDeque;
use std::f32::consts::PI;

pub const CLICK_MS: f32 = 6.0;
pub const RECORD_SECONDS: f64 = 1.0;
pub const MAX_SEARCH_SECONDS: f64 = 1.0;
/// Lead time between scheduling the click and playing it.
pub const CLICK_LEAD_SECONDS: f64 = 0.05;
pub const HISTORY_LEN: usize = 7;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Largest nudge a calibration may apply, in milliseconds either way.
pub const MAX_NUDGE_MS: f32 = 100.0;

/// A decaying 180 Hz tone with a unit impulse at the front.
pub fn make_click(sample_rate: u32, click_ms: f32) -> Vec<f32> {
    let len = ((click_ms / 1000.0 * sample_rate as f32).floor() as usize).max(1);
    (0..len)
        .map(|i| {
            let tone = if i == 0 {
                1.0
            } else {
                0.6 * (2.0 * PI * 180.0 * i as f32 / sample_rate as f32).sin()
            };
            tone * (-(i as f32) / (len as f32 * 0.15)).exp()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagEstimate {
    pub lag: usize,
    pub correlation: f32,
}

/// Searches lags `0..=max_lag` (bounded by how far `reference` can slide
/// inside `captured`) for the best normalized correlation. Ties keep the
/// earliest lag.
pub fn find_best_lag(reference: &[f32], captured: &[f32], max_lag: usize) -> LagEstimate {
    let max_lag = max_lag.min(captured.len().saturating_sub(reference.len()));
    let ref_energy = reference.iter().map(|x| x * x).sum::<f32>().sqrt() + 1e-9;

    (0..=max_lag)
        .into_par_iter()
        .map(|lag| {
            let mut dot = 0.0f32;
            let mut energy = 0.0f32;
            for (i, r) in reference.iter().enumerate() {
                let b = captured.get(lag + i).copied().unwrap_or(0.0);
                dot += r * b;
                energy += b * b;
            }
            LagEstimate {
                lag,
                correlation: dot / (ref_energy * (energy + 1e-9).sqrt()),
            }
        })
        .reduce(
            || LagEstimate {
                lag: usize::MAX,
                correlation: f32::NEG_INFINITY,
            },
            |a, b| {
                if b.correlation > a.correlation
                    || (b.correlation == a.correlation && b.lag < a.lag)
                {
                    b
                } else {
                    a
                }
            },
        )
}

/// Outcome of one successful calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyMeasurement {
    pub latency_ms: f32,
    pub correlation: f32,
    pub sample_rate: u32,
    pub lag_samples: usize,
    /// Median of the recent successful estimates, including this one.
    pub median_latency_ms: f32,
    pub measured_at: DateTime<Local>,
}

/// Keeps recent estimates and turns captures into measurements.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    history: VecDeque<f32>,
    confidence_threshold: f32,
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl LatencyEstimator {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            confidence_threshold,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &f32> {
        self.history.iter()
    }

    /// Correlates `captured` against the click and records the estimate.
    /// Low-confidence results are rejected and leave the history untouched.
    pub fn analyze(
        &mut self,
        reference: &[f32],
        captured: &[f32],
        sample_rate: u32,
        max_search_seconds: f64,
    ) -> Result<LatencyMeasurement, CalibrationError> {
        if captured.is_empty() {
            return Err(CalibrationError::EmptyCapture);
        }
        if captured.len() < reference.len() {
            return Err(CalibrationError::CaptureTooShort);
        }
        let max_lag = (max_search_seconds * sample_rate as f64).floor() as usize;
        let best = find_best_lag(reference, captured, max_lag);
        if !(best.correlation >= self.confidence_threshold) {
            return Err(CalibrationError::LowConfidence {
                correlation: best.correlation,
                threshold: self.confidence_threshold,
            });
        }

        let latency_ms = best.lag as f32 / sample_rate as f32 * 1000.0;
        self.push(latency_ms);
        Ok(LatencyMeasurement {
            latency_ms,
            correlation: best.correlation,
            sample_rate,
            lag_samples: best.lag,
            median_latency_ms: self.median().unwrap_or(latency_ms),
            measured_at: Local::now(),
        })
    }

    pub fn push(&mut self, latency_ms: f32) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(latency_ms);
    }

    /// Median of the recent estimates; the mean of the middle pair for even
    /// counts.
    pub fn median(&self) -> Option<f32> {
        if self.history.is_empty() {
            return None;
        }
        let mut sorted: Vec<f32> = self.history.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }
}

/// Nudge that compensates a measured latency, clamped to a sane window.
pub fn nudge_for_latency(latency_ms: f32) -> f32 {
    (-latency_ms.round()).clamp(-MAX_NUDGE_MS, MAX_NUDGE_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_click_shape() {
        let click = make_click(48_000, CLICK_MS);
        assert_eq!(click.len(), 288);
        assert_eq!(click[0], 1.0);
        assert!(click[287].abs() < 0.01);
        assert_eq!(make_click(10, 1.0).len(), 1);
    }

    #[test]
    fn test_recovers_known_lag() {
        let sr = 48_000;
        let click = make_click(sr, CLICK_MS);
        let k = 1_234;
        let mut captured = vec![0.0; k];
        captured.extend_from_slice(&click);
        captured.extend(std::iter::repeat(0.0).take(4_000));

        let best = find_best_lag(&click, &captured, sr as usize);
        assert_eq!(best.lag, k);
        assert!(best.correlation > 0.999, "correlation {}", best.correlation);
    }

    #[test]
    fn test_recovers_lag_under_noise() {
        let sr = 48_000;
        let click = make_click(sr, CLICK_MS);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let k = 2_400;
        let mut captured: Vec<f32> = (0..sr as usize).map(|_| rng.gen_range(-0.01..0.01)).collect();
        for (i, s) in click.iter().enumerate() {
            captured[k + i] += s * 0.5;
        }
        let mut estimator = LatencyEstimator::default();
        let m = estimator
            .analyze(&click, &captured, sr, MAX_SEARCH_SECONDS)
            .expect("confident");
        assert_eq!(m.lag_samples, k);
        assert!((m.latency_ms - 50.0).abs() < 1e-3);
        assert_eq!(m.median_latency_ms, m.latency_ms);
    }

    #[test]
    fn test_silence_is_rejected_and_not_recorded() {
        let click = make_click(8_000, CLICK_MS);
        let mut estimator = LatencyEstimator::default();
        let err = estimator
            .analyze(&click, &vec![0.0; 8_000], 8_000, MAX_SEARCH_SECONDS)
            .unwrap_err();
        assert!(matches!(err, CalibrationError::LowConfidence { .. }));
        assert_eq!(estimator.history().count(), 0);
        assert_eq!(
            estimator.analyze(&click, &[], 8_000, 1.0),
            Err(CalibrationError::EmptyCapture)
        );
    }

    #[test]
    fn test_median_over_bounded_history() {
        let mut estimator = LatencyEstimator::default();
        assert_eq!(estimator.median(), None);
        for ms in [10.0, 30.0, 20.0, 40.0] {
            estimator.push(ms);
        }
        assert_eq!(estimator.median(), Some(25.0));
        for _ in 0..HISTORY_LEN {
            estimator.push(5.0);
        }
        assert_eq!(estimator.history().count(), HISTORY_LEN);
        assert_eq!(estimator.median(), Some(5.0));
    }

    #[test]
    fn test_nudge_is_clamped() {
        assert_eq!(nudge_for_latency(23.4), -23.0);
        assert_eq!(nudge_for_latency(250.0), -100.0);
    }
}
