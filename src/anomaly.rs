//! Anomaly detector (spec.md §4.10): a streaming z-score monitor over a
//! sliding window of per-request cost samples, used to flag spend spikes
//! without keeping unbounded history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub window_size: usize,
    pub z_threshold: f64,
    /// Minimum samples observed before any detection is attempted.
    pub warmup: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            z_threshold: 4.0,
            warmup: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Moderate,
    High,
    Severe,
}

impl Severity {
    fn from_z(z: f64, threshold: f64) -> Self {
        if z >= threshold * 2.0 {
            Severity::Severe
        } else if z >= threshold * 1.5 {
            Severity::High
        } else {
            Severity::Moderate
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub value: f64,
    pub z_score: f64,
    pub mean: f64,
    pub deviation: f64,
    pub severity: Severity,
}

/// Streaming z-score detector. The mean and standard deviation used to
/// score a sample are computed from the window *before* that sample is
/// inserted, so a single outlier can't dilute its own z-score.
pub struct AnomalyDetector {
    window: VecDeque<f64>,
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
        }
    }

    fn mean_and_stddev(&self) -> (f64, f64) {
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / n;
        (mean, variance.sqrt())
    }

    /// Observe a new sample, returning an anomaly report if it scores
    /// above the configured z-threshold. Always records the sample into
    /// the window afterward, evicting the oldest if at capacity.
    pub fn observe(&mut self, value: f64) -> Option<AnomalyReport> {
        let report = if self.window.len() >= self.config.warmup {
            let (mean, stddev) = self.mean_and_stddev();
            if stddev > 0.0 {
                let z = (value - mean).abs() / stddev;
                if z >= self.config.z_threshold {
                    Some(AnomalyReport {
                        value,
                        z_score: z,
                        mean,
                        deviation: stddev,
                        severity: Severity::from_z(z, self.config.z_threshold),
                    })
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            None
        };

        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);

        report
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_detection_before_warmup() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            warmup: 5,
            ..AnomalyConfig::default()
        });
        for _ in 0..4 {
            assert!(detector.observe(1.0).is_none());
        }
        assert!(detector.observe(1000.0).is_none());
    }

    #[test]
    fn detects_spike_after_warmup() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            warmup: 20,
            window_size: 100,
            z_threshold: 4.0,
        });
        for _ in 0..30 {
            detector.observe(1.0);
        }
        let report = detector.observe(50.0);
        assert!(report.is_some());
        assert!(report.unwrap().z_score >= 4.0);
    }

    #[test]
    fn stable_values_never_trigger() {
        let mut detector = AnomalyDetector::new(AnomalyConfig::default());
        for _ in 0..200 {
            assert!(detector.observe(2.0).is_none());
        }
    }

    #[test]
    fn window_evicts_oldest_sample_at_capacity() {
        let mut detector = AnomalyDetector::new(AnomalyConfig {
            window_size: 10,
            warmup: 1,
            z_threshold: 4.0,
        });
        for i in 0..20 {
            detector.observe(i as f64);
        }
        assert_eq!(detector.sample_count(), 10);
    }

    #[test]
    fn severity_escalates_with_z_score() {
        assert_eq!(Severity::from_z(4.0, 4.0), Severity::Moderate);
        assert_eq!(Severity::from_z(6.0, 4.0), Severity::High);
        assert_eq!(Severity::from_z(9.0, 4.0), Severity::Severe);
    }
}
