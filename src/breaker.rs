//! Circuit breaker (spec.md §4.4): spend windows at session/hour/day/month
//! granularity, each with its own limit and action (stop/throttle/warn).

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What a tripped limit does to new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerAction {
    /// Deny the request outright.
    Stop,
    /// Allow it through but the caller should treat it as degraded
    /// (spec.md leaves exact throttle latency/backoff to the caller —
    /// the breaker only reports that throttling is in effect).
    Throttle,
    /// Allow the request, only emit a warning event.
    Warn,
}

/// A single spend window (session/hour/day/month).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowKind {
    Session,
    Hour,
    Day,
    Month,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowKind::Session => write!(f, "session"),
            WindowKind::Hour => write!(f, "hour"),
            WindowKind::Day => write!(f, "day"),
            WindowKind::Month => write!(f, "month"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowLimit {
    pub limit: f64,
    pub action: BreakerAction,
}

/// Breaker configuration: one optional limit per window kind, plus the
/// warning threshold fraction (spec.md §4.4 default 0.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub session: Option<WindowLimit>,
    pub hour: Option<WindowLimit>,
    pub day: Option<WindowLimit>,
    pub month: Option<WindowLimit>,
    pub warning_threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            session: None,
            hour: Some(WindowLimit {
                limit: 5.0,
                action: BreakerAction::Throttle,
            }),
            day: Some(WindowLimit {
                limit: 50.0,
                action: BreakerAction::Stop,
            }),
            month: Some(WindowLimit {
                limit: 1000.0,
                action: BreakerAction::Stop,
            }),
            warning_threshold: 0.8,
        }
    }
}

struct BreakerWindow {
    spent: f64,
    window_start: DateTime<Utc>,
    /// Whether the 0.8-threshold warning already fired for this window
    /// instance, so it only emits once per window per limit.
    warned: bool,
}

impl BreakerWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            spent: 0.0,
            window_start: now,
            warned: false,
        }
    }
}

fn window_boundary(kind: WindowKind, last_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match kind {
        WindowKind::Session => false,
        WindowKind::Hour => now.signed_duration_since(last_start).num_hours() >= 1,
        WindowKind::Day => now.date_naive() != last_start.date_naive(),
        WindowKind::Month => {
            now.year() != last_start.year() || now.month() != last_start.month()
        }
    }
}

/// The disallow verdict returned when a stopping limit is tripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerTripped {
    pub window: WindowKind,
    pub limit: f64,
    pub spent: f64,
    pub percent_used: f64,
}

/// A warning event fired when a window crosses its threshold but has not
/// (yet) tripped a stopping action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerWarning {
    pub window: WindowKind,
    pub limit: f64,
    pub spent: f64,
    pub percent_used: f64,
}

/// Result of a pre-spend admission check.
#[derive(Debug, Clone)]
pub enum BreakerDecision {
    Allow,
    Throttle(BreakerTripped),
    Deny(BreakerTripped),
}

struct BreakerState {
    windows: HashMap<WindowKind, BreakerWindow>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerState>>,
    config: Arc<RwLock<BreakerConfig>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let now = Utc::now();
        let mut windows = HashMap::new();
        for kind in [
            WindowKind::Session,
            WindowKind::Hour,
            WindowKind::Day,
            WindowKind::Month,
        ] {
            windows.insert(kind, BreakerWindow::new(now));
        }
        Self {
            state: Arc::new(RwLock::new(BreakerState { windows })),
            config: Arc::new(RwLock::new(config)),
        }
    }

    fn limit_for<'a>(config: &'a BreakerConfig, kind: WindowKind) -> Option<&'a WindowLimit> {
        match kind {
            WindowKind::Session => config.session.as_ref(),
            WindowKind::Hour => config.hour.as_ref(),
            WindowKind::Day => config.day.as_ref(),
            WindowKind::Month => config.month.as_ref(),
        }
    }

    /// Percent used, with the zero-limit edge case reported as a finite
    /// sentinel (999.0) rather than dividing by zero (spec.md §4.4).
    fn percent_used(spent: f64, limit: f64) -> f64 {
        if limit <= 0.0 {
            999.0
        } else {
            (spent / limit) * 100.0
        }
    }

    /// Check whether `estimated_cost` can be admitted against every
    /// configured window, rolling over any window whose boundary has
    /// passed. Returns the most restrictive decision across all windows.
    pub async fn check(&self, estimated_cost: f64) -> (BreakerDecision, Vec<BreakerWarning>) {
        let config = self.config.read().await;
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut warnings = Vec::new();
        let mut decision = BreakerDecision::Allow;

        for kind in [
            WindowKind::Session,
            WindowKind::Hour,
            WindowKind::Day,
            WindowKind::Month,
        ] {
            let Some(limit) = Self::limit_for(&config, kind) else {
                continue;
            };
            let window = state.windows.entry(kind).or_insert_with(|| BreakerWindow::new(now));
            if window_boundary(kind, window.window_start, now) {
                *window = BreakerWindow::new(now);
            }

            let projected = window.spent + estimated_cost;
            let percent = Self::percent_used(projected, limit.limit);

            if projected >= limit.limit {
                let tripped = BreakerTripped {
                    window: kind,
                    limit: limit.limit,
                    spent: window.spent,
                    percent_used: percent,
                };
                decision = match limit.action {
                    BreakerAction::Stop => BreakerDecision::Deny(tripped),
                    BreakerAction::Throttle => match decision {
                        BreakerDecision::Deny(_) => decision,
                        _ => BreakerDecision::Throttle(tripped),
                    },
                    BreakerAction::Warn => decision,
                };
            } else if percent / 100.0 >= config.warning_threshold && !window.warned {
                window.warned = true;
                warnings.push(BreakerWarning {
                    window: kind,
                    limit: limit.limit,
                    spent: window.spent,
                    percent_used: percent,
                });
            }
        }

        (decision, warnings)
    }

    /// Record actual spend against every window after a call completes.
    pub async fn record_spend(&self, actual_cost: f64) {
        let now = Utc::now();
        let config = self.config.read().await;
        let mut state = self.state.write().await;
        for kind in [
            WindowKind::Session,
            WindowKind::Hour,
            WindowKind::Day,
            WindowKind::Month,
        ] {
            if Self::limit_for(&config, kind).is_none() {
                continue;
            }
            let window = state.windows.entry(kind).or_insert_with(|| BreakerWindow::new(now));
            if window_boundary(kind, window.window_start, now) {
                *window = BreakerWindow::new(now);
            }
            window.spent += actual_cost;
        }
    }

    /// Replace the limit configuration, re-arming every window's warning
    /// flag so the new thresholds get their own one-shot warning.
    pub async fn update_limits(&self, config: BreakerConfig) {
        *self.config.write().await = config;
        let mut state = self.state.write().await;
        for window in state.windows.values_mut() {
            window.warned = false;
        }
    }

    /// Clear all accumulated spend and re-arm every warning flag.
    pub async fn reset(&self) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        for window in state.windows.values_mut() {
            *window = BreakerWindow::new(now);
        }
    }

    pub async fn spend_snapshot(&self) -> HashMap<WindowKind, f64> {
        let state = self.state.read().await;
        state
            .windows
            .iter()
            .map(|(k, w)| (*k, w.spent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_day_limit(limit: f64) -> BreakerConfig {
        BreakerConfig {
            session: None,
            hour: None,
            day: Some(WindowLimit {
                limit,
                action: BreakerAction::Stop,
            }),
            month: None,
            warning_threshold: 0.8,
        }
    }

    #[tokio::test]
    async fn allows_spend_under_limit() {
        let breaker = CircuitBreaker::new(config_with_day_limit(10.0));
        let (decision, _) = breaker.check(1.0).await;
        assert!(matches!(decision, BreakerDecision::Allow));
    }

    #[tokio::test]
    async fn denies_spend_over_limit() {
        let breaker = CircuitBreaker::new(config_with_day_limit(10.0));
        breaker.record_spend(9.5).await;
        let (decision, _) = breaker.check(1.0).await;
        assert!(matches!(decision, BreakerDecision::Deny(_)));
    }

    #[tokio::test]
    async fn zero_limit_reports_sentinel_percent() {
        let breaker = CircuitBreaker::new(config_with_day_limit(0.0));
        let (decision, _) = breaker.check(0.01).await;
        match decision {
            BreakerDecision::Deny(tripped) => assert_eq!(tripped.percent_used, 999.0),
            _ => panic!("expected deny"),
        }
    }

    #[tokio::test]
    async fn zero_limit_blocks_even_a_zero_cost_request() {
        let breaker = CircuitBreaker::new(config_with_day_limit(0.0));
        let (decision, _) = breaker.check(0.0).await;
        match decision {
            BreakerDecision::Deny(tripped) => assert_eq!(tripped.percent_used, 999.0),
            _ => panic!("a configured limit of 0 under action=stop must block every request"),
        }
    }

    #[tokio::test]
    async fn warning_fires_once_per_window() {
        let breaker = CircuitBreaker::new(config_with_day_limit(10.0));
        breaker.record_spend(8.5).await;
        let (_, warnings1) = breaker.check(0.0).await;
        assert_eq!(warnings1.len(), 1);
        let (_, warnings2) = breaker.check(0.0).await;
        assert_eq!(warnings2.len(), 0);
    }

    #[tokio::test]
    async fn update_limits_rearms_warnings() {
        let breaker = CircuitBreaker::new(config_with_day_limit(10.0));
        breaker.record_spend(8.5).await;
        let (_, warnings1) = breaker.check(0.0).await;
        assert_eq!(warnings1.len(), 1);
        breaker.update_limits(config_with_day_limit(20.0)).await;
        let (_, warnings2) = breaker.check(0.0).await;
        assert_eq!(warnings2.len(), 1);
    }

    #[tokio::test]
    async fn reset_clears_spend_and_rearms() {
        let breaker = CircuitBreaker::new(config_with_day_limit(10.0));
        breaker.record_spend(9.9).await;
        breaker.reset().await;
        let (decision, _) = breaker.check(1.0).await;
        assert!(matches!(decision, BreakerDecision::Allow));
    }
}
