//! User-budget manager (spec.md §4.5): per-user daily/monthly spend caps
//! with a reserve/commit/release lifecycle so a request's estimated cost
//! is held against the budget before the call runs and reconciled to the
//! actual cost afterward.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-user (or default) budget policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub daily_limit: f64,
    pub monthly_limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBudgetConfig {
    pub default_policy: BudgetPolicy,
    pub per_user_overrides: HashMap<String, BudgetPolicy>,
    pub warning_threshold: f64,
}

impl Default for UserBudgetConfig {
    fn default() -> Self {
        Self {
            default_policy: BudgetPolicy {
                daily_limit: 10.0,
                monthly_limit: 100.0,
            },
            per_user_overrides: HashMap::new(),
            warning_threshold: 0.8,
        }
    }
}

struct UserWindow {
    daily_spent: f64,
    daily_reserved: f64,
    day_start: DateTime<Utc>,
    monthly_spent: f64,
    monthly_reserved: f64,
    month_start: DateTime<Utc>,
    warned_daily: bool,
    warned_monthly: bool,
}

impl UserWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_spent: 0.0,
            daily_reserved: 0.0,
            day_start: now,
            monthly_spent: 0.0,
            monthly_reserved: 0.0,
            month_start: now,
            warned_daily: false,
            warned_monthly: false,
        }
    }

    fn roll_over(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.day_start.date_naive() {
            self.daily_spent = 0.0;
            self.daily_reserved = 0.0;
            self.day_start = now;
            self.warned_daily = false;
        }
        if now.year() != self.month_start.year() || now.month() != self.month_start.month() {
            self.monthly_spent = 0.0;
            self.monthly_reserved = 0.0;
            self.month_start = now;
            self.warned_monthly = false;
        }
    }
}

/// A held reservation against a user's budget, released or committed
/// exactly once.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: String,
    pub amount: f64,
}

/// Why a reservation was denied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BudgetDenied {
    DailyLimitExceeded { projected: f64, limit: f64 },
    MonthlyLimitExceeded { projected: f64, limit: f64 },
}

/// A warning fired when a user's spend crosses the threshold fraction of
/// either window without yet exceeding it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub user_id: String,
    pub daily_percent_used: f64,
    pub monthly_percent_used: f64,
}

struct BudgetState {
    windows: HashMap<String, UserWindow>,
}

#[derive(Clone)]
pub struct UserBudgetManager {
    state: Arc<RwLock<BudgetState>>,
    config: Arc<RwLock<UserBudgetConfig>>,
}

impl UserBudgetManager {
    pub fn new(config: UserBudgetConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(BudgetState {
                windows: HashMap::new(),
            })),
            config: Arc::new(RwLock::new(config)),
        }
    }

    async fn policy_for(&self, user_id: &str) -> BudgetPolicy {
        let config = self.config.read().await;
        config
            .per_user_overrides
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| config.default_policy.clone())
    }

    /// Reserve `amount` against a user's daily and monthly windows. Denies
    /// if the reservation plus already-committed spend plus already-held
    /// reservations would exceed either limit.
    pub async fn reserve(
        &self,
        user_id: &str,
        amount: f64,
    ) -> Result<(Reservation, Option<BudgetWarning>), BudgetDenied> {
        let policy = self.policy_for(user_id).await;
        let now = Utc::now();
        let warning_threshold = self.config.read().await.warning_threshold;

        let mut state = self.state.write().await;
        let window = state
            .windows
            .entry(user_id.to_string())
            .or_insert_with(|| UserWindow::new(now));
        window.roll_over(now);

        let projected_daily = window.daily_spent + window.daily_reserved + amount;
        if projected_daily > policy.daily_limit {
            return Err(BudgetDenied::DailyLimitExceeded {
                projected: projected_daily,
                limit: policy.daily_limit,
            });
        }
        let projected_monthly = window.monthly_spent + window.monthly_reserved + amount;
        if projected_monthly > policy.monthly_limit {
            return Err(BudgetDenied::MonthlyLimitExceeded {
                projected: projected_monthly,
                limit: policy.monthly_limit,
            });
        }

        window.daily_reserved += amount;
        window.monthly_reserved += amount;

        let daily_percent = if policy.daily_limit > 0.0 {
            projected_daily / policy.daily_limit
        } else {
            1.0
        };
        let monthly_percent = if policy.monthly_limit > 0.0 {
            projected_monthly / policy.monthly_limit
        } else {
            1.0
        };

        let mut warning = None;
        let should_warn = (daily_percent >= warning_threshold && !window.warned_daily)
            || (monthly_percent >= warning_threshold && !window.warned_monthly);
        if should_warn {
            if daily_percent >= warning_threshold {
                window.warned_daily = true;
            }
            if monthly_percent >= warning_threshold {
                window.warned_monthly = true;
            }
            warning = Some(BudgetWarning {
                user_id: user_id.to_string(),
                daily_percent_used: daily_percent * 100.0,
                monthly_percent_used: monthly_percent * 100.0,
            });
        }

        Ok((
            Reservation {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                amount,
            },
            warning,
        ))
    }

    /// Convert a reservation into committed spend, adjusting for the
    /// actual cost (which may differ from the estimate the reservation
    /// was made against).
    pub async fn commit(&self, reservation: Reservation, actual_cost: f64) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let window = state
            .windows
            .entry(reservation.user_id.clone())
            .or_insert_with(|| UserWindow::new(now));
        window.roll_over(now);
        window.daily_reserved = (window.daily_reserved - reservation.amount).max(0.0);
        window.monthly_reserved = (window.monthly_reserved - reservation.amount).max(0.0);
        window.daily_spent += actual_cost;
        window.monthly_spent += actual_cost;
    }

    /// Release a reservation without recording any spend (the call was
    /// blocked, cancelled, or failed before completion).
    pub async fn release(&self, reservation: Reservation) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let window = state
            .windows
            .entry(reservation.user_id.clone())
            .or_insert_with(|| UserWindow::new(now));
        window.roll_over(now);
        window.daily_reserved = (window.daily_reserved - reservation.amount).max(0.0);
        window.monthly_reserved = (window.monthly_reserved - reservation.amount).max(0.0);
    }

    pub async fn spend_for(&self, user_id: &str) -> (f64, f64) {
        let state = self.state.read().await;
        state
            .windows
            .get(user_id)
            .map(|w| (w.daily_spent, w.monthly_spent))
            .unwrap_or((0.0, 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(daily: f64, monthly: f64) -> UserBudgetConfig {
        UserBudgetConfig {
            default_policy: BudgetPolicy {
                daily_limit: daily,
                monthly_limit: monthly,
            },
            per_user_overrides: HashMap::new(),
            warning_threshold: 0.8,
        }
    }

    #[tokio::test]
    async fn reserve_commit_roundtrip_records_spend() {
        let mgr = UserBudgetManager::new(config(10.0, 100.0));
        let (res, _) = mgr.reserve("alice", 2.0).await.unwrap();
        mgr.commit(res, 1.5).await;
        let (daily, monthly) = mgr.spend_for("alice").await;
        assert_eq!(daily, 1.5);
        assert_eq!(monthly, 1.5);
    }

    #[tokio::test]
    async fn release_returns_reservation_without_spend() {
        let mgr = UserBudgetManager::new(config(10.0, 100.0));
        let (res, _) = mgr.reserve("alice", 5.0).await.unwrap();
        mgr.release(res).await;
        let (res2, _) = mgr.reserve("alice", 9.0).await.unwrap();
        mgr.release(res2).await;
        let (daily, _) = mgr.spend_for("alice").await;
        assert_eq!(daily, 0.0);
    }

    #[tokio::test]
    async fn denies_reservation_over_daily_limit() {
        let mgr = UserBudgetManager::new(config(5.0, 100.0));
        let result = mgr.reserve("alice", 6.0).await;
        assert!(matches!(result, Err(BudgetDenied::DailyLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn per_user_override_takes_priority() {
        let mut cfg = config(5.0, 100.0);
        cfg.per_user_overrides.insert(
            "vip".to_string(),
            BudgetPolicy {
                daily_limit: 50.0,
                monthly_limit: 500.0,
            },
        );
        let mgr = UserBudgetManager::new(cfg);
        let result = mgr.reserve("vip", 20.0).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn warning_fires_once_per_window() {
        let mgr = UserBudgetManager::new(config(10.0, 100.0));
        let (res1, warning1) = mgr.reserve("alice", 8.5).await.unwrap();
        assert!(warning1.is_some());
        mgr.commit(res1, 8.5).await;
        let (res2, warning2) = mgr.reserve("alice", 0.1).await.unwrap();
        mgr.commit(res2, 0.1).await;
        assert!(warning2.is_none());
    }

    #[tokio::test]
    async fn reservations_are_conserved_across_concurrent_holds() {
        let mgr = UserBudgetManager::new(config(10.0, 100.0));
        let (res_a, _) = mgr.reserve("alice", 4.0).await.unwrap();
        let result_b = mgr.reserve("alice", 4.0).await;
        assert!(result_b.is_ok());
        let result_c = mgr.reserve("alice", 3.0).await;
        assert!(result_c.is_err());
        mgr.release(res_a).await;
        let result_d = mgr.reserve("alice", 3.0).await;
        assert!(result_d.is_ok());
    }
}
