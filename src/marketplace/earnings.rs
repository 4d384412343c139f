//! Earnings views and badge ranks.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{Claim, UserAccount};

/// Rank derived from the count of successful claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Badge {
    Junior,
    Senior,
    God,
}

impl Badge {
    /// `<30 -> Junior`, `30..=99 -> Senior`, `>=100 -> God`.
    pub fn for_successes(successful_tasks_count: u64) -> Self {
        match successful_tasks_count {
            0..=29 => Badge::Junior,
            30..=99 => Badge::Senior,
            _ => Badge::God,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Junior => "Junior",
            Badge::Senior => "Senior",
            Badge::God => "God",
        }
    }
}

/// A paid claim joined with the task details shown in the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaidClaim {
    pub claim: Claim,
    pub task_title: String,
    pub category_id: uuid::Uuid,
    pub reward_cents: u64,
}

/// Counters recomputed from a user's full claim history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryTotals {
    pub successful_tasks_count: u64,
    pub failed_tasks_count: u64,
    pub total_earnings_cents: u64,
}

impl HistoryTotals {
    pub fn from_account(user: &UserAccount) -> Self {
        Self {
            successful_tasks_count: user.successful_tasks_count,
            failed_tasks_count: user.failed_tasks_count,
            total_earnings_cents: user.total_earnings_cents,
        }
    }
}

/// Wallet page: fast-path counters plus a page of paid history.
#[derive(Debug, Clone, Serialize)]
pub struct WalletView {
    pub total_tasks: u64,
    pub total_earnings_cents: u64,
    pub today_earnings_cents: u64,
    pub badge: Badge,
    pub history: Vec<PaidClaim>,
}

/// Comparison of stored counters against history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EarningsAudit {
    pub stored: HistoryTotals,
    pub recomputed: HistoryTotals,
    pub repaired: bool,
}

impl EarningsAudit {
    pub fn has_drift(&self) -> bool {
        self.stored != self.recomputed
    }
}

/// Start of the UTC day containing `now`.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
