//! Marketplace storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database with uniqueness constraints backing the claim race
//!
//! Every method that touches more than one row is atomic in both backends. The
//! decisions themselves live in [`crate::marketplace::lifecycle`].

mod memory;
mod sqlite;

pub use memory::InMemoryMarketStore;
pub use sqlite::SqliteMarketStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use uuid::Uuid;

use super::earnings::{HistoryTotals, PaidClaim};
use super::error::MarketError;
use super::lifecycle::ClaimTransition;
use super::types::{Category, Claim, Task, UserAccount, Verdict};

/// Marketplace store trait - implemented by all storage backends.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // === Users ===

    async fn insert_user(&self, user: &UserAccount) -> Result<(), MarketError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<UserAccount>, MarketError>;

    /// Overwrite the aggregate counters (repair path only).
    async fn set_user_totals(&self, id: Uuid, totals: HistoryTotals) -> Result<UserAccount, MarketError>;

    // === Catalogue ===

    async fn insert_category(&self, category: &Category) -> Result<(), MarketError>;

    async fn get_category(&self, id: Uuid) -> Result<Option<Category>, MarketError>;

    /// Categories that are active and not past their optional expiry,
    /// premium first, then newest first.
    async fn list_listed_categories(&self, now: DateTime<Utc>) -> Result<Vec<Category>, MarketError>;

    async fn insert_task(&self, task: &Task) -> Result<(), MarketError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, MarketError>;

    /// Change the mutable fields of a published task.
    async fn update_task_availability(
        &self,
        id: Uuid,
        is_active: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Task, MarketError>;

    /// Claimable tasks (active, unexpired, never claimed), newest first.
    async fn list_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, MarketError>;

    async fn count_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<usize, MarketError>;

    // === Claims ===

    /// Atomically check the claim preconditions and insert the claim.
    ///
    /// Two concurrent calls for the same task must never both succeed; the
    /// loser observes [`MarketError::TaskAlreadyTaken`].
    async fn create_claim(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Claim, MarketError>;

    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>, MarketError>;

    async fn find_claim(&self, user_id: Uuid, task_id: Uuid) -> Result<Option<Claim>, MarketError>;

    /// The user's non-terminal claim, if any.
    async fn active_claim(&self, user_id: Uuid) -> Result<Option<Claim>, MarketError>;

    /// Read-check-write of one claim row as a single atomic unit.
    async fn transition_claim(
        &self,
        claim_id: Uuid,
        transition: ClaimTransition,
        now: DateTime<Utc>,
    ) -> Result<Claim, MarketError>;

    /// Record a terminal verdict and the claimant's counters in one atomic unit.
    /// The credited reward is the task's reward, read inside the same unit.
    async fn finalize_claim(
        &self,
        claim_id: Uuid,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Result<(Claim, UserAccount), MarketError>;

    /// Non-terminal claims awaiting user action whose deadline is before `now`.
    async fn list_lapsed_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, MarketError>;

    // === Earnings ===

    /// Paid claims, most recently completed first.
    async fn list_paid_claims(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaidClaim>, MarketError>;

    /// Sum of task rewards over paid claims completed at or after `since`.
    async fn sum_paid_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64, MarketError>;

    /// Counters recomputed from the user's claim history.
    async fn history_totals(&self, user_id: Uuid) -> Result<HistoryTotals, MarketError>;
}

/// Store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    Memory,
    #[default]
    Sqlite,
}

impl StoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a store based on type and configuration.
pub async fn create_market_store(
    store_type: StoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn MarketStore>, MarketError> {
    match store_type {
        StoreType::Memory => Ok(Box::new(InMemoryMarketStore::new())),
        StoreType::Sqlite => {
            let store = SqliteMarketStore::new(base_dir).await?;
            Ok(Box::new(store))
        }
    }
}
