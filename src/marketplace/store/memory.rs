//! In-memory marketplace store (non-persistent).
//!
//! All tables sit behind one lock, so holding the write guard makes any
//! multi-row check-and-write atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::MarketStore;
use crate::marketplace::earnings::{HistoryTotals, PaidClaim};
use crate::marketplace::error::MarketError;
use crate::marketplace::lifecycle::{self, ClaimTransition};
use crate::marketplace::types::{
    Category, Claim, ClaimStatus, PaymentStatus, Task, UserAccount, Verdict,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserAccount>,
    categories: HashMap<Uuid, Category>,
    tasks: HashMap<Uuid, Task>,
    claims: HashMap<Uuid, Claim>,
    /// task_id -> claim_id. A task is claimed at most once.
    claim_by_task: HashMap<Uuid, Uuid>,
}

impl Tables {
    fn is_available(&self, task: &Task, category_id: Option<Uuid>, now: DateTime<Utc>) -> bool {
        category_id.map_or(true, |id| task.category_id == id)
            && task.is_open(now)
            && !self.claim_by_task.contains_key(&task.id)
    }

    fn active_claim(&self, user_id: Uuid) -> Option<&Claim> {
        self.claims
            .values()
            .find(|c| c.user_id == user_id && !c.status.is_terminal())
    }
}

#[derive(Clone)]
pub struct InMemoryMarketStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }
}

impl Default for InMemoryMarketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert_user(&self, user: &UserAccount) -> Result<(), MarketError> {
        self.tables.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<UserAccount>, MarketError> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn set_user_totals(&self, id: Uuid, totals: HistoryTotals) -> Result<UserAccount, MarketError> {
        let mut tables = self.tables.write().await;
        let user = tables.users.get_mut(&id).ok_or(MarketError::NotFound("user"))?;
        user.successful_tasks_count = totals.successful_tasks_count;
        user.failed_tasks_count = totals.failed_tasks_count;
        user.total_earnings_cents = totals.total_earnings_cents;
        Ok(user.clone())
    }

    async fn insert_category(&self, category: &Category) -> Result<(), MarketError> {
        self.tables
            .write()
            .await
            .categories
            .insert(category.id, category.clone());
        Ok(())
    }

    async fn get_category(&self, id: Uuid) -> Result<Option<Category>, MarketError> {
        Ok(self.tables.read().await.categories.get(&id).cloned())
    }

    async fn list_listed_categories(&self, now: DateTime<Utc>) -> Result<Vec<Category>, MarketError> {
        let mut categories: Vec<Category> = self
            .tables
            .read()
            .await
            .categories
            .values()
            .filter(|c| c.is_listed(now))
            .cloned()
            .collect();
        categories.sort_by(|a, b| {
            b.is_premium
                .cmp(&a.is_premium)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(categories)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), MarketError> {
        let mut tables = self.tables.write().await;
        if !tables.categories.contains_key(&task.category_id) {
            return Err(MarketError::NotFound("category"));
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, MarketError> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn update_task_availability(
        &self,
        id: Uuid,
        is_active: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Task, MarketError> {
        let mut tables = self.tables.write().await;
        let task = tables.tasks.get_mut(&id).ok_or(MarketError::NotFound("task"))?;
        task.is_active = is_active;
        task.expires_at = expires_at;
        Ok(task.clone())
    }

    async fn list_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, MarketError> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| tables.is_available(t, category_id, now))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_available_tasks(
        &self,
        category_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<usize, MarketError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| tables.is_available(t, category_id, now))
            .count())
    }

    async fn create_claim(
        &self,
        user_id: Uuid,
        task_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Claim, MarketError> {
        let mut tables = self.tables.write().await;
        lifecycle::check_claim(
            tables.active_claim(user_id),
            tables.claim_by_task.contains_key(&task_id),
            tables.tasks.get(&task_id),
            now,
        )?;
        let claim = lifecycle::open_claim(user_id, task_id, now, window);
        tables.claim_by_task.insert(task_id, claim.id);
        tables.claims.insert(claim.id, claim.clone());
        Ok(claim)
    }

    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>, MarketError> {
        Ok(self.tables.read().await.claims.get(&id).cloned())
    }

    async fn find_claim(&self, user_id: Uuid, task_id: Uuid) -> Result<Option<Claim>, MarketError> {
        let tables = self.tables.read().await;
        Ok(tables
            .claim_by_task
            .get(&task_id)
            .and_then(|id| tables.claims.get(id))
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn active_claim(&self, user_id: Uuid) -> Result<Option<Claim>, MarketError> {
        Ok(self.tables.read().await.active_claim(user_id).cloned())
    }

    async fn transition_claim(
        &self,
        claim_id: Uuid,
        transition: ClaimTransition,
        now: DateTime<Utc>,
    ) -> Result<Claim, MarketError> {
        let mut tables = self.tables.write().await;
        let claim = tables
            .claims
            .get_mut(&claim_id)
            .ok_or(MarketError::NotFound("claim"))?;
        // Mutate a copy so a rejected transition leaves the row untouched.
        let mut updated = claim.clone();
        lifecycle::apply_transition(&mut updated, &transition, now)?;
        *claim = updated.clone();
        Ok(updated)
    }

    async fn finalize_claim(
        &self,
        claim_id: Uuid,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Result<(Claim, UserAccount), MarketError> {
        let mut tables = self.tables.write().await;
        let mut claim = tables
            .claims
            .get(&claim_id)
            .cloned()
            .ok_or(MarketError::NotFound("claim"))?;
        let reward_cents = tables
            .tasks
            .get(&claim.task_id)
            .map(|t| t.reward_cents)
            .ok_or(MarketError::NotFound("task"))?;
        let mut user = tables
            .users
            .get(&claim.user_id)
            .cloned()
            .ok_or(MarketError::NotFound("user"))?;

        lifecycle::apply_verdict(&mut claim, &mut user, reward_cents, &verdict, now)?;

        tables.claims.insert(claim.id, claim.clone());
        tables.users.insert(user.id, user.clone());
        Ok((claim, user))
    }

    async fn list_lapsed_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, MarketError> {
        let tables = self.tables.read().await;
        let mut lapsed: Vec<Claim> = tables
            .claims
            .values()
            .filter(|c| crate::marketplace::expiry::is_lapsed(c, now))
            .cloned()
            .collect();
        lapsed.sort_by_key(|c| c.expires_at);
        Ok(lapsed)
    }

    async fn list_paid_claims(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaidClaim>, MarketError> {
        let tables = self.tables.read().await;
        let mut paid: Vec<PaidClaim> = tables
            .claims
            .values()
            .filter(|c| c.user_id == user_id && c.payment_status == PaymentStatus::Success)
            .filter_map(|c| {
                tables.tasks.get(&c.task_id).map(|t| PaidClaim {
                    claim: c.clone(),
                    task_title: t.title.clone(),
                    category_id: t.category_id,
                    reward_cents: t.reward_cents,
                })
            })
            .collect();
        paid.sort_by(|a, b| b.claim.completed_at.cmp(&a.claim.completed_at));
        Ok(paid.into_iter().skip(offset).take(limit).collect())
    }

    async fn sum_paid_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<u64, MarketError> {
        let tables = self.tables.read().await;
        Ok(tables
            .claims
            .values()
            .filter(|c| {
                c.user_id == user_id
                    && c.payment_status == PaymentStatus::Success
                    && c.completed_at.map_or(false, |at| at >= since)
            })
            .filter_map(|c| tables.tasks.get(&c.task_id))
            .map(|t| t.reward_cents)
            .sum())
    }

    async fn history_totals(&self, user_id: Uuid) -> Result<HistoryTotals, MarketError> {
        let tables = self.tables.read().await;
        let mut totals = HistoryTotals::default();
        for claim in tables.claims.values().filter(|c| c.user_id == user_id) {
            match claim.status {
                ClaimStatus::Completed => totals.successful_tasks_count += 1,
                ClaimStatus::Failed => totals.failed_tasks_count += 1,
                _ => {}
            }
            if claim.payment_status == PaymentStatus::Success {
                if let Some(task) = tables.tasks.get(&claim.task_id) {
                    totals.total_earnings_cents += task.reward_cents;
                }
            }
        }
        Ok(totals)
    }
}
