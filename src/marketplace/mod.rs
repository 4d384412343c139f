//! Task marketplace core.
//!
//! Admins publish time-limited tasks; users race to grab one, upload proof
//! within the claim countdown, and get paid once an admin verifies the work.
//!
//! This module is designed around a few rules:
//! - All coordination goes through the store's atomic operations
//! - Lifecycle decisions are pure functions in [`lifecycle`]
//! - Expiry is evaluated lazily against the [`Clock`]

pub mod artifact;
pub mod clock;
pub mod earnings;
pub mod error;
pub mod expiry;
pub mod lifecycle;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use earnings::{Badge, EarningsAudit, HistoryTotals, PaidClaim, WalletView};
pub use error::MarketError;
pub use lifecycle::ClaimTransition;
pub use store::{create_market_store, InMemoryMarketStore, MarketStore, SqliteMarketStore, StoreType};
pub use types::*;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Number of available tasks previewed per category on the browse page.
pub const CATEGORY_PREVIEW_LIMIT: usize = 5;

/// A listed category with its currently claimable tasks.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryListing {
    pub category: Category,
    pub available_count: usize,
    pub preview: Vec<Task>,
}

/// A claim as its owner sees it, with the countdown evaluated at read time.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimView {
    pub claim: Claim,
    pub task: Task,
    pub category: Option<Category>,
    pub expired: bool,
    pub seconds_remaining: i64,
}

/// Entry point for every marketplace operation.
pub struct Marketplace {
    store: Arc<dyn MarketStore>,
    clock: SharedClock,
    claim_window: Duration,
}

impl Marketplace {
    pub fn new(store: Arc<dyn MarketStore>, clock: SharedClock, claim_window: Duration) -> Self {
        Self {
            store,
            clock,
            claim_window,
        }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn claim_window(&self) -> Duration {
        self.claim_window
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity glue
    // ─────────────────────────────────────────────────────────────────────

    /// Resolve an authenticated user id into a caller with its stored role.
    pub async fn resolve_caller(&self, user_id: Uuid) -> Result<Caller, MarketError> {
        self.store
            .get_user(user_id)
            .await?
            .map(|u| u.caller())
            .ok_or(MarketError::NotFound("user"))
    }

    /// Register a user. Only superadmins may do this.
    pub async fn register_user(
        &self,
        caller: &Caller,
        name: &str,
        role: Role,
    ) -> Result<UserAccount, MarketError> {
        require(caller.role.can_manage_users(), "manage_users")?;
        let name = name.trim();
        if name.is_empty() {
            return Err(MarketError::InvalidInput("name is empty".to_string()));
        }
        let user = UserAccount::new(name, role, self.now());
        self.store.insert_user(&user).await?;
        tracing::info!(user_id = %user.id, role = role.as_str(), "Registered user");
        Ok(user)
    }

    /// Make sure a user with this id exists, creating it if needed.
    pub async fn ensure_user(&self, id: Uuid, name: &str, role: Role) -> Result<UserAccount, MarketError> {
        if let Some(existing) = self.store.get_user(id).await? {
            return Ok(existing);
        }
        let mut user = UserAccount::new(name, role, self.now());
        user.id = id;
        self.store.insert_user(&user).await?;
        tracing::info!(user_id = %id, role = role.as_str(), "Created bootstrap user");
        Ok(user)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────

    pub async fn create_category(&self, caller: &Caller, new: NewCategory) -> Result<Category, MarketError> {
        require(caller.role.can_verify(), "publish")?;
        if new.name.trim().is_empty() {
            return Err(MarketError::InvalidInput("category name is empty".to_string()));
        }
        let category = Category {
            id: Uuid::new_v4(),
            admin_id: caller.user_id,
            name: new.name.trim().to_string(),
            description: new.description,
            is_active: true,
            is_premium: new.is_premium,
            expires_at: new.expires_at,
            created_at: self.now(),
        };
        self.store.insert_category(&category).await?;
        tracing::info!(category_id = %category.id, admin_id = %caller.user_id, "Created category");
        Ok(category)
    }

    pub async fn publish_task(&self, caller: &Caller, new: NewTask) -> Result<Task, MarketError> {
        require(caller.role.can_verify(), "publish")?;
        if new.title.trim().is_empty() {
            return Err(MarketError::InvalidInput("title is empty".to_string()));
        }
        if new.reward_cents == 0 {
            return Err(MarketError::InvalidInput("reward must be positive".to_string()));
        }
        let now = self.now();
        if new.expires_at <= now {
            return Err(MarketError::InvalidInput("expiry must be in the future".to_string()));
        }
        let task = Task {
            id: Uuid::new_v4(),
            category_id: new.category_id,
            admin_id: caller.user_id,
            title: new.title.trim().to_string(),
            description: new.description,
            difficulty: new.difficulty,
            reward_cents: new.reward_cents,
            external_link: new.external_link,
            auxiliary_text: new.auxiliary_text,
            is_active: true,
            expires_at: new.expires_at,
            created_at: now,
        };
        self.store.insert_task(&task).await?;
        tracing::info!(task_id = %task.id, category_id = %task.category_id, "Published task");
        Ok(task)
    }

    /// Change `is_active` / `expires_at` of a task owned by the caller.
    pub async fn set_task_availability(
        &self,
        caller: &Caller,
        task_id: Uuid,
        is_active: bool,
        expires_at: DateTime<Utc>,
    ) -> Result<Task, MarketError> {
        require(caller.role.can_verify(), "publish")?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(MarketError::NotFound("task"))?;
        if task.admin_id != caller.user_id && !caller.role.can_manage_users() {
            return Err(MarketError::NotOwner);
        }
        let task = self
            .store
            .update_task_availability(task_id, is_active, expires_at)
            .await?;
        tracing::info!(task_id = %task_id, is_active, expires_at = %expires_at, "Updated task availability");
        Ok(task)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Availability filter
    // ─────────────────────────────────────────────────────────────────────

    /// Claimable tasks, newest first. Reads committed store state directly.
    pub async fn list_available(&self, category_id: Option<Uuid>, page: Page) -> Result<Vec<Task>, MarketError> {
        self.store
            .list_available_tasks(category_id, self.now(), page.per_page, page.offset())
            .await
    }

    /// Listed categories (premium first, then newest) with a preview of
    /// their claimable tasks.
    pub async fn browse_categories(&self) -> Result<Vec<CategoryListing>, MarketError> {
        let now = self.now();
        let categories = self.store.list_listed_categories(now).await?;
        let mut listings = Vec::with_capacity(categories.len());
        for category in categories {
            let available_count = self.store.count_available_tasks(Some(category.id), now).await?;
            let preview = self
                .store
                .list_available_tasks(Some(category.id), now, CATEGORY_PREVIEW_LIMIT, 0)
                .await?;
            listings.push(CategoryListing {
                category,
                available_count,
                preview,
            });
        }
        Ok(listings)
    }

    /// One category and a page of its claimable tasks.
    pub async fn category_tasks(
        &self,
        category_id: Uuid,
        page: Page,
    ) -> Result<(Category, Vec<Task>, usize), MarketError> {
        let category = self
            .store
            .get_category(category_id)
            .await?
            .ok_or(MarketError::NotFound("category"))?;
        let now = self.now();
        let total = self.store.count_available_tasks(Some(category_id), now).await?;
        let tasks = self
            .store
            .list_available_tasks(Some(category_id), now, page.per_page, page.offset())
            .await?;
        Ok((category, tasks, total))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Claim coordinator
    // ─────────────────────────────────────────────────────────────────────

    /// Grab a task for the caller.
    pub async fn claim(&self, caller: &Caller, task_id: Uuid) -> Result<Claim, MarketError> {
        let now = self.now();
        match self
            .store
            .create_claim(caller.user_id, task_id, now, self.claim_window)
            .await
        {
            Ok(claim) => {
                tracing::info!(
                    user_id = %caller.user_id,
                    task_id = %task_id,
                    claim_id = %claim.id,
                    expires_at = %claim.expires_at,
                    "Task claimed"
                );
                Ok(claim)
            }
            Err(e) => {
                log_rejection("claim", caller.user_id, &e);
                Err(e)
            }
        }
    }

    /// The caller's non-terminal claim, if any.
    pub async fn current_claim(&self, caller: &Caller) -> Result<Option<ClaimView>, MarketError> {
        match self.store.active_claim(caller.user_id).await? {
            Some(claim) => self.view(claim).await.map(Some),
            None => Ok(None),
        }
    }

    /// The caller's claim on a given task. Full task details are only
    /// visible through a claim.
    pub async fn claim_for_task(&self, caller: &Caller, task_id: Uuid) -> Result<ClaimView, MarketError> {
        let claim = self
            .store
            .find_claim(caller.user_id, task_id)
            .await?
            .ok_or(MarketError::NotFound("claim"))?;
        self.view(claim).await
    }

    async fn view(&self, claim: Claim) -> Result<ClaimView, MarketError> {
        let task = self
            .store
            .get_task(claim.task_id)
            .await?
            .ok_or(MarketError::NotFound("task"))?;
        let category = self.store.get_category(task.category_id).await?;
        let now = self.now();
        Ok(ClaimView {
            expired: expiry::is_expired(&claim, now),
            seconds_remaining: expiry::seconds_remaining(&claim, now),
            claim,
            task,
            category,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Proof workflow
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a proof artifact to the caller's claim.
    ///
    /// Checked in order: claim exists, belongs to the caller, is not expired,
    /// the artifact is an accepted image, and the slot is the one the claim
    /// is waiting for. The store re-checks ownership, expiry and slot inside
    /// its atomic section.
    pub async fn submit_proof(
        &self,
        caller: &Caller,
        claim_id: Uuid,
        slot: ProofSlot,
        artifact: ProofArtifact,
    ) -> Result<Claim, MarketError> {
        let result = self.try_submit_proof(caller, claim_id, slot, artifact).await;
        match &result {
            Ok(claim) => tracing::info!(
                user_id = %caller.user_id,
                claim_id = %claim_id,
                slot = slot.as_str(),
                status = %claim.status,
                "Proof uploaded"
            ),
            Err(e) => log_rejection("submit_proof", caller.user_id, e),
        }
        result
    }

    async fn try_submit_proof(
        &self,
        caller: &Caller,
        claim_id: Uuid,
        slot: ProofSlot,
        artifact: ProofArtifact,
    ) -> Result<Claim, MarketError> {
        let claim = self
            .store
            .get_claim(claim_id)
            .await?
            .ok_or(MarketError::NotFound("claim"))?;
        if claim.user_id != caller.user_id {
            return Err(MarketError::NotOwner);
        }
        if expiry::is_expired(&claim, self.now()) {
            return Err(MarketError::ClaimExpired);
        }
        artifact::validate_artifact(&artifact)?;

        self.store
            .transition_claim(
                claim_id,
                ClaimTransition::SubmitProof {
                    user_id: caller.user_id,
                    slot,
                    reference: artifact.reference,
                },
                self.now(),
            )
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Verification (admin)
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the claimant for the second proof.
    pub async fn request_second_proof(&self, caller: &Caller, claim_id: Uuid) -> Result<Claim, MarketError> {
        self.authorize_verifier(caller, claim_id).await?;
        let claim = self
            .store
            .transition_claim(claim_id, ClaimTransition::RequestSecondProof, self.now())
            .await?;
        tracing::info!(claim_id = %claim_id, admin_id = %caller.user_id, "Requested second proof");
        Ok(claim)
    }

    /// Record the terminal decision for a claim and apply payment counters.
    ///
    /// A claim that is already terminal is rejected with
    /// [`MarketError::AlreadyFinalized`] and counters stay as they were.
    pub async fn finalize(
        &self,
        caller: &Caller,
        claim_id: Uuid,
        verdict: Verdict,
    ) -> Result<(Claim, UserAccount), MarketError> {
        self.authorize_verifier(caller, claim_id).await?;
        match self.store.finalize_claim(claim_id, verdict, self.now()).await {
            Ok((claim, user)) => {
                tracing::info!(
                    claim_id = %claim_id,
                    admin_id = %caller.user_id,
                    user_id = %user.id,
                    status = %claim.status,
                    successful_tasks_count = user.successful_tasks_count,
                    total_earnings_cents = user.total_earnings_cents,
                    "Claim finalized"
                );
                Ok((claim, user))
            }
            Err(e) => {
                log_rejection("finalize", caller.user_id, &e);
                Err(e)
            }
        }
    }

    async fn authorize_verifier(&self, caller: &Caller, claim_id: Uuid) -> Result<(), MarketError> {
        require(caller.role.can_verify(), "verify")?;
        let claim = self
            .store
            .get_claim(claim_id)
            .await?
            .ok_or(MarketError::NotFound("claim"))?;
        if caller.role.can_manage_users() {
            return Ok(());
        }
        let task = self
            .store
            .get_task(claim.task_id)
            .await?
            .ok_or(MarketError::NotFound("task"))?;
        if task.admin_id != caller.user_id {
            return Err(MarketError::NotOwner);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Expiry sweep
    // ─────────────────────────────────────────────────────────────────────

    /// Fail every lapsed claim that is still waiting on its claimant.
    ///
    /// Returns the ids of the claims that were failed. Claims that moved on
    /// between listing and finalizing are skipped.
    pub async fn sweep_expired(&self) -> Result<Vec<Uuid>, MarketError> {
        let now = self.now();
        let lapsed = self.store.list_lapsed_claims(now).await?;
        let mut failed = Vec::with_capacity(lapsed.len());
        for claim in lapsed {
            match self.store.finalize_claim(claim.id, Verdict::Lapsed, now).await {
                Ok((claim, _)) => {
                    tracing::info!(
                        claim_id = %claim.id,
                        user_id = %claim.user_id,
                        task_id = %claim.task_id,
                        "Expired claim marked failed"
                    );
                    failed.push(claim.id);
                }
                Err(e) if e.is_business() => {
                    tracing::debug!(claim_id = %claim.id, error = %e, "Skipping claim during sweep");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Earnings
    // ─────────────────────────────────────────────────────────────────────

    /// Wallet for the caller: counters, today's earnings and paid history.
    pub async fn wallet(&self, caller: &Caller, page: Page) -> Result<WalletView, MarketError> {
        let user = self
            .store
            .get_user(caller.user_id)
            .await?
            .ok_or(MarketError::NotFound("user"))?;
        let today = earnings::start_of_day(self.now());
        let today_earnings_cents = self.store.sum_paid_since(user.id, today).await?;
        let history = self
            .store
            .list_paid_claims(user.id, page.per_page, page.offset())
            .await?;
        Ok(WalletView {
            total_tasks: user.successful_tasks_count,
            total_earnings_cents: user.total_earnings_cents,
            today_earnings_cents,
            badge: Badge::for_successes(user.successful_tasks_count),
            history,
        })
    }

    /// Compare a user's counters with their claim history, optionally
    /// overwriting the counters with the recomputed values.
    pub async fn audit_earnings(
        &self,
        caller: &Caller,
        user_id: Uuid,
        repair: bool,
    ) -> Result<EarningsAudit, MarketError> {
        require(caller.role.can_verify(), "verify")?;
        if repair {
            require(caller.role.can_manage_users(), "manage_users")?;
        }
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(MarketError::NotFound("user"))?;
        let stored = HistoryTotals::from_account(&user);
        let recomputed = self.store.history_totals(user_id).await?;
        let mut audit = EarningsAudit {
            stored,
            recomputed,
            repaired: false,
        };
        if audit.has_drift() {
            tracing::warn!(
                user_id = %user_id,
                stored = ?stored,
                recomputed = ?recomputed,
                "Earnings counters drifted from history"
            );
            if repair {
                self.store.set_user_totals(user_id, recomputed).await?;
                audit.repaired = true;
                tracing::info!(user_id = %user_id, "Earnings counters repaired");
            }
        }
        Ok(audit)
    }
}

fn require(allowed: bool, capability: &'static str) -> Result<(), MarketError> {
    if allowed {
        Ok(())
    } else {
        Err(MarketError::Forbidden(capability))
    }
}

fn log_rejection(operation: &str, user_id: Uuid, err: &MarketError) {
    if err.is_business() {
        tracing::debug!(operation, user_id = %user_id, kind = err.kind(), "Rejected");
    } else {
        tracing::warn!(operation, user_id = %user_id, error = %err, "Storage failure");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Harness {
        market: Marketplace,
        clock: ManualClock,
        admin: Caller,
        category: Category,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap()
    }

    async fn harness() -> Harness {
        let clock = ManualClock::new(t0());
        let market = Marketplace::new(
            Arc::new(InMemoryMarketStore::new()),
            Arc::new(clock.clone()),
            expiry::default_claim_window(),
        );
        let admin = market
            .ensure_user(Uuid::new_v4(), "admin", Role::Admin)
            .await
            .unwrap()
            .caller();
        let category = market
            .create_category(
                &admin,
                NewCategory {
                    name: "Groups".to_string(),
                    description: None,
                    is_premium: false,
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        Harness {
            market,
            clock,
            admin,
            category,
        }
    }

    impl Harness {
        async fn user(&self, name: &str) -> Caller {
            self.market
                .ensure_user(Uuid::new_v4(), name, Role::User)
                .await
                .unwrap()
                .caller()
        }

        async fn task(&self, title: &str, reward_cents: u64) -> Task {
            self.market
                .publish_task(
                    &self.admin,
                    NewTask {
                        category_id: self.category.id,
                        title: title.to_string(),
                        description: "Join the group and post".to_string(),
                        difficulty: Difficulty::Easy,
                        reward_cents,
                        external_link: "https://chat.example/join".to_string(),
                        auxiliary_text: None,
                        expires_at: self.clock.now() + Duration::days(1),
                    },
                )
                .await
                .unwrap()
        }
    }

    fn png(reference: &str) -> ProofArtifact {
        ProofArtifact {
            reference: reference.to_string(),
            file_name: "screenshot.png".to_string(),
            content_type: Some("image/png".to_string()),
            size_bytes: 200 * 1024,
        }
    }

    #[tokio::test]
    async fn test_claim_upload_finalize_scenario() {
        let h = harness().await;
        let task_x = h.task("X", 2500).await;
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;

        let claim = h.market.claim(&alice, task_x.id).await.unwrap();
        assert_eq!(claim.status, ClaimStatus::Taken);
        assert_eq!(claim.expires_at, t0() + Duration::minutes(10));

        h.clock.advance(Duration::seconds(10));
        assert_eq!(
            h.market.claim(&bob, task_x.id).await,
            Err(MarketError::TaskAlreadyTaken)
        );

        h.clock.advance(Duration::minutes(9) - Duration::seconds(10));
        let claim = h
            .market
            .submit_proof(&alice, claim.id, ProofSlot::Proof1, png("proofs/a.png"))
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Proof1Uploaded);

        let (claim, account) = h
            .market
            .finalize(&h.admin, claim.id, Verdict::Completed { notes: None })
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Completed);
        assert_eq!(account.successful_tasks_count, 1);
        assert_eq!(account.total_earnings_cents, 2500);

        // Second finalize is rejected and changes nothing.
        assert_eq!(
            h.market
                .finalize(&h.admin, claim.id, Verdict::Completed { notes: None })
                .await,
            Err(MarketError::AlreadyFinalized {
                status: ClaimStatus::Completed
            })
        );
        let wallet = h.market.wallet(&alice, Page::default()).await.unwrap();
        assert_eq!(wallet.total_tasks, 1);
        assert_eq!(wallet.total_earnings_cents, 2500);
        assert_eq!(wallet.today_earnings_cents, 2500);
        assert_eq!(wallet.badge, Badge::Junior);
        assert_eq!(wallet.history.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_claim_expires() {
        let h = harness().await;
        let task_x = h.task("X", 2500).await;
        let alice = h.user("alice").await;
        let claim = h.market.claim(&alice, task_x.id).await.unwrap();

        h.clock.advance(Duration::minutes(11));
        assert_eq!(
            h.market
                .submit_proof(&alice, claim.id, ProofSlot::Proof1, png("proofs/late.png"))
                .await,
            Err(MarketError::ClaimExpired)
        );
        let view = h.market.claim_for_task(&alice, task_x.id).await.unwrap();
        assert!(view.expired);
        assert_eq!(view.seconds_remaining, 0);

        // The task stays consumed and the user slot stays held until a verdict.
        assert!(h.market.list_available(None, Page::default()).await.unwrap().is_empty());
        let other = h.task("Y", 100).await;
        assert_eq!(
            h.market.claim(&alice, other.id).await,
            Err(MarketError::AlreadyHasActiveTask)
        );
    }

    #[tokio::test]
    async fn test_single_active_claim_any_task() {
        let h = harness().await;
        let a = h.task("A", 100).await;
        let b = h.task("B", 100).await;
        let alice = h.user("alice").await;

        h.market.claim(&alice, a.id).await.unwrap();
        assert_eq!(
            h.market.claim(&alice, b.id).await,
            Err(MarketError::AlreadyHasActiveTask)
        );
        // Even re-grabbing the same task reports the active-claim rule first.
        assert_eq!(
            h.market.claim(&alice, a.id).await,
            Err(MarketError::AlreadyHasActiveTask)
        );
    }

    #[tokio::test]
    async fn test_second_proof_needs_request() {
        let h = harness().await;
        let task = h.task("T", 100).await;
        let alice = h.user("alice").await;
        let claim = h.market.claim(&alice, task.id).await.unwrap();

        assert_eq!(
            h.market
                .submit_proof(&alice, claim.id, ProofSlot::Proof2, png("proofs/2.png"))
                .await,
            Err(MarketError::WrongProofSlot {
                status: ClaimStatus::Taken
            })
        );

        h.market
            .submit_proof(&alice, claim.id, ProofSlot::Proof1, png("proofs/1.png"))
            .await
            .unwrap();
        h.market.request_second_proof(&h.admin, claim.id).await.unwrap();
        let claim = h
            .market
            .submit_proof(&alice, claim.id, ProofSlot::Proof2, png("proofs/2.png"))
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Proof2Uploaded);
        assert_eq!(claim.proof2_ref.as_deref(), Some("proofs/2.png"));
    }

    #[tokio::test]
    async fn test_proof_checks_owner_and_artifact() {
        let h = harness().await;
        let task = h.task("T", 100).await;
        let alice = h.user("alice").await;
        let mallory = h.user("mallory").await;
        let claim = h.market.claim(&alice, task.id).await.unwrap();

        assert_eq!(
            h.market
                .submit_proof(&mallory, claim.id, ProofSlot::Proof1, png("proofs/m.png"))
                .await,
            Err(MarketError::NotOwner)
        );

        let mut pdf = png("proofs/doc.pdf");
        pdf.file_name = "doc.pdf".to_string();
        assert!(matches!(
            h.market.submit_proof(&alice, claim.id, ProofSlot::Proof1, pdf).await,
            Err(MarketError::InvalidArtifact(_))
        ));

        assert_eq!(
            h.market
                .submit_proof(&alice, Uuid::new_v4(), ProofSlot::Proof1, png("proofs/x.png"))
                .await,
            Err(MarketError::NotFound("claim"))
        );
    }

    #[tokio::test]
    async fn test_finalize_requires_verifier() {
        let h = harness().await;
        let task = h.task("T", 100).await;
        let alice = h.user("alice").await;
        let claim = h.market.claim(&alice, task.id).await.unwrap();

        assert_eq!(
            h.market
                .finalize(&alice, claim.id, Verdict::Failed { notes: None })
                .await,
            Err(MarketError::Forbidden("verify"))
        );

        let other_admin = h
            .market
            .ensure_user(Uuid::new_v4(), "other", Role::Admin)
            .await
            .unwrap()
            .caller();
        assert_eq!(
            h.market
                .finalize(&other_admin, claim.id, Verdict::Failed { notes: None })
                .await,
            Err(MarketError::NotOwner)
        );

        let root = h
            .market
            .ensure_user(Uuid::new_v4(), "root", Role::Superadmin)
            .await
            .unwrap()
            .caller();
        let (claim, account) = h
            .market
            .finalize(
                &root,
                claim.id,
                Verdict::Failed {
                    notes: Some("wrong group".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(claim.status, ClaimStatus::Failed);
        assert_eq!(claim.admin_notes.as_deref(), Some("wrong group"));
        assert_eq!(account.failed_tasks_count, 1);
    }

    #[tokio::test]
    async fn test_sweep_fails_only_idle_claims() {
        let h = harness().await;
        let a = h.task("A", 100).await;
        let b = h.task("B", 100).await;
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let idle = h.market.claim(&alice, a.id).await.unwrap();
        let busy = h.market.claim(&bob, b.id).await.unwrap();
        h.market
            .submit_proof(&bob, busy.id, ProofSlot::Proof1, png("proofs/b.png"))
            .await
            .unwrap();

        assert!(h.market.sweep_expired().await.unwrap().is_empty());
        h.clock.advance(Duration::minutes(11));
        assert_eq!(h.market.sweep_expired().await.unwrap(), vec![idle.id]);
        assert!(h.market.sweep_expired().await.unwrap().is_empty());

        let alice_account = h.market.store().get_user(alice.user_id).await.unwrap().unwrap();
        assert_eq!(alice_account.failed_tasks_count, 1);
        // Released user slot; the task itself stays consumed.
        assert!(h.market.current_claim(&alice).await.unwrap().is_none());
        assert!(h.market.list_available(None, Page::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_browse_categories_preview() {
        let h = harness().await;
        for i in 0..7 {
            h.task(&format!("task-{}", i), 100).await;
            h.clock.advance(Duration::seconds(1));
        }
        let listings = h.market.browse_categories().await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].available_count, 7);
        assert_eq!(listings[0].preview.len(), CATEGORY_PREVIEW_LIMIT);
        assert_eq!(listings[0].preview[0].title, "task-6");

        let (_, tasks, total) = h
            .market
            .category_tasks(h.category.id, Page::default())
            .await
            .unwrap();
        assert_eq!(total, 7);
        assert_eq!(tasks.len(), 7);
        assert_eq!(
            h.market.category_tasks(Uuid::new_v4(), Page::default()).await.err(),
            Some(MarketError::NotFound("category"))
        );
    }

    #[tokio::test]
    async fn test_task_availability_owner_only() {
        let h = harness().await;
        let task = h.task("T", 100).await;
        let other_admin = h
            .market
            .ensure_user(Uuid::new_v4(), "other", Role::Admin)
            .await
            .unwrap()
            .caller();
        assert_eq!(
            h.market
                .set_task_availability(&other_admin, task.id, false, task.expires_at)
                .await,
            Err(MarketError::NotOwner)
        );
        let updated = h
            .market
            .set_task_availability(&h.admin, task.id, false, task.expires_at)
            .await
            .unwrap();
        assert!(!updated.is_active);
        let alice = h.user("alice").await;
        assert_eq!(
            h.market.claim(&alice, task.id).await,
            Err(MarketError::TaskUnavailable)
        );
    }

    #[tokio::test]
    async fn test_audit_detects_and_repairs_drift() {
        let h = harness().await;
        let task = h.task("T", 700).await;
        let alice = h.user("alice").await;
        let claim = h.market.claim(&alice, task.id).await.unwrap();
        h.market
            .submit_proof(&alice, claim.id, ProofSlot::Proof1, png("proofs/t.png"))
            .await
            .unwrap();
        h.market
            .finalize(&h.admin, claim.id, Verdict::Completed { notes: None })
            .await
            .unwrap();

        let clean = h.market.audit_earnings(&h.admin, alice.user_id, false).await.unwrap();
        assert!(!clean.has_drift());

        h.market
            .store()
            .set_user_totals(
                alice.user_id,
                HistoryTotals {
                    successful_tasks_count: 5,
                    failed_tasks_count: 0,
                    total_earnings_cents: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.market.audit_earnings(&h.admin, alice.user_id, true).await,
            Err(MarketError::Forbidden("manage_users"))
        );

        let root = h
            .market
            .ensure_user(Uuid::new_v4(), "root", Role::Superadmin)
            .await
            .unwrap()
            .caller();
        let audit = h.market.audit_earnings(&root, alice.user_id, true).await.unwrap();
        assert!(audit.has_drift());
        assert!(audit.repaired);
        let account = h.market.store().get_user(alice.user_id).await.unwrap().unwrap();
        assert_eq!(account.successful_tasks_count, 1);
        assert_eq!(account.total_earnings_cents, 700);
    }

    #[tokio::test]
    async fn test_register_user_requires_superadmin() {
        let h = harness().await;
        assert_eq!(
            h.market.register_user(&h.admin, "eve", Role::User).await,
            Err(MarketError::Forbidden("manage_users"))
        );
        let root = h
            .market
            .ensure_user(Uuid::new_v4(), "root", Role::Superadmin)
            .await
            .unwrap()
            .caller();
        let eve = h.market.register_user(&root, "eve", Role::User).await.unwrap();
        assert_eq!(h.market.resolve_caller(eve.id).await.unwrap().role, Role::User);
        assert_eq!(
            h.market.resolve_caller(Uuid::new_v4()).await,
            Err(MarketError::NotFound("user"))
        );
    }
}
