//! Marketplace entities: categories, tasks, claims and user aggregates.
//!
//! # Invariants
//! - A task has at most one claim, ever.
//! - A user has at most one claim whose status is not terminal.
//! - `Claim::expires_at == Claim::taken_at + claim window`, fixed at creation.
//! - Claim status only moves forward (see [`ClaimStatus`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of caller roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Superadmin,
}

impl Role {
    /// Whether this role may publish tasks and record verification decisions.
    pub fn can_verify(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }

    /// Whether this role may register users and act on any admin's tasks.
    pub fn can_manage_users(&self) -> bool {
        matches!(self, Role::Superadmin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Superadmin => "superadmin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            "superadmin" => Some(Role::Superadmin),
            _ => None,
        }
    }
}

/// An authenticated actor, as supplied by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

/// A user together with the counters maintained by the finalize step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub successful_tasks_count: u64,
    pub failed_tasks_count: u64,
    pub total_earnings_cents: u64,
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(name: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            successful_tasks_count: 0,
            failed_tasks_count: 0,
            total_earnings_cents: 0,
            created_at: now,
        }
    }

    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.id,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub admin_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_premium: bool,
    /// Categories without an expiry stay listed while active.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Category {
    pub fn is_listed(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

/// A published task. Only `is_active` and `expires_at` change after publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub category_id: Uuid,
    pub admin_id: Uuid,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub reward_cents: u64,
    pub external_link: String,
    pub auxiliary_text: Option<String>,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Active and not past its deadline. Claim state is checked separately.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// Fields an admin supplies when publishing a task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub reward_cents: u64,
    pub external_link: String,
    pub auxiliary_text: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Fields an admin supplies when creating a category.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Status of a claim.
///
/// # State Machine
/// ```text
/// Taken -> Proof1Uploaded -> Proof2Requested -> Proof2Uploaded -> Completed
///      \-----------------\------------------\----------------\-> Failed
/// ```
/// `Completed` is also reachable straight from `Proof1Uploaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Taken,
    Proof1Uploaded,
    Proof2Requested,
    Proof2Uploaded,
    Completed,
    Failed,
}

impl ClaimStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Completed | ClaimStatus::Failed)
    }

    /// The next step belongs to the claimant, so the countdown matters.
    pub fn awaits_user(&self) -> bool {
        matches!(self, ClaimStatus::Taken | ClaimStatus::Proof2Requested)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Taken => "taken",
            ClaimStatus::Proof1Uploaded => "proof1_uploaded",
            ClaimStatus::Proof2Requested => "proof2_requested",
            ClaimStatus::Proof2Uploaded => "proof2_uploaded",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "taken" => Some(ClaimStatus::Taken),
            "proof1_uploaded" => Some(ClaimStatus::Proof1Uploaded),
            "proof2_requested" => Some(ClaimStatus::Proof2Requested),
            "proof2_uploaded" => Some(ClaimStatus::Proof2Uploaded),
            "completed" => Some(ClaimStatus::Completed),
            "failed" => Some(ClaimStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

/// One user's attempt at one task (a "user task").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub status: ClaimStatus,
    pub taken_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub proof1_ref: Option<String>,
    pub proof2_ref: Option<String>,
    pub payment_status: PaymentStatus,
    pub admin_notes: Option<String>,
}

/// Which of the two proof submissions an artifact is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofSlot {
    Proof1,
    Proof2,
}

impl ProofSlot {
    /// Status a claim must be in to accept this slot.
    pub fn expected_status(&self) -> ClaimStatus {
        match self {
            ProofSlot::Proof1 => ClaimStatus::Taken,
            ProofSlot::Proof2 => ClaimStatus::Proof2Requested,
        }
    }

    /// Status after a successful upload into this slot.
    pub fn uploaded_status(&self) -> ClaimStatus {
        match self {
            ProofSlot::Proof1 => ClaimStatus::Proof1Uploaded,
            ProofSlot::Proof2 => ClaimStatus::Proof2Uploaded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProofSlot::Proof1 => "proof1",
            ProofSlot::Proof2 => "proof2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proof1" | "1" => Some(ProofSlot::Proof1),
            "proof2" | "2" => Some(ProofSlot::Proof2),
            _ => None,
        }
    }
}

/// A stored proof file as described by the ingestion edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofArtifact {
    /// Opaque reference returned by file storage.
    pub reference: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// A verification decision on a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict {
    Completed { notes: Option<String> },
    Failed { notes: Option<String> },
    /// Recorded by the expiry sweep for claims whose countdown ran out.
    Lapsed,
}

impl Verdict {
    pub fn target_status(&self) -> ClaimStatus {
        match self {
            Verdict::Completed { .. } => ClaimStatus::Completed,
            Verdict::Failed { .. } | Verdict::Lapsed => ClaimStatus::Failed,
        }
    }
}

/// Pagination window, 1-based page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: usize,
    pub per_page: usize,
}

impl Page {
    pub const DEFAULT_PER_PAGE: usize = 20;

    pub fn new(number: Option<usize>) -> Self {
        Self {
            number: number.unwrap_or(1).max(1),
            per_page: Self::DEFAULT_PER_PAGE,
        }
    }

    /// Rows to skip. Saturates for page numbers past any real listing.
    pub fn offset(&self) -> usize {
        self.number.saturating_sub(1).saturating_mul(self.per_page)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Render integer cents as a 2dp amount, e.g. `2500 -> "25.00"`.
pub fn format_cents(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}
