//! API request and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::marketplace::{
    format_cents, Category, CategoryListing, Claim, ClaimStatus, ClaimView, Difficulty, PaymentStatus, Role,
    Task, UserAccount,
};

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Server time (ISO-8601)
    pub timestamp: String,

    /// Whether the store survives restarts
    pub persistent_store: bool,

    /// Whether callers may authenticate with `X-User-Id`
    pub dev_mode: bool,
}

/// `?page=` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
}

/// Query for the available-task listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvailableQuery {
    pub category_id: Option<Uuid>,
    pub page: Option<usize>,
}

/// A task as shown in listings. The link and auxiliary text are only
/// revealed to the claimant.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub category_id: Uuid,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub reward_cents: u64,
    pub reward: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            category_id: task.category_id,
            title: task.title.clone(),
            description: task.description.clone(),
            difficulty: task.difficulty,
            reward_cents: task.reward_cents,
            reward: format_cents(task.reward_cents),
            expires_at: task.expires_at,
            created_at: task.created_at,
        }
    }
}

/// Paginated task listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPage {
    pub page: usize,
    pub per_page: usize,
    pub total: Option<usize>,
    pub tasks: Vec<TaskSummary>,
}

/// A category on the browse page.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryEntry {
    pub category: Category,
    pub available_count: usize,
    pub preview: Vec<TaskSummary>,
}

impl From<&CategoryListing> for CategoryEntry {
    fn from(listing: &CategoryListing) -> Self {
        Self {
            category: listing.category.clone(),
            available_count: listing.available_count,
            preview: listing.preview.iter().map(TaskSummary::from).collect(),
        }
    }
}

/// One category with a page of its tasks.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryTasksResponse {
    pub category: Category,
    #[serde(flatten)]
    pub tasks: TaskPage,
}

/// Request to grab a task.
#[derive(Debug, Clone, Deserialize)]
pub struct TakeTaskRequest {
    pub task_id: Uuid,
}

/// Claim state returned after grab and upload.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ClaimStatus,
    pub taken_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payment_status: PaymentStatus,
    pub admin_notes: Option<String>,
    pub proof1_ref: Option<String>,
    pub proof2_ref: Option<String>,
}

impl From<&Claim> for ClaimResponse {
    fn from(claim: &Claim) -> Self {
        Self {
            id: claim.id,
            task_id: claim.task_id,
            status: claim.status,
            taken_at: claim.taken_at,
            expires_at: claim.expires_at,
            completed_at: claim.completed_at,
            payment_status: claim.payment_status,
            admin_notes: claim.admin_notes.clone(),
            proof1_ref: claim.proof1_ref.clone(),
            proof2_ref: claim.proof2_ref.clone(),
        }
    }
}

/// "My task" page: the claim with the full task.
#[derive(Debug, Clone, Serialize)]
pub struct MyTaskResponse {
    pub claim: ClaimResponse,
    pub task: Task,
    pub reward: String,
    pub category: Option<Category>,
    pub expired: bool,
    pub seconds_remaining: i64,
}

impl From<&ClaimView> for MyTaskResponse {
    fn from(view: &ClaimView) -> Self {
        Self {
            claim: ClaimResponse::from(&view.claim),
            task: view.task.clone(),
            reward: format_cents(view.task.reward_cents),
            category: view.category.clone(),
            expired: view.expired,
            seconds_remaining: view.seconds_remaining,
        }
    }
}

/// Request to change a task's availability.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTaskRequest {
    pub is_active: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verdict submitted by an admin.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeRequest {
    /// `completed` or `failed`
    pub outcome: String,
    pub notes: Option<String>,
}

/// Response after finalizing a claim.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeResponse {
    pub claim: ClaimResponse,
    pub user: UserAccount,
}

/// Result of an expiry sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResponse {
    pub failed: usize,
    pub claim_ids: Vec<Uuid>,
}

/// Request to register a user.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

/// Registered user with a bearer token it can use right away.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterUserResponse {
    pub user: UserAccount,
    pub token: Option<String>,
    pub exp: Option<i64>,
}
