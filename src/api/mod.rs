//! HTTP API for the task marketplace.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/categories` - Listed categories with task previews
//! - `GET /api/categories/{id}/tasks` - Available tasks in a category
//! - `GET /api/tasks/available` - Available tasks, optionally by category
//! - `POST /api/tasks/take` - Grab a task
//! - `GET /api/my-tasks/current` - The caller's active claim
//! - `GET /api/my-tasks/{task_id}` - The caller's claim on a task
//! - `POST /api/my-tasks/{task_id}/proof` - Upload proof 1 or proof 2
//! - `GET /api/wallet` - Earnings, badge and paid history
//! - `/api/admin/*` - Publishing, verification, sweep and audit

mod admin;
mod auth;
pub mod error;
pub mod proofs;
mod routes;
mod tasks;
pub mod types;
mod wallet;

pub use auth::{issue_jwt, verify_jwt};
pub use routes::{build_state, router, serve, AppState};
pub use types::*;
