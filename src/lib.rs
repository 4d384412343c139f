//! # Task Grabber
//!
//! Task marketplace service: admins publish time-limited tasks, users race to
//! grab one, prove completion within a countdown and get paid on verification.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            api (axum)            │
//!        │  auth · browse · grab · proofs   │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │  Marketplace    │  lifecycle · expiry · earnings
//!                └────────┬────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐
//!                │  MarketStore    │  memory | sqlite
//!                └─────────────────┘
//! ```
//!
//! ## Claim Flow
//! 1. User grabs an available task (one active claim per user, one claim per task)
//! 2. Countdown starts; proof 1 must be uploaded before it runs out
//! 3. Admin verifies, optionally asks for proof 2
//! 4. Admin finalizes; counters and earnings are updated atomically
//!
//! ## Modules
//! - `marketplace`: domain types, lifecycle rules and storage backends
//! - `api`: HTTP surface
//! - `config`: environment configuration

pub mod api;
pub mod config;
pub mod marketplace;

pub use config::Config;
pub use marketplace::{Marketplace, MarketError};
