//! Pure claim lifecycle rules.
//!
//! Storage backends load the affected rows inside their own atomic section,
//! call these functions to decide and mutate, then write the rows back. Keeping
//! the rules here means every backend enforces exactly the same state machine.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::MarketError;
use super::expiry;
use super::types::{Claim, ClaimStatus, PaymentStatus, ProofSlot, Task, UserAccount, Verdict};

const LAPSED_NOTE: &str = "Claim window lapsed before the next proof was uploaded";

/// A user- or admin-driven change to a single claim row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTransition {
    SubmitProof {
        user_id: Uuid,
        slot: ProofSlot,
        reference: String,
    },
    RequestSecondProof,
}

/// Decide whether `user` may claim `task`, in order:
/// 1. the user holds no non-terminal claim,
/// 2. nobody has ever claimed the task,
/// 3. the task exists, is active and not past its deadline.
pub fn check_claim(
    active_claim: Option<&Claim>,
    task_claimed: bool,
    task: Option<&Task>,
    now: DateTime<Utc>,
) -> Result<(), MarketError> {
    if active_claim.is_some() {
        return Err(MarketError::AlreadyHasActiveTask);
    }
    if task_claimed {
        return Err(MarketError::TaskAlreadyTaken);
    }
    match task {
        Some(task) if task.is_open(now) => Ok(()),
        _ => Err(MarketError::TaskUnavailable),
    }
}

/// Build the claim row for a successful grab.
pub fn open_claim(user_id: Uuid, task_id: Uuid, now: DateTime<Utc>, window: Duration) -> Claim {
    Claim {
        id: Uuid::new_v4(),
        user_id,
        task_id,
        status: ClaimStatus::Taken,
        taken_at: now,
        completed_at: None,
        expires_at: now + window,
        proof1_ref: None,
        proof2_ref: None,
        payment_status: PaymentStatus::Pending,
        admin_notes: None,
    }
}

/// Apply a non-terminal transition to `claim`.
pub fn apply_transition(
    claim: &mut Claim,
    transition: &ClaimTransition,
    now: DateTime<Utc>,
) -> Result<(), MarketError> {
    match transition {
        ClaimTransition::SubmitProof {
            user_id,
            slot,
            reference,
        } => {
            if claim.user_id != *user_id {
                return Err(MarketError::NotOwner);
            }
            if expiry::is_expired(claim, now) {
                return Err(MarketError::ClaimExpired);
            }
            if claim.status != slot.expected_status() {
                return Err(MarketError::WrongProofSlot {
                    status: claim.status,
                });
            }
            match slot {
                ProofSlot::Proof1 => claim.proof1_ref = Some(reference.clone()),
                ProofSlot::Proof2 => claim.proof2_ref = Some(reference.clone()),
            }
            claim.status = slot.uploaded_status();
            Ok(())
        }
        ClaimTransition::RequestSecondProof => {
            if claim.status.is_terminal() {
                return Err(MarketError::AlreadyFinalized {
                    status: claim.status,
                });
            }
            if claim.status != ClaimStatus::Proof1Uploaded {
                return Err(MarketError::InvalidTransition {
                    from: claim.status,
                    to: ClaimStatus::Proof2Requested,
                });
            }
            claim.status = ClaimStatus::Proof2Requested;
            Ok(())
        }
    }
}

/// Record a terminal verdict and update the claimant's counters with it.
///
/// Both rows must be written back together. A claim that is already terminal
/// is left untouched, which makes a repeated verdict a no-op on the counters.
pub fn apply_verdict(
    claim: &mut Claim,
    user: &mut UserAccount,
    reward_cents: u64,
    verdict: &Verdict,
    now: DateTime<Utc>,
) -> Result<(), MarketError> {
    debug_assert_eq!(claim.user_id, user.id);

    if claim.status.is_terminal() {
        return Err(MarketError::AlreadyFinalized {
            status: claim.status,
        });
    }

    let allowed = match verdict {
        Verdict::Completed { .. } => matches!(
            claim.status,
            ClaimStatus::Proof1Uploaded | ClaimStatus::Proof2Uploaded
        ),
        Verdict::Failed { .. } => true,
        Verdict::Lapsed => expiry::is_lapsed(claim, now),
    };
    if !allowed {
        return Err(MarketError::InvalidTransition {
            from: claim.status,
            to: verdict.target_status(),
        });
    }

    match verdict {
        Verdict::Completed { notes } => {
            claim.status = ClaimStatus::Completed;
            claim.completed_at = Some(now);
            claim.payment_status = PaymentStatus::Success;
            if notes.is_some() {
                claim.admin_notes = notes.clone();
            }
            user.successful_tasks_count += 1;
            user.total_earnings_cents = user.total_earnings_cents.saturating_add(reward_cents);
        }
        Verdict::Failed { notes } => {
            claim.status = ClaimStatus::Failed;
            claim.payment_status = PaymentStatus::Failed;
            if notes.is_some() {
                claim.admin_notes = notes.clone();
            }
            user.failed_tasks_count += 1;
        }
        Verdict::Lapsed => {
            claim.status = ClaimStatus::Failed;
            claim.payment_status = PaymentStatus::Failed;
            claim.admin_notes = Some(LAPSED_NOTE.to_string());
            user.failed_tasks_count += 1;
        }
    }
    Ok(())
}
