//! Lazy expiry evaluation for claims.
//!
//! Nothing transitions a claim when its countdown runs out; every gate calls
//! [`is_expired`] against the current time instead.

use chrono::{DateTime, Duration, Utc};

use super::types::Claim;

/// Default countdown between grabbing a task and its deadline.
pub const DEFAULT_CLAIM_WINDOW_MINUTES: i64 = 10;

pub fn default_claim_window() -> Duration {
    Duration::minutes(DEFAULT_CLAIM_WINDOW_MINUTES)
}

/// A non-terminal claim whose deadline has passed.
pub fn is_expired(claim: &Claim, now: DateTime<Utc>) -> bool {
    claim.expires_at < now && !claim.status.is_terminal()
}

/// Whole seconds left on the countdown; zero once expired or terminal.
pub fn seconds_remaining(claim: &Claim, now: DateTime<Utc>) -> i64 {
    if claim.status.is_terminal() {
        return 0;
    }
    (claim.expires_at - now).num_seconds().max(0)
}

/// Lapsed and still waiting on the claimant. These are what the sweep fails.
pub fn is_lapsed(claim: &Claim, now: DateTime<Utc>) -> bool {
    is_expired(claim, now) && claim.status.awaits_user()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketplace::types::{ClaimStatus, PaymentStatus};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn claim_at(taken_at: DateTime<Utc>, status: ClaimStatus) -> Claim {
        Claim {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            status,
            taken_at,
            completed_at: None,
            expires_at: taken_at + default_claim_window(),
            proof1_ref: None,
            proof2_ref: None,
            payment_status: PaymentStatus::Pending,
            admin_notes: None,
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let claim = claim_at(t0, ClaimStatus::Taken);

        assert!(!is_expired(&claim, t0 + Duration::minutes(9)));
        // The deadline instant itself is still inside the window.
        assert!(!is_expired(&claim, t0 + Duration::minutes(10)));
        assert!(is_expired(&claim, t0 + Duration::minutes(11)));
    }

    #[test]
    fn test_terminal_claims_never_expire() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let later = t0 + Duration::hours(2);
        assert!(!is_expired(&claim_at(t0, ClaimStatus::Completed), later));
        assert!(!is_expired(&claim_at(t0, ClaimStatus::Failed), later));
        assert_eq!(seconds_remaining(&claim_at(t0, ClaimStatus::Completed), t0), 0);
    }

    #[test]
    fn test_seconds_remaining_counts_down() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let claim = claim_at(t0, ClaimStatus::Taken);
        assert_eq!(seconds_remaining(&claim, t0), 600);
        assert_eq!(seconds_remaining(&claim, t0 + Duration::seconds(90)), 510);
        assert_eq!(seconds_remaining(&claim, t0 + Duration::minutes(30)), 0);
    }

    #[test]
    fn test_lapsed_only_when_waiting_on_user() {
        let t0 = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let later = t0 + Duration::minutes(15);
        assert!(is_lapsed(&claim_at(t0, ClaimStatus::Taken), later));
        assert!(is_lapsed(&claim_at(t0, ClaimStatus::Proof2Requested), later));
        assert!(!is_lapsed(&claim_at(t0, ClaimStatus::Proof1Uploaded), later));
        assert!(!is_lapsed(&claim_at(t0, ClaimStatus::Taken), t0));
    }
}
