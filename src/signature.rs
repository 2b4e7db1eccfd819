// ===============================
// src/signature.rs (signature / payment gate)
// ===============================
//
// Signature lifecycle:
//   pending -> signed    (customer, rating 1..5, before expires_at)
//   pending -> expired   (server; client only greys it out)
//   pending -> disputed  (dispute filed against it)
//   pending -> rejected  (customer declines, handled as a low-severity dispute)
//
// Every expiry decision in the crate goes through `is_expired`.
//
use chrono::{DateTime, Duration, Utc};

use crate::domain::{Actor, Booking, BookingStatus, Role, Signature, SignatureStatus};
use crate::machine::GuardError;

pub const SIGNATURE_WINDOW_HOURS: i64 = 48;

pub fn window() -> Duration {
    Duration::hours(SIGNATURE_WINDOW_HOURS)
}

pub fn expires_at_for(requested_at: DateTime<Utc>) -> DateTime<Utc> {
    requested_at + window()
}

pub fn is_expired(sig: &Signature, now: DateTime<Utc>) -> bool {
    now >= sig.expires_at
}

/// Pending and still inside its window.
pub fn is_actionable(sig: &Signature, now: DateTime<Utc>) -> bool {
    sig.status == SignatureStatus::Pending && !is_expired(sig, now)
}

/// Status to display: a pending signature past its window shows as expired
/// before the server says so. The stored record is left untouched.
pub fn display_status(sig: &Signature, now: DateTime<Utc>) -> SignatureStatus {
    if sig.status == SignatureStatus::Pending && is_expired(sig, now) {
        SignatureStatus::Expired
    } else {
        sig.status
    }
}

pub fn check_request(
    booking: &Booking,
    existing: Option<&Signature>,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<(), GuardError> {
    const ACTION: &str = "request a signature for";
    if actor.role != Role::Vendor {
        return Err(GuardError::RoleNotAllowed { action: ACTION, role: actor.role });
    }
    if booking.vendor_id.as_ref() != Some(&actor.user_id) {
        return Err(GuardError::NotAParty { action: ACTION });
    }
    if booking.status != BookingStatus::Completed {
        return Err(GuardError::InvalidState { action: ACTION, status: booking.status });
    }
    if existing.is_some_and(|s| is_actionable(s, now)) {
        return Err(GuardError::SignatureAlreadyActive);
    }
    Ok(())
}

fn check_customer_on_pending(
    sig: &Signature,
    booking: &Booking,
    actor: &Actor,
    action: &'static str,
    now: DateTime<Utc>,
) -> Result<(), GuardError> {
    if actor.role != Role::Customer {
        return Err(GuardError::RoleNotAllowed { action, role: actor.role });
    }
    if booking.customer_id != actor.user_id {
        return Err(GuardError::NotAParty { action });
    }
    if sig.status != SignatureStatus::Pending {
        return Err(GuardError::SignatureNotPending(sig.status));
    }
    if is_expired(sig, now) {
        return Err(GuardError::SignatureExpired);
    }
    Ok(())
}

/// Local gate for `sign`. Returns the validated rating.
pub fn check_sign(
    sig: &Signature,
    booking: &Booking,
    actor: &Actor,
    rating: Option<u8>,
    now: DateTime<Utc>,
) -> Result<u8, GuardError> {
    check_customer_on_pending(sig, booking, actor, "sign", now)?;
    match rating {
        None => Err(GuardError::RatingRequired),
        Some(r) if !(1..=5).contains(&r) => Err(GuardError::RatingOutOfRange(r)),
        Some(r) => Ok(r),
    }
}

pub fn check_decline(
    sig: &Signature,
    booking: &Booking,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<(), GuardError> {
    check_customer_on_pending(sig, booking, actor, "decline", now)
}

/// Shape checks on a server-reported terminal signature. A signed signature
/// must carry a rating in range and a signing time inside the window.
pub fn is_consistent(sig: &Signature) -> bool {
    match sig.status {
        SignatureStatus::Signed => {
            let rated = sig.satisfaction_rating.is_some_and(|r| (1..=5).contains(&r));
            let in_window = sig.signed_at.is_some_and(|t| t < sig.expires_at);
            rated && in_window
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{booking, customer, signature, t0, vendor};

    #[test]
    fn window_is_exactly_48h() {
        let s = signature("S1", "B1", t0());
        assert_eq!(s.expires_at - s.requested_at, Duration::hours(48));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let s = signature("S1", "B1", t0());
        assert!(!is_expired(&s, t0() + Duration::hours(48) - Duration::seconds(1)));
        assert!(is_expired(&s, t0() + Duration::hours(48)));
        assert_eq!(display_status(&s, t0() + Duration::hours(49)), SignatureStatus::Expired);
        // record itself stays pending
        assert_eq!(s.status, SignatureStatus::Pending);
    }

    #[test]
    fn sign_rejected_when_expired() {
        let b = booking("B1", BookingStatus::Completed, Some("V1"));
        let s = signature("S1", "B1", t0());
        let err = check_sign(&s, &b, &customer("C1"), Some(5), t0() + Duration::hours(49));
        assert_eq!(err, Err(GuardError::SignatureExpired));
    }

    #[test]
    fn sign_requires_rating_in_range() {
        let b = booking("B1", BookingStatus::Completed, Some("V1"));
        let s = signature("S1", "B1", t0());
        let now = t0() + Duration::hours(1);
        assert_eq!(check_sign(&s, &b, &customer("C1"), None, now), Err(GuardError::RatingRequired));
        assert_eq!(check_sign(&s, &b, &customer("C1"), Some(0), now), Err(GuardError::RatingOutOfRange(0)));
        assert_eq!(check_sign(&s, &b, &customer("C1"), Some(6), now), Err(GuardError::RatingOutOfRange(6)));
        assert_eq!(check_sign(&s, &b, &customer("C1"), Some(4), now), Ok(4));
        assert!(matches!(
            check_sign(&s, &b, &vendor("V1"), Some(4), now),
            Err(GuardError::RoleNotAllowed { .. })
        ));
    }

    #[test]
    fn request_blocked_by_active_signature_only() {
        let b = booking("B1", BookingStatus::Completed, Some("V1"));
        let v = vendor("V1");
        let s = signature("S1", "B1", t0());
        assert_eq!(
            check_request(&b, Some(&s), &v, t0() + Duration::hours(2)),
            Err(GuardError::SignatureAlreadyActive)
        );
        // expired one no longer blocks a fresh request
        assert!(check_request(&b, Some(&s), &v, t0() + Duration::hours(50)).is_ok());
        assert!(check_request(&b, None, &v, t0()).is_ok());

        let running = booking("B1", BookingStatus::InProgress, Some("V1"));
        assert!(matches!(check_request(&running, None, &v, t0()), Err(GuardError::InvalidState { .. })));
    }

    #[test]
    fn signed_signature_consistency() {
        let mut s = signature("S1", "B1", t0());
        s.status = SignatureStatus::Signed;
        s.satisfaction_rating = Some(5);
        s.signed_at = Some(t0() + Duration::hours(3));
        assert!(is_consistent(&s));
        s.signed_at = Some(s.expires_at);
        assert!(!is_consistent(&s));
        s.signed_at = Some(t0());
        s.satisfaction_rating = None;
        assert!(!is_consistent(&s));
    }
}
