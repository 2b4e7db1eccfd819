// ===============================
// src/machine.rs (booking lifecycle)
// ===============================
//
// Graph:
//   pending -> confirmed -> in_progress -> completed -> signed
//      |           |                          |
//      +-----------+--> cancelled             +--> disputed
//
// Guards here are advisory mirrors of the server's checks. A failing guard
// means the command is never sent.
//
use thiserror::Error;

use crate::domain::{
    Actor, Booking, BookingStatus, DisputeId, DisputeStatus, NewBooking, PaymentId, PaymentStatus,
    Role, SignatureId, SignatureStatus, BookingId,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("booking {0} is not loaded")]
    UnknownBooking(BookingId),
    #[error("signature {0} is not loaded")]
    UnknownSignature(SignatureId),
    #[error("dispute {0} is not loaded")]
    UnknownDispute(DisputeId),
    #[error("payment {0} is not loaded")]
    UnknownPayment(PaymentId),
    #[error("a {role} cannot {action}")]
    RoleNotAllowed { action: &'static str, role: Role },
    #[error("only parties to this booking can {action}")]
    NotAParty { action: &'static str },
    #[error("cannot {action} a booking that is {status}")]
    InvalidState { action: &'static str, status: BookingStatus },
    #[error("this booking already has a vendor")]
    VendorAlreadyAssigned,
    #[error("upload at least one before and one after photo first")]
    MissingPhotos,
    #[error("a signature request is already waiting for the customer")]
    SignatureAlreadyActive,
    #[error("the signature request has expired")]
    SignatureExpired,
    #[error("the signature request is already {0}")]
    SignatureNotPending(SignatureStatus),
    #[error("a satisfaction rating is required to sign")]
    RatingRequired,
    #[error("satisfaction rating must be between 1 and 5, got {0}")]
    RatingOutOfRange(u8),
    #[error("a dispute is already open for this booking")]
    DisputeAlreadyOpen,
    #[error("the dispute is already {0}")]
    DisputeClosed(DisputeStatus),
    #[error("payment is {0} and cannot be processed manually")]
    PaymentNotPayable(PaymentStatus),
    #[error("payment is frozen while a dispute is open")]
    PaymentFrozen,
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("another change to this booking is still waiting for confirmation")]
    CommandInFlight,
}

/// Direct successors of a status.
pub fn next_states(s: BookingStatus) -> &'static [BookingStatus] {
    use BookingStatus::*;
    match s {
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[InProgress, Cancelled],
        InProgress => &[Completed],
        Completed => &[Signed, Disputed],
        Signed | Disputed | Cancelled => &[],
    }
}

pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    next_states(from).contains(&to)
}

/// True if `to` can be reached from `from` through one or more legal transitions.
pub fn is_reachable(from: BookingStatus, to: BookingStatus) -> bool {
    next_states(from).iter().any(|&n| n == to || is_reachable(n, to))
}

/// How a server-reported status relates to the one already projected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// Same status; re-delivery.
    Duplicate,
    /// Legal forward move, possibly skipping missed intermediate states.
    Forward,
    /// Older than what we already show.
    Stale,
    /// Neither ahead nor behind: the projection disagrees with the server.
    Conflict,
}

pub fn classify(current: BookingStatus, incoming: BookingStatus) -> Drift {
    if current == incoming {
        Drift::Duplicate
    } else if is_reachable(current, incoming) {
        Drift::Forward
    } else if is_reachable(incoming, current) {
        Drift::Stale
    } else {
        Drift::Conflict
    }
}

fn require_role(actor: &Actor, action: &'static str, allowed: &[Role]) -> Result<(), GuardError> {
    if allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(GuardError::RoleNotAllowed { action, role: actor.role })
    }
}

fn require_status(b: &Booking, action: &'static str, allowed: &[BookingStatus]) -> Result<(), GuardError> {
    if allowed.contains(&b.status) {
        Ok(())
    } else {
        Err(GuardError::InvalidState { action, status: b.status })
    }
}

fn require_assigned_vendor(b: &Booking, actor: &Actor, action: &'static str) -> Result<(), GuardError> {
    require_role(actor, action, &[Role::Vendor])?;
    if b.vendor_id.as_ref() != Some(&actor.user_id) {
        return Err(GuardError::NotAParty { action });
    }
    Ok(())
}

pub fn check_create(actor: &Actor, req: &NewBooking) -> Result<(), GuardError> {
    require_role(actor, "book a service", &[Role::Customer])?;
    if req.total_minor <= 0 {
        return Err(GuardError::InvalidAmount);
    }
    Ok(())
}

pub fn check_accept(b: &Booking, actor: &Actor) -> Result<(), GuardError> {
    const ACTION: &str = "accept";
    require_role(actor, ACTION, &[Role::Vendor])?;
    require_status(b, ACTION, &[BookingStatus::Pending])?;
    if b.vendor_id.is_some() {
        return Err(GuardError::VendorAlreadyAssigned);
    }
    Ok(())
}

pub fn check_start(b: &Booking, actor: &Actor) -> Result<(), GuardError> {
    const ACTION: &str = "start";
    require_assigned_vendor(b, actor, ACTION)?;
    require_status(b, ACTION, &[BookingStatus::Confirmed])
}

pub fn check_complete(b: &Booking, actor: &Actor) -> Result<(), GuardError> {
    const ACTION: &str = "complete";
    require_assigned_vendor(b, actor, ACTION)?;
    require_status(b, ACTION, &[BookingStatus::InProgress])?;
    if !b.has_before_and_after_photos() {
        return Err(GuardError::MissingPhotos);
    }
    Ok(())
}

pub fn check_cancel(b: &Booking, actor: &Actor) -> Result<(), GuardError> {
    const ACTION: &str = "cancel";
    require_role(actor, ACTION, &[Role::Customer, Role::Vendor])?;
    if !b.is_party(&actor.user_id) {
        return Err(GuardError::NotAParty { action: ACTION });
    }
    require_status(b, ACTION, &[BookingStatus::Pending, BookingStatus::Confirmed])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PhotoKind, ServicePhoto};
    use crate::testutil::{booking, customer, vendor};
    use BookingStatus::*;

    #[test]
    fn graph_matches_lifecycle() {
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Confirmed, InProgress));
        assert!(can_transition(InProgress, Completed));
        assert!(can_transition(Completed, Signed));
        assert!(can_transition(Completed, Disputed));
        assert!(can_transition(Pending, Cancelled));
        assert!(!can_transition(InProgress, Cancelled));
        assert!(!can_transition(Pending, Completed));
        for terminal in [Signed, Disputed, Cancelled] {
            assert!(next_states(terminal).is_empty());
        }
    }

    #[test]
    fn drift_classification() {
        assert_eq!(classify(Signed, Signed), Drift::Duplicate);
        assert_eq!(classify(Confirmed, Completed), Drift::Forward);
        assert_eq!(classify(Completed, InProgress), Drift::Stale);
        assert_eq!(classify(Cancelled, InProgress), Drift::Conflict);
        assert_eq!(classify(Signed, Disputed), Drift::Conflict);
    }

    #[test]
    fn accept_requires_unassigned_pending() {
        let v = vendor("V1");
        let b = booking("B1", Pending, None);
        assert!(check_accept(&b, &v).is_ok());

        let mut taken = b.clone();
        taken.vendor_id = Some("V9".into());
        assert_eq!(check_accept(&taken, &v), Err(GuardError::VendorAlreadyAssigned));

        assert!(matches!(
            check_accept(&b, &customer("C1")),
            Err(GuardError::RoleNotAllowed { .. })
        ));
        let confirmed = booking("B1", Confirmed, Some("V1"));
        assert!(matches!(check_accept(&confirmed, &v), Err(GuardError::InvalidState { .. })));
    }

    #[test]
    fn start_only_for_assigned_vendor() {
        let b = booking("B1", Confirmed, Some("V1"));
        assert!(check_start(&b, &vendor("V1")).is_ok());
        assert_eq!(check_start(&b, &vendor("V2")), Err(GuardError::NotAParty { action: "start" }));
        let running = booking("B1", InProgress, Some("V1"));
        assert!(matches!(check_start(&running, &vendor("V1")), Err(GuardError::InvalidState { .. })));
    }

    #[test]
    fn complete_needs_photos() {
        let mut b = booking("B1", InProgress, Some("V1"));
        b.photos.clear();
        assert_eq!(check_complete(&b, &vendor("V1")), Err(GuardError::MissingPhotos));
        b.photos.push(ServicePhoto { kind: PhotoKind::Before, url: "1".into() });
        b.photos.push(ServicePhoto { kind: PhotoKind::After, url: "2".into() });
        assert!(check_complete(&b, &vendor("V1")).is_ok());
    }

    #[test]
    fn cancel_only_before_work_starts() {
        let c = customer("C1");
        assert!(check_cancel(&booking("B1", Pending, None), &c).is_ok());
        assert!(check_cancel(&booking("B1", Confirmed, Some("V1")), &vendor("V1")).is_ok());
        assert!(check_cancel(&booking("B1", InProgress, Some("V1")), &c).is_err());
        assert_eq!(
            check_cancel(&booking("B1", Pending, None), &customer("C2")),
            Err(GuardError::NotAParty { action: "cancel" })
        );
    }
}
