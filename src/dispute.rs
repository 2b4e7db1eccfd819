// ===============================
// src/dispute.rs (dispute overlay)
// ===============================
//
// Two ways in:
// - completed booking with no actionable signature
// - pending signature the customer refuses to sign
// While any dispute on a booking is non-terminal its payment stays on_hold/pending.
// Settlement amounts are the server's decision; we only carry them.
//
use chrono::{DateTime, Utc};

use crate::domain::{
    Actor, Booking, BookingStatus, Dispute, NewDispute, Payment, PaymentStatus, Role, Signature,
    SignatureId, SignatureStatus,
};
use crate::machine::GuardError;
use crate::signature::is_actionable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeEntry {
    FromCompleted,
    FromPendingSignature(SignatureId),
}

pub fn has_open_dispute<'a>(disputes: impl IntoIterator<Item = &'a Dispute>) -> bool {
    disputes.into_iter().any(|d| !d.status.is_terminal())
}

/// Which entry point a dispute filed now would use.
pub fn entry_point(
    booking: &Booking,
    signature: Option<&Signature>,
    now: DateTime<Utc>,
) -> Result<DisputeEntry, GuardError> {
    const ACTION: &str = "dispute";
    if booking.status != BookingStatus::Completed {
        return Err(GuardError::InvalidState { action: ACTION, status: booking.status });
    }
    match signature {
        Some(s) if s.status == SignatureStatus::Signed => {
            Err(GuardError::SignatureNotPending(SignatureStatus::Signed))
        }
        Some(s) if is_actionable(s, now) => Ok(DisputeEntry::FromPendingSignature(s.id.clone())),
        _ => Ok(DisputeEntry::FromCompleted),
    }
}

pub fn check_create<'a>(
    booking: &Booking,
    signature: Option<&Signature>,
    disputes: impl IntoIterator<Item = &'a Dispute>,
    actor: &Actor,
    req: &NewDispute,
    now: DateTime<Utc>,
) -> Result<DisputeEntry, GuardError> {
    const ACTION: &str = "raise a dispute on";
    if !matches!(actor.role, Role::Customer | Role::Vendor) {
        return Err(GuardError::RoleNotAllowed { action: ACTION, role: actor.role });
    }
    if !booking.is_party(&actor.user_id) {
        return Err(GuardError::NotAParty { action: ACTION });
    }
    if has_open_dispute(disputes) {
        return Err(GuardError::DisputeAlreadyOpen);
    }
    let entry = entry_point(booking, signature, now)?;
    if req.decline_signature && !matches!(entry, DisputeEntry::FromPendingSignature(_)) {
        // declining only makes sense against a live signature request
        return Err(match signature {
            Some(s) if s.status == SignatureStatus::Pending => GuardError::SignatureExpired,
            Some(s) => GuardError::SignatureNotPending(s.status),
            None => GuardError::InvalidState { action: "decline", status: booking.status },
        });
    }
    Ok(entry)
}

pub fn check_resolve(dispute: &Dispute, actor: &Actor) -> Result<(), GuardError> {
    if !actor.role.can_mediate() {
        return Err(GuardError::RoleNotAllowed { action: "resolve disputes", role: actor.role });
    }
    if dispute.status.is_terminal() {
        return Err(GuardError::DisputeClosed(dispute.status));
    }
    Ok(())
}

pub fn check_manual_payment<'a>(
    payment: &Payment,
    disputes: impl IntoIterator<Item = &'a Dispute>,
    actor: &Actor,
    amount_minor: i64,
) -> Result<(), GuardError> {
    if !actor.role.can_mediate() {
        return Err(GuardError::RoleNotAllowed { action: "process manual payments", role: actor.role });
    }
    if amount_minor <= 0 {
        return Err(GuardError::InvalidAmount);
    }
    if matches!(
        payment.status,
        PaymentStatus::Completed | PaymentStatus::Processing | PaymentStatus::Refunded
    ) {
        return Err(GuardError::PaymentNotPayable(payment.status));
    }
    if has_open_dispute(disputes) {
        return Err(GuardError::PaymentFrozen);
    }
    Ok(())
}

/// Hold a payment for a dispute. Settled payments are left alone, and a
/// hold reason the server already gave is kept as-is.
/// Returns true if the payment changed.
pub fn freeze(payment: &mut Payment, dispute: &Dispute) -> bool {
    if payment.status.is_settled() {
        return false;
    }
    let mut changed = payment.status != PaymentStatus::OnHold;
    payment.status = PaymentStatus::OnHold;
    if payment.hold_reason.is_none() {
        payment.hold_reason = Some(hold_reason(dispute));
        changed = true;
    }
    changed
}

pub fn hold_reason(dispute: &Dispute) -> String {
    if dispute.reason.trim().is_empty() {
        format!("Dispute {} is open", dispute.id)
    } else {
        format!("Dispute {} is open: {}", dispute.id, dispute.reason.trim())
    }
}

/// A payment may complete once its signature is signed or a mediator released it,
/// and never while a dispute is still open.
pub fn payment_may_complete<'a>(
    signature: Option<&Signature>,
    disputes: impl IntoIterator<Item = &'a Dispute> + Clone,
) -> bool {
    if has_open_dispute(disputes.clone()) {
        return false;
    }
    let signed = signature.is_some_and(|s| s.status == SignatureStatus::Signed);
    let released = disputes.into_iter().any(|d| d.status.is_terminal() && d.release_payment);
    signed || released
}
