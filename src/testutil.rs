// ===============================
// src/testutil.rs (fixtures shared by unit tests)
// ===============================
use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{
    Actor, Booking, BookingId, BookingStatus, Dispute, DisputeStatus, Party, Payment, PaymentKind,
    PaymentStatus, PhotoKind, Role, ServicePhoto, Severity, Signature, SignatureStatus,
};
use crate::signature::expires_at_for;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).single().unwrap_or_else(Utc::now)
}

pub fn customer(id: &str) -> Actor { Actor { user_id: id.into(), role: Role::Customer } }
pub fn vendor(id: &str) -> Actor { Actor { user_id: id.into(), role: Role::Vendor } }
pub fn manager(id: &str, role: Role) -> Actor { Actor { user_id: id.into(), role } }

/// Booking owned by customer `C1`, with both photos attached.
pub fn booking(id: &str, status: BookingStatus, vendor: Option<&str>) -> Booking {
    let completed_at = match status {
        BookingStatus::Completed | BookingStatus::Signed | BookingStatus::Disputed => Some(t0()),
        _ => None,
    };
    Booking {
        id: id.into(),
        customer_id: "C1".into(),
        vendor_id: vendor.map(Into::into),
        service_id: "SVC-CLEAN".into(),
        status,
        total_minor: 12_500,
        zone: "Z-NORTH".into(),
        scheduled_at: t0(),
        created_at: None,
        completed_at,
        buffers: None,
        photos: vec![
            ServicePhoto { kind: PhotoKind::Before, url: "before.jpg".into() },
            ServicePhoto { kind: PhotoKind::After, url: "after.jpg".into() },
        ],
        notes: None,
        cancellation_reason: None,
    }
}

pub fn signature(id: &str, booking_id: &str, requested_at: DateTime<Utc>) -> Signature {
    Signature {
        id: id.into(),
        booking_id: booking_id.into(),
        status: SignatureStatus::Pending,
        requested_at,
        expires_at: expires_at_for(requested_at),
        signed_at: None,
        satisfaction_rating: None,
        comments: None,
        signature_hash: None,
    }
}

pub fn payment(id: &str, booking_id: &str, status: PaymentStatus) -> Payment {
    Payment {
        id: id.into(),
        booking_id: booking_id.into(),
        amount_minor: 12_500,
        status,
        kind: PaymentKind::Automatic,
        hold_reason: None,
    }
}

pub fn dispute(id: &str, booking_id: &str, status: DisputeStatus) -> Dispute {
    Dispute {
        id: id.into(),
        booking_id: BookingId::from(booking_id),
        signature_id: None,
        raised_by: Party::Customer,
        severity: Severity::Medium,
        status,
        reason: "stains left on carpet".into(),
        resolution_notes: None,
        resolution_amount_minor: None,
        release_payment: false,
        decline_signature: false,
    }
}
