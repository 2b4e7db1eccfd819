// ===============================
// src/domain.rs
// ===============================
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ---- Identifiers ----
// Server kadang kirim id sebagai angka, kadang string -> terima dua-duanya.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
            pub fn as_str(&self) -> &str { &self.0 }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self { Self(s.to_string()) }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Raw { Str(String), Num(u64) }
                Ok(match Raw::deserialize(d)? {
                    Raw::Str(s) => Self(s),
                    Raw::Num(n) => Self(n.to_string()),
                })
            }
        }
    };
}

opaque_id!(BookingId);
opaque_id!(UserId);
opaque_id!(ServiceId);
opaque_id!(SignatureId);
opaque_id!(PaymentId);
opaque_id!(DisputeId);

// ---- Roles ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role { Customer, Vendor, OnboardingManager, OperationsManager, SuperAdmin }

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Vendor => "vendor",
            Role::OnboardingManager => "onboarding_manager",
            Role::OperationsManager => "operations_manager",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Roles allowed to mediate disputes and push manual payments.
    pub fn can_mediate(&self) -> bool {
        matches!(self, Role::OperationsManager | Role::SuperAdmin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "vendor" => Ok(Role::Vendor),
            "onboarding_manager" | "onboarding" => Ok(Role::OnboardingManager),
            "operations_manager" | "operations" | "ops" => Ok(Role::OperationsManager),
            "super_admin" | "superadmin" | "admin" => Ok(Role::SuperAdmin),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// The authenticated user issuing commands in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor { pub user_id: UserId, pub role: Role }

// ---- Booking ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus { Pending, Confirmed, InProgress, Completed, Signed, Disputed, Cancelled }

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Signed => "signed",
            BookingStatus::Disputed => "disputed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Signed | BookingStatus::Disputed | BookingStatus::Cancelled)
    }

    /// States in which `completed_at` must be present.
    pub fn requires_completion(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Signed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoKind { Before, After }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePhoto { pub kind: PhotoKind, pub url: String }

/// Advisory scheduling data from the external scheduler. Display only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    #[serde(default)] pub estimated_duration_min: Option<u32>,
    #[serde(default)] pub travel_time_to_min: Option<u32>,
    #[serde(default)] pub travel_time_from_min: Option<u32>,
    #[serde(default)] pub pre_buffer_min: Option<u32>,
    #[serde(default)] pub post_buffer_min: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer_id: UserId,
    #[serde(default)]
    pub vendor_id: Option<UserId>,
    pub service_id: ServiceId,
    pub status: BookingStatus,
    /// Minor currency units (cents).
    pub total_minor: i64,
    pub zone: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub buffers: Option<BufferInfo>,
    #[serde(default)]
    pub photos: Vec<ServicePhoto>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

impl Booking {
    pub fn has_before_and_after_photos(&self) -> bool {
        let before = self.photos.iter().any(|p| p.kind == PhotoKind::Before);
        let after = self.photos.iter().any(|p| p.kind == PhotoKind::After);
        before && after
    }

    pub fn is_party(&self, user: &UserId) -> bool {
        &self.customer_id == user || self.vendor_id.as_ref() == Some(user)
    }
}

// ---- Signature ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus { Pending, Signed, Expired, Disputed, Rejected }

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::Pending => "pending",
            SignatureStatus::Signed => "signed",
            SignatureStatus::Expired => "expired",
            SignatureStatus::Disputed => "disputed",
            SignatureStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool { !matches!(self, SignatureStatus::Pending) }
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub id: SignatureId,
    pub booking_id: BookingId,
    pub status: SignatureStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub satisfaction_rating: Option<u8>,
    #[serde(default)]
    pub comments: Option<String>,
    /// Opaque tamper-evidence token computed by the server.
    #[serde(default)]
    pub signature_hash: Option<String>,
}

// ---- Payment ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { Pending, Processing, Completed, Failed, Refunded, OnHold }

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::OnHold => "on_hold",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Refunded)
    }

    /// Statuses a payment may sit in while a dispute is open.
    pub fn is_frozen_compatible(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::OnHold)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind { Automatic, Manual }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub booking_id: BookingId,
    pub amount_minor: i64,
    pub status: PaymentStatus,
    #[serde(rename = "type")]
    pub kind: PaymentKind,
    #[serde(default)]
    pub hold_reason: Option<String>,
}

// ---- Dispute ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus { Open, InProgress, Resolved, Escalated, Closed }

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::InProgress => "in_progress",
            DisputeStatus::Resolved => "resolved",
            DisputeStatus::Escalated => "escalated",
            DisputeStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DisputeStatus::Resolved | DisputeStatus::Closed)
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity { Low, Medium, High, Critical }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party { Customer, Vendor }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub booking_id: BookingId,
    #[serde(default)]
    pub signature_id: Option<SignatureId>,
    pub raised_by: Party,
    pub severity: Severity,
    pub status: DisputeStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resolution_notes: Option<String>,
    #[serde(default)]
    pub resolution_amount_minor: Option<i64>,
    /// Set by a mediator when the resolution releases the held payment.
    #[serde(default)]
    pub release_payment: bool,
    /// Filed by a customer declining a pending signature.
    #[serde(default)]
    pub decline_signature: bool,
}

// ---- Command payloads ----
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBooking {
    pub service_id: ServiceId,
    pub zone: String,
    pub scheduled_at: DateTime<Utc>,
    pub total_minor: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionReport {
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub satisfaction_rating: u8,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDispute {
    pub booking_id: BookingId,
    #[serde(default)]
    pub signature_id: Option<SignatureId>,
    pub severity: Severity,
    pub reason: String,
    /// Customer declined to sign instead of filing a full dispute.
    #[serde(default)]
    pub decline_signature: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub resolution_notes: String,
    #[serde(default)]
    pub resolution_amount_minor: Option<i64>,
    pub release_payment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualPayment {
    pub payment_id: PaymentId,
    pub amount_minor: i64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Everything the server knows about one booking; returned by resync fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingBundle {
    pub booking: Booking,
    #[serde(default)]
    pub signature: Option<Signature>,
    #[serde(default)]
    pub payment: Option<Payment>,
    #[serde(default)]
    pub disputes: Vec<Dispute>,
}

// ---- Push payloads ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub booking_id: BookingId,
    pub status: BookingStatus,
    #[serde(default)]
    pub vendor_id: Option<UserId>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequested {
    pub signature_id: SignatureId,
    pub booking_id: BookingId,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureUpdate {
    pub signature_id: SignatureId,
    pub booking_id: BookingId,
    pub status: SignatureStatus,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub satisfaction_rating: Option<u8>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub signature_hash: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityAck {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel { Info, Success, Warning, Error }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNotification {
    #[serde(default)]
    pub title: Option<String>,
    pub message: String,
    #[serde(default)]
    pub level: Option<NoticeLevel>,
    #[serde(default)]
    pub booking_id: Option<BookingId>,
}
