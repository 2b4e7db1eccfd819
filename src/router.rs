// ===============================
// src/router.rs (frame decode + fan-out)
// ===============================
//
// Inbound frame: {"type": "<kind>", "data": {...}}
// 1) decode into a closed set of kinds (unknown kind -> log, ignore)
// 2) one handler per kind applies it to the projection
// 3) handler yields user-facing notices + resync requests
// 4) result is published on the bus to every subscriber of that kind
//
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{
    AvailabilityAck, Booking, BookingId, BookingStatus, Dispute, NoticeLevel, Payment, Role,
    ServerNotification, SignatureRequested, SignatureStatus, SignatureUpdate, StatusChange,
};
use crate::metrics::{EVENTS_APPLIED, FRAMES, MALFORMED_FRAMES, UNKNOWN_KINDS};
use crate::store::{BookingView, Effect, Outcome, ProjectionStore, Settled};
use crate::transport::LinkState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BookingStatusChange,
    SignatureRequested,
    SignatureCompleted,
    NewBooking,
    AvailabilityUpdateAck,
    Notification,
    DisputeUpdated,
    PaymentUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::BookingStatusChange,
        EventKind::SignatureRequested,
        EventKind::SignatureCompleted,
        EventKind::NewBooking,
        EventKind::AvailabilityUpdateAck,
        EventKind::Notification,
        EventKind::DisputeUpdated,
        EventKind::PaymentUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BookingStatusChange => "booking_status_change",
            EventKind::SignatureRequested => "signature_requested",
            EventKind::SignatureCompleted => "signature_completed",
            EventKind::NewBooking => "new_booking",
            EventKind::AvailabilityUpdateAck => "availability_update_ack",
            EventKind::Notification => "notification",
            EventKind::DisputeUpdated => "dispute_updated",
            EventKind::PaymentUpdated => "payment_updated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    BookingStatusChange(StatusChange),
    SignatureRequested(SignatureRequested),
    SignatureCompleted(SignatureUpdate),
    NewBooking(Booking),
    AvailabilityUpdateAck(AvailabilityAck),
    Notification(ServerNotification),
    DisputeUpdated(Dispute),
    PaymentUpdated(Payment),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::BookingStatusChange(_) => EventKind::BookingStatusChange,
            InboundEvent::SignatureRequested(_) => EventKind::SignatureRequested,
            InboundEvent::SignatureCompleted(_) => EventKind::SignatureCompleted,
            InboundEvent::NewBooking(_) => EventKind::NewBooking,
            InboundEvent::AvailabilityUpdateAck(_) => EventKind::AvailabilityUpdateAck,
            InboundEvent::Notification(_) => EventKind::Notification,
            InboundEvent::DisputeUpdated(_) => EventKind::DisputeUpdated,
            InboundEvent::PaymentUpdated(_) => EventKind::PaymentUpdated,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a json envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown event kind {0:?}")]
    UnknownKind(String),
    #[error("malformed {kind:?} payload: {source}")]
    Payload { kind: EventKind, #[source] source: serde_json::Error },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Some servers wrap entities (`{"booking": {...}}`), some send them bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum Wrapped<T> {
    Booking { booking: T },
    Dispute { dispute: T },
    Payment { payment: T },
    Bare(T),
}

impl<T> Wrapped<T> {
    fn into_inner(self) -> T {
        match self {
            Wrapped::Booking { booking } => booking,
            Wrapped::Dispute { dispute } => dispute,
            Wrapped::Payment { payment } => payment,
            Wrapped::Bare(t) => t,
        }
    }
}

pub fn decode_frame(text: &str) -> Result<InboundEvent, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Envelope)?;
    let kind = EventKind::parse(&raw.kind).ok_or_else(|| FrameError::UnknownKind(raw.kind.clone()))?;
    let bad = |source| FrameError::Payload { kind, source };
    let data = raw.data;
    Ok(match kind {
        EventKind::BookingStatusChange => InboundEvent::BookingStatusChange(serde_json::from_value(data).map_err(bad)?),
        EventKind::SignatureRequested => InboundEvent::SignatureRequested(serde_json::from_value(data).map_err(bad)?),
        EventKind::SignatureCompleted => InboundEvent::SignatureCompleted(serde_json::from_value(data).map_err(bad)?),
        EventKind::NewBooking => {
            InboundEvent::NewBooking(serde_json::from_value::<Wrapped<Booking>>(data).map_err(bad)?.into_inner())
        }
        EventKind::AvailabilityUpdateAck => InboundEvent::AvailabilityUpdateAck(serde_json::from_value(data).map_err(bad)?),
        EventKind::Notification => InboundEvent::Notification(serde_json::from_value(data).map_err(bad)?),
        EventKind::DisputeUpdated => {
            InboundEvent::DisputeUpdated(serde_json::from_value::<Wrapped<Dispute>>(data).map_err(bad)?.into_inner())
        }
        EventKind::PaymentUpdated => {
            InboundEvent::PaymentUpdated(serde_json::from_value::<Wrapped<Payment>>(data).map_err(bad)?.into_inner())
        }
    })
}

// ---- Notices (toast / banner) ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
    pub booking_id: Option<BookingId>,
}

impl Notice {
    pub fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self { level, text: text.into(), booking_id: None }
    }

    pub fn about(mut self, booking_id: &BookingId) -> Self {
        self.booking_id = Some(booking_id.clone());
        self
    }
}

fn status_phrase(status: BookingStatus) -> &'static str {
    match status {
        BookingStatus::Pending => "is waiting for a vendor",
        BookingStatus::Confirmed => "was accepted by a vendor",
        BookingStatus::InProgress => "is in progress",
        BookingStatus::Completed => "was marked complete",
        BookingStatus::Signed => "was signed off",
        BookingStatus::Disputed => "is under dispute",
        BookingStatus::Cancelled => "was cancelled",
    }
}

// ---- Pub/sub ----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Event(EventKind),
    Notices,
    Link,
}

impl Topic {
    pub fn all_events() -> Vec<Topic> {
        EventKind::ALL.into_iter().map(Topic::Event).collect()
    }
}

/// What a subscriber receives after the router has applied an event.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedEvent {
    pub event: InboundEvent,
    pub outcome: Option<Outcome>,
    /// Booking as displayed after the event, when the event concerns one.
    pub booking: Option<BookingView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "delivery", content = "payload", rename_all = "snake_case")]
pub enum Delivery {
    Event(Arc<RoutedEvent>),
    Notice(Notice),
    Link(LinkState),
}

type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

struct Slot {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    slots: Mutex<HashMap<Topic, Vec<Slot>>>,
}

impl BusInner {
    fn remove(&self, topic: Topic, id: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = slots.get_mut(&topic) {
            list.retain(|s| s.id != id);
        }
    }
}

/// Typed fan-out keyed by topic. Handlers run with the registry unlocked, so a
/// handler may subscribe or unsubscribe (itself or others) while being called.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    keys: Vec<(Topic, u64)>,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(inner) = self.bus.upgrade() {
            for (topic, id) in &self.keys {
                inner.remove(*topic, *id);
            }
        }
    }
}

impl Bus {
    pub fn new() -> Self { Self::default() }

    pub fn on<F>(&self, topics: &[Topic], handler: F) -> Subscription
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let active = Arc::new(AtomicBool::new(true));
        let mut keys = Vec::with_capacity(topics.len());
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        for &topic in topics {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            slots.entry(topic).or_default().push(Slot { id, active: active.clone(), handler: handler.clone() });
            keys.push((topic, id));
        }
        Subscription { keys, active, bus: Arc::downgrade(&self.inner) }
    }

    /// Channel-backed subscriber, for widgets living in their own task.
    pub fn channel(&self, topics: &[Topic]) -> (Subscription, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.on(topics, move |d| {
            let _ = tx.send(d.clone());
        });
        (sub, rx)
    }

    /// Returns how many handlers were invoked.
    pub fn publish(&self, topic: Topic, delivery: &Delivery) -> usize {
        let targets: Vec<(Arc<AtomicBool>, Handler)> = {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .get(&topic)
                .map(|list| list.iter().map(|s| (s.active.clone(), s.handler.clone())).collect())
                .unwrap_or_default()
        };
        let mut called = 0;
        for (active, handler) in targets {
            // skip anyone unsubscribed by an earlier handler in this round
            if active.load(Ordering::Acquire) {
                handler(delivery);
                called += 1;
            }
        }
        called
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&topic).map_or(0, Vec::len)
    }
}

// ---- Router ----
#[derive(Debug, Default)]
pub struct RouteResult {
    pub notices: Vec<Notice>,
    pub resync: Vec<BookingId>,
    pub outcome: Option<Outcome>,
}

pub struct Router {
    bus: Bus,
    role: Role,
}

impl Router {
    pub fn new(bus: Bus, role: Role) -> Self { Self { bus, role } }

    pub fn bus(&self) -> &Bus { &self.bus }

    /// Decode and route one text frame. Bad frames are logged and dropped.
    pub fn route_text(&self, store: &mut ProjectionStore, text: &str, now: DateTime<Utc>) -> RouteResult {
        FRAMES.inc();
        match decode_frame(text) {
            Ok(ev) => self.route(store, ev, now),
            Err(FrameError::UnknownKind(kind)) => {
                UNKNOWN_KINDS.inc();
                info!(%kind, "ignoring unknown event kind");
                RouteResult::default()
            }
            Err(e) => {
                MALFORMED_FRAMES.inc();
                warn!(error = %e, "dropping malformed frame");
                RouteResult::default()
            }
        }
    }

    pub fn route(&self, store: &mut ProjectionStore, event: InboundEvent, now: DateTime<Utc>) -> RouteResult {
        let kind = event.kind();
        let mut res = match &event {
            InboundEvent::BookingStatusChange(ch) => self.on_status_change(store, ch, now),
            InboundEvent::SignatureRequested(ev) => self.on_signature_requested(store, ev),
            InboundEvent::SignatureCompleted(up) => self.on_signature_completed(store, up, now),
            InboundEvent::NewBooking(b) => self.on_new_booking(store, b.clone()),
            InboundEvent::AvailabilityUpdateAck(ack) => on_availability_ack(ack),
            InboundEvent::Notification(n) => on_notification(n),
            InboundEvent::DisputeUpdated(d) => on_dispute(store, d.clone(), now),
            InboundEvent::PaymentUpdated(p) => on_payment(store, p.clone()),
        };

        if let Some(out) = &res.outcome {
            EVENTS_APPLIED.with_label_values(&[kind.as_str(), effect_label(out.effect)]).inc();
            if out.needs_resync() && !res.resync.contains(&out.booking_id) {
                res.resync.push(out.booking_id.clone());
            }
            if let Some(Settled::Superseded { server_status, .. }) = &out.settled {
                res.notices.push(
                    Notice::new(
                        NoticeLevel::Warning,
                        format!("Your change was overtaken: booking {} {}", out.booking_id, status_phrase(*server_status)),
                    )
                    .about(&out.booking_id),
                );
            }
        }

        let booking = res.outcome.as_ref().and_then(|o| store.view(&o.booking_id));
        let routed = Arc::new(RoutedEvent { event, outcome: res.outcome.clone(), booking });
        let n = self.bus.publish(Topic::Event(kind), &Delivery::Event(routed));
        debug!(kind = kind.as_str(), subscribers = n, "event routed");
        for notice in &res.notices {
            self.bus.publish(Topic::Notices, &Delivery::Notice(notice.clone()));
        }
        res
    }

    fn on_status_change(&self, store: &mut ProjectionStore, ch: &StatusChange, now: DateTime<Utc>) -> RouteResult {
        let out = store.apply_status_change(ch, now);
        let mut notices = Vec::new();
        if out.effect == Effect::Applied {
            let text = ch
                .message
                .clone()
                .unwrap_or_else(|| format!("Booking {} {}", ch.booking_id, status_phrase(ch.status)));
            let level = match ch.status {
                BookingStatus::Cancelled | BookingStatus::Disputed => NoticeLevel::Warning,
                BookingStatus::Signed | BookingStatus::Completed => NoticeLevel::Success,
                _ => NoticeLevel::Info,
            };
            notices.push(Notice::new(level, text).about(&ch.booking_id));
        }
        RouteResult { notices, resync: vec![], outcome: Some(out) }
    }

    fn on_signature_requested(&self, store: &mut ProjectionStore, ev: &SignatureRequested) -> RouteResult {
        let out = store.apply_signature_requested(ev);
        let mut notices = Vec::new();
        if out.effect == Effect::Applied {
            let text = match self.role {
                Role::Customer => format!(
                    "Please review and sign for booking {} before {}",
                    ev.booking_id,
                    store
                        .signature(&ev.signature_id)
                        .map(|s| s.expires_at.format("%Y-%m-%d %H:%M UTC").to_string())
                        .unwrap_or_default()
                ),
                _ => format!("Signature requested for booking {}", ev.booking_id),
            };
            notices.push(Notice::new(NoticeLevel::Info, text).about(&ev.booking_id));
        }
        RouteResult { notices, resync: vec![], outcome: Some(out) }
    }

    fn on_signature_completed(&self, store: &mut ProjectionStore, up: &SignatureUpdate, now: DateTime<Utc>) -> RouteResult {
        let out = store.apply_signature_update(up, now);
        let mut notices = Vec::new();
        if out.effect == Effect::Applied {
            let (level, text) = match up.status {
                SignatureStatus::Signed => (
                    NoticeLevel::Success,
                    format!(
                        "Booking {} signed off ({} stars), payment will be released",
                        up.booking_id,
                        up.satisfaction_rating.unwrap_or_default()
                    ),
                ),
                SignatureStatus::Expired => (
                    NoticeLevel::Warning,
                    format!("The signature request for booking {} expired", up.booking_id),
                ),
                SignatureStatus::Disputed | SignatureStatus::Rejected => (
                    NoticeLevel::Warning,
                    format!("The customer did not sign booking {}; payment is on hold", up.booking_id),
                ),
                SignatureStatus::Pending => (NoticeLevel::Info, format!("Signature for booking {} is pending", up.booking_id)),
            };
            notices.push(Notice::new(level, text).about(&up.booking_id));
        }
        RouteResult { notices, resync: vec![], outcome: Some(out) }
    }

    fn on_new_booking(&self, store: &mut ProjectionStore, b: Booking) -> RouteResult {
        let id = b.id.clone();
        let text = match self.role {
            Role::Vendor => format!("New booking request in zone {} for {}", b.zone, b.scheduled_at.format("%Y-%m-%d %H:%M")),
            _ => format!("Booking {} created", id),
        };
        let out = store.upsert_booking(b, None);
        let notices = if out.effect == Effect::Applied {
            vec![Notice::new(NoticeLevel::Info, text).about(&id)]
        } else {
            vec![]
        };
        RouteResult { notices, resync: vec![], outcome: Some(out) }
    }
}

fn on_availability_ack(ack: &AvailabilityAck) -> RouteResult {
    let notice = if ack.success {
        Notice::new(NoticeLevel::Success, ack.message.clone().unwrap_or_else(|| "Availability updated".into()))
    } else {
        Notice::new(NoticeLevel::Error, ack.message.clone().unwrap_or_else(|| "Availability update failed".into()))
    };
    RouteResult { notices: vec![notice], ..Default::default() }
}

fn on_notification(n: &ServerNotification) -> RouteResult {
    let text = match &n.title {
        Some(t) => format!("{t}: {}", n.message),
        None => n.message.clone(),
    };
    let mut notice = Notice::new(n.level.unwrap_or(NoticeLevel::Info), text);
    notice.booking_id = n.booking_id.clone();
    RouteResult { notices: vec![notice], ..Default::default() }
}

fn on_dispute(store: &mut ProjectionStore, d: Dispute, now: DateTime<Utc>) -> RouteResult {
    let text = if d.status.is_terminal() {
        match d.resolution_notes.as_deref() {
            Some(notes) => format!("Dispute on booking {} {}: {}", d.booking_id, d.status, notes),
            None => format!("Dispute on booking {} {}", d.booking_id, d.status),
        }
    } else {
        format!("Dispute on booking {} is {}; payment is on hold", d.booking_id, d.status)
    };
    let booking_id = d.booking_id.clone();
    let out = store.apply_dispute(d, now);
    let notices = if out.effect == Effect::Applied {
        vec![Notice::new(NoticeLevel::Warning, text).about(&booking_id)]
    } else {
        vec![]
    };
    RouteResult { notices, resync: vec![], outcome: Some(out) }
}

fn on_payment(store: &mut ProjectionStore, p: Payment) -> RouteResult {
    let text = match (&p.status, &p.hold_reason) {
        (crate::domain::PaymentStatus::OnHold, Some(reason)) => format!("Payment on hold: {reason}"),
        (status, _) => format!("Payment for booking {} is {}", p.booking_id, status),
    };
    let booking_id = p.booking_id.clone();
    let out = store.apply_payment(p);
    let notices = if out.effect == Effect::Applied {
        vec![Notice::new(NoticeLevel::Info, text).about(&booking_id)]
    } else {
        vec![]
    };
    RouteResult { notices, resync: vec![], outcome: Some(out) }
}

fn effect_label(e: Effect) -> &'static str {
    match e {
        Effect::Applied => "applied",
        Effect::Duplicate => "duplicate",
        Effect::Stale => "stale",
        Effect::Resync => "resync",
    }
}
