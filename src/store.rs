// ===============================
// src/store.rs (local projection of server entities)
// ===============================
//
// Read-mostly cache of bookings, signatures, payments and disputes.
// Two writers only:
//   1) the router, applying server-confirmed events / responses
//   2) the command path, opening and closing the optimistic overlay
// Every write returns an `Outcome` so callers can log, count and resync.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{
    Booking, BookingBundle, BookingId, BookingStatus, Dispute, DisputeId, Payment, PaymentId,
    PaymentStatus, Signature, SignatureId, SignatureRequested, SignatureStatus, SignatureUpdate, StatusChange,
    UserId,
};
use crate::dispute::{freeze, has_open_dispute, payment_may_complete};
use crate::machine::{classify, Drift, GuardError};
use crate::signature::{display_status, expires_at_for, is_actionable, is_consistent};

/// In-flight command overlay for one booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimistic {
    pub command_id: String,
    pub expected: BookingStatus,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
struct BookingEntry {
    confirmed: Booking,
    last_seq: Option<u64>,
    optimistic: Option<Optimistic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Applied,
    Duplicate,
    Stale,
    /// Projection disagrees with the server; refetch the booking.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum Settled {
    Committed { command_id: String },
    /// The server moved the booking somewhere else; the local guess is dropped.
    Superseded { command_id: String, server_status: BookingStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub booking_id: BookingId,
    pub effect: Effect,
    pub settled: Option<Settled>,
}

impl Outcome {
    fn new(booking_id: &BookingId, effect: Effect) -> Self {
        Self { booking_id: booking_id.clone(), effect, settled: None }
    }
    fn resync(booking_id: &BookingId) -> Self { Self::new(booking_id, Effect::Resync) }
    pub fn needs_resync(&self) -> bool { self.effect == Effect::Resync }
}

// ---- Snapshot (what the UI reads) ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    /// Booking as displayed: status includes the optimistic overlay.
    pub booking: Booking,
    pub confirmed_status: BookingStatus,
    pub pending_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureView {
    pub signature: Signature,
    pub display_status: SignatureStatus,
    pub can_sign: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub bookings: Vec<BookingView>,
    pub signatures: Vec<SignatureView>,
    pub payments: Vec<Payment>,
    pub disputes: Vec<Dispute>,
}

impl ProjectionSnapshot {
    pub fn booking(&self, id: &BookingId) -> Option<&BookingView> {
        self.bookings.iter().find(|v| &v.booking.id == id)
    }

    pub fn signature_for(&self, booking_id: &BookingId) -> Option<&SignatureView> {
        self.signatures
            .iter()
            .filter(|v| &v.signature.booking_id == booking_id)
            .max_by_key(|v| v.signature.requested_at)
    }

    pub fn payment_for(&self, booking_id: &BookingId) -> Option<&Payment> {
        self.payments.iter().find(|p| &p.booking_id == booking_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectionStore {
    bookings: HashMap<BookingId, BookingEntry>,
    signatures: HashMap<SignatureId, Signature>,
    payments: HashMap<PaymentId, Payment>,
    disputes: HashMap<DisputeId, Dispute>,
}

impl ProjectionStore {
    pub fn new() -> Self { Self::default() }

    // ---- Reads ----
    pub fn booking(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.get(id).map(|e| &e.confirmed)
    }

    pub fn effective_status(&self, id: &BookingId) -> Option<BookingStatus> {
        self.bookings
            .get(id)
            .map(|e| e.optimistic.as_ref().map(|o| o.expected).unwrap_or(e.confirmed.status))
    }

    pub fn view(&self, id: &BookingId) -> Option<BookingView> {
        self.bookings.get(id).map(entry_view)
    }

    pub fn pending_command(&self, id: &BookingId) -> Option<&Optimistic> {
        self.bookings.get(id).and_then(|e| e.optimistic.as_ref())
    }

    pub fn signature(&self, id: &SignatureId) -> Option<&Signature> { self.signatures.get(id) }

    /// Most recent signature request for a booking.
    pub fn signature_for(&self, booking_id: &BookingId) -> Option<&Signature> {
        self.signatures
            .values()
            .filter(|s| &s.booking_id == booking_id)
            .max_by_key(|s| s.requested_at)
    }

    pub fn payment(&self, id: &PaymentId) -> Option<&Payment> { self.payments.get(id) }

    pub fn payment_for(&self, booking_id: &BookingId) -> Option<&Payment> {
        self.payments.values().find(|p| &p.booking_id == booking_id)
    }

    pub fn dispute(&self, id: &DisputeId) -> Option<&Dispute> { self.disputes.get(id) }

    pub fn disputes_for<'a>(&'a self, booking_id: &'a BookingId) -> impl Iterator<Item = &'a Dispute> + Clone + 'a {
        self.disputes.values().filter(move |d| &d.booking_id == booking_id)
    }

    pub fn booking_ids(&self) -> Vec<BookingId> {
        let mut ids: Vec<BookingId> = self.bookings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Bookings that can still change: worth refetching after a gap in the feed.
    pub fn live_booking_ids(&self) -> Vec<BookingId> {
        let mut ids: Vec<BookingId> = self
            .bookings
            .iter()
            .filter(|(id, e)| {
                !e.confirmed.status.is_terminal()
                    || e.optimistic.is_some()
                    || has_open_dispute(self.disputes_for(id))
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ProjectionSnapshot {
        let mut bookings: Vec<BookingView> = self.bookings.values().map(entry_view).collect();
        bookings.sort_by(|a, b| a.booking.id.cmp(&b.booking.id));

        let mut signatures: Vec<SignatureView> = self
            .signatures
            .values()
            .map(|s| SignatureView {
                signature: s.clone(),
                display_status: display_status(s, now),
                can_sign: is_actionable(s, now),
            })
            .collect();
        signatures.sort_by(|a, b| a.signature.id.cmp(&b.signature.id));

        let mut payments: Vec<Payment> = self.payments.values().cloned().collect();
        payments.sort_by(|a, b| a.id.cmp(&b.id));
        let mut disputes: Vec<Dispute> = self.disputes.values().cloned().collect();
        disputes.sort_by(|a, b| a.id.cmp(&b.id));

        ProjectionSnapshot { taken_at: Some(now), bookings, signatures, payments, disputes }
    }

    // ---- Server-confirmed writes ----

    /// Full booking from a REST response or a `new_booking` event.
    pub fn upsert_booking(&mut self, incoming: Booking, seq: Option<u64>) -> Outcome {
        let id = incoming.id.clone();
        let signed_off = self.signature_for(&id).is_some_and(|s| s.status == SignatureStatus::Signed && is_consistent(s));
        if incoming.vendor_id.is_some() && incoming.status == BookingStatus::Pending {
            warn!(booking_id = %id, "pending booking arrived with a vendor");
            return Outcome::resync(&id);
        }
        let Some(entry) = self.bookings.get_mut(&id) else {
            self.bookings.insert(id.clone(), BookingEntry { confirmed: incoming, last_seq: seq, optimistic: None });
            return Outcome::new(&id, Effect::Applied);
        };
        if let Some(effect) = seq_gate(entry, seq) {
            return Outcome::new(&id, effect);
        }
        match classify(entry.confirmed.status, incoming.status) {
            Drift::Duplicate => {
                if entry.confirmed == incoming {
                    let settled = settle(entry, false);
                    return Outcome { booking_id: id, effect: Effect::Duplicate, settled };
                }
                entry.confirmed = incoming;
                bump_seq(entry, seq);
                let settled = settle(entry, false);
                Outcome { booking_id: id, effect: Effect::Applied, settled }
            }
            Drift::Forward => {
                if needs_vendor(incoming.status) && incoming.vendor_id.is_none() {
                    return Outcome::resync(&id);
                }
                if incoming.status == BookingStatus::Signed && !signed_off {
                    warn!(booking_id = %id, "signed booking without a signed signature");
                    return Outcome::resync(&id);
                }
                entry.confirmed = incoming;
                bump_seq(entry, seq);
                let settled = settle(entry, true);
                Outcome { booking_id: id, effect: Effect::Applied, settled }
            }
            Drift::Stale => {
                debug!(booking_id = %id, "stale booking snapshot ignored");
                Outcome::new(&id, Effect::Stale)
            }
            Drift::Conflict => Outcome::resync(&id),
        }
    }

    pub fn apply_status_change(&mut self, ch: &StatusChange, received_at: DateTime<Utc>) -> Outcome {
        self.transition(&ch.booking_id, ch.status, ch.vendor_id.clone(), ch.completed_at, ch.seq, received_at)
    }

    pub fn apply_signature_requested(&mut self, ev: &SignatureRequested) -> Outcome {
        let expires_at = expires_at_for(ev.requested_at);
        if let Some(server) = ev.expires_at.filter(|e| *e != expires_at) {
            warn!(signature_id = %ev.signature_id, %server, local = %expires_at, "server expiry differs from 48h window");
        }
        let sig = Signature {
            id: ev.signature_id.clone(),
            booking_id: ev.booking_id.clone(),
            status: SignatureStatus::Pending,
            requested_at: ev.requested_at,
            expires_at,
            signed_at: None,
            satisfaction_rating: None,
            comments: None,
            signature_hash: None,
        };
        self.insert_requested(sig, ev.seq)
    }

    pub fn apply_signature_update(&mut self, up: &SignatureUpdate, received_at: DateTime<Utc>) -> Outcome {
        let Some(existing) = self.signatures.get(&up.signature_id) else {
            return Outcome::resync(&up.booking_id);
        };
        let mut sig = existing.clone();
        sig.status = up.status;
        sig.signed_at = up.signed_at.or(sig.signed_at);
        sig.satisfaction_rating = up.satisfaction_rating.or(sig.satisfaction_rating);
        sig.comments = up.comments.clone().or(sig.comments);
        sig.signature_hash = up.signature_hash.clone().or(sig.signature_hash);
        self.settle_signature(sig, up.seq, received_at)
    }

    /// Full signature from a REST response.
    pub fn upsert_signature(&mut self, mut sig: Signature, received_at: DateTime<Utc>) -> Outcome {
        normalize_expiry(&mut sig);
        if sig.status == SignatureStatus::Pending {
            self.insert_requested(sig, None)
        } else {
            self.settle_signature(sig, None, received_at)
        }
    }

    pub fn apply_dispute(&mut self, d: Dispute, received_at: DateTime<Utc>) -> Outcome {
        let booking_id = d.booking_id.clone();
        if self.disputes.get(&d.id) == Some(&d) {
            return Outcome::new(&booking_id, Effect::Duplicate);
        }
        let Some(entry) = self.bookings.get(&booking_id) else {
            self.disputes.insert(d.id.clone(), d);
            return Outcome::resync(&booking_id);
        };
        let open = !d.status.is_terminal();
        // booking cannot enter the dispute branch: touch nothing, refetch
        if open && classify(entry.confirmed.status, BookingStatus::Disputed) == Drift::Conflict {
            warn!(booking_id = %booking_id, dispute_id = %d.id, status = %entry.confirmed.status, "dispute on a booking that cannot be disputed");
            return Outcome::resync(&booking_id);
        }
        let dispute = d.clone();
        self.disputes.insert(d.id.clone(), d);
        if !open {
            return Outcome::new(&booking_id, Effect::Applied);
        }

        // 1) freeze payment
        for p in self.payments.values_mut().filter(|p| p.booking_id == booking_id) {
            if freeze(p, &dispute) {
                debug!(payment_id = %p.id, dispute_id = %dispute.id, "payment put on hold");
            }
        }
        // 2) live signature request: rejected on a decline, disputed otherwise
        let sig_status = if dispute.decline_signature { SignatureStatus::Rejected } else { SignatureStatus::Disputed };
        for s in self.signatures.values_mut().filter(|s| s.booking_id == booking_id) {
            let declined_now = dispute.decline_signature
                && s.status == SignatureStatus::Disputed
                && dispute.signature_id.as_ref() == Some(&s.id);
            if is_actionable(s, received_at) || declined_now {
                s.status = sig_status;
            }
        }
        // 3) booking follows
        let out = self.transition(&booking_id, BookingStatus::Disputed, None, None, None, received_at);
        match out.effect {
            Effect::Resync => out,
            _ => Outcome { effect: Effect::Applied, ..out },
        }
    }

    pub fn apply_payment(&mut self, p: Payment) -> Outcome {
        let booking_id = p.booking_id.clone();
        if self.payments.get(&p.id) == Some(&p) {
            return Outcome::new(&booking_id, Effect::Duplicate);
        }
        let disputes = self.disputes_for(&booking_id);
        if p.status == PaymentStatus::Completed
            && !payment_may_complete(self.signature_for(&booking_id), disputes.clone())
        {
            warn!(payment_id = %p.id, booking_id = %booking_id, "completed payment without signature or release");
            return Outcome::resync(&booking_id);
        }
        if has_open_dispute(disputes) && !p.status.is_frozen_compatible() {
            warn!(payment_id = %p.id, status = %p.status, "payment moved while a dispute is open");
            return Outcome::resync(&booking_id);
        }
        self.payments.insert(p.id.clone(), p);
        Outcome::new(&booking_id, Effect::Applied)
    }

    /// Result of a targeted refetch. Server truth replaces whatever we had,
    /// unless a push event applied while the fetch was out already moved the
    /// booking past it.
    pub fn replace_bundle(&mut self, bundle: BookingBundle) -> Outcome {
        let BookingBundle { booking, signature, payment, disputes } = bundle;
        let id = booking.id.clone();
        if let Some(entry) = self.bookings.get(&id) {
            if classify(entry.confirmed.status, booking.status) == Drift::Stale {
                debug!(booking_id = %id, current = %entry.confirmed.status, fetched = %booking.status, "fetched bundle is older than projection");
                return Outcome::new(&id, Effect::Stale);
            }
        }
        if booking.status == BookingStatus::Signed
            && !signature.as_ref().is_some_and(|s| s.status == SignatureStatus::Signed && is_consistent(s))
        {
            warn!(booking_id = %id, "signed booking fetched without a signed signature");
        }
        let mut changed = false;

        match self.bookings.get_mut(&id) {
            Some(entry) => {
                changed |= entry.confirmed != booking;
                entry.confirmed = booking;
            }
            None => {
                changed = true;
                self.bookings.insert(id.clone(), BookingEntry { confirmed: booking, last_seq: None, optimistic: None });
            }
        }
        if let Some(mut sig) = signature {
            normalize_expiry(&mut sig);
            changed |= self.signatures.get(&sig.id) != Some(&sig);
            self.signatures.insert(sig.id.clone(), sig);
        }
        if let Some(p) = payment {
            changed |= self.payments.get(&p.id) != Some(&p);
            self.payments.insert(p.id.clone(), p);
        }
        for d in disputes {
            changed |= self.disputes.get(&d.id) != Some(&d);
            self.disputes.insert(d.id.clone(), d);
        }

        // a refetch may predate our command; only a match commits
        let settled = self.bookings.get_mut(&id).and_then(|e| settle(e, false));
        let effect = if changed { Effect::Applied } else { Effect::Duplicate };
        Outcome { booking_id: id, effect, settled }
    }

    // ---- Optimistic overlay ----
    pub fn begin_optimistic(
        &mut self,
        id: &BookingId,
        command_id: &str,
        expected: BookingStatus,
        deadline: Instant,
    ) -> Result<(), GuardError> {
        let entry = self.bookings.get_mut(id).ok_or_else(|| GuardError::UnknownBooking(id.clone()))?;
        if entry.optimistic.is_some() {
            return Err(GuardError::CommandInFlight);
        }
        entry.optimistic = Some(Optimistic { command_id: command_id.to_string(), expected, deadline });
        Ok(())
    }

    /// Drop the overlay for a failed command. False if it was already settled.
    pub fn rollback(&mut self, id: &BookingId, command_id: &str) -> bool {
        match self.bookings.get_mut(id) {
            Some(entry) if entry.optimistic.as_ref().is_some_and(|o| o.command_id == command_id) => {
                entry.optimistic = None;
                true
            }
            _ => false,
        }
    }

    pub fn expire_optimistic(&mut self, now: Instant) -> Vec<(BookingId, Optimistic)> {
        let mut expired = Vec::new();
        for (id, entry) in self.bookings.iter_mut() {
            if entry.optimistic.as_ref().is_some_and(|o| o.deadline <= now) {
                if let Some(o) = entry.optimistic.take() {
                    expired.push((id.clone(), o));
                }
            }
        }
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        expired
    }

    // ---- Internals ----
    fn transition(
        &mut self,
        id: &BookingId,
        to: BookingStatus,
        vendor: Option<UserId>,
        completed_at: Option<DateTime<Utc>>,
        seq: Option<u64>,
        received_at: DateTime<Utc>,
    ) -> Outcome {
        let signed_off = self.signature_for(id).is_some_and(|s| s.status == SignatureStatus::Signed && is_consistent(s));
        let Some(entry) = self.bookings.get_mut(id) else {
            return Outcome::resync(id);
        };
        if let Some(effect) = seq_gate(entry, seq) {
            return Outcome::new(id, effect);
        }
        match classify(entry.confirmed.status, to) {
            Drift::Duplicate => {
                let settled = settle(entry, false);
                Outcome { booking_id: id.clone(), effect: Effect::Duplicate, settled }
            }
            Drift::Stale => {
                debug!(booking_id = %id, current = %entry.confirmed.status, incoming = %to, "stale status ignored");
                Outcome::new(id, Effect::Stale)
            }
            Drift::Conflict => {
                warn!(booking_id = %id, current = %entry.confirmed.status, incoming = %to, "status conflict");
                Outcome::resync(id)
            }
            Drift::Forward => {
                if to == BookingStatus::Signed && !signed_off {
                    // wait for signature_completed; the refetch brings both
                    warn!(booking_id = %id, "signed status without a signed signature");
                    return Outcome::resync(id);
                }
                let vendor = vendor.or_else(|| entry.confirmed.vendor_id.clone());
                if needs_vendor(to) && vendor.is_none() {
                    return Outcome::resync(id);
                }
                let b = &mut entry.confirmed;
                b.status = to;
                b.vendor_id = vendor;
                if to.requires_completion() || to == BookingStatus::Disputed {
                    b.completed_at = completed_at.or(b.completed_at).or(Some(received_at));
                }
                bump_seq(entry, seq);
                let settled = settle(entry, true);
                Outcome { booking_id: id.clone(), effect: Effect::Applied, settled }
            }
        }
    }

    fn insert_requested(&mut self, sig: Signature, seq: Option<u64>) -> Outcome {
        let booking_id = sig.booking_id.clone();
        let Some(entry) = self.bookings.get(&booking_id) else {
            return Outcome::resync(&booking_id);
        };
        if let Some(existing) = self.signatures.get(&sig.id) {
            return if existing.status == SignatureStatus::Pending {
                Outcome::new(&booking_id, Effect::Duplicate)
            } else {
                Outcome::new(&booking_id, Effect::Stale)
            };
        }
        if entry.confirmed.status != BookingStatus::Completed {
            return Outcome::resync(&booking_id);
        }
        // one non-terminal signature per booking
        let requested_at = sig.requested_at;
        let mut clash = false;
        for old in self.signatures.values_mut().filter(|s| s.booking_id == booking_id) {
            if old.status != SignatureStatus::Pending {
                continue;
            }
            if is_actionable(old, requested_at) {
                clash = true;
            } else {
                old.status = SignatureStatus::Expired;
            }
        }
        if clash {
            return Outcome::resync(&booking_id);
        }
        if let Some(entry) = self.bookings.get_mut(&booking_id) {
            bump_seq(entry, seq);
        }
        self.signatures.insert(sig.id.clone(), sig);
        Outcome::new(&booking_id, Effect::Applied)
    }

    fn settle_signature(&mut self, sig: Signature, seq: Option<u64>, received_at: DateTime<Utc>) -> Outcome {
        let booking_id = sig.booking_id.clone();
        if let Some(existing) = self.signatures.get(&sig.id) {
            if existing.status == sig.status {
                return Outcome::new(&booking_id, Effect::Duplicate);
            }
            // disputed <-> rejected: same branch, the server's label wins
            let relabel = matches!(
                (existing.status, sig.status),
                (SignatureStatus::Disputed, SignatureStatus::Rejected) | (SignatureStatus::Rejected, SignatureStatus::Disputed)
            );
            if existing.status.is_terminal() && !relabel {
                warn!(signature_id = %sig.id, from = %existing.status, to = %sig.status, "terminal signature changed");
                return Outcome::resync(&booking_id);
            }
        }
        if !is_consistent(&sig) {
            warn!(signature_id = %sig.id, "signed signature without rating or inside-window time");
            return Outcome::resync(&booking_id);
        }
        let status = sig.status;
        self.signatures.insert(sig.id.clone(), sig);

        let target = match status {
            SignatureStatus::Signed => Some(BookingStatus::Signed),
            SignatureStatus::Disputed | SignatureStatus::Rejected => Some(BookingStatus::Disputed),
            SignatureStatus::Expired | SignatureStatus::Pending => None,
        };
        let Some(target) = target else {
            return Outcome::new(&booking_id, Effect::Applied);
        };
        let out = self.transition(&booking_id, target, None, None, seq, received_at);
        match out.effect {
            Effect::Resync => out,
            _ => Outcome { effect: Effect::Applied, ..out },
        }
    }
}

fn entry_view(e: &BookingEntry) -> BookingView {
    let mut booking = e.confirmed.clone();
    if let Some(o) = &e.optimistic {
        booking.status = o.expected;
    }
    BookingView {
        booking,
        confirmed_status: e.confirmed.status,
        pending_command: e.optimistic.as_ref().map(|o| o.command_id.clone()),
    }
}

/// The window is always requested_at + 48h, whatever the server sent.
fn normalize_expiry(sig: &mut Signature) {
    let expires_at = expires_at_for(sig.requested_at);
    if sig.expires_at != expires_at {
        warn!(signature_id = %sig.id, server = %sig.expires_at, local = %expires_at, "server expiry differs from 48h window");
        sig.expires_at = expires_at;
    }
}

fn needs_vendor(status: BookingStatus) -> bool {
    !matches!(status, BookingStatus::Pending | BookingStatus::Cancelled)
}

fn seq_gate(entry: &BookingEntry, seq: Option<u64>) -> Option<Effect> {
    match (entry.last_seq, seq) {
        (Some(last), Some(s)) if s == last => Some(Effect::Duplicate),
        (Some(last), Some(s)) if s < last => Some(Effect::Stale),
        _ => None,
    }
}

fn bump_seq(entry: &mut BookingEntry, seq: Option<u64>) {
    if let Some(s) = seq {
        entry.last_seq = Some(entry.last_seq.map_or(s, |l| l.max(s)));
    }
}

/// Resolve the overlay against fresh server state. A status change the
/// overlay did not predict supersedes it.
fn settle(entry: &mut BookingEntry, status_changed: bool) -> Option<Settled> {
    let o = entry.optimistic.as_ref()?;
    if o.expected == entry.confirmed.status {
        let o = entry.optimistic.take()?;
        return Some(Settled::Committed { command_id: o.command_id });
    }
    if status_changed {
        let o = entry.optimistic.take()?;
        return Some(Settled::Superseded { command_id: o.command_id, server_status: entry.confirmed.status });
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DisputeStatus;
    use crate::testutil::{booking, dispute, payment, signature, t0};
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use BookingStatus::*;

    fn change(id: &str, status: BookingStatus) -> StatusChange {
        StatusChange {
            booking_id: id.into(),
            status,
            vendor_id: None,
            completed_at: None,
            seq: None,
            message: None,
        }
    }

    fn signed_update(sig: &str, booking: &str, at: DateTime<Utc>) -> SignatureUpdate {
        SignatureUpdate {
            signature_id: sig.into(),
            booking_id: booking.into(),
            status: SignatureStatus::Signed,
            signed_at: Some(at),
            satisfaction_rating: Some(5),
            comments: Some("great".into()),
            signature_hash: Some("ab12".into()),
            seq: None,
        }
    }

    fn completed_with_signature() -> ProjectionStore {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Completed, Some("V1")), None);
        store.upsert_signature(signature("S1", "B1", t0()), t0());
        store
    }

    fn soon() -> Instant { Instant::now() + StdDuration::from_secs(5) }

    #[test]
    fn duplicate_status_change_is_idempotent() {
        let mut store = completed_with_signature();
        store.apply_signature_update(&signed_update("S1", "B1", t0() + Duration::hours(1)), t0());
        let ev = change("B1", Signed);

        let first = store.apply_status_change(&ev, t0());
        let snap = store.snapshot(t0());
        let second = store.apply_status_change(&ev, t0() + Duration::seconds(2));

        assert_eq!(first.effect, Effect::Duplicate); // already signed via the signature
        assert_eq!(second.effect, Effect::Duplicate);
        assert_eq!(store.snapshot(t0()), snap);
    }

    #[test]
    fn applying_status_twice_matches_once() {
        let mut once = ProjectionStore::new();
        once.upsert_booking(booking("B1", Pending, None), None);
        let mut twice = once.clone();
        let mut ev = change("B1", Confirmed);
        ev.vendor_id = Some("V1".into());

        once.apply_status_change(&ev, t0());
        twice.apply_status_change(&ev, t0());
        twice.apply_status_change(&ev, t0());
        assert_eq!(once.snapshot(t0()), twice.snapshot(t0()));
        assert_eq!(twice.booking(&"B1".into()).and_then(|b| b.vendor_id.clone()), Some("V1".into()));
    }

    #[test]
    fn stale_and_conflicting_events() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Completed, Some("V1")), None);
        assert_eq!(store.apply_status_change(&change("B1", InProgress), t0()).effect, Effect::Stale);
        assert_eq!(store.apply_status_change(&change("B1", Cancelled), t0()).effect, Effect::Resync);
        assert_eq!(store.apply_status_change(&change("B9", Confirmed), t0()).effect, Effect::Resync);
        assert_eq!(store.booking(&"B1".into()).map(|b| b.status), Some(Completed));
    }

    #[test]
    fn seq_orders_events_per_booking() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Confirmed, Some("V1")), Some(3));
        let mut ev = change("B1", InProgress);
        ev.seq = Some(3);
        assert_eq!(store.apply_status_change(&ev, t0()).effect, Effect::Duplicate);
        ev.seq = Some(2);
        assert_eq!(store.apply_status_change(&ev, t0()).effect, Effect::Stale);
        ev.seq = Some(4);
        assert_eq!(store.apply_status_change(&ev, t0()).effect, Effect::Applied);
        assert_eq!(store.effective_status(&"B1".into()), Some(InProgress));
    }

    #[test]
    fn confirmed_without_vendor_resyncs() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Pending, None), None);
        assert_eq!(store.apply_status_change(&change("B1", Confirmed), t0()).effect, Effect::Resync);
        let mut bad = booking("B2", Pending, None);
        bad.vendor_id = Some("V1".into());
        assert!(store.upsert_booking(bad, None).needs_resync());
    }

    #[test]
    fn completed_at_follows_completion() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", InProgress, Some("V1")), None);
        assert!(store.booking(&"B1".into()).and_then(|b| b.completed_at).is_none());
        let at = t0() + Duration::hours(3);
        let mut ev = change("B1", Completed);
        ev.completed_at = Some(at);
        store.apply_status_change(&ev, t0());
        assert_eq!(store.booking(&"B1".into()).and_then(|b| b.completed_at), Some(at));
    }

    #[test]
    fn request_signature_keeps_booking_completed() {
        let store = completed_with_signature();
        let sig = store.signature(&"S1".into()).cloned();
        let sig = sig.as_ref();
        assert_eq!(sig.map(|s| s.status), Some(SignatureStatus::Pending));
        assert_eq!(sig.map(|s| s.expires_at - s.requested_at), Some(Duration::hours(48)));
        assert_eq!(store.effective_status(&"B1".into()), Some(Completed));
    }

    #[test]
    fn second_live_signature_is_a_desync() {
        let mut store = completed_with_signature();
        let clash = SignatureRequested {
            signature_id: "S2".into(),
            booking_id: "B1".into(),
            requested_at: t0() + Duration::hours(1),
            expires_at: None,
            seq: None,
        };
        assert!(store.apply_signature_requested(&clash).needs_resync());

        // after the first one lapsed a new request replaces it
        let later = SignatureRequested { requested_at: t0() + Duration::hours(50), ..clash };
        assert_eq!(store.apply_signature_requested(&later).effect, Effect::Applied);
        assert_eq!(store.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Expired));
        assert_eq!(store.signature_for(&"B1".into()).map(|s| s.id.clone()), Some("S2".into()));
    }

    #[test]
    fn signed_signature_moves_booking_to_signed() {
        let mut store = completed_with_signature();
        let out = store.apply_signature_update(&signed_update("S1", "B1", t0() + Duration::hours(1)), t0());
        assert_eq!(out.effect, Effect::Applied);
        assert_eq!(store.effective_status(&"B1".into()), Some(Signed));
        let sig = store.signature(&"S1".into()).cloned();
        assert_eq!(sig.and_then(|s| s.satisfaction_rating), Some(5));
    }

    #[test]
    fn signing_after_expiry_is_rejected_as_desync() {
        let mut store = completed_with_signature();
        let late = signed_update("S1", "B1", t0() + Duration::hours(49));
        assert!(store.apply_signature_update(&late, t0()).needs_resync());
        assert_eq!(store.effective_status(&"B1".into()), Some(Completed));
    }

    #[test]
    fn optimistic_sign_round_trip_matches_server_only() {
        let mut optimistic = completed_with_signature();
        let mut server_only = optimistic.clone();
        optimistic.begin_optimistic(&"B1".into(), "CL-1", Signed, soon()).unwrap();
        assert_eq!(optimistic.effective_status(&"B1".into()), Some(Signed));
        assert_eq!(optimistic.booking(&"B1".into()).map(|b| b.status), Some(Completed));

        let up = signed_update("S1", "B1", t0() + Duration::hours(1));
        let out = optimistic.apply_signature_update(&up, t0());
        server_only.apply_signature_update(&up, t0());

        assert_eq!(out.settled, Some(Settled::Committed { command_id: "CL-1".into() }));
        assert_eq!(optimistic.snapshot(t0()), server_only.snapshot(t0()));
    }

    #[test]
    fn server_event_supersedes_local_guess() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Confirmed, Some("V1")), None);
        store.begin_optimistic(&"B1".into(), "CL-7", Cancelled, soon()).unwrap();
        let out = store.apply_status_change(&change("B1", InProgress), t0());
        assert_eq!(
            out.settled,
            Some(Settled::Superseded { command_id: "CL-7".into(), server_status: InProgress })
        );
        assert_eq!(store.effective_status(&"B1".into()), Some(InProgress));
        assert!(store.pending_command(&"B1".into()).is_none());
    }

    #[test]
    fn one_command_in_flight_per_booking() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Pending, None), None);
        store.begin_optimistic(&"B1".into(), "CL-1", Confirmed, soon()).unwrap();
        assert_eq!(
            store.begin_optimistic(&"B1".into(), "CL-2", Cancelled, soon()),
            Err(GuardError::CommandInFlight)
        );
        assert!(!store.rollback(&"B1".into(), "CL-2"));
        assert!(store.rollback(&"B1".into(), "CL-1"));
        assert_eq!(store.effective_status(&"B1".into()), Some(Pending));
    }

    #[test]
    fn deadline_rolls_back() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Pending, None), None);
        let now = Instant::now();
        store.begin_optimistic(&"B1".into(), "CL-1", Confirmed, now + StdDuration::from_millis(10)).unwrap();
        assert!(store.expire_optimistic(now).is_empty());
        let expired = store.expire_optimistic(now + StdDuration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1.command_id, "CL-1");
        assert_eq!(store.effective_status(&"B1".into()), Some(Pending));
    }

    #[test]
    fn dispute_on_pending_signature_freezes_payment() {
        let mut store = completed_with_signature();
        store.apply_payment(payment("P1", "B1", PaymentStatus::Pending));
        let out = store.apply_dispute(dispute("D1", "B1", DisputeStatus::Open), t0() + Duration::hours(2));

        assert_eq!(out.effect, Effect::Applied);
        assert_eq!(store.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Disputed));
        let p = store.payment(&"P1".into()).cloned();
        assert_eq!(p.as_ref().map(|p| p.status), Some(PaymentStatus::OnHold));
        assert_eq!(
            p.and_then(|p| p.hold_reason),
            Some("Dispute D1 is open: stains left on carpet".into())
        );
        assert_eq!(store.effective_status(&"B1".into()), Some(Disputed));

        // payment cannot complete while disputed
        let completed = payment("P1", "B1", PaymentStatus::Completed);
        assert!(store.apply_payment(completed).needs_resync());
        assert_eq!(store.payment(&"P1".into()).map(|p| p.status), Some(PaymentStatus::OnHold));
    }

    #[test]
    fn released_dispute_allows_completion() {
        let mut store = completed_with_signature();
        store.apply_dispute(dispute("D1", "B1", DisputeStatus::Open), t0());
        let mut resolved = dispute("D1", "B1", DisputeStatus::Resolved);
        resolved.release_payment = true;
        resolved.resolution_amount_minor = Some(6_000);
        store.apply_dispute(resolved, t0());
        let mut done = payment("P1", "B1", PaymentStatus::Completed);
        done.amount_minor = 6_000;
        assert_eq!(store.apply_payment(done).effect, Effect::Applied);
    }

    #[test]
    fn bundle_replaces_and_commits_only_on_match() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Pending, None), None);
        store.begin_optimistic(&"B1".into(), "CL-1", Confirmed, soon()).unwrap();

        let stale = BookingBundle { booking: booking("B1", Pending, None), signature: None, payment: None, disputes: vec![] };
        let out = store.replace_bundle(stale);
        assert_eq!(out.settled, None);
        assert!(store.pending_command(&"B1".into()).is_some());

        let fresh = BookingBundle {
            booking: booking("B1", Confirmed, Some("V1")),
            signature: None,
            payment: Some(payment("P1", "B1", PaymentStatus::Pending)),
            disputes: vec![],
        };
        let out = store.replace_bundle(fresh);
        assert_eq!(out.effect, Effect::Applied);
        assert_eq!(out.settled, Some(Settled::Committed { command_id: "CL-1".into() }));
    }

    #[test]
    fn snapshot_greys_out_expired_signature() {
        let store = completed_with_signature();
        let snap = store.snapshot(t0() + Duration::hours(49));
        let view = snap.signature_for(&"B1".into()).cloned();
        assert_eq!(view.as_ref().map(|v| v.display_status), Some(SignatureStatus::Expired));
        assert_eq!(view.as_ref().map(|v| v.can_sign), Some(false));
        // still listed, still pending underneath
        assert_eq!(view.map(|v| v.signature.status), Some(SignatureStatus::Pending));
    }

    #[test]
    fn invariants_hold_over_a_full_lifecycle() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Pending, None), None);
        let mut ev = change("B1", Confirmed);
        ev.vendor_id = Some("V1".into());
        store.apply_status_change(&ev, t0());
        store.apply_status_change(&change("B1", InProgress), t0());
        store.apply_status_change(&change("B1", Completed), t0());
        store.upsert_signature(signature("S1", "B1", t0()), t0());
        store.apply_signature_update(&signed_update("S1", "B1", t0() + Duration::hours(5)), t0());

        let snap = store.snapshot(t0());
        for v in &snap.bookings {
            let b = &v.booking;
            if b.vendor_id.is_some() {
                assert_ne!(b.status, Pending);
            }
            if b.status.requires_completion() {
                assert!(b.completed_at.is_some());
            }
            if b.status == Signed {
                let s = snap.signature_for(&b.id).map(|v| &v.signature);
                assert_eq!(s.map(|s| s.status), Some(SignatureStatus::Signed));
                assert!(s.and_then(|s| s.satisfaction_rating).is_some_and(|r| (1..=5).contains(&r)));
            }
        }
        for s in &snap.signatures {
            if let Some(at) = s.signature.signed_at {
                assert!(at < s.signature.expires_at);
            }
        }
    }

    #[test]
    fn signed_status_waits_for_signed_signature() {
        let mut store = completed_with_signature();
        let out = store.apply_status_change(&change("B1", Signed), t0() + Duration::hours(1));
        assert_eq!(out.effect, Effect::Resync);
        assert_eq!(store.effective_status(&"B1".into()), Some(Completed));
        assert_eq!(store.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Pending));

        // no signature at all
        let mut bare = ProjectionStore::new();
        bare.upsert_booking(booking("B2", Completed, Some("V1")), None);
        assert_eq!(bare.apply_status_change(&change("B2", Signed), t0()).effect, Effect::Resync);
        assert_eq!(bare.upsert_booking(booking("B2", Signed, Some("V1")), None).effect, Effect::Resync);
        assert_eq!(bare.effective_status(&"B2".into()), Some(Completed));

        // once the signature is signed the same change is a no-op
        store.apply_signature_update(&signed_update("S1", "B1", t0() + Duration::hours(1)), t0());
        assert_eq!(store.effective_status(&"B1".into()), Some(Signed));
        assert_eq!(store.apply_status_change(&change("B1", Signed), t0()).effect, Effect::Duplicate);
    }

    #[test]
    fn older_bundle_keeps_newer_pushed_state() {
        let mut store = ProjectionStore::new();
        store.upsert_booking(booking("B1", Confirmed, Some("V1")), None);
        let mut ev = change("B1", InProgress);
        ev.seq = Some(5);
        assert_eq!(store.apply_status_change(&ev, t0()).effect, Effect::Applied);

        // fetch started before the push, answer lands after it
        let old = BookingBundle {
            booking: booking("B1", Confirmed, Some("V1")),
            signature: None,
            payment: Some(payment("P1", "B1", PaymentStatus::Pending)),
            disputes: vec![],
        };
        let out = store.replace_bundle(old);
        assert_eq!(out.effect, Effect::Stale);
        assert_eq!(store.effective_status(&"B1".into()), Some(InProgress));
        assert!(store.payment(&"P1".into()).is_none());

        // a conflicting bundle is still server truth
        let cancelled = BookingBundle {
            booking: booking("B1", Cancelled, Some("V1")),
            signature: None,
            payment: None,
            disputes: vec![],
        };
        assert_eq!(store.replace_bundle(cancelled).effect, Effect::Applied);
        assert_eq!(store.effective_status(&"B1".into()), Some(Cancelled));
    }

    #[test]
    fn bundle_signature_gets_fixed_window() {
        let mut store = ProjectionStore::new();
        let mut sig = signature("S1", "B1", t0());
        sig.expires_at = t0() + Duration::hours(72);
        let b = BookingBundle {
            booking: booking("B1", Completed, Some("V1")),
            signature: Some(sig),
            payment: None,
            disputes: vec![],
        };
        store.replace_bundle(b);
        assert_eq!(store.signature(&"S1".into()).map(|s| s.expires_at), Some(t0() + Duration::hours(48)));
        assert!(!store.snapshot(t0() + Duration::hours(49)).signatures[0].can_sign);
    }

    #[test]
    fn decline_rejects_signature_without_resync() {
        let mut store = completed_with_signature();
        let mut d = dispute("D1", "B1", DisputeStatus::Open);
        d.signature_id = Some("S1".into());
        d.decline_signature = true;
        assert_eq!(store.apply_dispute(d, t0() + Duration::hours(1)).effect, Effect::Applied);
        assert_eq!(store.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Rejected));

        let confirm = SignatureUpdate {
            signature_id: "S1".into(),
            booking_id: "B1".into(),
            status: SignatureStatus::Rejected,
            signed_at: None,
            satisfaction_rating: None,
            comments: None,
            signature_hash: None,
            seq: None,
        };
        assert_eq!(store.apply_signature_update(&confirm, t0()).effect, Effect::Duplicate);

        // dispute pushed without the flag first: the server's rejected label still lands
        let mut other = completed_with_signature();
        let mut plain = dispute("D1", "B1", DisputeStatus::Open);
        plain.signature_id = Some("S1".into());
        other.apply_dispute(plain, t0() + Duration::hours(1));
        assert_eq!(other.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Disputed));
        let out = other.apply_signature_update(&confirm, t0());
        assert_eq!(out.effect, Effect::Applied);
        assert_eq!(other.signature(&"S1".into()).map(|s| s.status), Some(SignatureStatus::Rejected));
        assert_eq!(other.effective_status(&"B1".into()), Some(Disputed));
    }

    #[test]
    fn dispute_keeps_server_hold_reason() {
        let mut store = completed_with_signature();
        let mut p = payment("P1", "B1", PaymentStatus::OnHold);
        p.hold_reason = Some("Awaiting mediation".into());
        store.apply_payment(p);
        store.apply_dispute(dispute("D1", "B1", DisputeStatus::Open), t0() + Duration::hours(1));
        assert_eq!(
            store.payment(&"P1".into()).and_then(|p| p.hold_reason.clone()),
            Some("Awaiting mediation".into())
        );
    }

    #[test]
    fn dispute_on_signed_booking_touches_nothing() {
        let mut store = completed_with_signature();
        store.apply_signature_update(&signed_update("S1", "B1", t0() + Duration::hours(1)), t0());
        store.apply_payment(payment("P1", "B1", PaymentStatus::Processing));
        let before = store.snapshot(t0());

        let out = store.apply_dispute(dispute("D1", "B1", DisputeStatus::Open), t0() + Duration::hours(2));
        assert_eq!(out.effect, Effect::Resync);
        assert_eq!(store.payment(&"P1".into()).map(|p| p.status), Some(PaymentStatus::Processing));
        assert_eq!(store.snapshot(t0()), before);
    }
}
