// ===============================
// src/session.rs (session scope + sync engine)
// ===============================
//
// One SyncEngine per authenticated session. It owns the projection store and
// is the only task that mutates it:
//   frames   -> router -> store -> bus + snapshot
//   commands -> guard -> optimistic overlay -> REST task -> settle
//   link     -> reconnect resync / "unavailable" notice
//   tick     -> confirmation timeouts
// Handles are cheap clones talking to the engine over channels.
//
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ApiError, Backend};
use crate::domain::{
    Actor, AvailabilitySlot, Booking, BookingBundle, BookingId, BookingStatus, CancelRequest,
    CompletionReport, Dispute, DisputeId, DisputeResolution, ManualPayment, NewBooking, NewDispute,
    NoticeLevel, Payment, Role, Severity, SignRequest, Signature, SignatureId, UserId,
};
use crate::dispute::{self, DisputeEntry};
use crate::machine::{self, GuardError};
use crate::metrics::{COMMANDS, GUARD_REJECTIONS, OPTIMISTIC, RESYNCS, BOOKINGS_TRACKED};
use crate::router::{Bus, Delivery, Notice, Router, Subscription, Topic};
use crate::signature;
use crate::store::{Effect, Outcome, ProjectionSnapshot, ProjectionStore, Settled};
use crate::transport::{self, LinkState, TransportCfg, TransportError, TransportHandle};

// ---- Session scope ----
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: UserId,
    pub role: Role,
    pub api_base: String,
    pub ws_base: String,
    pub token: Option<String>,
}

impl SessionContext {
    pub fn actor(&self) -> Actor {
        Actor { user_id: self.user_id.clone(), role: self.role }
    }

    /// `{ws_base}/ws/{role}/{user_id}/?token=...`, derived fresh for every connect.
    pub fn ws_url(&self) -> Result<Url, TransportError> {
        let raw = format!(
            "{}/ws/{}/{}/",
            self.ws_base.trim_end_matches('/'),
            self.role.as_str(),
            urlencoding::encode(self.user_id.as_str())
        );
        let mut url = Url::parse(&raw)?;
        if let Some(t) = &self.token {
            url.query_pairs_mut().append_pair("token", t);
        }
        Ok(url)
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct EngineCfg {
    /// Optimistic changes without confirmation inside this window roll back.
    pub confirm_timeout: Duration,
    pub tick: Duration,
    pub clock: Clock,
}

impl Default for EngineCfg {
    fn default() -> Self {
        let clock: Clock = Arc::new(Utc::now);
        Self { confirm_timeout: Duration::from_secs(10), tick: Duration::from_millis(250), clock }
    }
}

// ---- Commands ----
#[derive(Debug, Clone)]
pub enum Command {
    Create(NewBooking),
    Accept(BookingId),
    Start(BookingId),
    Complete(BookingId, CompletionReport),
    RequestSignature(BookingId),
    Sign(SignatureId, SignRequest),
    /// Customer refuses a pending signature; filed as a dispute with the decline flag.
    Decline(NewDispute),
    Cancel(BookingId, CancelRequest),
    CreateDispute(NewDispute),
    ResolveDispute(DisputeId, DisputeResolution),
    ManualPayment(ManualPayment),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create(_) => "create",
            Command::Accept(_) => "accept",
            Command::Start(_) => "start",
            Command::Complete(..) => "complete",
            Command::RequestSignature(_) => "request_signature",
            Command::Sign(..) => "sign",
            Command::Decline(_) => "decline_signature",
            Command::Cancel(..) => "cancel",
            Command::CreateDispute(_) => "create_dispute",
            Command::ResolveDispute(..) => "resolve_dispute",
            Command::ManualPayment(_) => "process_manual_payment",
        }
    }

    async fn execute(self, backend: &dyn Backend) -> Result<Confirmed, ApiError> {
        match self {
            Command::Create(req) => backend.create_booking(&req).await.map(Confirmed::Booking),
            Command::Accept(id) => backend.accept(&id).await.map(Confirmed::Booking),
            Command::Start(id) => backend.start(&id).await.map(Confirmed::Booking),
            Command::Complete(id, rep) => backend.complete(&id, &rep).await.map(Confirmed::Booking),
            Command::RequestSignature(id) => backend.request_signature(&id).await.map(Confirmed::Signature),
            Command::Sign(id, req) => backend.sign(&id, &req).await.map(Confirmed::Signature),
            Command::Decline(req) | Command::CreateDispute(req) => {
                backend.create_dispute(&req).await.map(Confirmed::Dispute)
            }
            Command::Cancel(id, req) => backend.cancel(&id, &req).await.map(Confirmed::Booking),
            Command::ResolveDispute(id, req) => backend.resolve_dispute(&id, &req).await.map(Confirmed::Dispute),
            Command::ManualPayment(req) => backend.process_manual_payment(&req).await.map(Confirmed::Payment),
        }
    }
}

/// Server's answer to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmed {
    Booking(Booking),
    Signature(Signature),
    Dispute(Dispute),
    Payment(Payment),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no confirmation for {command} within {timeout_ms} ms; change rolled back")]
    Timeout { command: &'static str, timeout_ms: u64 },
    #[error("sync engine has stopped")]
    EngineGone,
}

type Reply<T> = oneshot::Sender<Result<T, CommandError>>;

enum EngineMsg {
    Command { cmd: Command, reply: Reply<Confirmed> },
    Seed { bundle: BookingBundle, reply: oneshot::Sender<Outcome> },
    Refresh { reply: Reply<()> },
}

enum Internal {
    Settled { command_id: String, result: Result<Confirmed, ApiError> },
    Resynced { booking_id: BookingId, result: Result<BookingBundle, ApiError> },
}

struct Inflight {
    name: &'static str,
    booking_id: Option<BookingId>,
    optimistic: bool,
    deadline: Instant,
    reply: Option<Reply<Confirmed>>,
}

struct Plan {
    cmd: Command,
    booking_id: Option<BookingId>,
    expected: Option<BookingStatus>,
}

pub fn new_command_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let salt: u16 = rand::thread_rng().gen();
    format!("CL-{nanos}-{salt:04x}")
}

// ---- Engine ----
struct SyncEngine {
    actor: Actor,
    cfg: EngineCfg,
    store: ProjectionStore,
    router: Router,
    backend: Arc<dyn Backend>,
    transport: TransportHandle,
    done_tx: mpsc::UnboundedSender<Internal>,
    snap_tx: watch::Sender<Arc<ProjectionSnapshot>>,
    inflight: HashMap<String, Inflight>,
    resyncing: HashSet<BookingId>,
    ever_connected: bool,
    link_lost: bool,
}

impl SyncEngine {
    fn now(&self) -> DateTime<Utc> { (self.cfg.clock)() }

    fn notify(&self, notice: Notice) {
        self.router.bus().publish(Topic::Notices, &Delivery::Notice(notice));
    }

    fn publish_snapshot(&self) {
        let snap = self.store.snapshot(self.now());
        BOOKINGS_TRACKED.set(snap.bookings.len() as i64);
        self.snap_tx.send_replace(Arc::new(snap));
    }

    fn count_settled(&self, out: &Outcome) {
        match &out.settled {
            Some(Settled::Committed { command_id }) => {
                debug!(booking_id = %out.booking_id, %command_id, "optimistic change confirmed");
                OPTIMISTIC.with_label_values(&["committed"]).inc();
            }
            Some(Settled::Superseded { command_id, server_status }) => {
                info!(booking_id = %out.booking_id, %command_id, %server_status, "optimistic change superseded");
                OPTIMISTIC.with_label_values(&["superseded"]).inc();
            }
            None => {}
        }
    }

    // ---- 1) inbound frames ----
    fn on_frame(&mut self, text: &str) {
        let now = self.now();
        let res = self.router.route_text(&mut self.store, text, now);
        if let Some(out) = &res.outcome {
            self.count_settled(out);
        }
        self.resync(res.resync);
        self.publish_snapshot();
    }

    // ---- 2) commands ----
    fn plan(&self, cmd: Command, now: DateTime<Utc>) -> Result<Plan, GuardError> {
        let actor = &self.actor;
        let booking = |id: &BookingId| self.store.booking(id).ok_or_else(|| GuardError::UnknownBooking(id.clone()));
        let optimistic = |cmd: Command, id: &BookingId, to: BookingStatus| Plan {
            cmd,
            booking_id: Some(id.clone()),
            expected: Some(to),
        };

        match cmd {
            Command::Create(ref req) => {
                machine::check_create(actor, req)?;
                Ok(Plan { cmd, booking_id: None, expected: None })
            }
            Command::Accept(ref id) => {
                machine::check_accept(booking(id)?, actor)?;
                let id = id.clone();
                Ok(optimistic(cmd, &id, BookingStatus::Confirmed))
            }
            Command::Start(ref id) => {
                machine::check_start(booking(id)?, actor)?;
                let id = id.clone();
                Ok(optimistic(cmd, &id, BookingStatus::InProgress))
            }
            Command::Complete(ref id, _) => {
                machine::check_complete(booking(id)?, actor)?;
                let id = id.clone();
                Ok(optimistic(cmd, &id, BookingStatus::Completed))
            }
            Command::Cancel(ref id, _) => {
                machine::check_cancel(booking(id)?, actor)?;
                let id = id.clone();
                Ok(optimistic(cmd, &id, BookingStatus::Cancelled))
            }
            Command::RequestSignature(ref id) => {
                signature::check_request(booking(id)?, self.store.signature_for(id), actor, now)?;
                let id = id.clone();
                Ok(Plan { cmd, booking_id: Some(id), expected: None })
            }
            Command::Sign(ref sig_id, ref req) => {
                let sig = self.store.signature(sig_id).ok_or_else(|| GuardError::UnknownSignature(sig_id.clone()))?;
                let b = booking(&sig.booking_id)?;
                signature::check_sign(sig, b, actor, Some(req.satisfaction_rating), now)?;
                let id = b.id.clone();
                Ok(optimistic(cmd, &id, BookingStatus::Signed))
            }
            Command::Decline(mut req) => {
                req.decline_signature = true;
                let sig = match &req.signature_id {
                    Some(sid) => Some(self.store.signature(sid).ok_or_else(|| GuardError::UnknownSignature(sid.clone()))?),
                    None => self.store.signature_for(&req.booking_id),
                };
                let b = booking(sig.map_or(&req.booking_id, |s| &s.booking_id))?;
                if let Some(s) = sig {
                    signature::check_decline(s, b, actor, now)?;
                }
                let entry = dispute::check_create(b, sig, self.store.disputes_for(&b.id), actor, &req, now)?;
                if let DisputeEntry::FromPendingSignature(sid) = entry {
                    req.signature_id = Some(sid);
                }
                req.booking_id = b.id.clone();
                let id = b.id.clone();
                Ok(optimistic(Command::Decline(req), &id, BookingStatus::Disputed))
            }
            Command::CreateDispute(mut req) => {
                let b = booking(&req.booking_id)?;
                let sig = self.store.signature_for(&b.id);
                let entry = dispute::check_create(b, sig, self.store.disputes_for(&b.id), actor, &req, now)?;
                if let DisputeEntry::FromPendingSignature(sid) = entry {
                    req.signature_id.get_or_insert(sid);
                }
                let id = b.id.clone();
                Ok(optimistic(Command::CreateDispute(req), &id, BookingStatus::Disputed))
            }
            Command::ResolveDispute(ref id, _) => {
                let d = self.store.dispute(id).ok_or_else(|| GuardError::UnknownDispute(id.clone()))?;
                dispute::check_resolve(d, actor)?;
                let booking_id = d.booking_id.clone();
                Ok(Plan { cmd, booking_id: Some(booking_id), expected: None })
            }
            Command::ManualPayment(ref req) => {
                let p = self.store.payment(&req.payment_id).ok_or_else(|| GuardError::UnknownPayment(req.payment_id.clone()))?;
                dispute::check_manual_payment(p, self.store.disputes_for(&p.booking_id), actor, req.amount_minor)?;
                let booking_id = p.booking_id.clone();
                Ok(Plan { cmd, booking_id: Some(booking_id), expected: None })
            }
        }
    }

    fn refuse(&self, name: &'static str, err: GuardError, reply: Reply<Confirmed>) {
        GUARD_REJECTIONS.with_label_values(&[name]).inc();
        info!(command = name, error = %err, "command refused locally");
        let _ = reply.send(Err(err.into()));
    }

    fn dispatch(&mut self, cmd: Command, reply: Reply<Confirmed>) {
        let name = cmd.name();
        let now = self.now();
        let plan = match self.plan(cmd, now) {
            Ok(p) => p,
            Err(e) => return self.refuse(name, e, reply),
        };

        let command_id = new_command_id();
        let deadline = Instant::now() + self.cfg.confirm_timeout;
        if let (Some(id), Some(expected)) = (&plan.booking_id, plan.expected) {
            if let Err(e) = self.store.begin_optimistic(id, &command_id, expected, deadline) {
                return self.refuse(name, e, reply);
            }
            debug!(booking_id = %id, %command_id, %expected, "optimistic change shown");
        }
        self.inflight.insert(
            command_id.clone(),
            Inflight {
                name,
                booking_id: plan.booking_id.clone(),
                optimistic: plan.expected.is_some(),
                deadline,
                reply: Some(reply),
            },
        );
        self.publish_snapshot();

        let backend = self.backend.clone();
        let done = self.done_tx.clone();
        let cmd = plan.cmd;
        tokio::spawn(async move {
            let result = cmd.execute(backend.as_ref()).await;
            let _ = done.send(Internal::Settled { command_id, result });
        });
    }

    fn on_settled(&mut self, command_id: String, result: Result<Confirmed, ApiError>) {
        let flight = self.inflight.remove(&command_id);
        let name = flight.as_ref().map_or("late", |f| f.name);
        let optimistic_on = flight
            .as_ref()
            .filter(|f| f.optimistic)
            .and_then(|f| f.booking_id.clone());
        let now = self.now();

        let answer = match result {
            Ok(confirmed) => {
                let out = match &confirmed {
                    Confirmed::Booking(b) => self.store.upsert_booking(b.clone(), None),
                    Confirmed::Signature(s) => self.store.upsert_signature(s.clone(), now),
                    Confirmed::Dispute(d) => {
                        let mut d = d.clone();
                        // server may not echo the flag back
                        d.decline_signature |= name == "decline_signature";
                        self.store.apply_dispute(d, now)
                    }
                    Confirmed::Payment(p) => self.store.apply_payment(p.clone()),
                };
                self.count_settled(&out);
                if out.needs_resync() {
                    self.resync(vec![out.booking_id.clone()]);
                }
                // server answered without reaching the expected state: its word wins
                if let Some(id) = &optimistic_on {
                    if self.store.rollback(id, &command_id) {
                        info!(booking_id = %id, %command_id, "response did not confirm optimistic change");
                        OPTIMISTIC.with_label_values(&["superseded"]).inc();
                    }
                }
                COMMANDS.with_label_values(&[name, "ok"]).inc();
                info!(command = name, %command_id, "command confirmed");
                Ok(confirmed)
            }
            Err(e) => {
                if let Some(id) = &optimistic_on {
                    if self.store.rollback(id, &command_id) {
                        OPTIMISTIC.with_label_values(&["rolled_back"]).inc();
                    }
                }
                let booking_id = flight.as_ref().and_then(|f| f.booking_id.clone());
                if e.suggests_resync() {
                    self.resync(booking_id.iter().cloned().collect());
                }
                COMMANDS.with_label_values(&[name, "error"]).inc();
                warn!(command = name, %command_id, error = %e, "command failed");
                let mut notice = Notice::new(NoticeLevel::Error, format!("Could not {}: {e}", name.replace('_', " ")));
                notice.booking_id = booking_id;
                self.notify(notice);
                Err(CommandError::Api(e))
            }
        };

        // subscribers see the settled projection before the caller resumes
        self.publish_snapshot();
        if let Some(reply) = flight.and_then(|f| f.reply) {
            let _ = reply.send(answer);
        }
    }

    // ---- 3) resync ----
    fn resync(&mut self, ids: Vec<BookingId>) {
        for id in ids {
            if !self.resyncing.insert(id.clone()) {
                continue;
            }
            debug!(booking_id = %id, "resync scheduled");
            let backend = self.backend.clone();
            let done = self.done_tx.clone();
            tokio::spawn(async move {
                let result = backend.fetch_booking(&id).await;
                let _ = done.send(Internal::Resynced { booking_id: id, result });
            });
        }
    }

    fn on_resynced(&mut self, booking_id: BookingId, result: Result<BookingBundle, ApiError>) {
        self.resyncing.remove(&booking_id);
        match result {
            Ok(bundle) => {
                let out = self.store.replace_bundle(bundle);
                self.count_settled(&out);
                let label = if out.effect == Effect::Stale { "stale" } else { "ok" };
                RESYNCS.with_label_values(&[label]).inc();
                debug!(%booking_id, effect = ?out.effect, "booking resynced");
                self.publish_snapshot();
            }
            Err(e) => {
                RESYNCS.with_label_values(&["error"]).inc();
                warn!(%booking_id, error = %e, "resync failed");
                self.notify(
                    Notice::new(NoticeLevel::Warning, format!("Could not refresh booking {booking_id}; showing last known state"))
                        .about(&booking_id),
                );
            }
        }
    }

    // ---- 4) link ----
    fn on_link(&mut self, state: LinkState) {
        self.router.bus().publish(Topic::Link, &Delivery::Link(state));
        match state {
            LinkState::Connected => {
                if self.link_lost {
                    let ids = self.store.live_booking_ids();
                    info!(bookings = ids.len(), "live channel back; resyncing");
                    self.resync(ids);
                }
                self.link_lost = false;
                self.ever_connected = true;
            }
            LinkState::Unavailable => {
                self.link_lost = true;
                self.notify(Notice::new(
                    NoticeLevel::Warning,
                    "Live updates are unavailable and data may be stale. Refresh to try again.",
                ));
            }
            LinkState::ServerClosed => {
                self.link_lost = true;
                self.notify(Notice::new(
                    NoticeLevel::Warning,
                    "The server closed the live channel; live updates are unavailable and data may be stale. Refresh to reconnect.",
                ));
            }
            LinkState::Connecting | LinkState::Reconnecting { .. } | LinkState::Closed => {
                if self.ever_connected {
                    self.link_lost = true;
                }
            }
        }
    }

    fn on_refresh(&mut self, reply: Reply<()>) {
        let res = self.transport.restart();
        if res.is_ok() {
            self.resync(self.store.booking_ids());
        }
        let _ = reply.send(res.map_err(CommandError::from));
    }

    // ---- 5) timeouts ----
    fn on_tick(&mut self) {
        let now = Instant::now();
        let timeout_ms = self.cfg.confirm_timeout.as_millis() as u64;
        let mut answers: Vec<(Reply<Confirmed>, Result<Confirmed, CommandError>)> = Vec::new();
        let expired = self.store.expire_optimistic(now);
        let rolled_back = !expired.is_empty();

        for (booking_id, o) in expired {
            OPTIMISTIC.with_label_values(&["timed_out"]).inc();
            let flight = self.inflight.remove(&o.command_id);
            let command = flight.as_ref().map_or("change", |f| f.name);
            warn!(%booking_id, command_id = %o.command_id, command, "no confirmation in time; rolled back");
            self.notify(
                Notice::new(
                    NoticeLevel::Error,
                    format!("No confirmation for {} on booking {booking_id}; change undone", command.replace('_', " ")),
                )
                .about(&booking_id),
            );
            if let Some(reply) = flight.and_then(|f| f.reply) {
                answers.push((reply, Err(CommandError::Timeout { command, timeout_ms })));
            }
        }

        // past deadline without an overlay left: already confirmed by push, or never had one
        let late: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for command_id in late {
            let Some(f) = self.inflight.remove(&command_id) else { continue };
            let Some(reply) = f.reply else { continue };
            let confirmed = f
                .booking_id
                .as_ref()
                .filter(|_| f.optimistic)
                .and_then(|id| self.store.booking(id))
                .map(|b| Confirmed::Booking(b.clone()));
            match confirmed {
                Some(c) => {
                    debug!(%command_id, "confirmed by push before the response");
                    answers.push((reply, Ok(c)));
                }
                None => {
                    warn!(%command_id, command = f.name, "no response in time");
                    answers.push((reply, Err(CommandError::Timeout { command: f.name, timeout_ms })));
                }
            }
        }

        if !rolled_back && answers.is_empty() {
            return;
        }
        self.publish_snapshot();
        for (reply, answer) in answers {
            let _ = reply.send(answer);
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineMsg>,
        mut done_rx: mpsc::UnboundedReceiver<Internal>,
        mut frames_rx: mpsc::Receiver<String>,
        mut link_rx: watch::Receiver<LinkState>,
    ) {
        let mut tick = tokio::time::interval(self.cfg.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_open = true;
        let mut link_open = true;

        let initial = *link_rx.borrow_and_update();
        self.on_link(initial);
        self.publish_snapshot();

        loop {
            tokio::select! {
                frame = frames_rx.recv(), if frames_open => match frame {
                    Some(text) => self.on_frame(&text),
                    None => {
                        frames_open = false;
                        debug!("frame stream ended");
                    }
                },
                msg = cmd_rx.recv() => match msg {
                    Some(EngineMsg::Command { cmd, reply }) => self.dispatch(cmd, reply),
                    Some(EngineMsg::Seed { bundle, reply }) => {
                        let out = self.store.replace_bundle(bundle);
                        self.count_settled(&out);
                        self.publish_snapshot();
                        let _ = reply.send(out);
                    }
                    Some(EngineMsg::Refresh { reply }) => self.on_refresh(reply),
                    None => break,
                },
                Some(done) = done_rx.recv() => match done {
                    Internal::Settled { command_id, result } => self.on_settled(command_id, result),
                    Internal::Resynced { booking_id, result } => self.on_resynced(booking_id, result),
                },
                res = link_rx.changed(), if link_open => match res {
                    Ok(()) => {
                        let state = *link_rx.borrow_and_update();
                        self.on_link(state);
                    }
                    Err(_) => link_open = false,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.transport.shutdown();
        info!("sync engine stopped");
    }
}

// ---- Public handle ----
#[derive(Clone)]
pub struct SessionHandle {
    actor: Actor,
    cmd_tx: mpsc::UnboundedSender<EngineMsg>,
    bus: Bus,
    snap_rx: watch::Receiver<Arc<ProjectionSnapshot>>,
    transport: TransportHandle,
    backend: Arc<dyn Backend>,
}

/// Start the engine on an existing transport.
pub fn start(
    ctx: SessionContext,
    backend: Arc<dyn Backend>,
    transport: TransportHandle,
    frames_rx: mpsc::Receiver<String>,
    cfg: EngineCfg,
) -> (SessionHandle, JoinHandle<()>) {
    let actor = ctx.actor();
    let bus = Bus::new();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = watch::channel(Arc::new(ProjectionSnapshot::default()));
    let link_rx = transport.watch();

    let engine = SyncEngine {
        actor: actor.clone(),
        cfg,
        store: ProjectionStore::new(),
        router: Router::new(bus.clone(), ctx.role),
        backend: backend.clone(),
        transport: transport.clone(),
        done_tx,
        snap_tx,
        inflight: HashMap::new(),
        resyncing: HashSet::new(),
        ever_connected: false,
        link_lost: false,
    };
    let task = tokio::spawn(engine.run(cmd_rx, done_rx, frames_rx, link_rx));
    (SessionHandle { actor, cmd_tx, bus, snap_rx, transport, backend }, task)
}

/// Open the live channel for `ctx` and start the engine on it.
pub fn connect(
    ctx: SessionContext,
    backend: Arc<dyn Backend>,
    tcfg: TransportCfg,
    ecfg: EngineCfg,
) -> (SessionHandle, JoinHandle<()>) {
    let (frames_tx, frames_rx) = mpsc::channel(1024);
    let url_ctx = ctx.clone();
    let (transport, _link_task) = transport::spawn(move || url_ctx.ws_url(), tcfg, frames_tx);
    start(ctx, backend, transport, frames_rx, ecfg)
}

impl SessionHandle {
    pub fn actor(&self) -> &Actor { &self.actor }

    async fn call(&self, cmd: Command) -> Result<Confirmed, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineMsg::Command { cmd, reply }).map_err(|_| CommandError::EngineGone)?;
        rx.await.map_err(|_| CommandError::EngineGone)?
    }

    pub async fn create(&self, req: NewBooking) -> Result<Confirmed, CommandError> {
        self.call(Command::Create(req)).await
    }

    pub async fn accept(&self, id: &BookingId) -> Result<Confirmed, CommandError> {
        self.call(Command::Accept(id.clone())).await
    }

    pub async fn start(&self, id: &BookingId) -> Result<Confirmed, CommandError> {
        self.call(Command::Start(id.clone())).await
    }

    pub async fn complete(&self, id: &BookingId, report: CompletionReport) -> Result<Confirmed, CommandError> {
        self.call(Command::Complete(id.clone(), report)).await
    }

    pub async fn request_signature(&self, id: &BookingId) -> Result<Confirmed, CommandError> {
        self.call(Command::RequestSignature(id.clone())).await
    }

    pub async fn sign(&self, id: &SignatureId, rating: u8, comments: Option<String>) -> Result<Confirmed, CommandError> {
        self.call(Command::Sign(id.clone(), SignRequest { satisfaction_rating: rating, comments })).await
    }

    /// Refuse to sign; recorded as a low-severity dispute carrying `reason`.
    pub async fn decline_signature(&self, id: &SignatureId, reason: String) -> Result<Confirmed, CommandError> {
        let booking_id = self
            .snapshot()
            .signatures
            .iter()
            .find(|v| &v.signature.id == id)
            .map(|v| v.signature.booking_id.clone())
            .ok_or_else(|| GuardError::UnknownSignature(id.clone()))?;
        let req = NewDispute {
            booking_id,
            signature_id: Some(id.clone()),
            severity: Severity::Low,
            reason,
            decline_signature: true,
        };
        self.call(Command::Decline(req)).await
    }

    pub async fn cancel(&self, id: &BookingId, reason: Option<String>) -> Result<Confirmed, CommandError> {
        self.call(Command::Cancel(id.clone(), CancelRequest { reason })).await
    }

    pub async fn create_dispute(&self, req: NewDispute) -> Result<Confirmed, CommandError> {
        self.call(Command::CreateDispute(req)).await
    }

    pub async fn resolve_dispute(&self, id: &DisputeId, res: DisputeResolution) -> Result<Confirmed, CommandError> {
        self.call(Command::ResolveDispute(id.clone(), res)).await
    }

    pub async fn process_manual_payment(&self, req: ManualPayment) -> Result<Confirmed, CommandError> {
        self.call(Command::ManualPayment(req)).await
    }

    /// Vendor availability goes over the live socket; fails while disconnected.
    pub fn update_availability(&self, slots: &[AvailabilitySlot]) -> Result<(), CommandError> {
        if self.actor.role != Role::Vendor {
            return Err(GuardError::RoleNotAllowed { action: "update availability", role: self.actor.role }.into());
        }
        let data = serde_json::json!({ "vendor_id": self.actor.user_id, "slots": slots });
        self.transport.send_event("availability_update", &data)?;
        Ok(())
    }

    /// Fetch bookings from the server and put them in the projection.
    pub async fn load(&self, ids: &[BookingId]) -> Result<usize, CommandError> {
        for id in ids {
            let bundle = self.backend.fetch_booking(id).await?;
            let (reply, rx) = oneshot::channel();
            self.cmd_tx.send(EngineMsg::Seed { bundle, reply }).map_err(|_| CommandError::EngineGone)?;
            let out = rx.await.map_err(|_| CommandError::EngineGone)?;
            debug!(booking_id = %out.booking_id, effect = ?out.effect, "booking loaded");
        }
        Ok(ids.len())
    }

    /// Reset the reconnect budget, reconnect, and refetch every known booking.
    pub async fn refresh(&self) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(EngineMsg::Refresh { reply }).map_err(|_| CommandError::EngineGone)?;
        rx.await.map_err(|_| CommandError::EngineGone)?
    }

    pub fn snapshot(&self) -> Arc<ProjectionSnapshot> { self.snap_rx.borrow().clone() }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<ProjectionSnapshot>> { self.snap_rx.clone() }

    pub fn link_state(&self) -> LinkState { self.transport.state() }

    pub fn bus(&self) -> &Bus { &self.bus }

    pub fn subscribe<F>(&self, topics: &[Topic], handler: F) -> Subscription
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        self.bus.on(topics, handler)
    }

    pub fn shutdown(&self) { self.transport.shutdown(); }
}
