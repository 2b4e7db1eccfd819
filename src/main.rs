// ===============================
// src/main.rs
// ===============================
/*
 # watch as a vendor, two bookings preloaded
 USER_ID=v-17 ROLE=vendor BOOKINGS=B1,B2 cargo run --release

 # one-shot actions (exit code 0 = confirmed by server)
 USER_ID=v-17 ROLE=vendor cargo run -- accept B1
 USER_ID=c-3 ROLE=customer cargo run -- sign S-B1 --booking B1 --rating 5

 # live channel + sync health
 curl -s localhost:9898/metrics | egrep '^(ws_connected|ws_reconnects_total|resync_fetch_total)'
 curl -s localhost:9898/metrics | grep '^optimistic_settled_total'
*/
/*
=============================================================================
Project : homeservice_sync — booking lifecycle sync client in Rust
Module  : <module_name>.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Holds a live projection of bookings, signatures, payments and
          disputes for one authenticated session. Applies server push events
          idempotently over a reconnecting websocket, guards commands locally
          before they reach the REST API, shows optimistic state with a
          confirmation deadline, and exposes Prometheus metrics plus an
          optional JSONL audit log.
=============================================================================
*/
mod domain;
mod machine;
mod signature;
mod dispute;
mod store;
mod router;      // frame decode + handlers + pub/sub bus
mod transport;   // websocket with bounded reconnect
mod api;         // REST command surface
mod session;     // single-owner sync engine
mod config;
mod metrics;
mod recorder;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use tokio::{select, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{Backend, HttpBackend};
use crate::config::{Action, ConfigError};
use crate::domain::{
    CompletionReport, DisputeId, DisputeResolution, ManualPayment, NewDispute, NoticeLevel, PaymentId,
    SignatureId,
};
use crate::router::{Delivery, Topic};
use crate::session::{CommandError, Confirmed, SessionHandle};

async fn run_action(s: &SessionHandle, action: Action) -> Result<Option<Confirmed>, CommandError> {
    let done = match action {
        Action::Watch => return Ok(None),
        Action::Accept { booking } => s.accept(&booking.as_str().into()).await?,
        Action::Start { booking } => s.start(&booking.as_str().into()).await?,
        Action::Complete { booking, notes } => s.complete(&booking.as_str().into(), CompletionReport { notes }).await?,
        Action::RequestSignature { booking } => s.request_signature(&booking.as_str().into()).await?,
        Action::Sign { signature, rating, comments, .. } => {
            s.sign(&SignatureId::new(signature), rating, comments).await?
        }
        Action::Decline { signature, reason, .. } => s.decline_signature(&SignatureId::new(signature), reason).await?,
        Action::Cancel { booking, reason } => s.cancel(&booking.as_str().into(), reason).await?,
        Action::Dispute { booking, reason, severity } => {
            let req = NewDispute {
                booking_id: booking.as_str().into(),
                signature_id: None,
                severity,
                reason,
                decline_signature: false,
            };
            s.create_dispute(req).await?
        }
        Action::Resolve { dispute, notes, amount_minor, release_payment, .. } => {
            let res = DisputeResolution { resolution_notes: notes, resolution_amount_minor: amount_minor, release_payment };
            s.resolve_dispute(&DisputeId::new(dispute), res).await?
        }
        Action::ManualPayment { payment, amount_minor, note, .. } => {
            let req = ManualPayment { payment_id: PaymentId::new(payment), amount_minor, note };
            s.process_manual_payment(req).await?
        }
    };
    Ok(Some(done))
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Load config ----
    let settings = match config::load() {
        Ok(s) => s,
        Err(ConfigError::Cli(e)) => e.exit(),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let ctx = settings.session.clone();

    // ---- Metrics ----
    metrics::init();
    if let Err(e) = metrics::serve_metrics(settings.metrics_port) {
        warn!(port = settings.metrics_port, error = %e, "metrics endpoint disabled");
    }
    metrics::SESSION_ROLE.with_label_values(&[ctx.role.as_str()]).set(1);

    info!(
        user_id = %ctx.user_id,
        role = %ctx.role,
        api = %ctx.api_base,
        ws = %ctx.ws_base,
        max_reconnects = settings.transport.max_retries,
        confirm_timeout_ms = settings.engine.confirm_timeout.as_millis() as u64,
        action = ?settings.action,
        "startup config"
    );

    // ---- REST backend + session ----
    let backend: Arc<dyn Backend> = match HttpBackend::new(&ctx.api_base, ctx.token.clone(), settings.request_timeout) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            error!(error = %e, "cannot build REST client");
            std::process::exit(1);
        }
    };
    let (session, mut engine) = session::connect(ctx.clone(), backend, settings.transport.clone(), settings.engine.clone());

    // ---- Recorder (optional) ----
    let _record_sub = settings.record_file.clone().map(|path| {
        let mut topics = Topic::all_events();
        topics.extend([Topic::Notices, Topic::Link]);
        let (sub, rx) = session.bus().channel(&topics);
        tokio::spawn(async move {
            if let Err(e) = recorder::run(rx, path.clone()).await {
                error!(error = %e, %path, "recorder could not start");
            }
        });
        sub
    });

    // ---- Notices -> log ----
    let _notice_sub = session.subscribe(&[Topic::Notices, Topic::Link], |d| match d {
        Delivery::Notice(n) => match n.level {
            NoticeLevel::Error | NoticeLevel::Warning => warn!(booking_id = ?n.booking_id, "{}", n.text),
            NoticeLevel::Info | NoticeLevel::Success => info!(booking_id = ?n.booking_id, "{}", n.text),
        },
        Delivery::Link(state) => info!(?state, "live channel"),
        Delivery::Event(_) => {}
    });

    // ---- Initial load ----
    let mut ids = settings.bookings.clone();
    for id in settings.action.bookings() {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if !ids.is_empty() {
        match session.load(&ids).await {
            Ok(n) => info!(bookings = n, "projection loaded"),
            Err(e) => warn!(error = %e, "initial load incomplete"),
        }
    }
    // referenced entity not in the loaded bundle -> the guard will refuse it
    let snap = session.snapshot();
    if let Some(id) = settings.action.signature_id() {
        if !snap.signatures.iter().any(|v| v.signature.id == id) {
            warn!(signature_id = %id, "signature not in projection");
        }
    }
    if let Some(id) = settings.action.dispute_id() {
        if !snap.disputes.iter().any(|d| d.id == id) {
            warn!(dispute_id = %id, "dispute not in projection");
        }
    }
    if let Some(id) = settings.action.payment_id() {
        if !snap.payments.iter().any(|p| p.id == id) {
            warn!(payment_id = %id, "payment not in projection");
        }
    }

    // ---- One-shot action ----
    if settings.action != Action::Watch {
        let code = match run_action(&session, settings.action.clone()).await {
            Ok(done) => {
                info!(result = ?done, "command confirmed");
                0
            }
            Err(e) => {
                error!(error = %e, "command failed");
                1
            }
        };
        session.shutdown();
        std::process::exit(code);
    }

    // ---- Heartbeat ----
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                session.shutdown();
                break;
            }
            res = &mut engine => {
                warn!(?res, "sync engine exited");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                let snap = session.snapshot();
                let pending = snap.bookings.iter().filter(|b| b.pending_command.is_some()).count();
                info!(bookings = snap.bookings.len(), pending, link = ?session.link_state(), "heartbeat");
            }
        }
    }
}
