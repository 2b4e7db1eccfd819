// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Metric names are static; construction only fails on an invalid name.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static counter definition")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("static counter definition")
}

// -------- Inbound stream --------
pub static FRAMES: Lazy<IntCounter> = Lazy::new(|| counter("ws_frames_total", "text frames received"));

pub static MALFORMED_FRAMES: Lazy<IntCounter> =
    Lazy::new(|| counter("ws_frames_malformed_total", "frames dropped: bad envelope or payload"));

pub static UNKNOWN_KINDS: Lazy<IntCounter> =
    Lazy::new(|| counter("ws_frames_unknown_kind_total", "frames with an event kind we do not handle"));

pub static EVENTS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "events_total",
        "routed events by kind and effect (applied, duplicate, stale, resync)",
        &["kind", "effect"],
    )
});

pub static RESYNCS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("resync_fetch_total", "targeted booking refetches (label: result)", &["result"]));

// -------- Commands --------
pub static COMMANDS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("commands_total", "commands by name and result", &["command", "result"]));

pub static GUARD_REJECTIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("guard_rejections_total", "commands refused locally before any network call", &["command"]));

pub static OPTIMISTIC: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "optimistic_settled_total",
        "optimistic overlays by outcome (committed, superseded, rolled_back, timed_out)",
        &["outcome"],
    )
});

// -------- Link health --------
pub static WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_connected", "1 if the live socket is open, 0 otherwise").expect("static gauge definition"));

pub static WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("ws_reconnects_total", "reconnect attempts after a lost connection"));

pub static WS_LAST_EVENT_TS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("ws_last_event_ts", "Unix seconds of the last received frame").expect("static gauge definition")
});

// ---- Session visibility ----
pub static SESSION_ROLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("session_role", "active session role (label: role)"), &["role"])
        .expect("static gauge definition")
});

pub static BOOKINGS_TRACKED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("bookings_tracked", "bookings held in the local projection").expect("static gauge definition"));

pub fn init() {
    // Register all metrics to the custom registry; a second init is a no-op
    for m in [
        REGISTRY.register(Box::new(FRAMES.clone())),
        REGISTRY.register(Box::new(MALFORMED_FRAMES.clone())),
        REGISTRY.register(Box::new(UNKNOWN_KINDS.clone())),
        REGISTRY.register(Box::new(EVENTS_APPLIED.clone())),
        REGISTRY.register(Box::new(RESYNCS.clone())),
        REGISTRY.register(Box::new(COMMANDS.clone())),
        REGISTRY.register(Box::new(GUARD_REJECTIONS.clone())),
        REGISTRY.register(Box::new(OPTIMISTIC.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_LAST_EVENT_TS.clone())),
        REGISTRY.register(Box::new(SESSION_ROLE.clone())),
        REGISTRY.register(Box::new(BOOKINGS_TRACKED.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Bind, then serve on a dedicated OS thread (keeps Tokio runtime clean).
pub fn serve_metrics(port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "metrics listening (GET / or /metrics)");
    thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(error = %e, "metrics accept error"),
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_show_up_in_text_output() {
        init();
        init();
        FRAMES.inc();
        EVENTS_APPLIED.with_label_values(&["booking_status_change", "applied"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ws_frames_total"));
        assert!(text.contains("events_total{effect=\"applied\",kind=\"booking_status_change\"}"));
    }
}
