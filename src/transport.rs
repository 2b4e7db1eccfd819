// ===============================
// src/transport.rs
// ===============================
//
// One live websocket per session (user_id, role).
// - open     : state Connected, backoff step reset
// - message  : text frames forwarded as-is to the engine (router parses)
// - close    : normal close from server -> ServerClosed until restart(); anything else -> reconnect
// - stable   : connection up for `stable_after` -> retry budget reset
// - cap      : retries exhausted -> Unavailable until restart()
// - send     : only while Connected; nothing is queued across reconnects
//
// URL is re-derived from the session context on every attempt.
//
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::{WS_CONNECTED, WS_LAST_EVENT_TS, WS_RECONNECTS};

#[derive(Debug, Clone)]
pub struct TransportCfg {
    /// First reconnect delay; doubles per failed attempt up to `max_delay`.
    pub reconnect_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub stable_after: Duration,
    /// Upper bound of random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for TransportCfg {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
            stable_after: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl TransportCfg {
    fn delay_for(&self, step: u32) -> Duration {
        let factor = 1u32 << step.min(6);
        let base = self.reconnect_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        // jangan simpan ThreadRng melewati .await
        let jitter = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ms) };
        base + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max: u32 },
    /// Retry budget exhausted; live updates are stale until a manual refresh.
    Unavailable,
    /// Server ended the channel with a normal close. No automatic reconnect,
    /// restart() still works.
    ServerClosed,
    Closed,
}

impl LinkState {
    pub fn is_connected(&self) -> bool { matches!(self, LinkState::Connected) }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("live connection is not open")]
    NotConnected,
    #[error("transport task has stopped")]
    Closed,
    #[error("bad websocket url: {0}")]
    Url(#[from] url::ParseError),
    #[error("cannot encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Restart,
    Shutdown,
}

/// Cheap, cloneable handle to the transport task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    out_tx: mpsc::UnboundedSender<String>,
    state_rx: watch::Receiver<LinkState>,
    control_tx: mpsc::UnboundedSender<Control>,
}

impl TransportHandle {
    /// Send a raw text frame. Fails instead of queueing while not connected.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        let state = *self.state_rx.borrow();
        if !state.is_connected() {
            warn!(?state, "send dropped: socket not open");
            return Err(TransportError::NotConnected);
        }
        self.out_tx.send(text).map_err(|_| TransportError::Closed)
    }

    /// `{type, data}` envelope, same shape the server pushes.
    pub fn send_event<T: Serialize>(&self, kind: &str, data: &T) -> Result<(), TransportError> {
        let frame = serde_json::json!({ "type": kind, "data": data });
        self.send(serde_json::to_string(&frame)?)
    }

    pub fn state(&self) -> LinkState { *self.state_rx.borrow() }

    pub fn watch(&self) -> watch::Receiver<LinkState> { self.state_rx.clone() }

    /// Reset the retry budget and reconnect now.
    pub fn restart(&self) -> Result<(), TransportError> {
        self.control_tx.send(Control::Restart).map_err(|_| TransportError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }
}

pub fn spawn<F>(url_for: F, cfg: TransportCfg, frames_tx: mpsc::Sender<String>) -> (TransportHandle, JoinHandle<()>)
where
    F: Fn() -> Result<Url, TransportError> + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(url_for, cfg, frames_tx, out_rx, state_tx, control_rx));
    (TransportHandle { out_tx, state_rx, control_tx }, task)
}

enum SessionEnd {
    /// Server sent a normal close.
    ServerClosed,
    Lost,
    Restart,
    Shutdown,
}

struct Link {
    cfg: TransportCfg,
    frames_tx: mpsc::Sender<String>,
    out_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<LinkState>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    /// Failed attempts since the last stable period.
    retries: u32,
    /// Backoff exponent, reset on every successful open.
    backoff: u32,
}

impl Link {
    fn set(&self, state: LinkState) {
        WS_CONNECTED.set(i64::from(state.is_connected()));
        let _ = self.state_tx.send(state);
    }

    fn reset_budget(&mut self) {
        self.retries = 0;
        self.backoff = 0;
    }
}

async fn run<F>(
    url_for: F,
    cfg: TransportCfg,
    frames_tx: mpsc::Sender<String>,
    out_rx: mpsc::UnboundedReceiver<String>,
    state_tx: watch::Sender<LinkState>,
    control_rx: mpsc::UnboundedReceiver<Control>,
) where
    F: Fn() -> Result<Url, TransportError>,
{
    let mut link = Link { cfg, frames_tx, out_rx, state_tx, control_rx, retries: 0, backoff: 0 };

    loop {
        // 1) connect (or fail) -----------------------------------------
        let outcome = match url_for() {
            Ok(url) => {
                info!(host = url.host_str().unwrap_or(""), path = url.path(), "connecting live channel");
                tokio::select! {
                    r = connect_async(url.as_str()) => Some(r),
                    ctl = link.control_rx.recv() => match ctl {
                        Some(Control::Restart) => { link.reset_budget(); continue; }
                        Some(Control::Shutdown) | None => break,
                    },
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot derive websocket url");
                None
            }
        };

        // 2) live session ------------------------------------------------
        if let Some(result) = outcome {
            match result {
                Ok((ws, _resp)) => {
                    // drop anything queued for the previous connection
                    let mut stale = 0usize;
                    while link.out_rx.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        warn!(stale, "discarded outbound frames from previous connection");
                    }
                    link.backoff = 0;
                    link.set(LinkState::Connected);
                    info!("live channel connected");

                    match session(&mut link, ws).await {
                        SessionEnd::ServerClosed => {
                            info!("server closed the live channel; waiting for restart");
                            link.set(LinkState::ServerClosed);
                            match link.control_rx.recv().await {
                                Some(Control::Restart) => {
                                    link.reset_budget();
                                    link.set(LinkState::Connecting);
                                    continue;
                                }
                                Some(Control::Shutdown) | None => break,
                            }
                        }
                        SessionEnd::Shutdown => break,
                        SessionEnd::Restart => {
                            link.reset_budget();
                            link.set(LinkState::Connecting);
                            continue;
                        }
                        SessionEnd::Lost => info!("live channel lost, will reconnect…"),
                    }
                }
                Err(e) => warn!(error = %e, "connect failed"),
            }
        }

        // 3) backoff or give up -----------------------------------------
        link.retries = link.retries.saturating_add(1);
        if link.retries > link.cfg.max_retries {
            warn!(max = link.cfg.max_retries, "reconnect budget exhausted; live updates unavailable");
            link.set(LinkState::Unavailable);
            match link.control_rx.recv().await {
                Some(Control::Restart) => {
                    link.reset_budget();
                    link.set(LinkState::Connecting);
                    continue;
                }
                Some(Control::Shutdown) | None => break,
            }
        }

        WS_RECONNECTS.inc();
        let delay = link.cfg.delay_for(link.backoff);
        link.backoff = link.backoff.saturating_add(1);
        link.set(LinkState::Reconnecting { attempt: link.retries, max: link.cfg.max_retries });
        debug!(attempt = link.retries, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = sleep(delay) => {}
            ctl = link.control_rx.recv() => match ctl {
                Some(Control::Restart) => link.reset_budget(),
                Some(Control::Shutdown) | None => break,
            },
        }
    }

    link.set(LinkState::Closed);
}

async fn session<S>(link: &mut Link, ws: tokio_tungstenite::WebSocketStream<S>) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let stable = sleep(link.cfg.stable_after);
    tokio::pin!(stable);
    let mut stable_done = false;
    let opened = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    WS_LAST_EVENT_TS.set(Utc::now().timestamp());
                    if link.frames_tx.send(text).await.is_err() {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Ping(p))) => {
                    let _ = sink.send(Message::Pong(p)).await;
                }
                Some(Ok(Message::Close(cf))) => {
                    let normal = cf.as_ref().is_some_and(|c| c.code == CloseCode::Normal);
                    debug!(?cf, "close frame");
                    return if normal { SessionEnd::ServerClosed } else { SessionEnd::Lost };
                }
                Some(Ok(_)) => {
                    // binary / pong: ignore
                }
                Some(Err(e)) => {
                    warn!(error = %e, "ws read error");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
            out = link.out_rx.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "ws write error");
                        return SessionEnd::Lost;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            },
            ctl = link.control_rx.recv() => {
                let _ = sink.close().await;
                return match ctl {
                    Some(Control::Restart) => SessionEnd::Restart,
                    Some(Control::Shutdown) | None => SessionEnd::Shutdown,
                };
            }
            _ = &mut stable, if !stable_done => {
                stable_done = true;
                if link.retries > 0 {
                    debug!(up_for_ms = opened.elapsed().as_millis() as u64, "link stable, retry budget reset");
                }
                link.retries = 0;
            }
        }
    }
}

/// Handle wired to in-memory channels instead of a socket.
#[cfg(test)]
pub struct TestLink {
    pub out_rx: mpsc::UnboundedReceiver<String>,
    pub state_tx: watch::Sender<LinkState>,
}

#[cfg(test)]
pub fn test_link(initial: LinkState) -> (TransportHandle, TestLink) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(initial);
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();
    // restart() on a test link reports Connected straight away
    let restart_state = state_tx.clone();
    tokio::spawn(async move {
        while let Some(ctl) = control_rx.recv().await {
            if ctl == Control::Restart {
                let _ = restart_state.send(LinkState::Connected);
            }
        }
    });
    (TransportHandle { out_tx, state_rx, control_tx }, TestLink { out_rx, state_tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn quick_cfg(max_retries: u32) -> TransportCfg {
        TransportCfg {
            reconnect_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            max_retries,
            stable_after: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<LinkState>, want: fn(&LinkState) -> bool) -> LinkState {
        timeout(Duration::from_secs(5), async {
            loop {
                let s = *rx.borrow_and_update();
                if want(&s) {
                    return s;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = quick_cfg(3);
        assert_eq!(cfg.delay_for(0), Duration::from_millis(20));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(40));
        assert_eq!(cfg.delay_for(5), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn reconnects_after_abrupt_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // first connection: one frame, then vanish without a close frame
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("first".into())).await.unwrap();
            drop(ws);
            // second connection: keep it open
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("second".into())).await.unwrap();
            let echoed = ws.next().await;
            (ws, echoed)
        });

        let (frames_tx, mut frames_rx) = mpsc::channel(16);
        let url = format!("ws://{addr}/ws/vendor/V1/");
        let (handle, _task) = spawn(move || Ok(Url::parse(&url)?), quick_cfg(3), frames_tx);

        assert_eq!(frames_rx.recv().await.as_deref(), Some("first"));
        assert_eq!(frames_rx.recv().await.as_deref(), Some("second"));
        let mut states = handle.watch();
        wait_for(&mut states, LinkState::is_connected).await;
        handle.send("ping-back".into()).unwrap();

        let (_ws, echoed) = server.await.unwrap();
        assert!(matches!(echoed, Some(Ok(Message::Text(t))) if t == "ping-back"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn gives_up_after_cap_and_refuses_sends() {
        // nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (frames_tx, _frames_rx) = mpsc::channel(4);
        let url = format!("ws://{addr}/ws/customer/C1/");
        let (handle, _task) = spawn(move || Ok(Url::parse(&url)?), quick_cfg(2), frames_tx);

        let mut states = handle.watch();
        let s = wait_for(&mut states, |s| *s == LinkState::Unavailable).await;
        assert_eq!(s, LinkState::Unavailable);
        assert!(matches!(handle.send("accept".into()), Err(TransportError::NotConnected)));
        handle.shutdown();
    }

    #[tokio::test]
    async fn normal_server_close_parks_until_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // first connection: polite close
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = ws
                .close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                    code: CloseCode::Normal,
                    reason: "bye".into(),
                }))
                .await;
            // hold the socket until the client answers the close
            while let Some(Ok(_)) = ws.next().await {}
            // second connection only comes from restart()
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("back".into())).await.unwrap();
            ws
        });

        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let url = format!("ws://{addr}/ws/customer/C1/");
        let (handle, task) = spawn(move || Ok(Url::parse(&url)?), quick_cfg(3), frames_tx);

        let mut states = handle.watch();
        wait_for(&mut states, |s| *s == LinkState::ServerClosed).await;
        // no reconnect on its own
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.state(), LinkState::ServerClosed);
        assert!(!task.is_finished());
        assert!(matches!(handle.send("accept".into()), Err(TransportError::NotConnected)));

        handle.restart().unwrap();
        assert_eq!(timeout(Duration::from_secs(5), frames_rx.recv()).await.unwrap().as_deref(), Some("back"));
        wait_for(&mut states, LinkState::is_connected).await;
        let _ws = server.await.unwrap();

        handle.shutdown();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.state(), LinkState::Closed);
    }
}
