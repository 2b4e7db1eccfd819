// ===============================
// src/recorder.rs
// ===============================
//
// JSONL audit log of what the session saw on its bus:
// - one line per routed event, notice or link change: {"at": ..., "delivery": ...}
// - BufWriter, flushed every second and every 500 lines
// - parent directory created on open
// - on a failed write: reopen once, then drop the line
//
// ENV: `RECORD_FILE=/path/to/session.jsonl` turns it on (see main.rs).
//
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::router::Delivery;

const FLUSH_EVERY: u32 = 500;

#[derive(Serialize)]
struct Line<'a> {
    at: DateTime<Utc>,
    delivery: &'a Delivery,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Runs until `rx` closes. Fails only if the file cannot be opened at start.
pub async fn run(mut rx: mpsc::UnboundedReceiver<Delivery>, path: String) -> std::io::Result<()> {
    let mut writer = open_writer(&path).await?;
    info!(%path, "recorder started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(delivery) = maybe else { break };
                let line = match serde_json::to_string(&Line { at: Utc::now(), delivery: &delivery }) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, "recorder: serialize failed, line skipped");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    warn!(error = %e, "recorder: write failed, reopening");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e) => {
                            error!(error = %e, %path, "recorder: reopen failed, line dropped");
                            continue;
                        }
                    }
                    if let Err(e) = write_line(&mut writer, &line).await {
                        error!(error = %e, "recorder: write failed again, line dropped");
                        continue;
                    }
                }
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }
            _ = tick.tick() => {
                if since_flush > 0 {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }
        }
    }

    writer.flush().await?;
    info!("recorder: channel closed, stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NoticeLevel;
    use crate::router::Notice;
    use crate::transport::LinkState;

    #[tokio::test]
    async fn writes_one_json_line_per_delivery() {
        let dir = std::env::temp_dir().join(format!("hs-rec-{}", std::process::id()));
        let path = dir.join("nested").join("session.jsonl");
        let path_str = path.to_string_lossy().to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, path_str));
        tx.send(Delivery::Link(LinkState::Connected)).unwrap();
        tx.send(Delivery::Notice(Notice::new(NoticeLevel::Warning, "live updates unavailable"))).unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.get("at").is_some()));
        assert!(text.contains("live updates unavailable"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
