// ===============================
// src/config.rs
// ===============================
//
// Flags with env fallbacks. `.env` is read first so the same keys work from
// a file, the shell, or the command line (flag wins).
//
use std::time::Duration;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use thiserror::Error;
use url::Url;

use crate::domain::{BookingId, DisputeId, PaymentId, Role, Severity, SignatureId, UserId};
use crate::session::{EngineCfg, SessionContext};
use crate::transport::TransportCfg;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("{key} is not a valid url: {value}")]
    InvalidUrl { key: &'static str, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Parser)]
#[command(name = "homeservice_sync", version, about = "Booking lifecycle sync client for the home-services marketplace")]
pub struct Cli {
    #[arg(long, env = "USER_ID")]
    pub user_id: String,

    /// customer | vendor | onboarding_manager | operations_manager | super_admin
    #[arg(long, env = "ROLE", value_parser = parse_role)]
    pub role: Role,

    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:8000")]
    pub api_base: String,

    /// Defaults to API_BASE_URL with the scheme switched to ws/wss.
    #[arg(long, env = "WS_BASE_URL")]
    pub ws_base: Option<String>,

    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    // ---- Live channel ----
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value_t = 3_000)]
    pub reconnect_delay_ms: u64,

    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub max_reconnect_attempts: u32,

    /// Connected this long resets the retry counter.
    #[arg(long, env = "STABLE_AFTER_SECS", default_value_t = 30)]
    pub stable_after_secs: u64,

    // ---- Commands ----
    #[arg(long, env = "CONFIRM_TIMEOUT_MS", default_value_t = 10_000)]
    pub confirm_timeout_ms: u64,

    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 15_000)]
    pub request_timeout_ms: u64,

    // ---- files/metrics ----
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    /// Bookings to load at startup, comma separated.
    #[arg(long, env = "BOOKINGS", value_delimiter = ',')]
    pub bookings: Vec<String>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Action {
    /// Stay connected and log events (default).
    Watch,
    Accept { booking: String },
    Start { booking: String },
    Complete {
        booking: String,
        #[arg(long)]
        notes: Option<String>,
    },
    RequestSignature { booking: String },
    Sign {
        signature: String,
        #[arg(long)]
        booking: String,
        /// 1..=5
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        comments: Option<String>,
    },
    Decline {
        signature: String,
        #[arg(long)]
        booking: String,
        #[arg(long)]
        reason: String,
    },
    Cancel {
        booking: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Dispute {
        booking: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "medium", value_parser = parse_severity)]
        severity: Severity,
    },
    Resolve {
        dispute: String,
        /// Booking the dispute belongs to (loaded first).
        #[arg(long)]
        booking: String,
        #[arg(long)]
        notes: String,
        #[arg(long)]
        amount_minor: Option<i64>,
        #[arg(long)]
        release_payment: bool,
    },
    ManualPayment {
        payment: String,
        #[arg(long)]
        booking: String,
        #[arg(long)]
        amount_minor: i64,
        #[arg(long)]
        note: Option<String>,
    },
}

impl Action {
    /// Bookings the action needs in the projection before its guard can run.
    pub fn bookings(&self) -> Vec<BookingId> {
        match self {
            Action::Watch => vec![],
            Action::Accept { booking }
            | Action::Start { booking }
            | Action::Complete { booking, .. }
            | Action::RequestSignature { booking }
            | Action::Sign { booking, .. }
            | Action::Decline { booking, .. }
            | Action::Cancel { booking, .. }
            | Action::Dispute { booking, .. }
            | Action::Resolve { booking, .. }
            | Action::ManualPayment { booking, .. } => vec![BookingId::new(booking.as_str())],
        }
    }

    pub fn dispute_id(&self) -> Option<DisputeId> {
        match self {
            Action::Resolve { dispute, .. } => Some(DisputeId::new(dispute.as_str())),
            _ => None,
        }
    }

    pub fn payment_id(&self) -> Option<PaymentId> {
        match self {
            Action::ManualPayment { payment, .. } => Some(PaymentId::new(payment.as_str())),
            _ => None,
        }
    }

    pub fn signature_id(&self) -> Option<SignatureId> {
        match self {
            Action::Sign { signature, .. } | Action::Decline { signature, .. } => Some(SignatureId::new(signature.as_str())),
            _ => None,
        }
    }
}

fn parse_role(s: &str) -> Result<Role, String> { s.parse() }

fn parse_severity(s: &str) -> Result<Severity, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => Err(format!("unknown severity {other:?}")),
    }
}

/// http(s) base -> ws(s) base
fn derive_ws_base(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_base.to_string()
    }
}

#[derive(Clone)]
pub struct Settings {
    pub session: SessionContext,
    pub transport: TransportCfg,
    pub engine: EngineCfg,
    pub request_timeout: Duration,
    pub metrics_port: u16,
    pub record_file: Option<String>,
    pub bookings: Vec<BookingId>,
    pub action: Action,
}

pub fn load() -> Result<Settings, ConfigError> {
    // Pastikan .env dibaca sebelum clap melihat env
    let _ = dotenv();
    from_cli(Cli::try_parse()?)
}

pub fn from_cli(cli: Cli) -> Result<Settings, ConfigError> {
    if cli.user_id.trim().is_empty() {
        return Err(ConfigError::Empty("USER_ID"));
    }
    let api_base = cli.api_base.trim_end_matches('/').to_string();
    Url::parse(&api_base).map_err(|_| ConfigError::InvalidUrl { key: "API_BASE_URL", value: api_base.clone() })?;

    let ws_base = cli
        .ws_base
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|| derive_ws_base(&api_base));
    match Url::parse(&ws_base) {
        Ok(u) if matches!(u.scheme(), "ws" | "wss") => {}
        _ => return Err(ConfigError::InvalidUrl { key: "WS_BASE_URL", value: ws_base }),
    }

    let transport = TransportCfg {
        reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
        max_retries: cli.max_reconnect_attempts,
        stable_after: Duration::from_secs(cli.stable_after_secs),
        ..TransportCfg::default()
    };
    let engine = EngineCfg { confirm_timeout: Duration::from_millis(cli.confirm_timeout_ms), ..EngineCfg::default() };

    Ok(Settings {
        session: SessionContext {
            user_id: UserId::new(cli.user_id.trim()),
            role: cli.role,
            api_base,
            ws_base,
            token: cli.token.filter(|t| !t.is_empty()),
        },
        transport,
        engine,
        request_timeout: Duration::from_millis(cli.request_timeout_ms),
        metrics_port: cli.metrics_port,
        record_file: cli.record_file.filter(|p| !p.is_empty()),
        bookings: cli
            .bookings
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(BookingId::new)
            .collect(),
        action: cli.action.unwrap_or(Action::Watch),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Result<Settings, ConfigError> {
        let mut argv = vec!["homeservice_sync"];
        argv.extend_from_slice(args);
        from_cli(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ws_base_follows_api_scheme() {
        let s = parse(&["--user-id", "u1", "--role", "vendor", "--api-base", "https://api.example.com/"]).unwrap();
        assert_eq!(s.session.api_base, "https://api.example.com");
        assert_eq!(s.session.ws_base, "wss://api.example.com");
        assert_eq!(s.action, Action::Watch);
        assert_eq!(s.transport.max_retries, 5);
        assert_eq!(s.transport.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn explicit_ws_base_must_be_websocket() {
        let err = parse(&["--user-id", "u1", "--role", "customer", "--ws-base", "http://rt.example.com"]);
        assert!(matches!(err, Err(ConfigError::InvalidUrl { key: "WS_BASE_URL", .. })));
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(matches!(parse(&["--user-id", "u1", "--role", "plumber"]), Err(ConfigError::Cli(_))));
    }

    #[test]
    fn subcommands_carry_their_bookings() {
        let s = parse(&[
            "--user-id", "ops1", "--role", "ops", "--bookings", "B1, B2",
            "resolve", "D9", "--booking", "B1", "--notes", "refund half", "--release-payment",
        ])
        .unwrap();
        assert_eq!(s.bookings, vec![BookingId::from("B1"), BookingId::from("B2")]);
        assert_eq!(s.action.bookings(), vec![BookingId::from("B1")]);
        assert_eq!(s.action.dispute_id(), Some(DisputeId::from("D9")));
        assert!(matches!(s.action, Action::Resolve { release_payment: true, .. }));
    }

    #[test]
    fn sign_needs_a_rating() {
        assert!(parse(&["--user-id", "c1", "--role", "customer", "sign", "S1", "--booking", "B1"]).is_err());
        let s = parse(&["--user-id", "c1", "--role", "customer", "sign", "S1", "--booking", "B1", "--rating", "4"]).unwrap();
        assert_eq!(s.action.signature_id(), Some(SignatureId::from("S1")));
    }
}
