// ===============================
// src/api.rs (REST command surface)
// ===============================
//
// Every command is one request returning the updated entity or a structured error.
// Responses may wrap the entity ({"booking": {...}}) or send it bare; both decode.
// `fetch_booking` is the targeted resync used after desync or reconnect.
//
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{
    Booking, BookingBundle, BookingId, CancelRequest, CompletionReport, Dispute, DisputeId,
    DisputeResolution, ManualPayment, NewBooking, NewDispute, Payment, SignRequest, Signature,
    SignatureId,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("server rejected request ({status}): {message}")]
    Http { status: u16, code: Option<String>, message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bad api url: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    /// 404/409/422 mean the server disagrees with our view of the entity.
    pub fn suggests_resync(&self) -> bool {
        matches!(self, ApiError::Http { status: 404 | 409 | 422, .. })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_booking(&self, req: &NewBooking) -> Result<Booking, ApiError>;
    async fn accept(&self, id: &BookingId) -> Result<Booking, ApiError>;
    async fn start(&self, id: &BookingId) -> Result<Booking, ApiError>;
    async fn complete(&self, id: &BookingId, report: &CompletionReport) -> Result<Booking, ApiError>;
    async fn request_signature(&self, id: &BookingId) -> Result<Signature, ApiError>;
    async fn sign(&self, id: &SignatureId, req: &SignRequest) -> Result<Signature, ApiError>;
    async fn cancel(&self, id: &BookingId, req: &CancelRequest) -> Result<Booking, ApiError>;
    async fn create_dispute(&self, req: &NewDispute) -> Result<Dispute, ApiError>;
    async fn resolve_dispute(&self, id: &DisputeId, req: &DisputeResolution) -> Result<Dispute, ApiError>;
    async fn process_manual_payment(&self, req: &ManualPayment) -> Result<Payment, ApiError>;
    async fn fetch_booking(&self, id: &BookingId) -> Result<BookingBundle, ApiError>;
}

/// Backend over HTTPS + bearer token.
pub struct HttpBackend {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        // validate once; request urls are built from the trimmed string
        Url::parse(api_base)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base: api_base.trim_end_matches('/').to_string(), token })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(Url::parse(&format!("{}{}", self.base, path))?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, entity: &str) -> Result<T, ApiError> {
        let mut rq = self.http.get(self.url(path)?);
        if let Some(t) = &self.token {
            rq = rq.bearer_auth(t);
        }
        self.finish(rq, path, entity).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        entity: &str,
    ) -> Result<T, ApiError> {
        let mut rq = self.http.post(self.url(path)?).json(body);
        if let Some(t) = &self.token {
            rq = rq.bearer_auth(t);
        }
        self.finish(rq, path, entity).await
    }

    async fn finish<T: DeserializeOwned>(
        &self,
        rq: reqwest::RequestBuilder,
        path: &str,
        entity: &str,
    ) -> Result<T, ApiError> {
        let rsp = rq.send().await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            let err = error_from_body(status.as_u16(), &body);
            warn!(%path, status = status.as_u16(), error = %err, "request rejected");
            return Err(err);
        }
        debug!(%path, status = status.as_u16(), "request ok");
        let v: serde_json::Value = serde_json::from_str(&body)?;
        Ok(unwrap_entity(v, entity)?)
    }
}

fn seg(id: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(id)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_booking(&self, req: &NewBooking) -> Result<Booking, ApiError> {
        self.post("/api/bookings", req, "booking").await
    }

    async fn accept(&self, id: &BookingId) -> Result<Booking, ApiError> {
        let path = format!("/api/bookings/{}/accept", seg(id.as_str()));
        self.post(&path, &serde_json::json!({}), "booking").await
    }

    async fn start(&self, id: &BookingId) -> Result<Booking, ApiError> {
        let path = format!("/api/bookings/{}/start", seg(id.as_str()));
        self.post(&path, &serde_json::json!({}), "booking").await
    }

    async fn complete(&self, id: &BookingId, report: &CompletionReport) -> Result<Booking, ApiError> {
        let path = format!("/api/bookings/{}/complete", seg(id.as_str()));
        self.post(&path, report, "booking").await
    }

    async fn request_signature(&self, id: &BookingId) -> Result<Signature, ApiError> {
        let path = format!("/api/bookings/{}/request-signature", seg(id.as_str()));
        self.post(&path, &serde_json::json!({}), "signature").await
    }

    async fn sign(&self, id: &SignatureId, req: &SignRequest) -> Result<Signature, ApiError> {
        let path = format!("/api/signatures/{}/sign", seg(id.as_str()));
        self.post(&path, req, "signature").await
    }

    async fn cancel(&self, id: &BookingId, req: &CancelRequest) -> Result<Booking, ApiError> {
        let path = format!("/api/bookings/{}/cancel", seg(id.as_str()));
        self.post(&path, req, "booking").await
    }

    async fn create_dispute(&self, req: &NewDispute) -> Result<Dispute, ApiError> {
        self.post("/api/disputes", req, "dispute").await
    }

    async fn resolve_dispute(&self, id: &DisputeId, req: &DisputeResolution) -> Result<Dispute, ApiError> {
        let path = format!("/api/disputes/{}/resolve", seg(id.as_str()));
        self.post(&path, req, "dispute").await
    }

    async fn process_manual_payment(&self, req: &ManualPayment) -> Result<Payment, ApiError> {
        self.post("/api/payments/manual", req, "payment").await
    }

    async fn fetch_booking(&self, id: &BookingId) -> Result<BookingBundle, ApiError> {
        let path = format!("/api/bookings/{}", seg(id.as_str()));
        let v: serde_json::Value = self.get(&path, "").await?;
        bundle_from_value(v)
    }
}

/// Accepts `{"<entity>": {...}}` or the entity itself.
fn unwrap_entity<T: DeserializeOwned>(v: serde_json::Value, entity: &str) -> Result<T, serde_json::Error> {
    match v {
        serde_json::Value::Object(mut m) if !entity.is_empty() && m.get(entity).is_some_and(|x| x.is_object()) => {
            serde_json::from_value(m.remove(entity).unwrap_or_default())
        }
        other => serde_json::from_value(other),
    }
}

/// `GET /api/bookings/{id}` returns either a bundle or a booking with embedded
/// `signature` / `payment` / `disputes` fields.
fn bundle_from_value(v: serde_json::Value) -> Result<BookingBundle, ApiError> {
    if v.get("booking").is_some_and(|b| b.is_object()) {
        return Ok(serde_json::from_value(v)?);
    }
    let booking: Booking = serde_json::from_value(v.clone())?;
    let field = |k: &str| v.get(k).cloned().filter(|x| !x.is_null());
    Ok(BookingBundle {
        booking,
        signature: field("signature").map(serde_json::from_value).transpose()?,
        payment: field("payment").map(serde_json::from_value).transpose()?,
        disputes: field("disputes").map(serde_json::from_value).transpose()?.unwrap_or_default(),
    })
}

/// Error bodies seen in the wild: {"error":{"code","message"}}, {"code","message"}, {"detail"}.
fn error_from_body(status: u16, body: &str) -> ApiError {
    let v: serde_json::Value = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    let inner = v.get("error").filter(|e| e.is_object()).unwrap_or(&v);
    let text = |k: &str| inner.get(k).and_then(|x| x.as_str()).map(str::to_string);
    let message = text("message")
        .or_else(|| text("detail"))
        .or_else(|| v.get("error").and_then(|x| x.as_str()).map(str::to_string))
        .unwrap_or_else(|| if body.trim().is_empty() { format!("HTTP {status}") } else { body.trim().to_string() });
    ApiError::Http { status, code: text("code"), message }
}
