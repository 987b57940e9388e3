//! axum integration: a middleware that validates the session on every
//! protected request and an extractor for the validated session.
//!
//! # Usage
//!
//! ```rust,ignore
//! use axum::{Router, middleware, routing::get};
//! use tessera_core::middleware::{CurrentSession, SessionGate, require_session};
//!
//! let gate = SessionGate::new(service.clone());
//! let app = Router::new()
//!     .route("/me", get(|CurrentSession(s): CurrentSession| async move { s.user_id.to_string() }))
//!     .route_layer(middleware::from_fn_with_state(gate, require_session));
//! ```
//!
//! When the token is rotated during validation the replacement is returned in
//! the `x-session-token` response header; clients must switch to it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::TesseraError;
use crate::service::SessionService;
use crate::store::Session;

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// Router state for [`require_session`].
#[derive(Clone)]
pub struct SessionGate {
    service: Arc<SessionService>,
    trust_forwarded: bool,
}

impl SessionGate {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self {
            service,
            trust_forwarded: false,
        }
    }

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites these headers.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }
}

/// The session validated for this request.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub Session);

/// Reject requests without a valid session; expose it as [`CurrentSession`].
pub async fn require_session(
    State(gate): State<SessionGate>,
    mut req: Request,
    next: Next,
) -> Result<Response, TesseraError> {
    let token = bearer_token(req.headers()).ok_or(TesseraError::Authentication)?;
    let ip = client_ip(&req, gate.trust_forwarded);
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let validated = gate
        .service
        .authenticate(&token, ip.as_deref(), user_agent.as_deref())
        .await?;

    let rotated = validated.rotated.then_some(validated.token);
    req.extensions_mut().insert(CurrentSession(validated.session));

    let mut response = next.run(req).await;
    if let Some(token) = rotated {
        let value = HeaderValue::from_str(&token)
            .map_err(|e| TesseraError::Internal(format!("rotated token header: {e}")))?;
        response.headers_mut().insert(SESSION_TOKEN_HEADER, value);
    }
    Ok(response)
}

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = TesseraError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or(TesseraError::Authentication)
    }
}

/// `Authorization: Bearer <token>`, falling back to `x-session-token`.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let from_auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let from_custom = || {
        headers
            .get(SESSION_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };
    from_auth
        .or_else(from_custom)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn client_ip(req: &Request, trust_forwarded: bool) -> Option<String> {
    if trust_forwarded {
        let forwarded = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = || {
            req.headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        if let Some(ip) = forwarded.or_else(real_ip) {
            return Some(ip.to_string());
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
