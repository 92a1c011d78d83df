//! HTTP surface of the ingress process.
//!
//! # Endpoints
//!
//! - `POST /webhook` - accept a provider delivery; 200 once delivered or queued
//! - `GET /webhook` - subscription handshake, echoes `hub.challenge`
//! - `GET /health` - liveness check
//! - `GET /` - banner

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::{info, warn};

use crate::error::IngressOutcome;
use crate::ingress::IngressRouter;
use crate::signing::{verify_signature_header, verify_subscription, SubscriptionQuery, SIGNATURE_HEADER};
use crate::telemetry::metric_inc;

/// Shared handler state, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    router: IngressRouter,
    verify_token: Option<String>,
    app_secret: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(router: IngressRouter, verify_token: Option<String>, app_secret: Option<Vec<u8>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                router,
                verify_token,
                app_secret,
            }),
        }
    }

    pub fn router(&self) -> &IngressRouter {
        &self.inner.router
    }
}

pub fn build_router(app_state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(banner_handler))
        .route("/health", get(health_handler))
        .route("/webhook", get(handshake_handler).post(webhook_handler))
        .with_state(app_state)
}

async fn banner_handler() -> &'static str {
    "relay ingress is active"
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn handshake_handler(
    State(state): State<AppState>,
    query: Result<Query<SubscriptionQuery>, QueryRejection>,
) -> Response {
    // An unparseable handshake is just another non-matching one.
    let Ok(Query(query)) = query else {
        warn!("subscription handshake rejected: malformed query");
        return StatusCode::FORBIDDEN.into_response();
    };

    match verify_subscription(&query, state.inner.verify_token.as_deref()) {
        Ok(challenge) => {
            info!("subscription handshake accepted");
            (StatusCode::OK, challenge).into_response()
        }
        Err(err) => {
            warn!(error = %err, "subscription handshake rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn webhook_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = &state.inner.app_secret {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if let Err(err) = verify_signature_header(secret, &body, header) {
            metric_inc("relay.ingress.rejected");
            warn!(error = %err, "webhook signature rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match state.router().handle(&body).await {
        Ok(IngressOutcome::Delivered) | Ok(IngressOutcome::Queued(_)) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
