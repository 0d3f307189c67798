//! HTTP surface of the three services.
//!
//! Errors render as RFC 7807 problem documents. Caller identity arrives in
//! the `X-User-Id` header, set by the authenticating gateway in front of
//! these services.

pub mod accounting;
pub mod gate;
pub mod tracker;

use std::future::{Future, IntoFuture};
use std::time::Duration;

use axum::Router;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::{Error, ErrorClass, Result};
use crate::model::UserId;

pub use accounting::accounting_router;
pub use gate::schema_gate_router;
pub use tracker::tracker_router;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Library error carried to the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            err => match err.class() {
                ErrorClass::Client | ErrorClass::ContractViolation => StatusCode::BAD_REQUEST,
                ErrorClass::DeliveryFailure => StatusCode::BAD_GATEWAY,
                ErrorClass::PersistenceFailure | ErrorClass::Internal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

/// RFC 7807 problem details.
#[derive(Debug, Serialize)]
pub struct Problem {
    pub status: u16,
    pub title: String,
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = if status.is_server_error() {
            error!("request failed: {}", self.0);
            // Storage and internal errors can leak connection details.
            match self.0.class() {
                ErrorClass::DeliveryFailure => self.0.to_string(),
                _ => "internal error".to_string(),
            }
        } else {
            self.0.to_string()
        };
        let problem = Problem {
            status: status.as_u16(),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            detail,
        };
        (status, Json(problem)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// The authenticated user making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| Error::Unauthenticated("missing X-User-Id header".into()))?;
        let id = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<UserId>().ok())
            .ok_or_else(|| Error::Unauthenticated("X-User-Id is not a user id".into()))?;
        Ok(Caller(id))
    }
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub status: &'static str,
}

impl Status {
    pub fn ok() -> Json<Self> {
        Json(Self { status: "OK" })
    }
}

pub async fn health() -> Json<Status> {
    Status::ok()
}

/// Serve `router` until `shutdown` resolves, then drain in-flight requests
/// for at most `grace` before giving up on them.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F, grace: Duration) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "http listening");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .into_future();
    let mut server = tokio::spawn(server);

    tokio::select! {
        joined = &mut server => return flatten(joined),
        _ = shutdown => {}
    }

    info!(grace_secs = grace.as_secs(), "http draining");
    let _ = stop_tx.send(());
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            warn!("grace period elapsed, dropping open connections");
            server.abort();
            Ok(())
        }
    }
}

fn flatten(
    joined: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match joined {
        Ok(served) => Ok(served?),
        Err(e) => Err(Error::Other(format!("http server task failed: {e}"))),
    }
}
