//! Schema gate service: `POST /validate/{event_type}/event`.
//!
//! 200 when the body satisfies the event's version-1 schema, 400 when it
//! does not or when no schema exists for the type.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::{ApiResult, Status, health};
use crate::event::EventType;
use crate::schema::{SchemaGate, SchemaRegistry};

pub fn schema_gate_router(registry: Arc<SchemaRegistry>) -> Router {
    Router::new()
        .route("/validate/{event_type}/event", post(validate))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn validate(
    State(registry): State<Arc<SchemaRegistry>>,
    Path(event_type): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Status>> {
    let event_type: EventType = event_type.parse()?;
    registry.validate(event_type, &body).await?;
    Ok(Status::ok())
}
