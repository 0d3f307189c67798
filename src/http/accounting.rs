//! Accounting routes: balances and the operation log.
//!
//! Anyone may read their own ledger. Reading someone else's (`?user_id=`)
//! takes an auditing role.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::{ApiResult, Caller, health};
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::model::{Operation, UserId};

#[derive(Debug, Default, Deserialize)]
pub struct Subject {
    pub user_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
pub struct Balance {
    pub user_id: UserId,
    pub amount: i64,
}

pub fn accounting_router(ledger: Ledger) -> Router {
    Router::new()
        .route("/balance", get(balance))
        .route("/operation/log", get(operation_log))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(ledger)
}

/// Resolve whose ledger the caller may see.
async fn subject(ledger: &Ledger, caller: UserId, requested: Option<UserId>) -> Result<UserId> {
    let user = ledger
        .store()
        .get_user(caller)
        .await?
        .ok_or_else(|| Error::Unauthenticated(format!("unknown user {caller}")))?;

    match requested {
        Some(other) if other != caller => {
            if user.role.can_audit() {
                Ok(other)
            } else {
                Err(Error::Forbidden(format!(
                    "{} may not read other users' ledgers",
                    user.role
                )))
            }
        }
        _ => Ok(caller),
    }
}

async fn balance(
    State(ledger): State<Ledger>,
    Caller(caller): Caller,
    Query(query): Query<Subject>,
) -> ApiResult<Json<Balance>> {
    let user_id = subject(&ledger, caller, query.user_id).await?;
    let amount = ledger.balance(user_id).await?;
    Ok(Json(Balance { user_id, amount }))
}

async fn operation_log(
    State(ledger): State<Ledger>,
    Caller(caller): Caller,
    Query(query): Query<Subject>,
) -> ApiResult<Json<Vec<Operation>>> {
    let user_id = subject(&ledger, caller, query.user_id).await?;
    Ok(Json(ledger.operations(user_id).await?))
}
