//! Task tracker routes.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::{ApiResult, Caller, Status, health};
use crate::error::Error;
use crate::model::{NewTask, Task, TaskId};
use crate::tracker::TaskTracker;

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: TaskId,
}

#[derive(Debug, Serialize)]
pub struct Reassigned {
    pub status: &'static str,
    pub reassigned: usize,
}

pub fn tracker_router(tracker: TaskTracker) -> Router {
    Router::new()
        .route("/task/create", post(create_task))
        .route("/task/{task_id}/complete", post(complete_task))
        .route("/task/get", get(my_tasks))
        .route("/task/assign", post(reassign_tasks))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(tracker)
}

async fn create_task(
    State(tracker): State<TaskTracker>,
    Caller(author): Caller,
    Json(new): Json<NewTask>,
) -> ApiResult<Json<Created>> {
    let task = tracker.create_task(author, new).await?;
    Ok(Json(Created { id: task.id }))
}

async fn complete_task(
    State(tracker): State<TaskTracker>,
    Caller(_): Caller,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Status>> {
    let task_id: TaskId = task_id
        .parse()
        .map_err(|_| Error::InvalidInput(format!("'{task_id}' is not a task id")))?;
    tracker.complete_task(task_id).await?;
    Ok(Status::ok())
}

async fn my_tasks(
    State(tracker): State<TaskTracker>,
    Caller(user): Caller,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(tracker.tasks_for(user).await?))
}

async fn reassign_tasks(
    State(tracker): State<TaskTracker>,
    Caller(actor): Caller,
) -> ApiResult<Json<Reassigned>> {
    let tasks = tracker.reassign_tasks(actor).await?;
    Ok(Json(Reassigned {
        status: "OK",
        reassigned: tasks.len(),
    }))
}
