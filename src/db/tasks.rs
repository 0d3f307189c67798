//! Tasks and costs, with outbox staging in the same transaction.

use async_trait::async_trait;
use uuid::Uuid;

use super::outbox::stage;
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::model::{Role, Task, TaskCost, TaskId, TaskStatus, User, UserId};
use crate::tracker::TaskStore;

const TASK_COLUMNS: &str =
    "id, status, description, author_id, assignee_id, created_at, updated_at";

impl super::Db {
    async fn insert_task(&self, task: &Task, cost: &TaskCost, outbox: &[Envelope]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO tasks (id, status, description, author_id, assignee_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(task.id.0)
        .bind(task.status.as_str())
        .bind(&task.description)
        .bind(task.author_id.0)
        .bind(task.assignee_id.0)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO task_costs (task_id, assign_cost, complete_cost) VALUES ($1, $2, $3)",
        )
        .bind(cost.task_id.0)
        .bind(cost.assign_cost)
        .bind(cost.complete_cost)
        .execute(&mut *tx)
        .await?;

        stage(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    pub async fn task_cost(&self, id: TaskId) -> Result<TaskCost> {
        let row: Option<(Uuid, i64, i64)> = sqlx::query_as(
            "SELECT task_id, assign_cost, complete_cost FROM task_costs WHERE task_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let (task_id, assign_cost, complete_cost) =
            row.ok_or_else(|| Error::NotFound(format!("cost for task {id}")))?;
        Ok(TaskCost {
            task_id: TaskId(task_id),
            assign_cost,
            complete_cost,
        })
    }

    /// Guarded update: only touches the row while it is still `created`.
    async fn update_open_task(
        &self,
        id: TaskId,
        to: TaskStatus,
        assignee: Option<UserId>,
        outbox: &[Envelope],
    ) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks
             SET status = $2, assignee_id = COALESCE($3, assignee_id), updated_at = now()
             WHERE id = $1 AND status = 'created'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id.0)
        .bind(to.as_str())
        .bind(assignee.map(|a| a.0))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Dropping tx rolls back; report why nothing matched.
            let current = self.get_task(id).await?;
            return Err(Error::InvalidTransition {
                from: current.status.to_string(),
                to: to.to_string(),
            });
        };

        stage(&mut tx, outbox).await?;
        tx.commit().await?;
        row.try_into_task()
    }

    async fn tasks_where(&self, clause: &str, value: impl ToString) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE {clause} ORDER BY created_at, id"
        ))
        .bind(value.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

#[async_trait]
impl TaskStore for super::Db {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        super::Db::upsert_user(self, user).await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        super::Db::get_user(self, id).await
    }

    async fn users_by_role(&self, role: Role) -> Result<Vec<User>> {
        super::Db::users_by_role(self, role).await
    }

    async fn create_task(&self, task: &Task, cost: &TaskCost, outbox: &[Envelope]) -> Result<()> {
        self.insert_task(task, cost, outbox).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        super::Db::get_task(self, id).await
    }

    async fn task_cost(&self, id: TaskId) -> Result<TaskCost> {
        super::Db::task_cost(self, id).await
    }

    async fn complete_task(&self, id: TaskId, outbox: &[Envelope]) -> Result<Task> {
        self.update_open_task(id, TaskStatus::Completed, None, outbox)
            .await
    }

    async fn reassign_task(
        &self,
        id: TaskId,
        assignee: UserId,
        outbox: &[Envelope],
    ) -> Result<Task> {
        self.update_open_task(id, TaskStatus::Created, Some(assignee), outbox)
            .await
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.tasks_where("status = $1", status).await
    }

    async fn tasks_by_assignee(&self, assignee: UserId) -> Result<Vec<Task>> {
        self.tasks_where("assignee_id = $1::uuid", assignee).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    status: String,
    description: String,
    author_id: Uuid,
    assignee_id: Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            status: self.status.parse()?,
            description: self.description,
            author_id: UserId(self.author_id),
            assignee_id: UserId(self.assignee_id),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
