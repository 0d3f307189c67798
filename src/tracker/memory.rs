//! In-memory task store and outbox for tests and local runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::TaskStore;
use crate::error::{Error, Result};
use crate::event::Envelope;
use crate::model::{Role, Task, TaskCost, TaskId, TaskStatus, User, UserId};
use crate::outbox::{OutboxRecord, OutboxStore, require_event_ids};

#[derive(Debug)]
struct Staged {
    record: OutboxRecord,
    published: bool,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    /// Insertion order doubles as creation order.
    tasks: Vec<Task>,
    costs: HashMap<TaskId, TaskCost>,
    outbox: Vec<Staged>,
    next_outbox_id: i64,
}

impl State {
    fn stage(&mut self, events: &[Envelope]) {
        for envelope in events {
            self.next_outbox_id += 1;
            self.outbox.push(Staged {
                record: OutboxRecord {
                    id: self.next_outbox_id,
                    envelope: envelope.clone(),
                    attempts: 0,
                    last_error: None,
                    created_at: Utc::now(),
                },
                published: false,
            });
        }
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    fn staged_mut(&mut self, id: i64) -> Result<&mut Staged> {
        self.outbox
            .iter_mut()
            .find(|staged| staged.record.id == id)
            .ok_or_else(|| Error::NotFound(format!("outbox record {id}")))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("task state poisoned".into()))
    }

    /// Number of outbox records not yet published.
    pub fn unpublished(&self) -> usize {
        self.lock()
            .map(|state| state.outbox.iter().filter(|s| !s.published).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut state = self.lock()?;
        let created_at = state
            .users
            .get(&user.id)
            .map(|existing| existing.created_at)
            .unwrap_or(user.created_at);
        state.users.insert(
            user.id,
            User {
                created_at,
                updated_at: Utc::now(),
                ..user.clone()
            },
        );
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn users_by_role(&self, role: Role) -> Result<Vec<User>> {
        let mut users: Vec<User> = self
            .lock()?
            .users
            .values()
            .filter(|user| user.role == role)
            .cloned()
            .collect();
        // HashMap order is random per process; keep selection seed-stable.
        users.sort_by_key(|user| user.id.0);
        Ok(users)
    }

    async fn create_task(&self, task: &Task, cost: &TaskCost, outbox: &[Envelope]) -> Result<()> {
        require_event_ids(outbox)?;
        let mut state = self.lock()?;
        state.tasks.push(task.clone());
        state.costs.insert(task.id, *cost);
        state.stage(outbox);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.lock()?
            .tasks
            .iter()
            .find(|task| task.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn task_cost(&self, id: TaskId) -> Result<TaskCost> {
        self.lock()?
            .costs
            .get(&id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("cost for task {id}")))
    }

    async fn complete_task(&self, id: TaskId, outbox: &[Envelope]) -> Result<Task> {
        require_event_ids(outbox)?;
        let mut state = self.lock()?;
        let task = state.task_mut(id)?;
        if !task.status.can_transition_to(TaskStatus::Completed) {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        task.status = TaskStatus::Completed;
        task.updated_at = Utc::now();
        let task = task.clone();
        state.stage(outbox);
        Ok(task)
    }

    async fn reassign_task(
        &self,
        id: TaskId,
        assignee: UserId,
        outbox: &[Envelope],
    ) -> Result<Task> {
        require_event_ids(outbox)?;
        let mut state = self.lock()?;
        let task = state.task_mut(id)?;
        if task.status != TaskStatus::Created {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Created.to_string(),
            });
        }
        task.assignee_id = assignee;
        task.updated_at = Utc::now();
        let task = task.clone();
        state.stage(outbox);
        Ok(task)
    }

    async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .iter()
            .filter(|task| task.status == status)
            .cloned()
            .collect())
    }

    async fn tasks_by_assignee(&self, assignee: UserId) -> Result<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .iter()
            .filter(|task| task.assignee_id == assignee)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryTaskStore {
    async fn pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .lock()?
            .outbox
            .iter()
            .filter(|staged| !staged.published)
            .take(limit)
            .map(|staged| staged.record.clone())
            .collect())
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        self.lock()?.staged_mut(id)?.published = true;
        Ok(())
    }

    async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut state = self.lock()?;
        let staged = state.staged_mut(id)?;
        staged.record.attempts += 1;
        staged.record.last_error = Some(error.to_string());
        Ok(())
    }
}
