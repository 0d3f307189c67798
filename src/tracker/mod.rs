//! Task lifecycle producer.
//!
//! Creates tasks, assigns them to random workers, prices them and emits the
//! lifecycle events the ledger folds into balances. Every outgoing event is
//! checked by the schema gate before anything is written.
//!
//! With [`DeliveryMode::Outbox`] the task change and its events commit in
//! one transaction and the [`crate::outbox::OutboxRelay`] publishes them
//! later. With [`DeliveryMode::Direct`] the change commits first and the
//! events are published afterwards on a best-effort basis: a broker outage
//! leaves a gap in the ledger but never fails the request.

pub mod handlers;
pub mod memory;
pub mod random;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{error, info, warn};

use crate::broker::topology::ROUTING_KEY;
use crate::error::{Error, Result};
use crate::event::{Envelope, TaskAssigned, TaskCompleted, TaskCreated};
use crate::model::{NewTask, Role, Task, TaskCost, TaskId, TaskStatus, User, UserId};
use crate::publisher::EventPublisher;
use crate::schema::SchemaGate;
use crate::telemetry::metrics;

pub use handlers::tracker_registry;
pub use memory::InMemoryTaskStore;
pub use random::{RandomSource, SeededRandom};

/// Storage owned by the tracker. Writes that take an `outbox` slice stage
/// those envelopes in the same transaction as the change.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    async fn users_by_role(&self, role: Role) -> Result<Vec<User>>;

    async fn create_task(&self, task: &Task, cost: &TaskCost, outbox: &[Envelope]) -> Result<()>;

    async fn get_task(&self, id: TaskId) -> Result<Task>;

    async fn task_cost(&self, id: TaskId) -> Result<TaskCost>;

    /// `created -> completed`. Fails with [`Error::InvalidTransition`] when
    /// the task is not open, in which case nothing is staged.
    async fn complete_task(&self, id: TaskId, outbox: &[Envelope]) -> Result<Task>;

    /// Move an open task to a new assignee.
    async fn reassign_task(&self, id: TaskId, assignee: UserId, outbox: &[Envelope])
    -> Result<Task>;

    async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;

    async fn tasks_by_assignee(&self, assignee: UserId) -> Result<Vec<Task>>;
}

/// How lifecycle events reach the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Staged with the state change, relayed asynchronously.
    #[default]
    Outbox,
    /// Published right after commit; failures are logged and swallowed.
    Direct,
}

impl std::str::FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outbox" => Ok(DeliveryMode::Outbox),
            "direct" => Ok(DeliveryMode::Direct),
            other => Err(Error::Config(format!(
                "unknown delivery mode '{other}' (expected outbox or direct)"
            ))),
        }
    }
}

#[derive(Clone)]
pub struct TaskTracker {
    store: Arc<dyn TaskStore>,
    gate: Arc<dyn SchemaGate>,
    publisher: EventPublisher,
    random: Arc<dyn RandomSource>,
    mode: DeliveryMode,
}

impl TaskTracker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        gate: Arc<dyn SchemaGate>,
        publisher: EventPublisher,
        random: Arc<dyn RandomSource>,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            store,
            gate,
            publisher,
            random,
            mode,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Resolve a caller to a mirrored user.
    pub async fn user(&self, id: UserId) -> Result<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| Error::Unauthenticated(format!("unknown user {id}")))
    }

    /// Open a task for a random worker and charge them the assignment cost.
    pub async fn create_task(&self, author_id: UserId, new: NewTask) -> Result<Task> {
        let description = new.description.trim();
        if description.is_empty() {
            return Err(Error::InvalidInput("description must not be empty".into()));
        }

        let assignee_id = self.pick_worker().await?;
        let task_id = TaskId::new();
        let cost = TaskCost {
            task_id,
            assign_cost: self.random.between(TaskCost::ASSIGN_RANGE),
            complete_cost: self.random.between(TaskCost::COMPLETE_RANGE),
        };
        let now = Utc::now();
        let task = Task {
            id: task_id,
            status: TaskStatus::Created,
            description: description.to_string(),
            author_id,
            assignee_id,
            created_at: now,
            updated_at: now,
        };

        let events = vec![
            Envelope::new(&TaskCreated {
                task_id,
                description: task.description.clone(),
                author_id,
                assignee_id,
            })?,
            Envelope::new(&TaskAssigned {
                amount: cost.assign_cost,
                assignee_id,
            })?,
        ];
        self.check(&events).await?;

        self.store
            .create_task(&task, &cost, self.staged(&events))
            .await?;
        info!(
            %task_id,
            %assignee_id,
            assign_cost = cost.assign_cost,
            complete_cost = cost.complete_cost,
            "task created"
        );
        count_transition("created");

        self.publish_direct(&events).await;
        Ok(task)
    }

    /// Close an open task and pay the assignee the completion cost.
    pub async fn complete_task(&self, task_id: TaskId) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        if !task.status.can_transition_to(TaskStatus::Completed) {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        let cost = self.store.task_cost(task_id).await?;

        let events = vec![Envelope::new(&TaskCompleted {
            amount: cost.complete_cost,
            assignee_id: task.assignee_id,
        })?];
        self.check(&events).await?;

        let task = self
            .store
            .complete_task(task_id, self.staged(&events))
            .await?;
        info!(%task_id, assignee_id = %task.assignee_id, "task completed");
        count_transition("completed");

        self.publish_direct(&events).await;
        Ok(task)
    }

    /// Reshuffle every open task among the current workers. Each assignment
    /// charges the new assignee again.
    pub async fn reassign_tasks(&self, actor_id: UserId) -> Result<Vec<Task>> {
        let actor = self.user(actor_id).await?;
        if !actor.role.can_reassign() {
            return Err(Error::Forbidden(format!(
                "{} may not reassign tasks",
                actor.role
            )));
        }

        let workers = self.store.users_by_role(Role::Worker).await?;
        if workers.is_empty() {
            return Err(Error::NoWorkersAvailable);
        }

        let mut reassigned = Vec::new();
        for task in self.store.tasks_by_status(TaskStatus::Created).await? {
            let Some(worker) = random::choose(self.random.as_ref(), &workers) else {
                return Err(Error::NoWorkersAvailable);
            };
            let cost = self.store.task_cost(task.id).await?;
            let events = vec![Envelope::new(&TaskAssigned {
                amount: cost.assign_cost,
                assignee_id: worker.id,
            })?];
            self.check(&events).await?;

            let updated = match self
                .store
                .reassign_task(task.id, worker.id, self.staged(&events))
                .await
            {
                Ok(updated) => updated,
                Err(Error::InvalidTransition { .. }) => {
                    warn!(task_id = %task.id, "task closed during reassignment, skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            count_transition("reassigned");
            self.publish_direct(&events).await;
            reassigned.push(updated);
        }

        info!(actor_id = %actor.id, count = reassigned.len(), "tasks reassigned");
        Ok(reassigned)
    }

    /// Open and closed tasks assigned to a worker.
    pub async fn tasks_for(&self, user_id: UserId) -> Result<Vec<Task>> {
        let user = self.user(user_id).await?;
        if user.role != Role::Worker {
            return Err(Error::Forbidden("only workers have task lists".into()));
        }
        self.store.tasks_by_assignee(user_id).await
    }

    async fn pick_worker(&self) -> Result<UserId> {
        let workers = self.store.users_by_role(Role::Worker).await?;
        random::choose(self.random.as_ref(), &workers)
            .map(|worker| worker.id)
            .ok_or(Error::NoWorkersAvailable)
    }

    async fn check(&self, events: &[Envelope]) -> Result<()> {
        for envelope in events {
            self.gate
                .validate(envelope.event_type, &envelope.payload)
                .await?;
        }
        Ok(())
    }

    fn staged<'a>(&self, events: &'a [Envelope]) -> &'a [Envelope] {
        match self.mode {
            DeliveryMode::Outbox => events,
            DeliveryMode::Direct => &[],
        }
    }

    async fn publish_direct(&self, events: &[Envelope]) {
        if self.mode != DeliveryMode::Direct {
            return;
        }
        for envelope in events {
            if let Err(e) = self.publisher.publish(ROUTING_KEY, envelope).await {
                error!(
                    event_type = %envelope.event_type,
                    event_id = ?envelope.event_id,
                    "event not delivered, ledger will miss it: {e}"
                );
            }
        }
    }
}

fn count_transition(action: &'static str) {
    metrics::task_transitions().add(1, &[KeyValue::new("action", action)]);
}
