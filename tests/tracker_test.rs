use std::sync::Arc;

use taskledger::broker::topology::{self, ACCOUNTING_QUEUE, TRACKER_EXCHANGE};
use taskledger::broker::InMemoryBroker;
use taskledger::error::{Error, ErrorClass};
use taskledger::event::{Envelope, EventType, TaskAssigned, TaskCreated};
use taskledger::model::{NewTask, Role, Task, TaskCost, TaskId, TaskStatus, User, UserId};
use taskledger::outbox::{OutboxRelay, OutboxStore, RelayConfig};
use taskledger::publisher::EventPublisher;
use taskledger::schema::{SchemaGate, SchemaRegistry};
use taskledger::tracker::{DeliveryMode, InMemoryTaskStore, SeededRandom, TaskStore, TaskTracker};

struct Harness {
    store: Arc<InMemoryTaskStore>,
    broker: Arc<InMemoryBroker>,
    publisher: EventPublisher,
    tracker: TaskTracker,
}

async fn harness(mode: DeliveryMode) -> Harness {
    harness_with_gate(mode, Arc::new(SchemaRegistry::builtin().unwrap())).await
}

async fn harness_with_gate(mode: DeliveryMode, gate: Arc<dyn SchemaGate>) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    topology::declare(broker.as_ref()).await.unwrap();
    let store = Arc::new(InMemoryTaskStore::new());
    let publisher = EventPublisher::new(broker.clone(), TRACKER_EXCHANGE);
    let tracker = TaskTracker::new(
        store.clone(),
        gate,
        publisher.clone(),
        Arc::new(SeededRandom::from_seed(7)),
        mode,
    );
    Harness {
        store,
        broker,
        publisher,
        tracker,
    }
}

impl Harness {
    async fn user(&self, name: &str, role: Role) -> UserId {
        let id = UserId::new();
        self.store.upsert_user(&User::new(id, name, role)).await.unwrap();
        id
    }

    fn relay(&self) -> OutboxRelay {
        OutboxRelay::new(self.store.clone(), self.publisher.clone(), RelayConfig::default())
    }
}

#[tokio::test]
async fn create_fails_without_workers() {
    let h = harness(DeliveryMode::Outbox).await;
    let manager = h.user("mona", Role::Manager).await;

    let err = h
        .tracker
        .create_task(manager, NewTask::new("file the report"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoWorkersAvailable));
    assert!(h.store.tasks_by_status(TaskStatus::Created).await.unwrap().is_empty());
    assert_eq!(h.store.unpublished(), 0);
}

#[tokio::test]
async fn create_rejects_blank_description() {
    let h = harness(DeliveryMode::Outbox).await;
    h.user("wes", Role::Worker).await;

    let err = h
        .tracker
        .create_task(UserId::new(), NewTask::new("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn only_workers_are_assigned_and_costs_stay_in_range() {
    let h = harness(DeliveryMode::Outbox).await;
    let manager = h.user("mona", Role::Manager).await;
    h.user("adam", Role::Admin).await;
    h.user("acc", Role::Accountant).await;
    let workers = [h.user("wes", Role::Worker).await, h.user("wil", Role::Worker).await];

    for i in 0..40 {
        let task = h
            .tracker
            .create_task(manager, NewTask::new(format!("task {i}")))
            .await
            .unwrap();
        assert!(workers.contains(&task.assignee_id));
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.author_id, manager);

        let cost = h.store.task_cost(task.id).await.unwrap();
        assert!(cost.is_within_bounds(), "{cost:?}");
    }
}

#[tokio::test]
async fn outbox_mode_stages_events_until_relayed() {
    let h = harness(DeliveryMode::Outbox).await;
    let worker = h.user("wes", Role::Worker).await;

    let task = h
        .tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap();

    assert_eq!(h.store.unpublished(), 2);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);

    let staged = h.store.pending(10).await.unwrap();
    assert_eq!(staged[0].envelope.event_type, EventType::TaskCreated);
    let created: TaskCreated = staged[0].envelope.decode().unwrap();
    assert_eq!(created.task_id, task.id);
    let assigned: TaskAssigned = staged[1].envelope.decode().unwrap();
    assert_eq!(assigned.assignee_id, worker);
    assert_eq!(
        assigned.amount,
        h.store.task_cost(task.id).await.unwrap().assign_cost
    );

    let report = h.relay().relay_once().await.unwrap();
    assert_eq!(report.published, 2);
    assert!(!report.stalled);
    assert_eq!(h.store.unpublished(), 0);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 2);
}

#[tokio::test]
async fn relay_stalls_on_failure_and_resumes_in_order() {
    let h = harness(DeliveryMode::Outbox).await;
    h.user("wes", Role::Worker).await;
    h.tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap();

    h.broker.fail_next_publishes(1);
    let relay = h.relay();
    let report = relay.relay_once().await.unwrap();
    assert!(report.stalled);
    assert_eq!(report.published, 0);
    assert_eq!(h.store.unpublished(), 2);

    let pending = h.store.pending(10).await.unwrap();
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    let report = relay.relay_once().await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(h.store.unpublished(), 0);
}

#[tokio::test]
async fn direct_mode_publishes_after_commit() {
    let h = harness(DeliveryMode::Direct).await;
    h.user("wes", Role::Worker).await;

    h.tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap();

    assert_eq!(h.store.unpublished(), 0);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 2);
}

#[tokio::test]
async fn direct_mode_swallows_publish_failure() {
    let h = harness(DeliveryMode::Direct).await;
    h.user("wes", Role::Worker).await;
    h.broker.fail_next_publishes(2);

    let task = h
        .tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap();

    assert_eq!(h.store.get_task(task.id).await.unwrap(), task);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
}

#[tokio::test]
async fn gate_rejection_persists_nothing() {
    let h = harness_with_gate(DeliveryMode::Outbox, Arc::new(SchemaRegistry::empty())).await;
    h.user("wes", Role::Worker).await;

    let err = h
        .tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::ContractViolation);
    assert!(h.store.tasks_by_status(TaskStatus::Created).await.unwrap().is_empty());
    assert_eq!(h.store.unpublished(), 0);
}

#[tokio::test]
async fn completion_pays_once() {
    let h = harness(DeliveryMode::Outbox).await;
    let worker = h.user("wes", Role::Worker).await;
    let task = h
        .tracker
        .create_task(UserId::new(), NewTask::new("sweep"))
        .await
        .unwrap();

    let done = h.tracker.complete_task(task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(h.store.unpublished(), 3);

    let err = h.tracker.complete_task(task.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert_eq!(h.store.unpublished(), 3);

    let pending = h.store.pending(10).await.unwrap();
    let paid = pending.last().unwrap();
    assert_eq!(paid.envelope.event_type, EventType::TaskCompleted);
    let cost = h.store.task_cost(task.id).await.unwrap();
    let completed: taskledger::event::TaskCompleted = paid.envelope.decode().unwrap();
    assert_eq!(completed.amount, cost.complete_cost);
    assert_eq!(completed.assignee_id, worker);
}

#[tokio::test]
async fn completing_unknown_task_is_not_found() {
    let h = harness(DeliveryMode::Outbox).await;
    let err = h
        .tracker
        .complete_task(taskledger::model::TaskId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn reassign_charges_every_open_task_again() {
    let h = harness(DeliveryMode::Outbox).await;
    let manager = h.user("mona", Role::Manager).await;
    h.user("wes", Role::Worker).await;
    h.user("wil", Role::Worker).await;

    let open = h
        .tracker
        .create_task(manager, NewTask::new("open"))
        .await
        .unwrap();
    let closed = h
        .tracker
        .create_task(manager, NewTask::new("closed"))
        .await
        .unwrap();
    h.tracker.complete_task(closed.id).await.unwrap();
    let before = h.store.unpublished();

    let reassigned = h.tracker.reassign_tasks(manager).await.unwrap();
    assert_eq!(reassigned.len(), 1);
    assert_eq!(reassigned[0].id, open.id);
    assert_eq!(h.store.unpublished(), before + 1);

    let pending = h.store.pending(20).await.unwrap();
    let charge: TaskAssigned = pending.last().unwrap().envelope.decode().unwrap();
    assert_eq!(charge.assignee_id, reassigned[0].assignee_id);
    assert_eq!(charge.amount, h.store.task_cost(open.id).await.unwrap().assign_cost);
}

#[tokio::test]
async fn reassign_requires_manager_or_admin() {
    let h = harness(DeliveryMode::Outbox).await;
    let worker = h.user("wes", Role::Worker).await;
    let accountant = h.user("acc", Role::Accountant).await;
    let admin = h.user("adam", Role::Admin).await;

    assert!(matches!(
        h.tracker.reassign_tasks(worker).await.unwrap_err(),
        Error::Forbidden(_)
    ));
    assert!(matches!(
        h.tracker.reassign_tasks(accountant).await.unwrap_err(),
        Error::Forbidden(_)
    ));
    assert!(matches!(
        h.tracker.reassign_tasks(UserId::new()).await.unwrap_err(),
        Error::Unauthenticated(_)
    ));
    assert!(h.tracker.reassign_tasks(admin).await.unwrap().is_empty());
}

#[tokio::test]
async fn only_workers_list_their_tasks() {
    let h = harness(DeliveryMode::Outbox).await;
    let manager = h.user("mona", Role::Manager).await;
    let worker = h.user("wes", Role::Worker).await;

    h.tracker.create_task(manager, NewTask::new("a")).await.unwrap();
    h.tracker.create_task(manager, NewTask::new("b")).await.unwrap();

    assert_eq!(h.tracker.tasks_for(worker).await.unwrap().len(), 2);
    assert!(matches!(
        h.tracker.tasks_for(manager).await.unwrap_err(),
        Error::Forbidden(_)
    ));
}

#[tokio::test]
async fn staging_an_envelope_without_event_id_is_refused() {
    let store = InMemoryTaskStore::new();
    let now = chrono::Utc::now();
    let task = Task {
        id: TaskId::new(),
        status: TaskStatus::Created,
        description: "sweep".into(),
        author_id: UserId::new(),
        assignee_id: UserId::new(),
        created_at: now,
        updated_at: now,
    };
    let cost = TaskCost {
        task_id: task.id,
        assign_cost: 11,
        complete_cost: 25,
    };
    let mut anonymous = Envelope::new(&TaskAssigned {
        amount: cost.assign_cost,
        assignee_id: task.assignee_id,
    })
    .unwrap();
    anonymous.event_id = None;

    let err = store
        .create_task(&task, &cost, std::slice::from_ref(&anonymous))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    assert!(matches!(store.get_task(task.id).await, Err(Error::NotFound(_))));
    assert_eq!(store.unpublished(), 0);

    store.create_task(&task, &cost, &[]).await.unwrap();
    let err = store
        .complete_task(task.id, std::slice::from_ref(&anonymous))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    assert_eq!(store.get_task(task.id).await.unwrap().status, TaskStatus::Created);
}
