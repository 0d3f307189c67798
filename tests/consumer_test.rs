use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskledger::broker::topology::{self, ACCOUNTING_QUEUE, ROUTING_KEY, TRACKER_EXCHANGE};
use taskledger::broker::{Broker, InMemoryBroker};
use taskledger::consumer::{AckMode, Consumer, ConsumerConfig, ConsumerState, Disposition, HandlerRegistry};
use taskledger::error::Error;
use taskledger::event::{Envelope, EventType, TaskAssigned, TaskCompleted, TaskCreated};
use taskledger::ledger::{InMemoryLedgerStore, Ledger, accounting_registry};
use taskledger::model::{TaskId, UserId};
use taskledger::publisher::EventPublisher;
use taskledger::schema::SchemaRegistry;

const VISIBILITY: Duration = Duration::from_secs(30);

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryLedgerStore>,
    ledger: Ledger,
    publisher: EventPublisher,
    consumer: Consumer,
}

async fn harness(ack_mode: AckMode) -> Harness {
    harness_with(ack_mode, None).await
}

async fn harness_with(ack_mode: AckMode, registry: Option<HandlerRegistry>) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    topology::declare(broker.as_ref()).await.unwrap();

    let store = Arc::new(InMemoryLedgerStore::new());
    let ledger = Ledger::new(store.clone());
    let registry = registry.unwrap_or_else(|| accounting_registry(&ledger));

    let consumer = Consumer::new(
        broker.clone(),
        ACCOUNTING_QUEUE,
        registry,
        Arc::new(SchemaRegistry::builtin().unwrap()),
        ConsumerConfig {
            ack_mode,
            visibility_timeout: VISIBILITY,
            poll_interval: Duration::from_millis(20),
        },
    );

    Harness {
        publisher: EventPublisher::new(broker.clone(), TRACKER_EXCHANGE),
        broker,
        store,
        ledger,
        consumer,
    }
}

impl Harness {
    async fn assign(&self, assignee_id: UserId, amount: i64) {
        self.publisher
            .publish_payload(ROUTING_KEY, &TaskAssigned { amount, assignee_id })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn handles_assignment_and_completion() {
    let h = harness(AckMode::default()).await;
    let worker = UserId::new();

    h.assign(worker, 14).await;
    h.publisher
        .publish_payload(
            ROUTING_KEY,
            &TaskCompleted {
                amount: 33,
                assignee_id: worker,
            },
        )
        .await
        .unwrap();

    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), -14);
    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), 19);

    assert_eq!(h.consumer.process_one().await.unwrap(), None);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
}

#[tokio::test]
async fn task_created_is_ignored_by_accounting() {
    let h = harness(AckMode::default()).await;
    h.publisher
        .publish_payload(
            ROUTING_KEY,
            &TaskCreated {
                task_id: TaskId::new(),
                description: "water the plants".into(),
                author_id: UserId::new(),
                assignee_id: UserId::new(),
            },
        )
        .await
        .unwrap();

    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Ignored));
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
    assert_eq!(h.store.operation_count(), 0);
}

#[tokio::test]
async fn auto_ack_loses_event_when_handler_fails() {
    let h = harness(AckMode::Auto).await;
    let worker = UserId::new();
    h.store.fail_next_writes(1);

    h.assign(worker, 12).await;
    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(disposition, Disposition::Failed { attempt: 1, .. }));

    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
    assert_eq!(h.consumer.process_one().await.unwrap(), None);
    assert_eq!(h.ledger.balance(worker).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn after_commit_redelivers_failed_event() {
    let h = harness(AckMode::default()).await;
    let worker = UserId::new();
    h.store.fail_next_writes(1);

    h.assign(worker, 17).await;
    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(disposition, Disposition::Failed { attempt: 1, .. }));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), 0);

    // Still hidden until the visibility timeout lapses.
    assert_eq!(h.consumer.process_one().await.unwrap(), None);

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), -17);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_failure_is_dead_lettered() {
    let h = harness(AckMode::AfterCommit { max_attempts: 2 }).await;
    let worker = UserId::new();
    h.store.fail_next_writes(10);

    h.assign(worker, 10).await;
    let first = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(first, Disposition::Failed { attempt: 1, .. }));

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    let second = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(second, Disposition::DeadLettered(_)), "{second:?}");

    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
    let parked = h.broker.dead_letters(ACCOUNTING_QUEUE);
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0]["attempt"], 2);
}

#[tokio::test(start_paused = true)]
async fn failed_ack_surfaces_and_redelivery_is_absorbed() {
    let h = harness(AckMode::default()).await;
    let worker = UserId::new();
    h.broker.fail_next_acks(1);

    h.assign(worker, 17).await;
    let err = h.consumer.process_one().await.unwrap_err();
    assert!(matches!(err, Error::Delivery(_)), "{err}");
    assert_eq!(*h.consumer.state().borrow(), ConsumerState::Idle);
    assert_eq!(h.ledger.balance(worker).await.unwrap(), -17);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 1);

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), -17);
    assert_eq!(h.store.operation_count(), 1);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
}

#[tokio::test]
async fn failed_auto_ack_skips_the_handler() {
    let h = harness(AckMode::Auto).await;
    let worker = UserId::new();
    h.broker.fail_next_acks(1);

    h.assign(worker, 9).await;
    assert!(h.consumer.process_one().await.is_err());
    assert_eq!(h.store.operation_count(), 0);
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 1);
}

#[tokio::test]
async fn redelivered_duplicate_is_applied_once() {
    let h = harness(AckMode::default()).await;
    let worker = UserId::new();
    let envelope = Envelope::new(&TaskAssigned {
        amount: 16,
        assignee_id: worker,
    })
    .unwrap();

    h.publisher.publish(ROUTING_KEY, &envelope).await.unwrap();
    h.publisher.publish(ROUTING_KEY, &envelope).await.unwrap();

    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.consumer.process_one().await.unwrap(), Some(Disposition::Handled));
    assert_eq!(h.ledger.balance(worker).await.unwrap(), -16);
    assert_eq!(h.store.operation_count(), 1);
}

#[tokio::test]
async fn schema_violation_is_rejected_without_side_effects() {
    let h = harness(AckMode::default()).await;
    let envelope = Envelope::from_raw(EventType::TaskAssigned, br#"{"amount": 15}"#.to_vec());
    h.publisher.publish(ROUTING_KEY, &envelope).await.unwrap();

    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(disposition, Disposition::Rejected(_)), "{disposition:?}");
    assert_eq!(h.store.operation_count(), 0);
    assert_eq!(h.broker.dead_letters(ACCOUNTING_QUEUE).len(), 1);
}

#[tokio::test]
async fn unknown_type_tag_is_rejected() {
    let h = harness(AckMode::default()).await;
    h.broker
        .publish(
            TRACKER_EXCHANGE,
            ROUTING_KEY,
            &json!({"type": "task_exploded", "body": "{}"}),
        )
        .await
        .unwrap();

    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(disposition, Disposition::Rejected(_)), "{disposition:?}");
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
    assert_eq!(h.broker.dead_letters(ACCOUNTING_QUEUE).len(), 1);
}

#[tokio::test]
async fn unregistered_type_is_rejected() {
    let h = harness_with(AckMode::default(), Some(HandlerRegistry::new())).await;
    h.assign(UserId::new(), 10).await;

    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    let Disposition::Rejected(reason) = disposition else {
        panic!("expected rejection, got {disposition:?}");
    };
    assert!(reason.contains("task_assigned"), "{reason}");
}

#[tokio::test]
async fn auto_ack_rejection_is_discarded() {
    let h = harness(AckMode::Auto).await;
    let envelope = Envelope::from_raw(EventType::TaskCompleted, b"not json".to_vec());
    h.publisher.publish(ROUTING_KEY, &envelope).await.unwrap();

    let disposition = h.consumer.process_one().await.unwrap().unwrap();
    assert!(matches!(disposition, Disposition::Rejected(_)));
    assert_eq!(h.broker.depth(ACCOUNTING_QUEUE), 0);
    assert!(h.broker.dead_letters(ACCOUNTING_QUEUE).is_empty());
}

#[tokio::test]
async fn run_drains_queue_and_stops_on_shutdown() {
    let h = harness(AckMode::default()).await;
    let worker = UserId::new();
    let mut state = h.consumer.state();

    let task = tokio::spawn({
        let consumer = h.consumer.clone();
        async move { consumer.run().await }
    });

    h.assign(worker, 11).await;
    h.assign(worker, 12).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.ledger.balance(worker).await.unwrap() != -23 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer should drain the queue");

    h.consumer.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer should stop")
        .unwrap()
        .unwrap();

    state
        .wait_for(|s| *s == ConsumerState::Stopped)
        .await
        .unwrap();
}
