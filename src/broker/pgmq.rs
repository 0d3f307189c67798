//! Broker over pgmq via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.delete. Exchanges are rows in `broker_bindings`; publishing fans a
//! message out to every bound queue inside one transaction and fires a
//! NOTIFY per queue so idle consumers wake up without polling.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Broker, Delivery, dead_letter_body, dead_letter_queue};
use crate::error::Result;
use crate::telemetry::metrics;

/// pgmq queue names must be plain identifiers.
fn pgmq_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn notify_channel(queue: &str) -> String {
    format!("queue_ready_{}", pgmq_name(queue))
}

fn count(queue: &str, operation: &'static str) {
    metrics::broker_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

struct Listener {
    inner: PgListener,
    channels: HashSet<String>,
}

pub struct PgmqBroker {
    pool: PgPool,
    listener: Mutex<Option<Listener>>,
}

impl PgmqBroker {
    /// Connect to the Postgres instance hosting pgmq and make sure the
    /// extension and binding table exist.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        let broker = Self::from_pool(pool);
        broker.install().await?;
        Ok(broker)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            listener: Mutex::new(None),
        }
    }

    async fn install(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS broker_bindings (
                exchange    TEXT NOT NULL,
                queue       TEXT NOT NULL,
                routing_key TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (exchange, queue, routing_key)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of messages currently held by a queue, visible or not.
    pub async fn queue_depth(&self, queue: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT count(*) FROM pgmq.q_{}",
            pgmq_name(queue)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        for name in [pgmq_name(queue), pgmq_name(&dead_letter_queue(queue))] {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(&name)
                .execute(&self.pool)
                .await?;
        }
        count(queue, "create");
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_bindings (exchange, queue, routing_key)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(exchange)
        .bind(queue)
        .bind(routing_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &serde_json::Value,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let queues: Vec<(String,)> = sqlx::query_as(
            "SELECT queue FROM broker_bindings WHERE exchange = $1 AND routing_key = $2",
        )
        .bind(exchange)
        .bind(routing_key)
        .fetch_all(&mut *tx)
        .await?;

        if queues.is_empty() {
            warn!(exchange, routing_key, "no queue bound, message dropped");
            tx.commit().await?;
            return Ok(0);
        }

        for (queue,) in &queues {
            sqlx::query("SELECT pgmq.send($1, $2, $3)")
                .bind(pgmq_name(queue))
                .bind(message)
                .bind(0i32)
                .execute(&mut *tx)
                .await?;
            // NOTIFY is transactional: only fires on commit
            sqlx::query("SELECT pg_notify($1, '')")
                .bind(notify_channel(queue))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        for (queue,) in &queues {
            count(queue, "send");
        }
        Ok(queues.len())
    }

    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let vt_seconds = i32::try_from(visibility.as_secs()).unwrap_or(i32::MAX);
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(pgmq_name(queue))
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let delivery = row.map(|(msg_id, read_ct, enqueued_at, message)| Delivery {
            queue: queue.to_string(),
            tag: msg_id,
            attempt: u32::try_from(read_ct).unwrap_or(u32::MAX),
            enqueued_at,
            message,
        });

        count(queue, if delivery.is_some() { "read" } else { "read_empty" });
        Ok(delivery)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(pgmq_name(&delivery.queue))
            .bind(delivery.tag)
            .execute(&self.pool)
            .await?;
        count(&delivery.queue, "ack");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pgmq.send($1, $2, $3)")
            .bind(pgmq_name(&dead_letter_queue(&delivery.queue)))
            .bind(dead_letter_body(delivery, reason))
            .bind(0i32)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(pgmq_name(&delivery.queue))
            .bind(delivery.tag)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        count(&delivery.queue, "dead_letter");
        Ok(())
    }

    async fn wait(&self, queue: &str, timeout: Duration) -> Result<()> {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(inner) => {
                    *guard = Some(Listener {
                        inner,
                        channels: HashSet::new(),
                    })
                }
                Err(e) => {
                    warn!("PgListener connect failed: {e}, falling back to poll");
                    drop(guard);
                    tokio::time::sleep(timeout).await;
                    return Ok(());
                }
            }
        }

        let Some(listener) = guard.as_mut() else {
            return Ok(());
        };

        let channel = notify_channel(queue);
        if !listener.channels.contains(&channel) {
            listener.inner.listen(&channel).await?;
            listener.channels.insert(channel);
        }

        match tokio::time::timeout(timeout, listener.inner.recv()).await {
            Ok(Ok(notification)) => {
                debug!(channel = notification.channel(), "queue notified");
            }
            Ok(Err(e)) => {
                warn!("PgListener error: {e}, reconnecting on next wait");
                *guard = None;
            }
            Err(_) => {}
        }
        Ok(())
    }
}
