use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::{Error, Queue, QueueMessage, Result};

/// Queue stored in `state.queue_messages`.
///
/// Receiving hides a message for `visibility_timeout`; a message that is neither acked nor
/// requeued in time becomes visible again, which is what makes delivery at-least-once.
/// Concurrent receivers never pick the same row (`FOR UPDATE SKIP LOCKED`).
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Messages of `queue` not yet acked, visible or not.
    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM state.queue_messages WHERE queue_name = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("count queue={queue}"))?;
        Ok(depth)
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO state.queue_messages (message_id, queue_name, payload, available_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(message_id)
        .bind(queue)
        .bind(payload)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("publish to queue={queue}"))?;

        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let rows = sqlx::query(
            r#"
            UPDATE state.queue_messages AS m
            SET invisible_until = now() + make_interval(secs => $3),
                deliveries = m.deliveries + 1
            WHERE m.message_id IN (
              SELECT message_id
              FROM state.queue_messages
              WHERE queue_name = $1
                AND available_at <= now()
                AND coalesce(invisible_until, '-infinity') <= now()
              ORDER BY available_at, created_at
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            RETURNING m.message_id, m.queue_name, m.payload, m.deliveries
            "#,
        )
        .bind(queue)
        .bind(max)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("receive from queue={queue}"))?;

        rows.into_iter()
            .map(|row| -> Result<QueueMessage> {
                let message_id: Uuid = row.try_get("message_id")?;
                Ok(QueueMessage {
                    ack_token: message_id.to_string(),
                    message_id: message_id.to_string(),
                    queue_name: row.try_get("queue_name")?,
                    payload: row.try_get("payload")?,
                    deliveries: row.try_get("deliveries")?,
                })
            })
            .collect()
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        sqlx::query("DELETE FROM state.queue_messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("ack message_id={message_id}"))?;
        Ok(())
    }

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        sqlx::query(
            r#"
            UPDATE state.queue_messages
            SET available_at = now() + make_interval(secs => $2),
                invisible_until = NULL
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .with_context(|| format!("requeue message_id={message_id}"))?;
        Ok(())
    }
}

fn parse_ack_token(ack_token: &str) -> Result<Uuid> {
    ack_token
        .parse::<Uuid>()
        .map_err(|err| Error::msg(format!("invalid pgqueue ack token '{ack_token}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_tokens_must_be_uuids() {
        assert!(parse_ack_token("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_ack_token(&id.to_string()).unwrap(), id);
    }
}
