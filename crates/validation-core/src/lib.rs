//! Shared core abstractions for the validation orchestrator.
//!
//! This crate defines the cross-crate contracts used by the job preparation and job execution
//! services: the message queue, the validation job ledger, the validator registry and sandbox,
//! and the managed worker pool that drives both services.
//!
//! # API notes
//! `validation-core` is an internal crate (`publish = false`). Its public API uses a few
//! third-party types (`chrono::DateTime<Utc>`, `serde_json::Value`) as part of the orchestrator
//! contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{fmt, time::Duration};

pub mod ledger;
pub mod lite;
pub mod model;
pub mod pool;
pub mod sandbox;
pub mod validators;
pub mod workdir;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn into_anyhow(self) -> anyhow::Error {
        self.inner
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alternate formatting keeps the context chain ("commit ledger tx: connection reset").
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Opaque token used to acknowledge or requeue the message.
    ///
    /// - PgQueue: UUID string
    /// - MemoryQueue: UUID string
    pub ack_token: String,

    /// Provider message id (for tracing).
    pub message_id: String,

    pub queue_name: String,
    pub payload: Value,
    pub deliveries: i32,
}

/// At-least-once message queue with explicit per-message acknowledge/requeue.
///
/// Delivery is pull based: a consumer calls [`Queue::receive`], handles each message, then either
/// acks it (done, or permanently undeliverable) or requeues it for redelivery.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String>;

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    async fn ack(&self, ack_token: &str) -> Result<()>;

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()>;
}
