//! Managed worker pool.
//!
//! A pool runs a fixed number of identical consumer loops over one queue. Each loop owns its own
//! shutdown signal, pulls one message at a time and hands it to a [`MessageHandler`]:
//! - `Ok(())` acks the message (handled, or dropped as undeliverable by the handler);
//! - `Err(_)` requeues it for redelivery after `requeue_delay`, or dead-letters it when the
//!   failing delivery is the `max_deliveries`-th (or later).
//!
//! A failure to receive from the queue is fatal to that loop only. It is reported once through
//! [`WorkerPool::monitor`] and the loop stops; restarting is left to the operator.
//! In-flight handlers are never interrupted: shutdown waits for the current message to finish.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{Error, Queue, QueueMessage, Result};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
struct PoolConfig {
    name: String,
    queue_name: String,
    worker_count: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
    requeue_delay: Duration,
    max_deliveries: i32,
}

pub struct WorkerPoolBuilder {
    name: String,
    queue_name: Option<String>,
    queue: Option<Arc<dyn Queue>>,
    worker_count: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
    requeue_delay: Duration,
    max_deliveries: i32,
}

impl WorkerPoolBuilder {
    /// Prefix for worker ids (`{name}-{index}`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    /// Dead-letter a failing message once it has been delivered this many times. `0` disables
    /// dead-lettering.
    pub fn max_deliveries(mut self, max_deliveries: i32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    pub fn build(self) -> Result<WorkerPool> {
        let queue_name = self
            .queue_name
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::msg("queue_name is required"))?;
        let queue = self.queue.ok_or_else(|| Error::msg("queue is required"))?;
        if self.worker_count == 0 {
            return Err(Error::msg("worker_count must be at least 1"));
        }

        Ok(WorkerPool {
            cfg: Arc::new(PoolConfig {
                name: self.name,
                queue_name,
                worker_count: self.worker_count,
                poll_interval: self.poll_interval,
                visibility_timeout: self.visibility_timeout,
                requeue_delay: self.requeue_delay,
                max_deliveries: self.max_deliveries,
            }),
            queue,
            workers: Vec::new(),
            monitor_rx: None,
        })
    }
}

struct Worker {
    id: String,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub struct WorkerPool {
    cfg: Arc<PoolConfig>,
    queue: Arc<dyn Queue>,
    workers: Vec<Worker>,
    monitor_rx: Option<mpsc::Receiver<Error>>,
}

impl WorkerPool {
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            name: "worker".to_string(),
            queue_name: None,
            queue: None,
            worker_count: 1,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
            requeue_delay: Duration::from_secs(5),
            max_deliveries: 0,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.cfg.queue_name
    }

    /// Spawn `worker_count` consumer loops, each invoking `handler` per message.
    pub fn start(&mut self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !self.workers.is_empty() {
            return Err(Error::msg(format!(
                "worker pool {} already started",
                self.cfg.name
            )));
        }

        // Each loop reports at most one fatal error, so the channel never fills up.
        let (monitor_tx, monitor_rx) = mpsc::channel(self.cfg.worker_count);
        self.monitor_rx = Some(monitor_rx);

        for i in 0..self.cfg.worker_count {
            let id = format!("{}-{i}", self.cfg.name);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let consumer = Consumer {
                id: id.clone(),
                cfg: self.cfg.clone(),
                queue: self.queue.clone(),
                handler: handler.clone(),
            };
            let join = tokio::spawn(consumer.run(shutdown_rx, monitor_tx.clone()));
            self.workers.push(Worker {
                id,
                shutdown_tx,
                join,
            });
        }

        tracing::info!(
            event = "validation.pool.started",
            pool = %self.cfg.name,
            queue = %self.cfg.queue_name,
            workers = self.cfg.worker_count,
            "worker pool started"
        );
        Ok(())
    }

    /// Channel yielding the first fatal receive error of each loop.
    ///
    /// The channel closes once every loop has stopped. Calling this before [`WorkerPool::start`]
    /// (or a second time) yields a channel holding a single "not started" error.
    pub fn monitor(&mut self) -> mpsc::Receiver<Error> {
        match self.monitor_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Error::msg(format!(
                    "worker pool {} has not been started",
                    self.cfg.name
                )));
                rx
            }
        }
    }

    /// Signal every loop to stop and wait until each one has.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            let _ = worker.shutdown_tx.send(true);
        }

        for worker in self.workers {
            if let Err(err) = worker.join.await {
                tracing::error!(
                    event = "validation.pool.worker.join_failed",
                    worker_id = %worker.id,
                    error = %err,
                    "worker task ended abnormally"
                );
            }
        }

        tracing::info!(
            event = "validation.pool.shutdown",
            pool = %self.cfg.name,
            "worker pool stopped"
        );
    }
}

struct Consumer {
    id: String,
    cfg: Arc<PoolConfig>,
    queue: Arc<dyn Queue>,
    handler: Arc<dyn MessageHandler>,
}

impl Consumer {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, monitor_tx: mpsc::Sender<Error>) {
        tracing::debug!(
            event = "validation.pool.worker.started",
            worker_id = %self.id,
            queue = %self.cfg.queue_name,
            "worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown_rx.changed() => break,
                res = self.queue.receive(&self.cfg.queue_name, 1, self.cfg.visibility_timeout) => res,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::error!(
                        event = "validation.pool.worker.receive_failed",
                        worker_id = %self.id,
                        queue = %self.cfg.queue_name,
                        error = %err,
                        "worker stopped after receive error"
                    );
                    let _ = monitor_tx.try_send(err);
                    break;
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                }
                continue;
            }

            for msg in messages {
                self.process(msg).await;
            }
        }

        tracing::debug!(
            event = "validation.pool.worker.stopped",
            worker_id = %self.id,
            "worker stopped"
        );
    }

    async fn process(&self, msg: QueueMessage) {
        let ack_token = msg.ack_token.clone();

        let err = match self.handler.handle(&msg).await {
            Ok(()) => {
                if let Err(err) = self.queue.ack(&ack_token).await {
                    tracing::warn!(
                        event = "validation.pool.message.ack_failed",
                        worker_id = %self.id,
                        message_id = %msg.message_id,
                        error = %err,
                        "failed to ack message"
                    );
                }
                return;
            }
            Err(err) => err,
        };

        if self.cfg.max_deliveries > 0 && msg.deliveries >= self.cfg.max_deliveries {
            if let Err(dlq_err) = self.dead_letter(&msg, &err).await {
                tracing::warn!(
                    event = "validation.pool.message.dlq_failed",
                    worker_id = %self.id,
                    message_id = %msg.message_id,
                    error = %dlq_err,
                    "failed to dead-letter message; requeueing"
                );
            } else {
                return;
            }
        }

        tracing::warn!(
            event = "validation.pool.message.requeued",
            worker_id = %self.id,
            message_id = %msg.message_id,
            deliveries = msg.deliveries,
            error = %format!("{err:#}"),
            "message handling failed; requeueing"
        );
        if let Err(err) = self
            .queue
            .nack_or_requeue(&ack_token, self.cfg.requeue_delay)
            .await
        {
            tracing::warn!(
                event = "validation.pool.message.requeue_failed",
                worker_id = %self.id,
                message_id = %msg.message_id,
                error = %err,
                "failed to requeue message"
            );
        }
    }

    async fn dead_letter(&self, msg: &QueueMessage, err: &anyhow::Error) -> anyhow::Result<()> {
        let dlq = format!("{}_dlq", self.cfg.queue_name);
        let payload = serde_json::json!({
            "error": format!("{err:#}"),
            "original": msg.payload,
        });
        self.queue
            .publish(&dlq, payload, Utc::now())
            .await
            .context("publish to dlq")?;
        self.queue.ack(&msg.ack_token).await.context("ack dead-lettered")?;

        tracing::warn!(
            event = "validation.pool.message.dead_lettered",
            worker_id = %self.id,
            message_id = %msg.message_id,
            deliveries = msg.deliveries,
            dlq = %dlq,
            "message reached max deliveries"
        );
        Ok(())
    }
}
