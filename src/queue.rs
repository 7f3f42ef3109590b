//! Redis-based job queue for preview jobs.
//!
//! Jobs wait as JSON strings on a pending list. Receiving atomically moves a
//! message onto this worker's in-flight list (`BLMOVE`), and acknowledging
//! removes it from there. A message whose worker dies before acknowledging
//! stays in flight until [`MessageQueue::recover`] puts it back, so delivery
//! is at-least-once.

use crate::error::Result;
use crate::job::Job;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A message handed out by [`MessageQueue::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Raw message body, also the handle used to acknowledge it.
    pub body: String,
}

impl Delivery {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Decodes the `{id, url, postBackUrl}` body.
    pub fn decode(&self) -> Result<Job> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Adds a job to the pending list.
    async fn enqueue(&self, job: &Job) -> Result<()>;

    /// Waits up to `wait` for the next message. `None` means the wait ran out.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Removes a received message for good.
    async fn acknowledge(&self, delivery: &Delivery) -> Result<()>;

    /// Returns unacknowledged messages from a previous run to the pending list.
    async fn recover(&self) -> Result<usize>;
}

/// Redis-backed [`MessageQueue`].
///
/// `ConnectionManager` is a cheap, reconnecting handle; every call works on
/// its own clone so the queue can be shared behind `&self`. Clones still share
/// one socket, and a pending `receive` blocks it: producers need a queue built
/// on a separate connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    pending_key: String,
    in_flight_key: String,
}

impl RedisQueue {
    /// Creates a queue on `queue_name`. `worker_id` names this instance's
    /// in-flight list; reuse it across restarts to recover stranded jobs.
    pub fn new(conn: ConnectionManager, queue_name: &str, worker_id: &str) -> Self {
        Self {
            conn,
            pending_key: queue_name.to_string(),
            in_flight_key: in_flight_key(queue_name, worker_id),
        }
    }

    /// Returns the current number of pending jobs.
    pub async fn queue_length(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.pending_key).await?;
        Ok(len)
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn enqueue(&self, job: &Job) -> Result<()> {
        let body = serde_json::to_string(job)?;

        let mut conn = self.conn.clone();
        // RPUSH + BLMOVE LEFT keeps FIFO order
        conn.rpush::<_, _, ()>(&self.pending_key, &body).await?;

        info!(job_id = %job.id, url = %job.url, "Added the job to the queue");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.pending_key)
            .arg(&self.in_flight_key)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        if body.is_some() {
            debug!("Received a message from the queue");
        }
        Ok(body.map(Delivery::new))
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(&self.in_flight_key, 1, &delivery.body).await?;
        if removed == 0 {
            warn!("Acknowledged message was no longer in flight");
        }
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            // Popping from the right keeps the in-flight order at the head of the pending list.
            let body: Option<String> = redis::cmd("LMOVE")
                .arg(&self.in_flight_key)
                .arg(&self.pending_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if body.is_none() {
                break;
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!(count = recovered, "Returned unacknowledged messages to the queue");
        }
        Ok(recovered)
    }
}

fn in_flight_key(queue_name: &str, worker_id: &str) -> String {
    format!("{}:in-flight:{}", queue_name, worker_id)
}
