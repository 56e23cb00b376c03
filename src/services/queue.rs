use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "leafscan:dispatch";
const PROCESSING_KEY: &str = "leafscan:dispatch_processing";

/// Batch dispatch command serialized into Redis. The job row already
/// exists (pending) when this is enqueued; the worker claims it.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub job_id: Uuid,
    pub store_name: String,
    pub prefix: String,
}

/// Redis-backed queue for batch dispatch commands.
pub struct DispatchQueue {
    client: redis::Client,
}

impl DispatchQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Enqueue a dispatch command.
    pub async fn enqueue(&self, command: &DispatchCommand) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(command).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Dequeue a command for processing (pop with move to processing list).
    pub async fn dequeue(&self) -> Result<Option<DispatchCommand>, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let command: DispatchCommand =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge a command (remove from processing list). A command
    /// is redelivered only if the worker dies before calling this.
    pub async fn complete(&self, command: &DispatchCommand) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(command).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Return a command to the queue after a failed handling attempt.
    /// Removes it from the processing list and pushes it back behind
    /// any newer commands so it gets redelivered.
    pub async fn release(&self, command: &DispatchCommand) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(command).map_err(QueueError::Serialize)?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &payload)
            .lpush(QUEUE_KEY, &payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending dispatch commands).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
