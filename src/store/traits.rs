//! Persistence interface for planner checkpoints.

use async_trait::async_trait;

use crate::decision::types::Checkpoint;
use crate::error::DatabaseError;

/// Keyed `(stage, state)` storage, one row per message id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest checkpoint for `message_id`, if any.
    async fn load(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError>;

    /// Insert or replace the checkpoint for its message id.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError>;
}
