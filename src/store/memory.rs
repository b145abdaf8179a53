use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::decision::types::Checkpoint;
use crate::error::DatabaseError;
use crate::store::traits::CheckpointStore;

/// In-process checkpoint store. Lost on restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, message_id: &str) -> Result<Option<Checkpoint>, DatabaseError> {
        Ok(self.checkpoints.read().await.get(message_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.message_id.clone(), checkpoint.clone());
        Ok(())
    }
}
