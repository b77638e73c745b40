/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use crate::checkpoint::CheckpointStore;
use crate::error::ConsumerError;
use crate::types::{Checkpoint, ShardId, ShardKey};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<ShardKey, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(
        &self,
        stream: &str,
        shard_id: &ShardId,
    ) -> Result<Option<Checkpoint>, ConsumerError> {
        let key = ShardKey::new(stream, shard_id.clone());
        Ok(self.checkpoints.get(&key).map(|entry| entry.value().clone()))
    }

    async fn put(
        &self,
        stream: &str,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<(), ConsumerError> {
        trace!("Storing checkpoint: {checkpoint} for shard: {shard_id} of stream: {stream}");
        self.checkpoints
            .insert(ShardKey::new(stream, shard_id.clone()), checkpoint);
        Ok(())
    }

    async fn remove(&self, stream: &str, shard_id: &ShardId) -> Result<(), ConsumerError> {
        self.checkpoints
            .remove(&ShardKey::new(stream, shard_id.clone()));
        Ok(())
    }
}
