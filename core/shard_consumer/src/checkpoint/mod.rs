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

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use crate::error::ConsumerError;
use crate::types::{Checkpoint, ShardId};
use async_trait::async_trait;

/// Durable per-shard progress shared by every consumer instance of a stream.
///
/// Writes are unconditional overwrites, the last writer wins. Monotonicity is kept by
/// the single consumer holding the shard lock, not by the store.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    async fn get(&self, stream: &str, shard_id: &ShardId)
    -> Result<Option<Checkpoint>, ConsumerError>;

    async fn put(
        &self,
        stream: &str,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<(), ConsumerError>;

    async fn remove(&self, stream: &str, shard_id: &ShardId) -> Result<(), ConsumerError>;
}
