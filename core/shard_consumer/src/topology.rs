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
use crate::service::{ServiceError, StreamService, StreamStatus};
use crate::types::{Checkpoint, Shard, ShardId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Snapshot of the lineage graph taken by [`ShardTopology::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGraph {
    shards: BTreeMap<ShardId, Shard>,
    consumable: Vec<ShardId>,
}

impl ShardGraph {
    /// Shards that may be assigned now, in shard id order.
    pub fn consumable(&self) -> &[ShardId] {
        &self.consumable
    }

    pub fn is_consumable(&self, shard_id: &ShardId) -> bool {
        self.consumable.contains(shard_id)
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&Shard> {
        self.shards.get(shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Tracks the split/merge lineage of one stream's shards.
///
/// Shards are never removed from the graph once seen, and a closed shard never reopens.
pub struct ShardTopology {
    stream: String,
    service: Arc<dyn StreamService>,
    checkpoints: Arc<dyn CheckpointStore>,
    shards: BTreeMap<ShardId, Shard>,
    drained: HashSet<ShardId>,
    abandoned: HashSet<ShardId>,
}

impl ShardTopology {
    pub fn new(
        stream: impl Into<String>,
        service: Arc<dyn StreamService>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            stream: stream.into(),
            service,
            checkpoints,
            shards: BTreeMap::new(),
            drained: HashSet::new(),
            abandoned: HashSet::new(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Lists the stream's shards, merges them into the graph and computes the consumable set.
    pub async fn refresh(&mut self) -> Result<ShardGraph, ConsumerError> {
        let description = self
            .service
            .describe_stream(&self.stream)
            .await
            .map_err(|error| self.unavailable(error))?;
        match description.status {
            StreamStatus::Creating | StreamStatus::Deleting => {
                return Err(ConsumerError::TopologyUnavailable {
                    stream: self.stream.clone(),
                    reason: format!("stream status is {}", description.status),
                });
            }
            StreamStatus::Active | StreamStatus::Updating => {}
        }

        let listed = self
            .service
            .list_shards(&self.stream)
            .await
            .map_err(|error| self.unavailable(error))?;
        for shard in listed {
            self.merge(shard);
        }

        let mut consumable = Vec::new();
        let shard_ids = self.shards.keys().cloned().collect::<Vec<_>>();
        for shard_id in shard_ids {
            if self.abandoned.contains(&shard_id) || self.is_drained(&shard_id).await? {
                continue;
            }
            if self.parents_finished(&shard_id).await? {
                consumable.push(shard_id);
            }
        }

        debug!(
            "Refreshed topology of stream: {} with {} shards, consumable: {:?}",
            self.stream,
            self.shards.len(),
            consumable
        );
        Ok(ShardGraph {
            shards: self.shards.clone(),
            consumable,
        })
    }

    /// Excludes a shard from consumption and stops it from blocking its children.
    pub fn mark_abandoned(&mut self, shard_id: &ShardId) {
        if self.abandoned.insert(shard_id.clone()) {
            warn!(
                "Shard: {shard_id} of stream: {} was abandoned, its children may proceed",
                self.stream
            );
        }
    }

    pub fn is_abandoned(&self, shard_id: &ShardId) -> bool {
        self.abandoned.contains(shard_id)
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<&Shard> {
        self.shards.get(shard_id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    pub fn children_of(&self, shard_id: &ShardId) -> Vec<&Shard> {
        self.shards
            .values()
            .filter(|shard| shard.is_child_of(shard_id))
            .collect()
    }

    fn merge(&mut self, shard: Shard) {
        match self.shards.get_mut(&shard.shard_id) {
            None => {
                info!(
                    "Discovered shard: {shard} of stream: {}, parents: {:?}",
                    self.stream,
                    shard.parents().collect::<Vec<_>>()
                );
                self.shards.insert(shard.shard_id.clone(), shard);
            }
            Some(known) if !known.is_closed() && shard.is_closed() => {
                info!("Shard: {} of stream: {} was closed", shard.shard_id, self.stream);
                known.sequence_range = shard.sequence_range;
            }
            Some(_) => {}
        }
    }

    async fn is_drained(&mut self, shard_id: &ShardId) -> Result<bool, ConsumerError> {
        if self.drained.contains(shard_id) {
            return Ok(true);
        }

        let Some(shard) = self.shards.get(shard_id) else {
            return Ok(false);
        };
        let Some(ending_sequence_number) = shard.ending_sequence_number() else {
            return Ok(false);
        };
        let drained = match self.checkpoints.get(&self.stream, shard_id).await? {
            Some(Checkpoint::ShardEnd) => true,
            Some(checkpoint) => checkpoint.covers(ending_sequence_number),
            None => false,
        };
        if drained {
            trace!("Shard: {shard_id} of stream: {} is drained", self.stream);
            self.drained.insert(shard_id.clone());
        }
        Ok(drained)
    }

    async fn parents_finished(&mut self, shard_id: &ShardId) -> Result<bool, ConsumerError> {
        let parents = match self.shards.get(shard_id) {
            Some(shard) => shard.parents().cloned().collect::<Vec<_>>(),
            None => return Ok(false),
        };
        for parent in parents {
            if !self.shards.contains_key(&parent) || self.abandoned.contains(&parent) {
                continue;
            }
            if !self.is_drained(&parent).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn unavailable(&self, error: ServiceError) -> ConsumerError {
        match error {
            ServiceError::StreamNotFound(_) => ConsumerError::TopologyUnavailable {
                stream: self.stream.clone(),
                reason: error.to_string(),
            },
            error if error.is_transient() => ConsumerError::TopologyUnavailable {
                stream: self.stream.clone(),
                reason: error.to_string(),
            },
            error => ConsumerError::Service(error),
        }
    }
}
