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

use crate::error::ConsumerError;
use crate::locking::LockRegistry;
use crate::types::ShardKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct MemoryLockRegistry {
    leases: Mutex<HashMap<ShardKey, Lease>>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

impl MemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of the shard, if any.
    pub async fn holder(&self, key: &ShardKey) -> Option<String> {
        let now = Instant::now();
        self.leases
            .lock()
            .await
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl LockRegistry for MemoryLockRegistry {
    async fn try_acquire(
        &self,
        key: &ShardKey,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, ConsumerError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        if let Some(current) = leases.get(key).filter(|current| current.is_live(now)) {
            if current.holder != holder {
                debug!("Lock for shard: {key} is held by: {}", current.holder);
                return Ok(false);
            }
        }

        let previous = leases.insert(
            key.clone(),
            Lease {
                holder: holder.to_owned(),
                expires_at: now + lease,
            },
        );
        if let Some(previous) = previous.filter(|previous| previous.holder != holder) {
            info!(
                "Lock for shard: {key} lapsed for: {}, taken over by: {holder}",
                previous.holder
            );
        }
        Ok(true)
    }

    async fn release(&self, key: &ShardKey, holder: &str) -> Result<(), ConsumerError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|lease| lease.holder == holder) {
            leases.remove(key);
            debug!("Released lock for shard: {key} by: {holder}");
        }
        Ok(())
    }

    async fn is_held_by_me(&self, key: &ShardKey, holder: &str) -> Result<bool, ConsumerError> {
        let now = Instant::now();
        Ok(self
            .leases
            .lock()
            .await
            .get(key)
            .is_some_and(|lease| lease.holder == holder && lease.is_live(now)))
    }
}
