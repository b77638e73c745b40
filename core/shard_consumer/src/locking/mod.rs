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

mod memory;

pub use memory::MemoryLockRegistry;

use crate::error::ConsumerError;
use crate::types::ShardKey;
use async_trait::async_trait;
use std::time::Duration;

/// Lease-based mutual exclusion over shards, shared by competing consumer instances.
#[async_trait]
pub trait LockRegistry: Send + Sync + 'static {
    /// Acquires or renews the lease. Never blocks waiting for another holder.
    async fn try_acquire(
        &self,
        key: &ShardKey,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, ConsumerError>;

    /// Releases the lease, doing nothing unless `holder` owns it.
    async fn release(&self, key: &ShardKey, holder: &str) -> Result<(), ConsumerError>;

    async fn is_held_by_me(&self, key: &ShardKey, holder: &str) -> Result<bool, ConsumerError>;
}
