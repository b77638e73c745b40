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

use crate::service::ServiceError;
use crate::types::{ShardId, ShardKey};
use strum::IntoStaticStr;
use thiserror::Error;

#[derive(Clone, Debug, Error, IntoStaticStr, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Invalid sequence number: {0}")]
    InvalidSequenceNumber(String),
    #[error("Topology of stream: {stream} is unavailable. {reason}")]
    TopologyUnavailable { stream: String, reason: String },
    #[error("Shard iterator for shard: {0} has expired and could not be regenerated")]
    IteratorExpired(ShardKey),
    #[error("Shard: {shard_id} was not found in stream: {stream}")]
    ShardNotFound { stream: String, shard_id: ShardId },
    #[error("Lock for shard: {0} is no longer held by this consumer")]
    LockLost(ShardKey),
    #[error("Delivery of record with sequence number: {sequence_number} was rejected. {reason}")]
    DeliveryRejected {
        sequence_number: String,
        reason: String,
    },
    #[error("Stream service failed {attempts} times in a row for shard: {key}. {cause}")]
    ServiceTransient {
        key: ShardKey,
        attempts: u32,
        cause: ServiceError,
    },
    #[error("Stream service error: {0}")]
    Service(ServiceError),
    #[error("Lock registry error: {0}")]
    LockRegistry(String),
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),
    #[error("Consumer task for shard: {0} has panicked")]
    ConsumerPanicked(ShardKey),
}

impl ConsumerError {
    pub fn as_code(&self) -> &'static str {
        self.into()
    }

    /// Fatal errors terminate the owning shard consumer, everything else is retried in place.
    pub fn is_fatal_for_shard(&self) -> bool {
        matches!(
            self,
            ConsumerError::IteratorExpired(_)
                | ConsumerError::ShardNotFound { .. }
                | ConsumerError::LockLost(_)
                | ConsumerError::ServiceTransient { .. }
                | ConsumerError::ConsumerPanicked(_)
        )
    }
}
