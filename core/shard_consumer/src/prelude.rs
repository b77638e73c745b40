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

//! Prelude module for the shard consumer.
//!
//! # Examples
//!
//! ```
//! use shard_consumer::prelude::*;
//! ```

pub use crate::backoff::{BackoffConfig, ExponentialBackoff};
pub use crate::checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use crate::config::{CheckpointMode, ConsumerConfig, InitialPosition};
pub use crate::consumer::{ConsumerContext, ConsumerState, ShardConsumer, ShardOutcome};
pub use crate::delivery::{ChannelSink, DeliveredRecord, DeliverySink, RecordHeaders, Rejection};
pub use crate::error::ConsumerError;
pub use crate::error_callback::{
    ChannelErrorCallback, ErrorCallback, ErrorEvent, LogErrorCallback,
};
pub use crate::locking::{LockRegistry, MemoryLockRegistry};
pub use crate::service::{
    GetRecordsOutput, MemoryStreamService, ServiceError, ShardIteratorToken, StreamDescription,
    StreamService, StreamStatus,
};
pub use crate::supervisor::{ConsumerSupervisor, ReconcileReport};
pub use crate::topology::{ShardGraph, ShardTopology};
pub use crate::types::{
    Checkpoint, HashKeyRange, IteratorPosition, Record, SequenceNumber, SequenceRange, Shard,
    ShardId, ShardKey, ShardState,
};
