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

pub use memory::MemoryStreamService;

use crate::types::{IteratorPosition, Record, Shard, ShardId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum::Display as StrumDisplay;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Stream: {0} was not found")]
    StreamNotFound(String),
    #[error("Shard: {shard_id} was not found in stream: {stream}")]
    ShardNotFound { stream: String, shard_id: ShardId },
    #[error("Shard iterator has expired or is invalid")]
    IteratorExpired,
    #[error("Throughput limit exceeded")]
    Throttled,
    #[error("Stream service is unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Errors worth retrying with backoff without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Throttled | ServiceError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StreamStatus {
    Creating,
    Active,
    Updating,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescription {
    pub stream_name: String,
    pub status: StreamStatus,
    pub open_shard_count: usize,
}

/// Opaque, single-use cursor issued by the stream service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardIteratorToken(String);

impl ShardIteratorToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ShardIteratorToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// Absent once a closed shard has been read to its end.
    pub next_shard_iterator: Option<ShardIteratorToken>,
    pub shard_closed: bool,
    pub millis_behind_latest: u64,
}

impl GetRecordsOutput {
    pub fn reached_shard_end(&self) -> bool {
        self.shard_closed && self.next_shard_iterator.is_none()
    }
}

/// Operations consumed from the partitioned stream log.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamService: Send + Sync + 'static {
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, ServiceError>;

    async fn list_shards(&self, stream: &str) -> Result<Vec<Shard>, ServiceError>;

    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ShardIteratorToken, ServiceError>;

    async fn get_records(
        &self,
        iterator: &ShardIteratorToken,
        limit: usize,
    ) -> Result<GetRecordsOutput, ServiceError>;
}
