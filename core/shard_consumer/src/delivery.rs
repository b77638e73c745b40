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

use crate::types::{Record, SequenceNumber, ShardId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Formatter};
use thiserror::Error;
use tracing::trace;

/// Metadata attached to every delivered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeaders {
    pub stream: String,
    pub shard_id: ShardId,
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub approximate_arrival_timestamp: DateTime<Utc>,
}

impl RecordHeaders {
    pub fn new(stream: &str, shard_id: &ShardId, record: &Record) -> Self {
        Self {
            stream: stream.to_owned(),
            shard_id: shard_id.clone(),
            sequence_number: record.sequence_number.clone(),
            partition_key: record.partition_key.clone(),
            approximate_arrival_timestamp: record.approximate_arrival_timestamp,
        }
    }
}

/// Reasons a sink refuses a record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    /// The record is reported and then treated as processed.
    #[error("{reason}")]
    Failed { reason: String },
    /// The record is reported and read again on the next poll.
    #[error("{reason} (retry same position)")]
    RetrySamePosition { reason: String },
}

impl Rejection {
    pub fn failed(reason: impl Into<String>) -> Self {
        Rejection::Failed {
            reason: reason.into(),
        }
    }

    pub fn retry_same_position(reason: impl Into<String>) -> Self {
        Rejection::RetrySamePosition {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Rejection::Failed { reason } | Rejection::RetrySamePosition { reason } => reason,
        }
    }

    pub fn is_retry_same_position(&self) -> bool {
        matches!(self, Rejection::RetrySamePosition { .. })
    }
}

/// Downstream receiver of records, called in sequence order per shard.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn deliver(&self, record: &Record, headers: &RecordHeaders) -> Result<(), Rejection>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredRecord {
    pub headers: RecordHeaders,
    pub record: Record,
}

type Acceptance = Box<dyn Fn(&Record, &RecordHeaders) -> Result<(), Rejection> + Send + Sync>;

/// Sink pushing accepted records into a flume queue.
pub struct ChannelSink {
    sender: flume::Sender<DeliveredRecord>,
    acceptance: Option<Acceptance>,
}

impl ChannelSink {
    /// Creates the sink and its receiving end. `None` capacity means an unbounded queue.
    pub fn new(capacity: Option<usize>) -> (Self, flume::Receiver<DeliveredRecord>) {
        let (sender, receiver) = match capacity {
            Some(capacity) => flume::bounded(capacity),
            None => flume::unbounded(),
        };
        (
            Self {
                sender,
                acceptance: None,
            },
            receiver,
        )
    }

    /// Consults `acceptance` before queueing each record.
    pub fn with_acceptance<F>(mut self, acceptance: F) -> Self
    where
        F: Fn(&Record, &RecordHeaders) -> Result<(), Rejection> + Send + Sync + 'static,
    {
        self.acceptance = Some(Box::new(acceptance));
        self
    }
}

impl Debug for ChannelSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink")
            .field("queued", &self.sender.len())
            .field("acceptance", &self.acceptance.is_some())
            .finish()
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    async fn deliver(&self, record: &Record, headers: &RecordHeaders) -> Result<(), Rejection> {
        if let Some(acceptance) = &self.acceptance {
            acceptance(record, headers)?;
        }

        self.sender
            .send_async(DeliveredRecord {
                headers: headers.clone(),
                record: record.clone(),
            })
            .await
            .map_err(|_| Rejection::failed("delivery queue is disconnected"))?;
        trace!(
            "Queued record: {} from shard: {} of stream: {}",
            headers.sequence_number, headers.shard_id, headers.stream
        );
        Ok(())
    }
}
