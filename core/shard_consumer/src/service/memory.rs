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

use crate::service::{
    GetRecordsOutput, ServiceError, ShardIteratorToken, StreamDescription, StreamService,
    StreamStatus,
};
use crate::types::{
    HashKeyRange, IteratorPosition, Record, SequenceNumber, SequenceRange, Shard, ShardId,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_ITERATOR_TTL: Duration = Duration::from_secs(300);
const FIRST_SEQUENCE_NUMBER: u128 = 49_590_338_271_490_256_608_559_692_538_361_571_095;

/// In-process stream log with Kinesis semantics: hash-key routed shards, splits and
/// merges that close the parents, and single-use iterators that expire.
#[derive(Debug)]
pub struct MemoryStreamService {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    streams: HashMap<String, MemoryStream>,
    iterators: HashMap<String, IteratorEntry>,
    next_iterator_id: u64,
    injected_failures: usize,
    iterator_ttl: Duration,
}

#[derive(Debug)]
struct MemoryStream {
    status: StreamStatus,
    shards: Vec<MemoryShard>,
    next_sequence_number: u128,
    next_shard_index: u32,
}

#[derive(Debug)]
struct MemoryShard {
    shard: Shard,
    records: Vec<Record>,
    trimmed: bool,
}

#[derive(Debug)]
struct IteratorEntry {
    stream: String,
    shard_id: ShardId,
    next_index: usize,
    issued_at: Instant,
}

impl Default for MemoryStreamService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamService {
    pub fn new() -> Self {
        Self::with_iterator_ttl(DEFAULT_ITERATOR_TTL)
    }

    pub fn with_iterator_ttl(iterator_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                iterators: HashMap::new(),
                next_iterator_id: 1,
                injected_failures: 0,
                iterator_ttl,
            }),
        }
    }

    /// Creates an active stream whose hash key space is split evenly across `shard_count` shards.
    pub async fn create_stream(&self, stream: &str, shard_count: u32) -> Vec<ShardId> {
        let shard_count = shard_count.max(1);
        let mut inner = self.inner.lock().await;
        let mut memory_stream = MemoryStream {
            status: StreamStatus::Active,
            shards: Vec::with_capacity(shard_count as usize),
            next_sequence_number: FIRST_SEQUENCE_NUMBER,
            next_shard_index: 0,
        };

        let width = u128::MAX / shard_count as u128;
        let mut shard_ids = Vec::with_capacity(shard_count as usize);
        for index in 0..shard_count {
            let starting_hash_key = width * index as u128;
            let ending_hash_key = if index + 1 == shard_count {
                u128::MAX
            } else {
                starting_hash_key + width - 1
            };
            let shard_id = memory_stream.add_shard(
                HashKeyRange {
                    starting_hash_key,
                    ending_hash_key,
                },
                None,
                None,
            );
            shard_ids.push(shard_id);
        }

        info!("Created stream: {stream} with {shard_count} shards.");
        inner.streams.insert(stream.to_owned(), memory_stream);
        shard_ids
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        inner
            .streams
            .remove(stream)
            .ok_or_else(|| ServiceError::StreamNotFound(stream.to_owned()))?;
        inner.iterators.retain(|_, entry| entry.stream != stream);
        info!("Deleted stream: {stream}.");
        Ok(())
    }

    pub async fn set_stream_status(
        &self,
        stream: &str,
        status: StreamStatus,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        memory_stream.status = status;
        Ok(())
    }

    /// Appends a record to the open shard owning the partition key's hash.
    pub async fn put_record(
        &self,
        stream: &str,
        partition_key: &str,
        data: impl Into<Bytes>,
    ) -> Result<(ShardId, SequenceNumber), ServiceError> {
        let hash_key = hash_key(partition_key);
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        let sequence_number = SequenceNumber::from(memory_stream.next_sequence_number);
        let shard = memory_stream
            .shards
            .iter_mut()
            .find(|shard| !shard.shard.is_closed() && shard.shard.hash_key_range.contains(hash_key))
            .ok_or_else(|| {
                ServiceError::Unavailable(format!("no open shard for hash key: {hash_key}"))
            })?;

        shard.records.push(Record {
            sequence_number: sequence_number.clone(),
            partition_key: partition_key.to_owned(),
            data: data.into(),
            approximate_arrival_timestamp: Utc::now(),
        });
        let shard_id = shard.shard.shard_id.clone();
        memory_stream.next_sequence_number += 1;
        debug!("Put record: {sequence_number} to shard: {shard_id} of stream: {stream}.");
        Ok((shard_id, sequence_number))
    }

    /// Closes `shard_id` and creates two children dividing its hash key range at `new_starting_hash_key`.
    pub async fn split_shard(
        &self,
        stream: &str,
        shard_id: &ShardId,
        new_starting_hash_key: u128,
    ) -> Result<(ShardId, ShardId), ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        let parent = memory_stream.open_shard(stream, shard_id)?;
        let range = parent.shard.hash_key_range;
        if new_starting_hash_key <= range.starting_hash_key
            || new_starting_hash_key > range.ending_hash_key
        {
            return Err(ServiceError::Unavailable(format!(
                "hash key: {new_starting_hash_key} does not split shard: {shard_id}"
            )));
        }

        parent.close();
        let left = memory_stream.add_shard(
            HashKeyRange {
                starting_hash_key: range.starting_hash_key,
                ending_hash_key: new_starting_hash_key - 1,
            },
            Some(shard_id.clone()),
            None,
        );
        let right = memory_stream.add_shard(
            HashKeyRange {
                starting_hash_key: new_starting_hash_key,
                ending_hash_key: range.ending_hash_key,
            },
            Some(shard_id.clone()),
            None,
        );
        info!("Split shard: {shard_id} of stream: {stream} into: {left} and {right}.");
        Ok((left, right))
    }

    /// Closes two shards with adjacent hash key ranges and creates their merged child.
    pub async fn merge_shards(
        &self,
        stream: &str,
        shard_id: &ShardId,
        adjacent_shard_id: &ShardId,
    ) -> Result<ShardId, ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        let first = memory_stream.open_shard(stream, shard_id)?.shard.hash_key_range;
        let second = memory_stream
            .open_shard(stream, adjacent_shard_id)?
            .shard
            .hash_key_range;
        let (lower, upper) = if first.starting_hash_key < second.starting_hash_key {
            (first, second)
        } else {
            (second, first)
        };
        if lower.ending_hash_key.checked_add(1) != Some(upper.starting_hash_key) {
            return Err(ServiceError::Unavailable(format!(
                "shards: {shard_id} and {adjacent_shard_id} are not adjacent"
            )));
        }

        memory_stream.open_shard(stream, shard_id)?.close();
        memory_stream.open_shard(stream, adjacent_shard_id)?.close();
        let child = memory_stream.add_shard(
            HashKeyRange {
                starting_hash_key: lower.starting_hash_key,
                ending_hash_key: upper.ending_hash_key,
            },
            Some(shard_id.clone()),
            Some(adjacent_shard_id.clone()),
        );
        info!(
            "Merged shards: {shard_id} and {adjacent_shard_id} of stream: {stream} into: {child}."
        );
        Ok(child)
    }

    /// Removes a closed shard from listings, as retention eventually does.
    pub async fn trim_shard(&self, stream: &str, shard_id: &ShardId) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        let shard = memory_stream
            .shards
            .iter_mut()
            .find(|shard| &shard.shard.shard_id == shard_id)
            .ok_or_else(|| ServiceError::ShardNotFound {
                stream: stream.to_owned(),
                shard_id: shard_id.clone(),
            })?;
        shard.trimmed = true;
        Ok(())
    }

    /// Invalidates every outstanding iterator.
    pub async fn expire_iterators(&self) {
        self.inner.lock().await.iterators.clear();
    }

    /// Makes the next `count` get-records calls fail with a transient error.
    pub async fn fail_next_get_records(&self, count: usize) {
        self.inner.lock().await.injected_failures = count;
    }

    pub async fn shard_records(
        &self,
        stream: &str,
        shard_id: &ShardId,
    ) -> Result<Vec<Record>, ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        memory_stream
            .shards
            .iter()
            .find(|shard| &shard.shard.shard_id == shard_id)
            .map(|shard| shard.records.clone())
            .ok_or_else(|| ServiceError::ShardNotFound {
                stream: stream.to_owned(),
                shard_id: shard_id.clone(),
            })
    }
}

impl Inner {
    fn stream_mut(&mut self, stream: &str) -> Result<&mut MemoryStream, ServiceError> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| ServiceError::StreamNotFound(stream.to_owned()))
    }

    fn issue_iterator(
        &mut self,
        stream: &str,
        shard_id: &ShardId,
        next_index: usize,
    ) -> ShardIteratorToken {
        let token = format!("{stream}/{shard_id}/{}", self.next_iterator_id);
        self.next_iterator_id += 1;
        self.iterators.insert(
            token.clone(),
            IteratorEntry {
                stream: stream.to_owned(),
                shard_id: shard_id.clone(),
                next_index,
                issued_at: Instant::now(),
            },
        );
        ShardIteratorToken::new(token)
    }
}

impl MemoryStream {
    fn add_shard(
        &mut self,
        hash_key_range: HashKeyRange,
        parent_shard_id: Option<ShardId>,
        adjacent_parent_shard_id: Option<ShardId>,
    ) -> ShardId {
        let shard_id = ShardId::new(format!("shardId-{:012}", self.next_shard_index));
        self.next_shard_index += 1;
        self.shards.push(MemoryShard {
            shard: Shard {
                shard_id: shard_id.clone(),
                parent_shard_id,
                adjacent_parent_shard_id,
                hash_key_range,
                sequence_range: SequenceRange {
                    starting_sequence_number: SequenceNumber::from(self.next_sequence_number),
                    ending_sequence_number: None,
                },
            },
            records: Vec::new(),
            trimmed: false,
        });
        shard_id
    }

    fn open_shard(
        &mut self,
        stream: &str,
        shard_id: &ShardId,
    ) -> Result<&mut MemoryShard, ServiceError> {
        self.shards
            .iter_mut()
            .find(|shard| &shard.shard.shard_id == shard_id && !shard.shard.is_closed())
            .ok_or_else(|| ServiceError::ShardNotFound {
                stream: stream.to_owned(),
                shard_id: shard_id.clone(),
            })
    }

    fn shard(&self, stream: &str, shard_id: &ShardId) -> Result<&MemoryShard, ServiceError> {
        self.shards
            .iter()
            .find(|shard| &shard.shard.shard_id == shard_id && !shard.trimmed)
            .ok_or_else(|| ServiceError::ShardNotFound {
                stream: stream.to_owned(),
                shard_id: shard_id.clone(),
            })
    }
}

impl MemoryShard {
    fn close(&mut self) {
        let ending_sequence_number = self
            .records
            .last()
            .map(|record| record.sequence_number.clone())
            .unwrap_or_else(|| self.shard.sequence_range.starting_sequence_number.clone());
        self.shard.sequence_range.ending_sequence_number = Some(ending_sequence_number);
    }

    fn start_index(&self, position: &IteratorPosition) -> usize {
        match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::Latest => self.records.len(),
            IteratorPosition::AtTimestamp(timestamp) => self
                .records
                .partition_point(|record| record.approximate_arrival_timestamp < *timestamp),
            IteratorPosition::AtSequenceNumber(sequence_number) => self
                .records
                .partition_point(|record| record.sequence_number < *sequence_number),
            IteratorPosition::AfterSequenceNumber(sequence_number) => self
                .records
                .partition_point(|record| record.sequence_number <= *sequence_number),
        }
    }
}

fn hash_key(partition_key: &str) -> u128 {
    let hash = crc32fast::hash(partition_key.as_bytes()) as u128;
    (hash << 96) | (hash << 64) | (hash << 32) | hash
}

#[async_trait]
impl StreamService for MemoryStreamService {
    async fn describe_stream(&self, stream: &str) -> Result<StreamDescription, ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        Ok(StreamDescription {
            stream_name: stream.to_owned(),
            status: memory_stream.status,
            open_shard_count: memory_stream
                .shards
                .iter()
                .filter(|shard| !shard.shard.is_closed())
                .count(),
        })
    }

    async fn list_shards(&self, stream: &str) -> Result<Vec<Shard>, ServiceError> {
        let mut inner = self.inner.lock().await;
        let memory_stream = inner.stream_mut(stream)?;
        Ok(memory_stream
            .shards
            .iter()
            .filter(|shard| !shard.trimmed)
            .map(|shard| shard.shard.clone())
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ShardIteratorToken, ServiceError> {
        let mut inner = self.inner.lock().await;
        let next_index = inner
            .stream_mut(stream)?
            .shard(stream, shard_id)?
            .start_index(position);
        debug!("Issuing iterator for shard: {shard_id} of stream: {stream} at {position}.");
        Ok(inner.issue_iterator(stream, shard_id, next_index))
    }

    async fn get_records(
        &self,
        iterator: &ShardIteratorToken,
        limit: usize,
    ) -> Result<GetRecordsOutput, ServiceError> {
        let mut inner = self.inner.lock().await;
        if inner.injected_failures > 0 {
            inner.injected_failures -= 1;
            return Err(ServiceError::Unavailable("injected failure".to_owned()));
        }

        let entry = inner
            .iterators
            .remove(iterator.as_str())
            .ok_or(ServiceError::IteratorExpired)?;
        if entry.issued_at.elapsed() > inner.iterator_ttl {
            return Err(ServiceError::IteratorExpired);
        }

        let stream = entry.stream.clone();
        let shard = inner.stream_mut(&stream)?.shard(&stream, &entry.shard_id)?;
        let end = shard.records.len().min(entry.next_index + limit.max(1));
        let start = entry.next_index.min(end);
        let records = shard.records[start..end].to_vec();
        let shard_closed = shard.shard.is_closed();
        let millis_behind_latest = shard
            .records
            .get(end)
            .map(|unread| {
                (Utc::now() - unread.approximate_arrival_timestamp)
                    .num_milliseconds()
                    .max(0) as u64
            })
            .unwrap_or(0);
        let exhausted = end >= shard.records.len();

        let next_shard_iterator = if shard_closed && exhausted {
            None
        } else {
            Some(inner.issue_iterator(&stream, &entry.shard_id, end))
        };

        Ok(GetRecordsOutput {
            records,
            next_shard_iterator,
            shard_closed,
            millis_behind_latest,
        })
    }
}
