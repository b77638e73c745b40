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

use crate::delivery::{RecordHeaders, Rejection};
use crate::error::ConsumerError;
use crate::types::{Record, ShardKey};
use std::fmt::Debug;
use std::pin::Pin;
use tracing::{error, warn};

/// Failure notifications raised by shard consumers and the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorEvent {
    /// The sink refused a record. The raw record travels with the event.
    DeliveryRejected {
        headers: RecordHeaders,
        record: Record,
        rejection: Rejection,
    },
    /// A shard consumer stopped on a fatal error.
    ShardTerminated { key: ShardKey, error: ConsumerError },
}

impl ErrorEvent {
    pub fn shard_key(&self) -> ShardKey {
        match self {
            ErrorEvent::DeliveryRejected { headers, .. } => {
                ShardKey::new(headers.stream.clone(), headers.shard_id.clone())
            }
            ErrorEvent::ShardTerminated { key, .. } => key.clone(),
        }
    }

    pub fn to_error(&self) -> ConsumerError {
        match self {
            ErrorEvent::DeliveryRejected {
                headers, rejection, ..
            } => ConsumerError::DeliveryRejected {
                sequence_number: headers.sequence_number.to_string(),
                reason: rejection.reason().to_owned(),
            },
            ErrorEvent::ShardTerminated { error, .. } => error.clone(),
        }
    }
}

/// Handles error events off the consumer's hot path.
///
/// Implementors can log, forward to a dead letter queue, alert and so on.
pub trait ErrorCallback: Send + Sync + Debug + 'static {
    fn call(&self, event: ErrorEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

/// Default implementation of [`ErrorCallback`] that logs the event using `tracing`.
#[derive(Debug, Default)]
pub struct LogErrorCallback;

impl ErrorCallback for LogErrorCallback {
    fn call(&self, event: ErrorEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(async move {
            match event {
                ErrorEvent::DeliveryRejected {
                    headers,
                    record,
                    rejection,
                } => {
                    warn!(
                        stream = headers.stream,
                        shard_id = %headers.shard_id,
                        sequence_number = %headers.sequence_number,
                        partition_key = headers.partition_key,
                        payload_size = record.data.len(),
                        retry_same_position = rejection.is_retry_same_position(),
                        reason = rejection.reason(),
                        "Record delivery was rejected",
                    );
                }
                ErrorEvent::ShardTerminated { key, error } => {
                    error!(
                        stream = key.stream,
                        shard_id = %key.shard_id,
                        code = error.as_code(),
                        cause = %error,
                        "Shard consumer terminated",
                    );
                }
            }
        })
    }
}

/// Forwards every event into a flume channel.
#[derive(Debug, Clone)]
pub struct ChannelErrorCallback {
    sender: flume::Sender<ErrorEvent>,
}

impl ChannelErrorCallback {
    pub fn new() -> (Self, flume::Receiver<ErrorEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }
}

impl ErrorCallback for ChannelErrorCallback {
    fn call(&self, event: ErrorEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let sender = self.sender.clone();
        Box::pin(async move {
            if sender.send_async(event).await.is_err() {
                warn!("Error event receiver is disconnected, event dropped");
            }
        })
    }
}
