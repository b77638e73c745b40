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

use crate::backoff::ExponentialBackoff;
use crate::checkpoint::CheckpointStore;
use crate::config::{CheckpointMode, ConsumerConfig};
use crate::delivery::{DeliverySink, RecordHeaders};
use crate::error::ConsumerError;
use crate::error_callback::{ErrorCallback, ErrorEvent, LogErrorCallback};
use crate::locking::LockRegistry;
use crate::service::{ServiceError, ShardIteratorToken, StreamService};
use crate::types::{Checkpoint, IteratorPosition, Record, SequenceNumber, ShardKey};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Collaborators shared by the supervisor and every shard consumer it spawns.
#[derive(Clone, Builder)]
pub struct ConsumerContext {
    pub config: Arc<ConsumerConfig>,
    pub service: Arc<dyn StreamService>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub locks: Arc<dyn LockRegistry>,
    pub sink: Arc<dyn DeliverySink>,
    /// Receives delivery rejections and shard terminations.
    #[builder(default = Arc::new(LogErrorCallback))]
    pub error_callback: Arc<dyn ErrorCallback>,
    /// Lock holder identity of this consumer instance.
    #[builder(into, default = Uuid::now_v7().to_string())]
    pub holder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConsumerState {
    Starting,
    IteratorAcquired,
    Polling,
    Delivering,
    FailedRetrying,
    Closed,
    Handoff,
    Terminated,
}

/// How a shard consumer finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    /// Every record of the closed shard was processed and `ShardEnd` was stored.
    Drained,
    /// Stopped on request after flushing progress and releasing the lock.
    Stopped,
    /// Another holder owns the shard now. Nothing was flushed or released.
    LockLost,
    /// The shard no longer exists upstream.
    ShardGone,
    Failed(ConsumerError),
}

/// Reads one shard in sequence order while holding its lock.
pub struct ShardConsumer {
    key: ShardKey,
    context: ConsumerContext,
    stop: watch::Receiver<bool>,
    state: watch::Sender<ConsumerState>,
    durable: Option<Checkpoint>,
    pending: Option<SequenceNumber>,
    same_position: Option<(SequenceNumber, u32)>,
    last_renewal: Instant,
    iterator_backoff: ExponentialBackoff,
    service_backoff: ExponentialBackoff,
}

impl ShardConsumer {
    pub fn new(key: ShardKey, context: ConsumerContext, stop: watch::Receiver<bool>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        let iterator_backoff = ExponentialBackoff::new(context.config.iterator_backoff);
        let service_backoff = ExponentialBackoff::new(context.config.service_backoff);
        Self {
            key,
            context,
            stop,
            state,
            durable: None,
            pending: None,
            same_position: None,
            last_renewal: Instant::now(),
            iterator_backoff,
            service_backoff,
        }
    }

    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Consumes the shard until it is drained, stopped or fails.
    pub async fn run(mut self) -> ShardOutcome {
        info!(
            "Starting consumer for shard: {} of stream: {}",
            self.key.shard_id, self.key.stream
        );
        let outcome = match self.consume().await {
            Ok(outcome) => outcome,
            Err(ConsumerError::LockLost(_)) => {
                warn!(
                    "Lost lock for shard: {} of stream: {}, stopping without checkpoint",
                    self.key.shard_id, self.key.stream
                );
                ShardOutcome::LockLost
            }
            Err(ConsumerError::ShardNotFound { .. }) => {
                warn!(
                    "Shard: {} of stream: {} no longer exists",
                    self.key.shard_id, self.key.stream
                );
                ShardOutcome::ShardGone
            }
            Err(error) => {
                error!(
                    "Consumer for shard: {} of stream: {} failed. {error}",
                    self.key.shard_id, self.key.stream
                );
                ShardOutcome::Failed(error)
            }
        };
        self.set_state(ConsumerState::Terminated);
        outcome
    }

    async fn consume(&mut self) -> Result<ShardOutcome, ConsumerError> {
        self.set_state(ConsumerState::Starting);
        let holder = self.context.holder.clone();
        if !self.context.locks.is_held_by_me(&self.key, &holder).await? {
            return Err(ConsumerError::LockLost(self.key.clone()));
        }
        self.last_renewal = Instant::now();

        self.durable = self
            .context
            .checkpoints
            .get(&self.key.stream, &self.key.shard_id)
            .await?;
        if self.durable.as_ref().is_some_and(Checkpoint::is_shard_end) {
            debug!(
                "Shard: {} of stream: {} was already drained",
                self.key.shard_id, self.key.stream
            );
            return self.close().await;
        }

        let Some(mut iterator) = self.acquire_iterator(self.resume_position()).await? else {
            return self.stop().await;
        };
        let batch_limit = self.context.config.batch_limit;
        let idle_between_polls = self.context.config.idle_between_polls;

        loop {
            if self.stop_requested() {
                return self.stop().await;
            }
            self.renew_lock().await?;

            self.set_state(ConsumerState::Polling);
            let output = match self.context.service.get_records(&iterator, batch_limit).await {
                Ok(output) => {
                    self.service_backoff.reset();
                    self.iterator_backoff.reset();
                    output
                }
                Err(ServiceError::IteratorExpired) => {
                    self.set_state(ConsumerState::FailedRetrying);
                    let Some(delay) = self.iterator_backoff.next_delay() else {
                        return Err(ConsumerError::IteratorExpired(self.key.clone()));
                    };
                    warn!(
                        "Iterator for shard: {} of stream: {} expired, regenerating from checkpoint: {:?} in {delay:?}",
                        self.key.shard_id, self.key.stream, self.durable
                    );
                    self.pause(delay).await?;
                    match self.acquire_iterator(self.resume_position()).await? {
                        Some(regenerated) => iterator = regenerated,
                        None => return self.stop().await,
                    }
                    continue;
                }
                Err(error) if error.is_transient() => {
                    self.set_state(ConsumerState::FailedRetrying);
                    let delay = self.transient_delay(error)?;
                    self.pause(delay).await?;
                    continue;
                }
                Err(error) => return Err(self.service_error(error)),
            };

            trace!(
                "Polled {} records from shard: {} of stream: {}, behind latest: {} ms",
                output.records.len(),
                self.key.shard_id,
                self.key.stream,
                output.millis_behind_latest
            );
            self.set_state(ConsumerState::Delivering);
            let reread = self.deliver(&output.records).await?;
            self.flush_checkpoint().await?;

            match (reread, output.next_shard_iterator) {
                (Some(position), _) => {
                    self.pause(idle_between_polls).await?;
                    match self.acquire_iterator(position).await? {
                        Some(regenerated) => iterator = regenerated,
                        None => return self.stop().await,
                    }
                }
                (None, Some(next)) => {
                    iterator = next;
                    self.pause(idle_between_polls).await?;
                }
                (None, None) => return self.close().await,
            }
        }
    }

    /// Delivers the batch in order. Returns the position to re-read from when the sink asked for it.
    async fn deliver(
        &mut self,
        records: &[Record],
    ) -> Result<Option<IteratorPosition>, ConsumerError> {
        for record in records {
            self.renew_lock().await?;
            let headers = RecordHeaders::new(&self.key.stream, &self.key.shard_id, record);
            if let Err(rejection) = self.context.sink.deliver(record, &headers).await {
                debug!(
                    "Record: {} of shard: {} of stream: {} was rejected. {rejection}",
                    record.sequence_number, self.key.shard_id, self.key.stream
                );
                let retry_same_position = rejection.is_retry_same_position();
                self.context
                    .error_callback
                    .call(ErrorEvent::DeliveryRejected {
                        headers,
                        record: record.clone(),
                        rejection,
                    })
                    .await;

                if retry_same_position {
                    let retries = match &self.same_position {
                        Some((sequence_number, retries))
                            if sequence_number == &record.sequence_number =>
                        {
                            retries + 1
                        }
                        _ => 1,
                    };
                    let allowed = self
                        .context
                        .config
                        .max_same_position_retries
                        .is_none_or(|max_retries| retries <= max_retries);
                    if allowed {
                        self.same_position = Some((record.sequence_number.clone(), retries));
                        return Ok(Some(IteratorPosition::AtSequenceNumber(
                            record.sequence_number.clone(),
                        )));
                    }
                    warn!(
                        "Record: {} of shard: {} of stream: {} was re-read {} times, skipping it",
                        record.sequence_number,
                        self.key.shard_id,
                        self.key.stream,
                        retries - 1
                    );
                }
            }

            self.same_position = None;
            self.processed(record.sequence_number.clone()).await?;
        }
        Ok(None)
    }

    async fn processed(&mut self, sequence_number: SequenceNumber) -> Result<(), ConsumerError> {
        self.pending = Some(sequence_number);
        if self.context.config.checkpoint_mode == CheckpointMode::Record {
            self.flush_checkpoint().await?;
        }
        Ok(())
    }

    async fn flush_checkpoint(&mut self) -> Result<(), ConsumerError> {
        let Some(sequence_number) = self.pending.take() else {
            return Ok(());
        };
        let advances = match &self.durable {
            Some(Checkpoint::Sequence(durable)) => &sequence_number > durable,
            Some(Checkpoint::ShardEnd) => false,
            None => true,
        };
        if !advances {
            return Ok(());
        }

        self.confirm_lock().await?;
        let checkpoint = Checkpoint::Sequence(sequence_number);
        self.context
            .checkpoints
            .put(&self.key.stream, &self.key.shard_id, checkpoint.clone())
            .await?;
        trace!(
            "Stored checkpoint: {checkpoint} for shard: {} of stream: {}",
            self.key.shard_id, self.key.stream
        );
        self.durable = Some(checkpoint);
        Ok(())
    }

    /// Renews the lease once the renewal interval has passed. A lease that was not renewed within
    /// its duration is treated as lost, even when nobody has taken it yet.
    async fn renew_lock(&mut self) -> Result<(), ConsumerError> {
        let elapsed = self.last_renewal.elapsed();
        if elapsed < self.context.config.lock_renewal_interval {
            return Ok(());
        }
        if elapsed >= self.context.config.lock_lease {
            warn!(
                "Lease for shard: {} of stream: {} lapsed {elapsed:?} after the last renewal",
                self.key.shard_id, self.key.stream
            );
            return Err(ConsumerError::LockLost(self.key.clone()));
        }

        let renewed = self
            .context
            .locks
            .try_acquire(
                &self.key,
                &self.context.holder,
                self.context.config.lock_lease,
            )
            .await?;
        if !renewed {
            return Err(ConsumerError::LockLost(self.key.clone()));
        }
        trace!(
            "Renewed lock for shard: {} of stream: {}",
            self.key.shard_id, self.key.stream
        );
        self.last_renewal = Instant::now();
        Ok(())
    }

    /// Checkpoints are written only while the lock is still ours.
    async fn confirm_lock(&self) -> Result<(), ConsumerError> {
        if self
            .context
            .locks
            .is_held_by_me(&self.key, &self.context.holder)
            .await?
        {
            return Ok(());
        }
        Err(ConsumerError::LockLost(self.key.clone()))
    }

    /// Returns `None` when a stop was requested while waiting to retry.
    async fn acquire_iterator(
        &mut self,
        position: IteratorPosition,
    ) -> Result<Option<ShardIteratorToken>, ConsumerError> {
        loop {
            if self.stop_requested() {
                return Ok(None);
            }

            match self
                .context
                .service
                .get_shard_iterator(&self.key.stream, &self.key.shard_id, &position)
                .await
            {
                Ok(iterator) => {
                    self.service_backoff.reset();
                    self.set_state(ConsumerState::IteratorAcquired);
                    debug!(
                        "Acquired iterator for shard: {} of stream: {} at {position}",
                        self.key.shard_id, self.key.stream
                    );
                    return Ok(Some(iterator));
                }
                Err(error) if error.is_transient() => {
                    self.set_state(ConsumerState::FailedRetrying);
                    let delay = self.transient_delay(error)?;
                    self.pause(delay).await?;
                }
                Err(error) => return Err(self.service_error(error)),
            }
        }
    }

    fn transient_delay(&mut self, error: ServiceError) -> Result<Duration, ConsumerError> {
        let Some(delay) = self.service_backoff.next_delay() else {
            return Err(ConsumerError::ServiceTransient {
                key: self.key.clone(),
                attempts: self.service_backoff.attempts(),
                cause: error,
            });
        };
        warn!(
            "Stream service failed for shard: {} of stream: {}, retrying in {delay:?}. {error}",
            self.key.shard_id, self.key.stream
        );
        Ok(delay)
    }

    fn service_error(&self, error: ServiceError) -> ConsumerError {
        match error {
            ServiceError::ShardNotFound { .. } | ServiceError::StreamNotFound(_) => {
                ConsumerError::ShardNotFound {
                    stream: self.key.stream.clone(),
                    shard_id: self.key.shard_id.clone(),
                }
            }
            ServiceError::IteratorExpired => ConsumerError::IteratorExpired(self.key.clone()),
            error => ConsumerError::Service(error),
        }
    }

    fn resume_position(&self) -> IteratorPosition {
        match &self.durable {
            Some(Checkpoint::Sequence(sequence_number)) => {
                IteratorPosition::AfterSequenceNumber(sequence_number.clone())
            }
            _ => self.context.config.initial_position.into(),
        }
    }

    async fn close(&mut self) -> Result<ShardOutcome, ConsumerError> {
        self.set_state(ConsumerState::Closed);
        if !self.durable.as_ref().is_some_and(Checkpoint::is_shard_end) {
            self.confirm_lock().await?;
            self.context
                .checkpoints
                .put(&self.key.stream, &self.key.shard_id, Checkpoint::ShardEnd)
                .await?;
            self.durable = Some(Checkpoint::ShardEnd);
        }

        self.set_state(ConsumerState::Handoff);
        self.context
            .locks
            .release(&self.key, &self.context.holder)
            .await?;
        info!(
            "Shard: {} of stream: {} was drained",
            self.key.shard_id, self.key.stream
        );
        Ok(ShardOutcome::Drained)
    }

    async fn stop(&mut self) -> Result<ShardOutcome, ConsumerError> {
        self.flush_checkpoint().await?;
        self.context
            .locks
            .release(&self.key, &self.context.holder)
            .await?;
        info!(
            "Stopped consumer for shard: {} of stream: {} at checkpoint: {:?}",
            self.key.shard_id, self.key.stream, self.durable
        );
        Ok(ShardOutcome::Stopped)
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Sleeps for `duration` unless a stop is requested first, renewing the lock on schedule.
    async fn pause(&mut self, duration: Duration) -> Result<(), ConsumerError> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || self.stop_requested() {
                return Ok(());
            }

            let next_renewal = self.last_renewal + self.context.config.lock_renewal_interval;
            let wake_at = deadline.min(next_renewal.max(now));
            let stop = &mut self.stop;
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = async {
                    let _ = stop.wait_for(|stop| *stop).await;
                } => {
                    return Ok(());
                }
            }
            self.renew_lock().await?;
        }
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(
                "Consumer for shard: {} of stream: {} moved from {previous} to {state}",
                self.key.shard_id, self.key.stream
            );
        }
    }
}
