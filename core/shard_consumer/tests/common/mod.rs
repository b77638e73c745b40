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

use async_trait::async_trait;
use shard_consumer::prelude::*;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const STREAM: &str = "TestStream";
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .try_init();
    });
}

/// Short intervals so that scenarios finish quickly.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig::builder()
        .stream(STREAM)
        .initial_position(InitialPosition::TrimHorizon)
        .idle_between_polls(Duration::from_millis(1))
        .reconcile_interval(Duration::from_millis(10))
        .topology_refresh_interval(Duration::from_millis(50))
        .lock_lease(Duration::from_secs(5))
        .lock_renewal_interval(Duration::from_millis(100))
        .iterator_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Some(5),
        ))
        .service_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Some(5),
        ))
        .topology_backoff(BackoffConfig::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            None,
        ))
        .shutdown_timeout(Duration::from_secs(2))
        .build()
}

/// Collaborators shared by every competing instance of a scenario.
pub struct Cluster {
    pub config: Arc<ConsumerConfig>,
    pub service: Arc<MemoryStreamService>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub locks: Arc<MemoryLockRegistry>,
    pub sink: Arc<dyn DeliverySink>,
    pub error_callback: Arc<dyn ErrorCallback>,
}

impl Cluster {
    pub fn context(&self, holder: &str) -> ConsumerContext {
        ConsumerContext::builder()
            .config(self.config.clone())
            .service(self.service.clone())
            .checkpoints(self.checkpoints.clone())
            .locks(self.locks.clone())
            .sink(self.sink.clone())
            .error_callback(self.error_callback.clone())
            .holder(holder)
            .build()
    }

    /// Starts a supervisor running until the returned sender is set to true.
    pub fn start(&self, holder: &str) -> RunningInstance {
        let mut supervisor =
            ConsumerSupervisor::new(self.context(holder)).expect("valid consumer config");
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            supervisor.run(shutdown_rx).await;
            supervisor
        });
        RunningInstance { shutdown, handle }
    }
}

pub struct RunningInstance {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ConsumerSupervisor>,
}

impl RunningInstance {
    pub async fn stop(self) -> ConsumerSupervisor {
        self.shutdown.send_replace(true);
        self.handle.await.expect("supervisor task")
    }
}

pub async fn receive(records: &flume::Receiver<DeliveredRecord>) -> DeliveredRecord {
    tokio::time::timeout(RECEIVE_TIMEOUT, records.recv_async())
        .await
        .expect("record delivered in time")
        .expect("delivery queue connected")
}

pub async fn receive_error(errors: &flume::Receiver<ErrorEvent>) -> ErrorEvent {
    tokio::time::timeout(RECEIVE_TIMEOUT, errors.recv_async())
        .await
        .expect("error reported in time")
        .expect("error queue connected")
}

/// Checkpoint store remembering every write, in order.
#[derive(Debug, Default)]
pub struct RecordingCheckpointStore {
    inner: MemoryCheckpointStore,
    writes: Mutex<Vec<(ShardId, Checkpoint)>>,
}

impl RecordingCheckpointStore {
    pub fn writes(&self) -> Vec<(ShardId, Checkpoint)> {
        self.writes.lock().expect("writes lock").clone()
    }
}

#[async_trait]
impl CheckpointStore for RecordingCheckpointStore {
    async fn get(
        &self,
        stream: &str,
        shard_id: &ShardId,
    ) -> Result<Option<Checkpoint>, ConsumerError> {
        self.inner.get(stream, shard_id).await
    }

    async fn put(
        &self,
        stream: &str,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<(), ConsumerError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push((shard_id.clone(), checkpoint.clone()));
        self.inner.put(stream, shard_id, checkpoint).await
    }

    async fn remove(&self, stream: &str, shard_id: &ShardId) -> Result<(), ConsumerError> {
        self.inner.remove(stream, shard_id).await
    }
}
