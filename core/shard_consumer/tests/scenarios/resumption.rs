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

use crate::common::{Cluster, STREAM, init_tracing, receive, test_config};
use async_trait::async_trait;
use shard_consumer::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn cluster(
    service: Arc<MemoryStreamService>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> (Cluster, flume::Receiver<DeliveredRecord>) {
    let (sink, records) = ChannelSink::new(None);
    let (error_callback, _) = ChannelErrorCallback::new();
    (
        Cluster {
            config: Arc::new(test_config()),
            service,
            checkpoints,
            locks: Arc::new(MemoryLockRegistry::new()),
            sink: Arc::new(sink),
            error_callback: Arc::new(error_callback),
        },
        records,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_instance_should_resume_after_checkpoint() {
    init_tracing();
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("checkpoints.json");
    let service = Arc::new(MemoryStreamService::new());
    let shard_id = service.create_stream(STREAM, 1).await.remove(0);
    for index in 0..3 {
        service
            .put_record(STREAM, "1", format!("first-{index}"))
            .await
            .unwrap();
    }

    let checkpoints = Arc::new(FileCheckpointStore::open(&path).await.unwrap());
    let (first_cluster, records) = cluster(service.clone(), checkpoints);
    let instance = first_cluster.start("adapter-1");
    let mut last = None;
    for _ in 0..3 {
        last = Some(receive(&records).await.headers.sequence_number);
    }
    instance.stop().await;
    drop(first_cluster);

    for index in 0..2 {
        service
            .put_record(STREAM, "1", format!("second-{index}"))
            .await
            .unwrap();
    }

    let checkpoints = Arc::new(FileCheckpointStore::open(&path).await.unwrap());
    assert_eq!(
        checkpoints.get(STREAM, &shard_id).await.unwrap(),
        last.clone().map(Checkpoint::Sequence)
    );
    let (second_cluster, records) = cluster(service.clone(), checkpoints);
    let instance = second_cluster.start("adapter-2");
    let mut payloads = Vec::new();
    for _ in 0..2 {
        let delivered = receive(&records).await;
        assert!(Some(&delivered.headers.sequence_number) > last.as_ref());
        payloads.push(String::from_utf8_lossy(&delivered.record.data).into_owned());
    }
    assert_eq!(payloads, vec!["second-0", "second-1"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(records.is_empty());
    instance.stop().await;
}

/// Forwards every record and hangs forever after forwarding `stall_on`.
struct StallingSink {
    sender: flume::Sender<DeliveredRecord>,
    stall_on: &'static str,
}

#[async_trait]
impl DeliverySink for StallingSink {
    async fn deliver(&self, record: &Record, headers: &RecordHeaders) -> Result<(), Rejection> {
        let _ = self.sender.send(DeliveredRecord {
            headers: headers.clone(),
            record: record.clone(),
        });
        if record.data == self.stall_on {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_consumer_should_be_resumed_after_durable_checkpoint() {
    init_tracing();
    let service = Arc::new(MemoryStreamService::new());
    let shard_id = service.create_stream(STREAM, 1).await.remove(0);
    let key = ShardKey::new(STREAM, shard_id.clone());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let locks = Arc::new(MemoryLockRegistry::new());
    let mut config = test_config();
    config.lock_lease = Duration::from_millis(300);
    config.lock_renewal_interval = Duration::from_millis(50);
    let config = Arc::new(config);
    for index in 0..3 {
        service
            .put_record(STREAM, "1", format!("first-{index}"))
            .await
            .unwrap();
    }

    let (sender, crashed_records) = flume::unbounded();
    let crashed = Cluster {
        config: config.clone(),
        service: service.clone(),
        checkpoints: checkpoints.clone(),
        locks: locks.clone(),
        sink: Arc::new(StallingSink {
            sender,
            stall_on: "second-1",
        }),
        error_callback: Arc::new(ChannelErrorCallback::new().0),
    };
    assert!(locks.try_acquire(&key, "crashed", config.lock_lease).await.unwrap());
    let (_stop_tx, stop) = watch::channel(false);
    let consumer = ShardConsumer::new(key.clone(), crashed.context("crashed"), stop);
    let handle = tokio::spawn(consumer.run());

    let mut last_first = None;
    for _ in 0..3 {
        last_first = Some(receive(&crashed_records).await.headers.sequence_number);
    }
    let last_first = last_first.unwrap();
    while checkpoints.get(STREAM, &shard_id).await.unwrap()
        != Some(Checkpoint::Sequence(last_first.clone()))
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for index in 0..2 {
        service
            .put_record(STREAM, "1", format!("second-{index}"))
            .await
            .unwrap();
    }
    let second_zero = receive(&crashed_records).await.headers.sequence_number;
    let stalled = receive(&crashed_records).await;
    assert_eq!(stalled.record.data, "second-1");
    handle.abort();
    let _ = handle.await;

    let Some(Checkpoint::Sequence(durable)) = checkpoints.get(STREAM, &shard_id).await.unwrap()
    else {
        panic!("sequence checkpoint expected");
    };
    assert!(durable < stalled.headers.sequence_number);
    let expected = if durable == second_zero {
        vec!["second-1"]
    } else {
        assert_eq!(durable, last_first);
        vec!["second-0", "second-1"]
    };

    let (sink, records) = ChannelSink::new(None);
    let restarted = Cluster {
        config,
        service: service.clone(),
        checkpoints: checkpoints.clone(),
        locks,
        sink: Arc::new(sink),
        error_callback: Arc::new(ChannelErrorCallback::new().0),
    };
    let instance = restarted.start("adapter-2");
    let mut payloads = Vec::new();
    for _ in 0..expected.len() {
        let delivered = receive(&records).await;
        assert!(delivered.headers.sequence_number > durable);
        payloads.push(String::from_utf8_lossy(&delivered.record.data).into_owned());
    }
    assert_eq!(payloads, expected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(records.is_empty());
    instance.stop().await;
}
