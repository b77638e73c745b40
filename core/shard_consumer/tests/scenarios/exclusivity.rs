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

use crate::common::{
    Cluster, RecordingCheckpointStore, STREAM, init_tracing, receive, test_config,
};
use shard_consumer::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_shard_should_be_owned_by_one_instance() {
    init_tracing();
    let service = Arc::new(MemoryStreamService::new());
    let shards = service.create_stream(STREAM, 4).await;
    let checkpoints = Arc::new(RecordingCheckpointStore::default());
    let locks = Arc::new(MemoryLockRegistry::new());
    let (sink, records) = ChannelSink::new(None);
    let (error_callback, errors) = ChannelErrorCallback::new();
    let cluster = Cluster {
        config: Arc::new(test_config()),
        service: service.clone(),
        checkpoints: checkpoints.clone(),
        locks: locks.clone(),
        sink: Arc::new(sink),
        error_callback: Arc::new(error_callback),
    };
    let holders = (1..=4)
        .map(|index| format!("adapter-{index}"))
        .collect::<Vec<_>>();
    let instances = holders
        .iter()
        .map(|holder| cluster.start(holder))
        .collect::<Vec<_>>();

    let mut produced = BTreeMap::<ShardId, Vec<SequenceNumber>>::new();
    for index in 0..40 {
        let (shard_id, sequence_number) = service
            .put_record(STREAM, &format!("key-{index}"), format!("record-{index}"))
            .await
            .unwrap();
        produced.entry(shard_id).or_default().push(sequence_number);
    }

    let mut consumed = BTreeMap::<ShardId, Vec<SequenceNumber>>::new();
    let mut seen = HashSet::new();
    for _ in 0..40 {
        let delivered = receive(&records).await;
        assert!(
            seen.insert(delivered.headers.sequence_number.clone()),
            "record: {} was delivered twice",
            delivered.headers.sequence_number
        );
        consumed
            .entry(delivered.headers.shard_id)
            .or_default()
            .push(delivered.headers.sequence_number);
    }
    assert_eq!(consumed, produced);

    for shard_id in &shards {
        let holder = locks
            .holder(&ShardKey::new(STREAM, shard_id.clone()))
            .await
            .expect("every shard is locked");
        assert!(holders.contains(&holder));
    }

    for instance in instances {
        instance.stop().await;
    }
    assert!(errors.is_empty());

    let mut last = BTreeMap::<ShardId, SequenceNumber>::new();
    for (shard_id, checkpoint) in checkpoints.writes() {
        let Checkpoint::Sequence(sequence_number) = checkpoint else {
            continue;
        };
        if let Some(previous) = last.get(&shard_id) {
            assert!(previous < &sequence_number, "checkpoint of {shard_id} went backwards");
        }
        last.insert(shard_id, sequence_number);
    }
    for (shard_id, sequence_numbers) in &produced {
        assert_eq!(last.get(shard_id), sequence_numbers.last());
    }
}
