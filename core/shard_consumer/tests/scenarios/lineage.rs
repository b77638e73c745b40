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
use shard_consumer::prelude::*;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn children_should_not_be_consumed_before_parent_is_drained() {
    init_tracing();
    let service = Arc::new(MemoryStreamService::new());
    let parent = service.create_stream(STREAM, 1).await.remove(0);
    let mut parent_records = Vec::new();
    for index in 0..10 {
        let (_, sequence_number) = service
            .put_record(STREAM, &format!("key-{index}"), format!("parent-{index}"))
            .await
            .unwrap();
        parent_records.push(sequence_number);
    }
    let (left, right) = service
        .split_shard(STREAM, &parent, u128::MAX / 2)
        .await
        .unwrap();
    for index in 0..10 {
        service
            .put_record(STREAM, &format!("key-{index}"), format!("child-{index}"))
            .await
            .unwrap();
    }

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (sink, records) = ChannelSink::new(None);
    let (error_callback, _errors) = ChannelErrorCallback::new();
    let cluster = Cluster {
        config: Arc::new(test_config()),
        service: service.clone(),
        checkpoints: checkpoints.clone(),
        locks: Arc::new(MemoryLockRegistry::new()),
        sink: Arc::new(sink),
        error_callback: Arc::new(error_callback),
    };
    let first = cluster.start("adapter-1");
    let second = cluster.start("adapter-2");

    let mut delivered = Vec::new();
    for _ in 0..20 {
        delivered.push(receive(&records).await.headers);
    }

    let (from_parent, from_children): (Vec<_>, Vec<_>) = delivered
        .iter()
        .partition(|headers| headers.shard_id == parent);
    assert_eq!(
        from_parent
            .iter()
            .map(|headers| headers.sequence_number.clone())
            .collect::<Vec<_>>(),
        parent_records
    );
    assert!(
        delivered[..10].iter().all(|headers| headers.shard_id == parent),
        "a child record was delivered before the parent was drained"
    );
    assert!(from_children
        .iter()
        .all(|headers| headers.shard_id == left || headers.shard_id == right));
    for child in [&left, &right] {
        let sequence_numbers = from_children
            .iter()
            .filter(|headers| &headers.shard_id == child)
            .map(|headers| headers.sequence_number.clone())
            .collect::<Vec<_>>();
        assert!(sequence_numbers.is_sorted());
    }

    first.stop().await;
    second.stop().await;
    assert_eq!(
        checkpoints.get(STREAM, &parent).await.unwrap(),
        Some(Checkpoint::ShardEnd)
    );
}
