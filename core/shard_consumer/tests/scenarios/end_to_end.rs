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

use crate::common::{Cluster, STREAM, init_tracing, receive, receive_error, test_config};
use chrono::{DateTime, Utc};
use shard_consumer::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Only timestamps are accepted. The first rejection asks for the record to be read again.
fn timestamp_sink() -> (ChannelSink, flume::Receiver<DeliveredRecord>) {
    let retried = AtomicBool::new(false);
    let (sink, records) = ChannelSink::new(None);
    let sink = sink.with_acceptance(move |record, _| {
        let payload = String::from_utf8_lossy(&record.data);
        if DateTime::parse_from_rfc3339(&payload).is_ok() {
            return Ok(());
        }

        let reason = format!("expected a timestamp, but received: {payload}");
        if retried
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Err(Rejection::retry_same_position(reason))
        } else {
            Err(Rejection::failed(reason))
        }
    });
    (sink, records)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_instances_should_deliver_every_record_once() {
    init_tracing();
    let service = Arc::new(MemoryStreamService::new());
    service.create_stream(STREAM, 1).await;
    let (sink, records) = timestamp_sink();
    let (error_callback, errors) = ChannelErrorCallback::new();
    let cluster = Cluster {
        config: Arc::new(test_config()),
        service: service.clone(),
        checkpoints: Arc::new(MemoryCheckpointStore::new()),
        locks: Arc::new(MemoryLockRegistry::new()),
        sink: Arc::new(sink),
        error_callback: Arc::new(error_callback),
    };
    let instances = (1..=4)
        .map(|index| cluster.start(&format!("adapter-{index}")))
        .collect::<Vec<_>>();

    service.put_record(STREAM, "1", "foo").await.unwrap();
    let now = Utc::now().to_rfc3339();
    service.put_record(STREAM, "1", now.clone()).await.unwrap();

    let received = receive(&records).await;
    assert_eq!(received.record.data, now.as_bytes());
    assert_eq!(received.headers.stream, STREAM);
    assert_eq!(received.headers.partition_key, "1");

    let ErrorEvent::DeliveryRejected {
        headers: first_headers,
        record: raw_record,
        rejection,
    } = receive_error(&errors).await
    else {
        panic!("expected a delivery rejection");
    };
    assert_eq!(raw_record.data, "foo");
    assert!(rejection.is_retry_same_position());
    assert!(rejection.reason().contains("expected a timestamp"));

    let ErrorEvent::DeliveryRejected {
        headers: second_headers,
        rejection,
        ..
    } = receive_error(&errors).await
    else {
        panic!("expected a delivery rejection");
    };
    assert!(!rejection.is_retry_same_position());
    assert_eq!(second_headers.sequence_number, first_headers.sequence_number);

    for _ in 0..2 {
        service
            .put_record(STREAM, "1", Utc::now().to_rfc3339())
            .await
            .unwrap();
    }
    let mut received_sequences = HashSet::new();
    for _ in 0..2 {
        let received = receive(&records).await;
        assert!(received_sequences.insert(received.headers.sequence_number));
    }
    assert_eq!(received_sequences.len(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(records.is_empty());
    assert!(errors.is_empty());

    for instance in instances {
        instance.stop().await;
    }
}
