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

//! Distributed shard consumer engine for partitioned, append-only stream logs.
//!
//! Each shard is read by exactly one consumer across all competing instances,
//! guarded by lease-based locks. Progress is checkpointed per shard so that a
//! restarted instance resumes after the last processed record, which gives
//! at-least-once delivery. Closed shards are drained before their children
//! from splits and merges are consumed.

pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod error_callback;
pub mod locking;
pub mod prelude;
pub mod service;
pub mod supervisor;
pub mod topology;
pub mod types;
