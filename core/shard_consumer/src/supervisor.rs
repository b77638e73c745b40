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
use crate::consumer::{ConsumerContext, ConsumerState, ShardConsumer, ShardOutcome};
use crate::error::ConsumerError;
use crate::error_callback::ErrorEvent;
use crate::topology::{ShardGraph, ShardTopology};
use crate::types::{ShardId, ShardKey};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Result of a single reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Shards whose lock was acquired and whose consumer was spawned.
    pub started: Vec<ShardId>,
    /// Consumable shards locked by another instance.
    pub contended: Vec<ShardId>,
    /// Set while reconciliation is suspended after a topology failure.
    pub suspended: bool,
}

struct RunningConsumer {
    state: watch::Receiver<ConsumerState>,
    handle: JoinHandle<()>,
}

/// Assigns consumable shards to consumers of this instance and reacts to their outcomes.
pub struct ConsumerSupervisor {
    context: ConsumerContext,
    topology: ShardTopology,
    graph: Option<ShardGraph>,
    refresh_due: bool,
    suspended_until: Option<Instant>,
    topology_backoff: ExponentialBackoff,
    running: HashMap<ShardId, RunningConsumer>,
    failures: HashMap<ShardId, u32>,
    outcomes_tx: flume::Sender<(ShardId, ShardOutcome)>,
    outcomes_rx: flume::Receiver<(ShardId, ShardOutcome)>,
    stop_tx: watch::Sender<bool>,
}

impl ConsumerSupervisor {
    pub fn new(context: ConsumerContext) -> Result<Self, ConsumerError> {
        context.config.validate()?;
        let topology = ShardTopology::new(
            context.config.stream.clone(),
            context.service.clone(),
            context.checkpoints.clone(),
        );
        let topology_backoff = ExponentialBackoff::new(context.config.topology_backoff);
        let (outcomes_tx, outcomes_rx) = flume::unbounded();
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            context,
            topology,
            graph: None,
            refresh_due: true,
            suspended_until: None,
            topology_backoff,
            running: HashMap::new(),
            failures: HashMap::new(),
            outcomes_tx,
            outcomes_rx,
            stop_tx,
        })
    }

    pub fn holder(&self) -> &str {
        &self.context.holder
    }

    pub fn topology(&self) -> &ShardTopology {
        &self.topology
    }

    /// Last successfully refreshed lineage graph.
    pub fn graph(&self) -> Option<&ShardGraph> {
        self.graph.as_ref()
    }

    /// States of the consumers currently running in this instance.
    pub fn status(&self) -> BTreeMap<ShardId, ConsumerState> {
        self.running
            .iter()
            .map(|(shard_id, running)| (shard_id.clone(), *running.state.borrow()))
            .collect()
    }

    /// Requests a topology refresh on the next reconciliation.
    pub fn request_refresh(&mut self) {
        self.refresh_due = true;
    }

    /// One assignment pass: refreshes the topology when due and starts a consumer for every
    /// consumable shard whose lock this instance wins.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, ConsumerError> {
        while let Ok((shard_id, outcome)) = self.outcomes_rx.try_recv() {
            self.handle_outcome(shard_id, outcome).await;
        }

        if let Some(suspended_until) = self.suspended_until {
            if Instant::now() < suspended_until {
                return Ok(ReconcileReport {
                    suspended: true,
                    ..Default::default()
                });
            }
        }

        if self.refresh_due || self.graph.is_none() {
            self.refresh_topology().await?;
        }

        let consumable = self
            .graph
            .as_ref()
            .map(|graph| graph.consumable().to_vec())
            .unwrap_or_default();
        let mut report = ReconcileReport::default();
        for shard_id in consumable {
            if self.running.contains_key(&shard_id) || self.topology.is_abandoned(&shard_id) {
                continue;
            }

            let key = ShardKey::new(self.context.config.stream.clone(), shard_id.clone());
            let acquired = self
                .context
                .locks
                .try_acquire(&key, &self.context.holder, self.context.config.lock_lease)
                .await?;
            if acquired {
                self.spawn(key);
                report.started.push(shard_id);
            } else {
                report.contended.push(shard_id);
            }
        }

        if !report.started.is_empty() {
            info!(
                "Started consumers for shards: {:?} of stream: {}",
                report.started, self.context.config.stream
            );
        }
        Ok(report)
    }

    /// Reconciles on a timer until `shutdown` turns true, then stops every consumer.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.context.config.clone();
        info!(
            "Starting consumer supervisor: {} for stream: {}",
            self.context.holder, config.stream
        );
        let mut reconcile_timer = tokio::time::interval(config.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut topology_timer = tokio::time::interval(config.topology_refresh_interval);
        topology_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        topology_timer.tick().await;
        let outcomes = self.outcomes_rx.clone();

        loop {
            tokio::select! {
                _ = async {
                    let _ = shutdown.wait_for(|shutdown| *shutdown).await;
                } => {
                    break;
                }
                _ = topology_timer.tick() => {
                    self.refresh_due = true;
                }
                _ = reconcile_timer.tick() => {
                    self.reconcile_and_log().await;
                }
                outcome = outcomes.recv_async() => {
                    let Ok((shard_id, outcome)) = outcome else {
                        break;
                    };
                    let drained = outcome == ShardOutcome::Drained;
                    self.handle_outcome(shard_id, outcome).await;
                    if drained {
                        self.reconcile_and_log().await;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stops every consumer, waiting up to the shutdown timeout, and releases remaining locks.
    pub async fn shutdown(&mut self) {
        info!(
            "Stopping {} consumers of stream: {}",
            self.running.len(),
            self.context.config.stream
        );
        self.stop_tx.send_replace(true);
        let deadline = Instant::now() + self.context.config.shutdown_timeout;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.outcomes_rx.recv_async()).await {
                Ok(Ok((shard_id, outcome))) => self.handle_outcome(shard_id, outcome).await,
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        "Consumers of stream: {} did not stop within {:?}",
                        self.context.config.stream, self.context.config.shutdown_timeout
                    );
                    break;
                }
            }
        }

        let stragglers = self.running.drain().collect::<Vec<_>>();
        for (shard_id, running) in stragglers {
            running.handle.abort();
            warn!(
                "Aborted consumer for shard: {shard_id} of stream: {}",
                self.context.config.stream
            );
            self.release(&shard_id).await;
        }
        info!(
            "Consumer supervisor: {} for stream: {} has stopped",
            self.context.holder, self.context.config.stream
        );
    }

    async fn reconcile_and_log(&mut self) {
        match self.reconcile().await {
            Ok(report) if report.suspended => {
                debug!(
                    "Reconciliation of stream: {} is suspended",
                    self.context.config.stream
                );
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    "Reconciliation of stream: {} failed. {error}",
                    self.context.config.stream
                );
            }
        }
    }

    async fn refresh_topology(&mut self) -> Result<(), ConsumerError> {
        match self.topology.refresh().await {
            Ok(graph) => {
                self.graph = Some(graph);
                self.refresh_due = false;
                self.suspended_until = None;
                self.topology_backoff.reset();
                Ok(())
            }
            Err(error) => {
                let delay = self
                    .topology_backoff
                    .next_delay()
                    .unwrap_or(self.context.config.topology_backoff.cap);
                self.suspended_until = Some(Instant::now() + delay);
                warn!(
                    "Topology of stream: {} is unavailable, suspending reconciliation for {delay:?}. {error}",
                    self.context.config.stream
                );
                Err(error)
            }
        }
    }

    fn spawn(&mut self, key: ShardKey) {
        let shard_id = key.shard_id.clone();
        let consumer = ShardConsumer::new(
            key.clone(),
            self.context.clone(),
            self.stop_tx.subscribe(),
        );
        let state = consumer.subscribe();
        let outcomes = self.outcomes_tx.clone();
        let handle = tokio::spawn({
            let shard_id = shard_id.clone();
            async move {
                let outcome = match AssertUnwindSafe(consumer.run()).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        error!("Consumer for shard: {key} panicked: {panic:?}");
                        ShardOutcome::Failed(ConsumerError::ConsumerPanicked(key))
                    }
                };
                let _ = outcomes.send_async((shard_id, outcome)).await;
            }
        });
        self.running.insert(shard_id, RunningConsumer { state, handle });
    }

    async fn handle_outcome(&mut self, shard_id: ShardId, outcome: ShardOutcome) {
        self.running.remove(&shard_id);
        let key = ShardKey::new(self.context.config.stream.clone(), shard_id.clone());
        match outcome {
            ShardOutcome::Drained => {
                debug!("Shard: {shard_id} of stream: {} was handed off", key.stream);
                self.failures.remove(&shard_id);
                self.refresh_due = true;
            }
            ShardOutcome::Stopped => {
                debug!("Consumer for shard: {shard_id} of stream: {} stopped", key.stream);
            }
            ShardOutcome::LockLost => {
                self.report(key.clone(), ConsumerError::LockLost(key)).await;
            }
            ShardOutcome::ShardGone => {
                self.retire(&shard_id).await;
                self.release(&shard_id).await;
                self.topology.mark_abandoned(&shard_id);
                self.refresh_due = true;
                let error = ConsumerError::ShardNotFound {
                    stream: key.stream.clone(),
                    shard_id,
                };
                self.report(key, error).await;
            }
            ShardOutcome::Failed(error) => {
                self.release(&shard_id).await;
                if error.is_fatal_for_shard() {
                    let failures = self.failures.entry(shard_id.clone()).or_default();
                    *failures += 1;
                    if *failures >= self.context.config.max_shard_failures {
                        error!(
                            "Consumer for shard: {shard_id} of stream: {} failed {failures} times, abandoning the shard",
                            key.stream
                        );
                        self.topology.mark_abandoned(&shard_id);
                        self.refresh_due = true;
                    }
                }
                self.report(key, error).await;
            }
        }
    }

    /// Drops the checkpoint of a shard that no longer exists upstream.
    async fn retire(&self, shard_id: &ShardId) {
        let stream = &self.context.config.stream;
        match self.context.checkpoints.remove(stream, shard_id).await {
            Ok(()) => info!("Retired checkpoint of shard: {shard_id} of stream: {stream}"),
            Err(error) => warn!(
                "Cannot retire checkpoint of shard: {shard_id} of stream: {stream}. {error}"
            ),
        }
    }

    async fn release(&self, shard_id: &ShardId) {
        let key = ShardKey::new(self.context.config.stream.clone(), shard_id.clone());
        if let Err(error) = self.context.locks.release(&key, &self.context.holder).await {
            warn!(
                "Cannot release lock for shard: {shard_id} of stream: {}. {error}",
                key.stream
            );
        }
    }

    async fn report(&self, key: ShardKey, error: ConsumerError) {
        self.context
            .error_callback
            .call(ErrorEvent::ShardTerminated { key, error })
            .await;
    }
}
