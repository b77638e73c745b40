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

pub use crate::backoff::BackoffConfig;
use crate::error::ConsumerError;
use crate::types::IteratorPosition;
use bon::Builder;
use chrono::{DateTime, Utc};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

pub const ENV_PREFIX: &str = "SHARD_CONSUMER_";

/// Where a shard without a checkpoint starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    TrimHorizon,
    #[default]
    Latest,
    AtTimestamp(DateTime<Utc>),
}

impl From<InitialPosition> for IteratorPosition {
    fn from(value: InitialPosition) -> Self {
        match value {
            InitialPosition::TrimHorizon => IteratorPosition::TrimHorizon,
            InitialPosition::Latest => IteratorPosition::Latest,
            InitialPosition::AtTimestamp(timestamp) => IteratorPosition::AtTimestamp(timestamp),
        }
    }
}

/// How often progress is written to the checkpoint store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// After every processed record.
    Record,
    /// Once per polled batch, at the last processed record.
    #[default]
    Batch,
}

/// Every tunable of the consumer engine.
///
/// # Examples
///
/// ```
/// use shard_consumer::prelude::*;
/// use std::time::Duration;
///
/// let config = ConsumerConfig::builder()
///     .stream("orders")
///     .initial_position(InitialPosition::TrimHorizon)
///     .idle_between_polls(Duration::from_millis(1))
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Name of the consumed stream.
    #[builder(into)]
    pub stream: String,
    #[builder(default)]
    pub initial_position: InitialPosition,
    /// Maximum number of records requested per poll.
    #[builder(default = 10_000)]
    pub batch_limit: usize,
    /// Pause after every poll, including empty ones.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub idle_between_polls: Duration,
    /// Cadence of the supervisor's assignment pass.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub reconcile_interval: Duration,
    /// Cadence of shard listing. Drained shards also trigger a refresh.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(10))]
    pub topology_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(30))]
    pub lock_lease: Duration,
    /// Must be shorter than `lock_lease`.
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(10))]
    pub lock_renewal_interval: Duration,
    /// Regeneration of rejected shard iterators.
    #[builder(default = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(5), Some(5)))]
    pub iterator_backoff: BackoffConfig,
    /// Transient stream service failures while polling.
    #[builder(default = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(10), Some(10)))]
    pub service_backoff: BackoffConfig,
    /// Suspension of reconciliation while the topology is unavailable.
    #[builder(default = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60), None))]
    pub topology_backoff: BackoffConfig,
    #[builder(default)]
    pub checkpoint_mode: CheckpointMode,
    /// Re-reads of a record whose delivery asked for the same position. `None` is unlimited.
    pub max_same_position_retries: Option<u32>,
    /// Fatal consumer failures of a shard before it is abandoned.
    #[builder(default = 3)]
    pub max_shard_failures: u32,
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(10))]
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::builder().stream(String::new()).build()
    }
}

impl ConsumerConfig {
    /// Layers the defaults, the optional TOML file and `SHARD_CONSUMER_*` environment variables.
    ///
    /// Nested fields use a double underscore, e.g. `SHARD_CONSUMER_SERVICE_BACKOFF__CAP=5s`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConsumerError> {
        let mut figment = Figment::from(Serialized::defaults(ConsumerConfig::default()));
        match path {
            Some(path) if path.is_file() => {
                info!("Loading consumer config from path: '{}'", path.display());
                figment = figment.merge(Toml::file(path));
            }
            Some(path) => {
                warn!(
                    "Consumer config file not found at path: '{}', using defaults",
                    path.display()
                );
            }
            None => {}
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: ConsumerConfig = figment
            .extract()
            .map_err(|error| ConsumerError::InvalidConfiguration(error.to_string()))?;
        config.validate()?;
        info!("Consumer config loaded: {config}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.stream.trim().is_empty() {
            return Err(invalid("stream name must not be empty"));
        }

        if self.batch_limit == 0 {
            return Err(invalid("batch_limit must be greater than zero"));
        }

        if self.lock_lease.is_zero() {
            return Err(invalid("lock_lease must be greater than zero"));
        }

        if self.lock_renewal_interval >= self.lock_lease {
            return Err(invalid("lock_renewal_interval must be shorter than lock_lease"));
        }

        for (name, backoff) in [
            ("iterator_backoff", &self.iterator_backoff),
            ("service_backoff", &self.service_backoff),
            ("topology_backoff", &self.topology_backoff),
        ] {
            if backoff.base > backoff.cap {
                return Err(invalid(format!("{name} base must not exceed its cap")));
            }
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConsumerError {
    ConsumerError::InvalidConfiguration(reason.into())
}

impl Display for ConsumerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ stream: {}, initial_position: {:?}, batch_limit: {}, idle_between_polls: {}, reconcile_interval: {}, topology_refresh_interval: {}, lock_lease: {}, lock_renewal_interval: {}, iterator_backoff: {}, service_backoff: {}, topology_backoff: {}, checkpoint_mode: {:?}, max_same_position_retries: {:?}, max_shard_failures: {}, shutdown_timeout: {} }}",
            self.stream,
            self.initial_position,
            self.batch_limit,
            humantime::format_duration(self.idle_between_polls),
            humantime::format_duration(self.reconcile_interval),
            humantime::format_duration(self.topology_refresh_interval),
            humantime::format_duration(self.lock_lease),
            humantime::format_duration(self.lock_renewal_interval),
            self.iterator_backoff,
            self.service_backoff,
            self.topology_backoff,
            self.checkpoint_mode,
            self.max_same_position_retries,
            self.max_shard_failures,
            humantime::format_duration(self.shutdown_timeout),
        )
    }
}
