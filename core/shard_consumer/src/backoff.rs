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

use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Bounded exponential backoff parameters: delays double from `base` up to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(1))]
    pub base: Duration,
    #[serde(with = "humantime_serde")]
    #[builder(default = Duration::from_secs(60))]
    pub cap: Duration,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl BackoffConfig {
    pub fn new(base: Duration, cap: Duration, max_retries: Option<u32>) -> Self {
        Self {
            base,
            cap,
            max_retries,
        }
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Display for BackoffConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ base: {}, cap: {}, max_retries: {:?} }}",
            humantime::format_duration(self.base),
            humantime::format_duration(self.cap),
            self.max_retries
        )
    }
}

/// Tracks consecutive failures against a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns the delay to wait, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_retries
            .is_some_and(|max_retries| self.attempt >= max_retries)
        {
            return None;
        }

        let delay = self.config.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Number of failures recorded since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
