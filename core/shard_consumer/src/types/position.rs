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

use crate::types::SequenceNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Starting position requested when a shard iterator is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    TrimHorizon,
    Latest,
    AtTimestamp(DateTime<Utc>),
    AtSequenceNumber(SequenceNumber),
    AfterSequenceNumber(SequenceNumber),
}

impl Display for IteratorPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IteratorPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            IteratorPosition::Latest => write!(f, "LATEST"),
            IteratorPosition::AtTimestamp(timestamp) => {
                write!(f, "AT_TIMESTAMP:{}", timestamp.to_rfc3339())
            }
            IteratorPosition::AtSequenceNumber(sequence_number) => {
                write!(f, "AT_SEQUENCE_NUMBER:{sequence_number}")
            }
            IteratorPosition::AfterSequenceNumber(sequence_number) => {
                write!(f, "AFTER_SEQUENCE_NUMBER:{sequence_number}")
            }
        }
    }
}

/// Durable progress marker of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    /// Last successfully processed sequence number.
    Sequence(SequenceNumber),
    /// The shard is closed and every record has been processed.
    ShardEnd,
}

impl Checkpoint {
    pub fn sequence_number(&self) -> Option<&SequenceNumber> {
        match self {
            Checkpoint::Sequence(sequence_number) => Some(sequence_number),
            Checkpoint::ShardEnd => None,
        }
    }

    pub fn is_shard_end(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }

    /// Whether the checkpoint covers a shard whose last record is `ending_sequence_number`.
    pub fn covers(&self, ending_sequence_number: &SequenceNumber) -> bool {
        match self {
            Checkpoint::Sequence(sequence_number) => sequence_number >= ending_sequence_number,
            Checkpoint::ShardEnd => true,
        }
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Checkpoint::Sequence(sequence_number) => write!(f, "{sequence_number}"),
            Checkpoint::ShardEnd => write!(f, "SHARD_END"),
        }
    }
}
