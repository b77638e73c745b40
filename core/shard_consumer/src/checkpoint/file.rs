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

use crate::checkpoint::CheckpointStore;
use crate::error::ConsumerError;
use crate::types::{Checkpoint, ShardId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

type Checkpoints = BTreeMap<String, BTreeMap<ShardId, Checkpoint>>;

/// Checkpoints kept in a single JSON document, rewritten on every change.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    checkpoints: Checkpoints,
}

impl FileCheckpointStore {
    /// Opens the checkpoint file, creating it when missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ConsumerError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|error| {
                error!("Cannot open checkpoint file: {}. {error}.", path.display());
                ConsumerError::CheckpointStore(format!("cannot open {}", path.display()))
            })?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).await.map_err(|error| {
            error!("Cannot read checkpoint file: {}. {error}.", path.display());
            ConsumerError::CheckpointStore(format!("cannot read {}", path.display()))
        })?;

        let checkpoints = if buffer.is_empty() {
            info!("Checkpoint file is empty: {}", path.display());
            Checkpoints::new()
        } else {
            let checkpoints: Checkpoints = serde_json::from_slice(&buffer).map_err(|error| {
                error!("Cannot parse checkpoint file: {}. {error}.", path.display());
                ConsumerError::CheckpointStore(format!("cannot parse {}", path.display()))
            })?;
            info!(
                "Loaded {} checkpoints from file: {}",
                checkpoints.values().map(BTreeMap::len).sum::<usize>(),
                path.display()
            );
            checkpoints
        };

        Ok(Self {
            path,
            state: Mutex::new(FileState { file, checkpoints }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, file: &mut File, checkpoints: &Checkpoints) -> Result<(), ConsumerError> {
        let write_error = |error: std::io::Error| {
            error!("Cannot write checkpoint file: {}. {error}.", self.path.display());
            ConsumerError::CheckpointStore(format!("cannot write {}", self.path.display()))
        };

        let buffer = serde_json::to_vec_pretty(checkpoints).map_err(|error| {
            ConsumerError::CheckpointStore(format!("cannot serialize checkpoints. {error}"))
        })?;
        file.set_len(0).await.map_err(write_error)?;
        file.seek(SeekFrom::Start(0)).await.map_err(write_error)?;
        file.write_all(&buffer).await.map_err(write_error)?;
        file.sync_data().await.map_err(write_error)?;
        debug!("Saved checkpoint file: {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(
        &self,
        stream: &str,
        shard_id: &ShardId,
    ) -> Result<Option<Checkpoint>, ConsumerError> {
        let state = self.state.lock().await;
        Ok(state
            .checkpoints
            .get(stream)
            .and_then(|shards| shards.get(shard_id))
            .cloned())
    }

    async fn put(
        &self,
        stream: &str,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        let mut checkpoints = state.checkpoints.clone();
        checkpoints
            .entry(stream.to_owned())
            .or_default()
            .insert(shard_id.clone(), checkpoint);
        self.save(&mut state.file, &checkpoints).await?;
        state.checkpoints = checkpoints;
        Ok(())
    }

    async fn remove(&self, stream: &str, shard_id: &ShardId) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        let mut checkpoints = state.checkpoints.clone();
        let Some(shards) = checkpoints.get_mut(stream) else {
            return Ok(());
        };
        if shards.remove(shard_id).is_none() {
            return Ok(());
        }
        if shards.is_empty() {
            checkpoints.remove(stream);
        }
        self.save(&mut state.file, &checkpoints).await?;
        state.checkpoints = checkpoints;
        Ok(())
    }
}
