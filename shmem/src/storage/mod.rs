use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, error};

use super::config::StorageConfig;
use super::errors::{RelayError, Result};

/// Where fans read shard bytes from.
pub trait ShardSource {
    fn load_shard(&self, shard_id: u32) -> Result<Vec<u8>>;
}

#[inline]
pub fn shard_file_name(shard_id: u32, extension: &str) -> String {
    format!("shard_{:04}{}", shard_id, extension)
}

/// Reads `shard_NNNN<ext>` files from a directory.
#[derive(Clone, Debug)]
pub struct DirShardSource {
    dir: PathBuf,
    extension: String,
}

impl DirShardSource {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> DirShardSource {
        DirShardSource {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(cfg: &StorageConfig) -> DirShardSource {
        DirShardSource::new(&cfg.shards_dir, &cfg.extension)
    }

    pub fn path_of(&self, shard_id: u32) -> PathBuf {
        self.dir.join(shard_file_name(shard_id, &self.extension))
    }
}

impl ShardSource for DirShardSource {
    fn load_shard(&self, shard_id: u32) -> Result<Vec<u8>> {
        let path = self.path_of(shard_id);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("loaded shard {} ({} bytes) from {}", shard_id, bytes.len(), path.display());
                Ok(bytes)
            }
            Err(e) => {
                error!("unable to read {}: {}", path.display(), e);
                Err(RelayError::io(path, e))
            }
        }
    }
}

/// Shards held in memory, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct MemoryShardSource {
    shards: HashMap<u32, Vec<u8>>,
}

impl MemoryShardSource {
    pub fn new() -> MemoryShardSource {
        MemoryShardSource::default()
    }

    pub fn insert(&mut self, shard_id: u32, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.shards.insert(shard_id, payload.into());
        self
    }
}

impl FromIterator<(u32, Vec<u8>)> for MemoryShardSource {
    fn from_iter<I: IntoIterator<Item = (u32, Vec<u8>)>>(iter: I) -> Self {
        MemoryShardSource {
            shards: iter.into_iter().collect(),
        }
    }
}

impl ShardSource for MemoryShardSource {
    fn load_shard(&self, shard_id: u32) -> Result<Vec<u8>> {
        self.shards.get(&shard_id).cloned().ok_or_else(|| {
            RelayError::io(
                format!("memory://shard/{}", shard_id),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such shard"),
            )
        })
    }
}
