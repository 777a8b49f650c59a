use std::env;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::errors::{RelayError, Result};

pub const DEFAULT_SLOT_COUNT: usize = 4;
pub const DEFAULT_MAX_SHARD_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub data_dir: String,
    pub shmem_file_name: String,
    pub slot_count: usize,
    pub max_shard_size: usize,
    // How long an attaching process waits for the owner to finish initializing.
    pub open_timeout_ms: u64,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            data_dir: "/tmp".to_string(),
            shmem_file_name: "shardcast-slots".to_string(),
            slot_count: DEFAULT_SLOT_COUNT,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            open_timeout_ms: 5_000,
        }
    }
}

impl ShmemConfig {
    pub fn link_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.shmem_file_name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub shard_count: u32,
    pub fan_count: u32,
    pub backoff_us: u64,
    // 0 waits forever.
    pub receive_timeout_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            shard_count: 128,
            fan_count: 16,
            backoff_us: 500,
            receive_timeout_ms: 0,
        }
    }
}

impl RunConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_micros(self.backoff_us)
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        match self.receive_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub shards_dir: String,
    pub extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            shards_dir: "video_shards".to_string(),
            extension: ".mp4".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub work_dir: String,
    pub output_name: String,
    pub audio_path: Option<String>,
    /// Argument vector run to mux audio; `{video}`, `{audio}` and `{output}` are substituted.
    pub mux_command: Vec<String>,
    /// Argument vector run to play the result; `{input}` is substituted.
    pub player_command: Vec<String>,
    pub play: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        AssemblyConfig {
            work_dir: "temp".to_string(),
            output_name: "concat_all".to_string(),
            audio_path: None,
            mux_command: vec![
                "ffmpeg".to_string(),
                "-y".to_string(),
                "-loglevel".to_string(),
                "quiet".to_string(),
                "-i".to_string(),
                "{video}".to_string(),
                "-i".to_string(),
                "{audio}".to_string(),
                "-c:v".to_string(),
                "copy".to_string(),
                "{output}".to_string(),
            ],
            player_command: vec!["vlc".to_string(), "--play-and-exit".to_string(), "{input}".to_string()],
            play: false,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub shmem: ShmemConfig,
    pub run: RunConfig,
    pub storage: StorageConfig,
    pub assembly: AssemblyConfig,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.fan_count == 0 {
            return Err(RelayError::Config("fan_count must be at least 1".to_string()));
        }
        if self.run.shard_count < self.run.fan_count {
            return Err(RelayError::Config(format!(
                "shard_count ({}) must not be smaller than fan_count ({})",
                self.run.shard_count, self.run.fan_count
            )));
        }
        if self.shmem.slot_count == 0 {
            return Err(RelayError::Config("slot_count must be at least 1".to_string()));
        }
        if self.shmem.max_shard_size == 0 {
            return Err(RelayError::Config("max_shard_size must be at least 1".to_string()));
        }
        if self.shmem.shmem_file_name.is_empty() {
            return Err(RelayError::Config("shmem_file_name must not be empty".to_string()));
        }
        // The work dir is cleaned before every run and must not hold the inputs.
        let work_dir = absolute(Path::new(&self.assembly.work_dir));
        if absolute(Path::new(&self.storage.shards_dir)).starts_with(&work_dir) {
            return Err(RelayError::Config(format!(
                "work_dir {} must not contain shards_dir {}",
                self.assembly.work_dir, self.storage.shards_dir
            )));
        }
        Ok(())
    }
}

// Lexical absolute form; the directories may not exist yet.
fn absolute(path: &Path) -> PathBuf {
    let joined = match env::current_dir() {
        Ok(cwd) if path.is_relative() => cwd.join(path),
        _ => path.to_path_buf(),
    };
    let mut normal = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other.as_os_str()),
        }
    }
    normal
}
