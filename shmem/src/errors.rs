use std::io;
use std::path::PathBuf;

use thiserror::Error;

// raw_sync hands back Box<dyn Error> which is neither Send nor Sync, so lock
// failures are flattened into their message.

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Os(#[from] io::Error),

    #[error("Signal handling error: {0}")]
    SignalHook(io::Error),

    #[error("Slot {slot} is still occupied")]
    SlotOccupied { slot: usize },

    #[error("Shard {shard_id} is {len} bytes, slots hold at most {max}")]
    ShardTooLarge { shard_id: u32, len: usize, max: usize },

    #[error("Assembly is incomplete, missing shards {missing:?}")]
    IncompleteAssembly { missing: Vec<u32> },

    #[error("Timed out with {received}/{expected} shards received")]
    Timeout { received: u32, expected: u32 },

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Child process {name} failed: {status}")]
    Child { name: String, status: String },

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Logic error: {0}")]
    Logic(String),
}

impl RelayError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> RelayError {
        RelayError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> RelayError {
        RelayError::Lock(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
