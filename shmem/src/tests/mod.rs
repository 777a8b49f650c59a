use tempfile::{tempdir, TempDir};

use crate::config::ShmemConfig;


/// A buffer configuration whose link file lives in a fresh temporary directory.
pub(crate) fn scratch_config(slot_count: usize, max_shard_size: usize) -> (TempDir, ShmemConfig) {
    let dir = tempdir().expect("create temp dir");
    let cfg = ShmemConfig {
        data_dir: dir.path().to_string_lossy().into_owned(),
        shmem_file_name: format!("slots-{}", std::process::id()),
        slot_count,
        max_shard_size,
        open_timeout_ms: 2_000,
    };
    (dir, cfg)
}
