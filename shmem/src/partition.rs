//! Splits shard ids into contiguous groups, one per fan.

use std::ops::Range;

use super::errors::{RelayError, Result};

/// Returns `fan_count` contiguous, non-overlapping groups covering `0..shard_count`.
///
/// Every group holds `shard_count / fan_count` ids and the first
/// `shard_count % fan_count` groups hold one more.
pub fn partition(shard_count: u32, fan_count: u32) -> Result<Vec<Range<u32>>> {
    check(shard_count, fan_count)?;
    let base = shard_count / fan_count;
    let extra = shard_count % fan_count;
    let mut groups = Vec::with_capacity(fan_count as usize);
    let mut start = 0;
    for fan_id in 0..fan_count {
        let len = base + u32::from(fan_id < extra);
        groups.push(start..start + len);
        start += len;
    }
    debug_assert_eq!(start, shard_count);
    Ok(groups)
}

/// The group of a single fan, without building the whole partition.
pub fn assignment_of(fan_id: u32, shard_count: u32, fan_count: u32) -> Result<Range<u32>> {
    check(shard_count, fan_count)?;
    if fan_id >= fan_count {
        return Err(RelayError::Config(format!(
            "fan {} does not exist ({} fans)",
            fan_id, fan_count
        )));
    }
    let base = shard_count / fan_count;
    let extra = shard_count % fan_count;
    let start = fan_id * base + fan_id.min(extra);
    let len = base + u32::from(fan_id < extra);
    Ok(start..start + len)
}

fn check(shard_count: u32, fan_count: u32) -> Result<()> {
    if fan_count == 0 {
        return Err(RelayError::Config("at least one fan is required".to_string()));
    }
    if shard_count < fan_count {
        return Err(RelayError::Config(format!(
            "{} shards cannot be split across {} fans",
            shard_count, fan_count
        )));
    }
    Ok(())
}
