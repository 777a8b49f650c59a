use std::mem;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::assembly::{self, Assembler};
use super::config::AssemblyConfig;
use super::core::{Backoff, SlotBuffer, SlotEntry};
use super::errors::{RelayError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JockeyState {
    AwaitingShards,
    Assembling,
    Done,
}

/// What happened to a shard handed to [`Jockey::accept`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acceptance {
    Stored,
    Duplicate,
    OutOfRange,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DrainOptions {
    pub backoff: Backoff,
    pub timeout: Option<Duration>,
}

/// The single consumer: drains the slot buffer and keeps every shard at its id.
pub struct Jockey {
    shard_count: u32,
    results: Vec<Option<Vec<u8>>>,
    received: u32,
    duplicates: u32,
    state: JockeyState,
    next_slot: usize,
}

impl Jockey {
    pub fn new(shard_count: u32) -> Jockey {
        Jockey {
            shard_count,
            results: vec![None; shard_count as usize],
            received: 0,
            duplicates: 0,
            state: JockeyState::AwaitingShards,
            next_slot: 0,
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn duplicates(&self) -> u32 {
        self.duplicates
    }

    pub fn state(&self) -> JockeyState {
        self.state
    }

    pub fn has_all_shards(&self) -> bool {
        self.received == self.shard_count()
    }

    pub fn shard(&self, shard_id: u32) -> Option<&[u8]> {
        self.results.get(shard_id as usize)?.as_deref()
    }

    pub fn missing(&self) -> Vec<u32> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Records one shard. A shard id seen before keeps its first payload.
    pub fn accept(&mut self, entry: SlotEntry) -> Acceptance {
        let shard_count = self.shard_count();
        let result = match self.results.get_mut(entry.shard_id as usize) {
            Some(result) => result,
            None => {
                warn!(
                    "discarding shard {} from fan {}, only {} shards exist",
                    entry.shard_id, entry.producer_id, shard_count
                );
                return Acceptance::OutOfRange;
            }
        };
        if result.is_some() {
            self.duplicates += 1;
            warn!(
                "duplicate shard {} from fan {}, discarded",
                entry.shard_id, entry.producer_id
            );
            return Acceptance::Duplicate;
        }
        *result = Some(entry.payload);
        self.received += 1;
        info!(
            "received shard {} from fan {}. {}/{} shards received",
            entry.shard_id, entry.producer_id, self.received, shard_count
        );
        Acceptance::Stored
    }

    /// Polls the slots round robin until every shard has arrived, then raises
    /// the completion flag.
    pub fn drain(&mut self, buffer: &SlotBuffer, opts: &DrainOptions) -> Result<()> {
        let started = Instant::now();
        while !self.has_all_shards() {
            buffer.ensure_not_closing()?;
            let slot = self.next_slot;
            let taken = match buffer.try_acquire(slot)? {
                Some(mut guard) => guard.take(),
                None => {
                    trace!("slot {} locked", slot);
                    None
                }
            };
            match taken {
                Some(entry) => {
                    debug!("took shard {} from slot {}", entry.shard_id, slot);
                    self.accept(entry);
                }
                None => {
                    if let Some(timeout) = opts.timeout {
                        if started.elapsed() >= timeout {
                            return Err(RelayError::Timeout {
                                received: self.received,
                                expected: self.shard_count(),
                            });
                        }
                    }
                    self.next_slot = (slot + 1) % buffer.slot_count();
                    opts.backoff.wait();
                }
            }
        }
        buffer.set_all_received();
        self.state = JockeyState::Assembling;
        info!("all {} shards received", self.shard_count());
        Ok(())
    }

    /// Hands out the shards in id order, failing if any id never arrived.
    pub fn into_shards(mut self) -> Result<Vec<Vec<u8>>> {
        self.take_shards()
    }

    /// Runs the assembly pipeline over every shard and moves to `Done`.
    /// The shards are handed to `assembler` and no longer held afterwards.
    pub fn assemble(&mut self, assembler: &dyn Assembler, cfg: &AssemblyConfig) -> Result<PathBuf> {
        if self.state != JockeyState::Assembling {
            return Err(RelayError::Logic(format!(
                "cannot assemble while {:?}",
                self.state
            )));
        }
        let shards = self.take_shards()?;
        let output = assembly::assemble(assembler, &shards, cfg)?;
        self.state = JockeyState::Done;
        Ok(output)
    }

    fn take_shards(&mut self) -> Result<Vec<Vec<u8>>> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(RelayError::IncompleteAssembly { missing });
        }
        Ok(mem::take(&mut self.results).into_iter().flatten().collect())
    }
}
