use std::mem;

use tracing::{debug, info, trace};

use super::core::{Backoff, SlotBuffer};
use super::errors::Result;
use super::storage::ShardSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanState {
    Idle,
    Loading,
    Delivering(u32),
    Done,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<u32>,
    /// Shards dropped because the jockey already had every shard.
    pub abandoned: Vec<u32>,
    pub attempts: u64,
}

/// A producer owning a fixed group of shards.
pub struct Fan {
    id: u32,
    assignment: Vec<u32>,
    staged: Vec<(u32, Vec<u8>)>,
    state: FanState,
    next_slot: usize,
}

impl Fan {
    pub fn new(id: u32, assignment: impl IntoIterator<Item = u32>) -> Fan {
        Fan {
            id,
            assignment: assignment.into_iter().collect(),
            staged: Vec::new(),
            state: FanState::Idle,
            next_slot: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn assignment(&self) -> &[u32] {
        &self.assignment
    }

    pub fn state(&self) -> FanState {
        self.state
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Loads every assigned shard. Any unreadable shard aborts the load.
    pub fn load(&mut self, source: &dyn ShardSource) -> Result<()> {
        self.state = FanState::Loading;
        let mut staged = Vec::with_capacity(self.assignment.len());
        for &shard_id in &self.assignment {
            staged.push((shard_id, source.load_shard(shard_id)?));
        }
        info!("fan {} loaded {} shards", self.id, staged.len());
        self.staged = staged;
        Ok(())
    }

    /// Pushes every staged shard into the buffer, in order.
    pub fn deliver(&mut self, buffer: &SlotBuffer, backoff: &Backoff) -> Result<DeliveryReport> {
        let mut report = DeliveryReport::default();
        let mut pending = mem::take(&mut self.staged).into_iter();
        while let Some((shard_id, payload)) = pending.next() {
            self.state = FanState::Delivering(shard_id);
            if self.push(buffer, backoff, shard_id, &payload, &mut report.attempts)? {
                report.delivered.push(shard_id);
                continue;
            }
            report.abandoned.push(shard_id);
            report.abandoned.extend(pending.map(|(id, _)| id));
            info!(
                "fan {} stopping early, jockey has all shards ({} undelivered)",
                self.id,
                report.abandoned.len()
            );
            break;
        }
        self.state = FanState::Done;
        Ok(report)
    }

    pub fn run(
        &mut self,
        source: &dyn ShardSource,
        buffer: &SlotBuffer,
        backoff: &Backoff,
    ) -> Result<DeliveryReport> {
        if self.assignment.is_empty() {
            self.state = FanState::Done;
            return Ok(DeliveryReport::default());
        }
        self.load(source)?;
        self.deliver(buffer, backoff)
    }

    // Ok(false) when the completion flag was observed before the shard found a slot.
    fn push(
        &mut self,
        buffer: &SlotBuffer,
        backoff: &Backoff,
        shard_id: u32,
        payload: &[u8],
        attempts: &mut u64,
    ) -> Result<bool> {
        loop {
            buffer.ensure_not_closing()?;
            if buffer.all_received() {
                return Ok(false);
            }
            *attempts += 1;
            let slot = self.next_slot;
            if let Some(mut guard) = buffer.try_acquire(slot)? {
                if guard.is_free() {
                    guard.write(self.id, shard_id, payload)?;
                    drop(guard);
                    debug!("fan {} sent shard {} to slot {}", self.id, shard_id, slot);
                    return Ok(true);
                }
                trace!("fan {} found slot {} occupied", self.id, slot);
            } else {
                trace!("fan {} found slot {} locked", self.id, slot);
            }
            self.next_slot = (slot + 1) % buffer.slot_count();
            backoff.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::errors::RelayError;
    use crate::storage::MemoryShardSource;
    use crate::tests::scratch_config;

    fn source(ids: std::ops::Range<u32>) -> MemoryShardSource {
        ids.map(|id| (id, format!("shard-{}", id).into_bytes())).collect()
    }

    #[test]
    fn fills_slots_round_robin() -> Result<()> {
        let (_dir, cfg) = scratch_config(2, 32);
        let buffer = SlotBuffer::create(&cfg)?;
        let mut fan = Fan::new(5, 0..2);
        let report = fan.run(&source(0..2), &buffer, &Backoff::new(Duration::ZERO))?;

        assert_eq!(report.delivered, vec![0, 1]);
        assert!(report.abandoned.is_empty());
        assert_eq!(fan.state(), FanState::Done);

        let first = buffer.try_acquire(0)?.and_then(|g| g.read()).expect("slot 0 filled");
        let second = buffer.try_acquire(1)?.and_then(|g| g.read()).expect("slot 1 filled");
        assert_eq!((first.producer_id, first.shard_id), (5, 0));
        assert_eq!((second.producer_id, second.shard_id), (5, 1));
        assert_eq!(second.payload, b"shard-1".to_vec());
        Ok(())
    }

    #[test]
    fn empty_assignment_finishes_immediately() -> Result<()> {
        let (_dir, cfg) = scratch_config(1, 8);
        let buffer = SlotBuffer::create(&cfg)?;
        let mut fan = Fan::new(0, Vec::new());
        let report = fan.run(&MemoryShardSource::new(), &buffer, &Backoff::default())?;
        assert_eq!(report, DeliveryReport::default());
        assert_eq!(fan.state(), FanState::Done);
        Ok(())
    }

    #[test]
    fn unreadable_shard_is_fatal() {
        let mut fan = Fan::new(1, 0..3);
        let err = fan.load(&source(0..2)).unwrap_err();
        assert!(matches!(err, RelayError::Io { .. }));
        assert_eq!(fan.staged_len(), 0);
    }

    #[test]
    fn does_not_deliver_once_flag_is_set() -> Result<()> {
        let (_dir, cfg) = scratch_config(2, 32);
        let buffer = SlotBuffer::create(&cfg)?;
        buffer.set_all_received();

        let mut fan = Fan::new(0, 0..2);
        let report = fan.run(&source(0..2), &buffer, &Backoff::default())?;
        assert!(report.delivered.is_empty());
        assert_eq!(report.abandoned, vec![0, 1]);
        for slot in 0..2 {
            assert!(buffer.try_acquire(slot)?.expect("unlocked").is_free());
        }
        Ok(())
    }

    #[test]
    fn stops_waiting_when_flag_flips() -> Result<()> {
        let (_dir, cfg) = scratch_config(1, 32);
        let buffer = SlotBuffer::create(&cfg)?;
        buffer.try_acquire(0)?.expect("unlocked").write(9, 99, b"stuck")?;

        let flipper = thread::spawn({
            let cfg = cfg.clone();
            move || {
                let peer = SlotBuffer::open(&cfg).expect("open peer mapping");
                thread::sleep(Duration::from_millis(50));
                peer.set_all_received();
            }
        });

        let mut fan = Fan::new(0, 0..3);
        let report = fan.run(&source(0..3), &buffer, &Backoff::new(Duration::from_millis(1)))?;
        flipper.join().expect("flipper thread panicked");

        assert!(report.delivered.is_empty());
        assert_eq!(report.abandoned, vec![0, 1, 2]);
        assert!(report.attempts > 1);
        let left = buffer.try_acquire(0)?.and_then(|g| g.read()).expect("slot untouched");
        assert_eq!(left.shard_id, 99);
        Ok(())
    }
}
