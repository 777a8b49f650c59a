use std::fmt;
use std::io;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ::shared_memory::{Shmem, ShmemConf};
use once_cell::sync::Lazy;
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{debug, info, warn};

use super::config::ShmemConfig;
use super::errors::{RelayError, Result};

const MAGIC: u64 = 0x5348_4152_4443_5354;
const CACHE_LINE: usize = 64;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

const HEADER_AREA: usize = align_up(mem::size_of::<RegionHeader>(), CACHE_LINE);
const RECORD_AREA: usize = align_up(mem::size_of::<SlotRecord>(), 8);

// pthread mutex size is only known at runtime.
static LOCK_AREA: Lazy<usize> = Lazy::new(|| align_up(Mutex::size_of(None), CACHE_LINE));

#[repr(C)]
struct RegionHeader {
    magic: u64,
    slot_count: u64,
    max_shard_size: u64,
    initialized: AtomicBool,
    all_received: AtomicBool,
}

const EMPTY: u8 = 0;
const OCCUPIED: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct SlotRecord {
    occupied: u8,
    producer_id: u32,
    shard_id: u32,
    len: u64,
}

impl SlotRecord {
    const VACANT: SlotRecord = SlotRecord {
        occupied: EMPTY,
        producer_id: 0,
        shard_id: 0,
        len: 0,
    };
}

#[inline]
fn slot_stride(max_shard_size: usize) -> usize {
    align_up(*LOCK_AREA + RECORD_AREA + max_shard_size, CACHE_LINE)
}

#[inline]
fn region_size(slot_count: usize, max_shard_size: usize) -> usize {
    HEADER_AREA + slot_count * slot_stride(max_shard_size)
}

// raw_sync reports the pthread status only inside its message
// ("Failed to acquire mutex : 110"). A timed out attempt means another
// participant holds the lock; anything else is a broken lock.
fn is_contention(message: &str) -> bool {
    let code = message
        .rsplit(':')
        .next()
        .and_then(|code| code.trim().parse::<i32>().ok());
    match code {
        Some(code) => io::Error::from_raw_os_error(code).kind() == io::ErrorKind::TimedOut,
        None => true,
    }
}

/// One shard taken out of a slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotEntry {
    pub producer_id: u32,
    pub shard_id: u32,
    pub payload: Vec<u8>,
}

/// Fixed polling interval used between failed probes.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    interval: Duration,
}

impl Backoff {
    pub fn new(interval: Duration) -> Backoff {
        Backoff { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn wait(&self) {
        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_micros(500))
    }
}

/// Fixed set of independently locked slots plus the completion flag, living in
/// OS shared memory so that every fan and the jockey can map it.
///
/// The process that calls [`SlotBuffer::create`] owns the region and removes it
/// when dropped; every other participant attaches with [`SlotBuffer::open`].
pub struct SlotBuffer {
    // Declared before `shmem` so lock handles are dropped before the mapping.
    locks: Vec<Box<dyn LockImpl>>,
    shmem: Shmem,
    slot_count: usize,
    max_shard_size: usize,
    closing: Arc<AtomicBool>,
}

impl SlotBuffer {
    pub fn create(cfg: &ShmemConfig) -> Result<SlotBuffer> {
        if cfg.slot_count == 0 || cfg.max_shard_size == 0 {
            return Err(RelayError::Config(
                "slot_count and max_shard_size must be at least 1".to_string(),
            ));
        }
        let stride = slot_stride(cfg.max_shard_size);
        let shmem = ShmemConf::new()
            .size(region_size(cfg.slot_count, cfg.max_shard_size))
            .flink(cfg.link_path())
            .force_create_flink()
            .create()?;

        let base = shmem.as_ptr();
        unsafe {
            ptr::write(
                base as *mut RegionHeader,
                RegionHeader {
                    magic: MAGIC,
                    slot_count: cfg.slot_count as u64,
                    max_shard_size: cfg.max_shard_size as u64,
                    initialized: AtomicBool::new(false),
                    all_received: AtomicBool::new(false),
                },
            );
        }

        let mut locks = Vec::with_capacity(cfg.slot_count);
        for slot in 0..cfg.slot_count {
            let lock_p = unsafe { base.add(HEADER_AREA + slot * stride) };
            let record_p = unsafe { lock_p.add(*LOCK_AREA) };
            let (lock, _) = unsafe { Mutex::new(lock_p, record_p) }.map_err(RelayError::lock)?;
            unsafe { ptr::write(record_p as *mut SlotRecord, SlotRecord::VACANT) };
            locks.push(lock);
        }

        let buffer = SlotBuffer {
            locks,
            shmem,
            slot_count: cfg.slot_count,
            max_shard_size: cfg.max_shard_size,
            closing: Arc::new(AtomicBool::new(false)),
        };
        buffer.header().initialized.store(true, Ordering::Release);
        info!("created slot buffer: {}", buffer);
        Ok(buffer)
    }

    pub fn open(cfg: &ShmemConfig) -> Result<SlotBuffer> {
        let shmem = ShmemConf::new().flink(cfg.link_path()).open()?;
        if shmem.len() < HEADER_AREA {
            return Err(RelayError::Logic(format!(
                "shared region {} is too small ({} bytes)",
                cfg.link_path().display(),
                shmem.len()
            )));
        }

        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const RegionHeader) };
        let deadline = Instant::now() + Duration::from_millis(cfg.open_timeout_ms);
        while !header.initialized.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return Err(RelayError::Logic(format!(
                    "shared region {} was never initialized",
                    cfg.link_path().display()
                )));
            }
            thread::sleep(Duration::from_millis(1));
        }
        if header.magic != MAGIC {
            return Err(RelayError::Logic(format!(
                "{} is not a shard slot buffer",
                cfg.link_path().display()
            )));
        }
        let slot_count = header.slot_count as usize;
        let max_shard_size = header.max_shard_size as usize;
        if slot_count != cfg.slot_count || max_shard_size != cfg.max_shard_size {
            return Err(RelayError::Config(format!(
                "buffer geometry mismatch: region has {} slots of {} bytes, configured {} slots of {} bytes",
                slot_count, max_shard_size, cfg.slot_count, cfg.max_shard_size
            )));
        }
        if shmem.len() < region_size(slot_count, max_shard_size) {
            return Err(RelayError::Logic(format!(
                "shared region {} is truncated",
                cfg.link_path().display()
            )));
        }

        let stride = slot_stride(max_shard_size);
        let mut locks = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            let lock_p = unsafe { base.add(HEADER_AREA + slot * stride) };
            let record_p = unsafe { lock_p.add(*LOCK_AREA) };
            let (lock, _) =
                unsafe { Mutex::from_existing(lock_p, record_p) }.map_err(RelayError::lock)?;
            locks.push(lock);
        }

        let buffer = SlotBuffer {
            locks,
            shmem,
            slot_count,
            max_shard_size,
            closing: Arc::new(AtomicBool::new(false)),
        };
        debug!("attached to slot buffer: {}", buffer);
        Ok(buffer)
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        unsafe { &*(self.shmem.as_ptr() as *const RegionHeader) }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn max_shard_size(&self) -> usize {
        self.max_shard_size
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    /// Non-blocking attempt to take the lock of `slot`. `Ok(None)` means another
    /// participant holds it.
    pub fn try_acquire(&self, slot: usize) -> Result<Option<SlotGuard<'_>>> {
        let lock = self.locks.get(slot).ok_or_else(|| {
            RelayError::Logic(format!(
                "slot {} is out of range ({} slots)",
                slot, self.slot_count
            ))
        })?;
        let guard = match lock.try_lock(Timeout::Val(Duration::ZERO)) {
            Ok(guard) => guard,
            Err(e) if is_contention(&e.to_string()) => return Ok(None),
            Err(e) => {
                warn!("slot {} lock failed: {}", slot, e);
                return Err(RelayError::lock(e));
            }
        };
        let record_p = *guard;
        Ok(Some(SlotGuard {
            slot,
            record: record_p as *mut SlotRecord,
            payload: unsafe { record_p.add(RECORD_AREA) },
            capacity: self.max_shard_size,
            _lock: guard,
        }))
    }

    pub fn set_all_received(&self) {
        self.header().all_received.store(true, Ordering::Release);
    }

    pub fn all_received(&self) -> bool {
        self.header().all_received.load(Ordering::Acquire)
    }

    /// Routes the usual termination signals into [`SlotBuffer::is_closing`].
    pub fn watch_signals(&self) -> Result<()> {
        for signal in &[SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
            signal_hook::flag::register(*signal, Arc::clone(&self.closing))
                .map_err(RelayError::SignalHook)?;
        }
        Ok(())
    }

    /// Stops every loop using this handle as if a termination signal had arrived.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn ensure_not_closing(&self) -> Result<()> {
        if self.is_closing() {
            warn!("termination signal received");
            return Err(RelayError::Interrupted);
        }
        Ok(())
    }
}

impl fmt::Display for SlotBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} slots x {} bytes at {} (os id {}, {} bytes, owner: {})",
            self.slot_count,
            self.max_shard_size,
            self.shmem
                .get_flink_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.shmem.get_os_id(),
            self.shmem.len(),
            self.shmem.is_owner()
        )
    }
}

/// Exclusive access to one slot. The slot lock is released when the guard drops.
pub struct SlotGuard<'a> {
    slot: usize,
    record: *mut SlotRecord,
    payload: *mut u8,
    capacity: usize,
    _lock: LockGuard<'a>,
}

impl<'a> SlotGuard<'a> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    fn record(&self) -> SlotRecord {
        unsafe { ptr::read(self.record) }
    }

    pub fn is_occupied(&self) -> bool {
        self.record().occupied == OCCUPIED
    }

    pub fn is_free(&self) -> bool {
        !self.is_occupied()
    }

    pub fn write(&mut self, producer_id: u32, shard_id: u32, payload: &[u8]) -> Result<()> {
        if self.is_occupied() {
            return Err(RelayError::SlotOccupied { slot: self.slot });
        }
        if payload.len() > self.capacity {
            return Err(RelayError::ShardTooLarge {
                shard_id,
                len: payload.len(),
                max: self.capacity,
            });
        }
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), self.payload, payload.len());
            ptr::write(
                self.record,
                SlotRecord {
                    occupied: OCCUPIED,
                    producer_id,
                    shard_id,
                    len: payload.len() as u64,
                },
            );
        }
        Ok(())
    }

    pub fn read(&self) -> Option<SlotEntry> {
        let record = self.record();
        if record.occupied != OCCUPIED {
            return None;
        }
        let len = (record.len as usize).min(self.capacity);
        let payload = unsafe { slice::from_raw_parts(self.payload, len) }.to_vec();
        Some(SlotEntry {
            producer_id: record.producer_id,
            shard_id: record.shard_id,
            payload,
        })
    }

    pub fn clear(&mut self) {
        unsafe { ptr::write(self.record, SlotRecord::VACANT) };
    }

    /// Reads the slot and clears it in one critical section.
    pub fn take(&mut self) -> Option<SlotEntry> {
        let entry = self.read();
        if entry.is_some() {
            self.clear();
        }
        entry
    }
}
