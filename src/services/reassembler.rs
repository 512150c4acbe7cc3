use crate::config::MeterConfig;
use crate::error::FrameError;
use crate::packet_buffer::PacketBuffer;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use std::collections::HashMap;

#[derive(Debug)]
struct Slot {
    data: Option<Vec<u8>>,
    deadline: u64,
}

/// Out-of-order segments keyed by sequence number.
///
/// Every slot carries a deadline. A drained slot stays behind as an empty
/// tombstone until its deadline so that a late duplicate landing there is
/// reclaimed by the same sweep instead of lingering.
#[derive(Debug, Default)]
pub struct ExpiringCache {
    slots: HashMap<u32, Slot>,
}

impl ExpiringCache {
    /// Stores `data` at `seq`. A slot that already has a deadline keeps it.
    pub fn insert(&mut self, seq: u32, data: Vec<u8>, deadline: u64) {
        let slot = self.slots.entry(seq).or_insert(Slot { data: None, deadline });
        slot.data = Some(data);
    }

    pub fn take(&mut self, seq: u32) -> Option<Vec<u8>> {
        self.slots.get_mut(&seq).and_then(|slot| slot.data.take())
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.slots.get(&seq).is_some_and(|slot| slot.data.is_some())
    }

    /// Forces `seq` out at `deadline`, whatever lands in it meanwhile.
    pub fn schedule_eviction(&mut self, seq: u32, deadline: u64) {
        self.slots
            .entry(seq)
            .and_modify(|slot| slot.deadline = deadline)
            .or_insert(Slot { data: None, deadline });
    }

    /// Drops every slot whose deadline has passed. Returns how many held data.
    pub fn sweep(&mut self, now: u64) -> usize {
        let mut expired = 0;
        self.slots.retain(|_, slot| {
            if slot.deadline <= now {
                expired += usize::from(slot.data.is_some());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Segments waiting for their predecessors
    pub fn pending(&self) -> usize {
        self.slots.values().filter(|slot| slot.data.is_some()).count()
    }

    /// All slots, tombstones included
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Turns the segments of the active flow back into an ordered byte stream.
#[derive(Debug)]
pub struct Reassembler {
    next_seq: Option<u32>,
    cache: ExpiringCache,
    buffer: PacketBuffer,
    last_drain_ms: Option<u64>,
    cache_ttl_ms: u64,
    stall_timeout_ms: u64,
    max_frame_len: u32,
}

impl Reassembler {
    pub fn new(config: &MeterConfig) -> Self {
        Self {
            next_seq: None,
            cache: ExpiringCache::default(),
            buffer: PacketBuffer::new(config.max_frame_len),
            last_drain_ms: None,
            cache_ttl_ms: config.cache_ttl_ms,
            stall_timeout_ms: config.stall_timeout_ms,
            max_frame_len: config.max_frame_len,
        }
    }

    pub fn reset(&mut self) {
        self.next_seq = None;
        self.cache.clear();
        self.buffer.clear();
        self.last_drain_ms = None;
    }

    /// True once the stream has drained at least once and then gone quiet
    /// for longer than the stall timeout.
    pub fn is_stalled(&self, now: u64) -> bool {
        self.last_drain_ms
            .is_some_and(|last| now.saturating_sub(last) > self.stall_timeout_ms)
    }

    /// Caches the segment and appends every contiguous segment to the stream.
    /// Returns the number of bytes appended.
    pub fn push(&mut self, seq: u32, payload: &[u8], now: u64) -> usize {
        if payload.is_empty() {
            return 0;
        }

        // 1. A plausible frame length marks a stream start
        if self.next_seq.is_none() && payload.len() >= 4 {
            let length = BigEndian::read_u32(payload);
            if length < self.max_frame_len {
                debug!("[Reassembler] Stream start at seq {}", seq);
                self.next_seq = Some(seq);
            }
        }

        // 2. Cache, last write wins
        self.cache.insert(seq, payload.to_vec(), now + self.cache_ttl_ms);

        // 3. Drain
        let Some(mut next) = self.next_seq else {
            trace!("[Reassembler] No stream start yet, cached seq {}", seq);
            return 0;
        };

        let mut appended = 0;
        while let Some(data) = self.cache.take(next) {
            self.buffer.add(&data);
            self.cache.schedule_eviction(next, now + self.cache_ttl_ms);
            appended += data.len();
            next = next.wrapping_add(data.len() as u32);
            self.last_drain_ms = Some(now);
        }
        self.next_seq = Some(next);

        if appended == 0 {
            trace!(
                "[Reassembler] Out of order seq {} (waiting for {}, {} pending)",
                seq,
                next,
                self.cache.pending()
            );
        }
        appended
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        self.buffer.next()
    }

    pub fn sweep(&mut self, now: u64) -> usize {
        let expired = self.cache.sweep(now);
        if expired > 0 {
            debug!("[Reassembler] Evicted {} stale segments", expired);
        }
        expired
    }

    pub fn next_seq(&self) -> Option<u32> {
        self.next_seq
    }

    pub fn pending(&self) -> usize {
        self.cache.pending()
    }

    pub fn cached_slots(&self) -> usize {
        self.cache.slot_count()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
