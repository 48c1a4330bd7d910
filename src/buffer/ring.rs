//! Local video ring buffer
//!
//! A bounded circular queue of [`VideoDesc`] slots between an application
//! producer/consumer and the network side. One slot is always kept in
//! reserve, so at most `capacity - 1` descriptors are queued and
//! `write_index == read_index` always means empty.
//!
//! Two storage modes exist:
//! - pool-backed: payload is written straight into packets acquired from
//!   the attached [`PacketPool`], which then travel with the descriptor
//!   (transmit side, zero copy towards the network)
//! - internal: each slot owns a pre-allocated byte buffer and readers get
//!   a copy (receive side)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::buffer::descriptor::{ReadStatus, VideoDesc, VideoUnit, WriteStatus};
use crate::error::BufferError;
use crate::packet::avtp::{SOURCE_PACKET_SIZE, SPH_SIZE, TSP_SIZE};
use crate::packet::{Packet, PacketPool};

/// Required fill level before and slack after a slot may be appended to
const RECYCLE_MARGIN: usize = 2;

struct Slot {
    desc: VideoDesc,
    storage: Vec<u8>,
}

struct RingState {
    slots: Vec<Slot>,
    read_index: usize,
    write_index: usize,
    pool: Option<PacketPool>,
    last_rtp_sequence: u16,
    optimal_fill_level: usize,
    no_data_pending: bool,
}

impl RingState {
    fn fill_level(&self) -> usize {
        let n = self.slots.len();
        (self.write_index + n - self.read_index) % n
    }

    fn advance_write(&mut self) {
        self.write_index = (self.write_index + 1) % self.slots.len();
    }
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    read: AtomicU64,
    dropped_full: AtomicU64,
    pool_exhausted: AtomicU64,
    underruns: AtomicU64,
    sequence_gaps: AtomicU64,
    no_data_marks: AtomicU64,
}

/// Buffer statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub fill_level: usize,
    pub optimal_fill_level: usize,
    pub written: u64,
    pub read: u64,
    pub dropped_full: u64,
    pub pool_exhausted: u64,
    pub underruns: u64,
    pub sequence_gaps: u64,
    pub no_data_marks: u64,
}

/// Ring buffer of video descriptors
pub struct LocalVideoBuffer {
    state: Mutex<RingState>,
    data_ready: Condvar,
    max_packet_size: usize,
    internal_buffers: bool,
    counters: Counters,
}

impl LocalVideoBuffer {
    /// Create a buffer with `num_packets` slots for payloads of up to `max_packet_size` bytes
    pub fn new(
        num_packets: usize,
        max_packet_size: usize,
        internal_buffers: bool,
    ) -> Result<Self, BufferError> {
        if num_packets < 2 || max_packet_size == 0 {
            return Err(BufferError::InvalidGeometry {
                num_packets,
                max_packet_size,
            });
        }

        let slots = (0..num_packets)
            .map(|_| Slot {
                desc: VideoDesc::default(),
                storage: if internal_buffers {
                    vec![0u8; max_packet_size]
                } else {
                    Vec::new()
                },
            })
            .collect();

        tracing::debug!(num_packets, max_packet_size, internal_buffers, "Creating local video buffer");

        Ok(Self {
            state: Mutex::new(RingState {
                slots,
                read_index: 0,
                write_index: 0,
                pool: None,
                last_rtp_sequence: 0,
                optimal_fill_level: 0,
                no_data_pending: false,
            }),
            data_ready: Condvar::new(),
            max_packet_size,
            internal_buffers,
            counters: Counters::default(),
        })
    }

    /// Number of slots, including the reserve slot
    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn uses_internal_buffers(&self) -> bool {
        self.internal_buffers
    }

    /// Attach or detach the pool used in pool-backed mode
    pub fn set_packet_pool(&self, pool: Option<PacketPool>) {
        self.state.lock().pool = pool;
    }

    pub fn has_packet_pool(&self) -> bool {
        self.state.lock().pool.is_some()
    }

    /// Queued descriptors
    pub fn fill_level(&self) -> usize {
        self.state.lock().fill_level()
    }

    /// Drop every queued descriptor and rewind both indices
    ///
    /// Attached packets go back to their pool.
    pub fn reset(&self, optimal_fill_level: usize) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            slot.desc.clear();
        }
        state.read_index = 0;
        state.write_index = 0;
        state.last_rtp_sequence = 0;
        state.no_data_pending = false;
        state.optimal_fill_level = optimal_fill_level;
        tracing::debug!(optimal_fill_level, "Local video buffer reset");
    }

    /// Queue one unit
    ///
    /// Internal-buffer mode copies the payload into the slot. Pool-backed
    /// mode writes H.264 units into one packet each and packs MPEG-TS
    /// units into shared packets.
    pub fn write(&self, unit: &VideoUnit<'_>) -> Result<WriteStatus, BufferError> {
        let size = unit.data.len();
        if size == 0 || size > self.max_packet_size {
            return Err(BufferError::InvalidPayloadSize {
                size,
                max: self.max_packet_size,
            });
        }

        if self.internal_buffers {
            self.write_internal(unit)
        } else if unit.is_iec61883 {
            self.write_mpeg_ts(unit)
        } else {
            self.write_h264(unit)
        }
    }

    fn write_internal(&self, unit: &VideoUnit<'_>) -> Result<WriteStatus, BufferError> {
        let mut state = self.state.lock();
        if !self.has_room(&state) {
            return Ok(WriteStatus::Full);
        }

        let w = state.write_index;
        let size = unit.data.len();
        let slot = &mut state.slots[w];
        slot.storage[..size].copy_from_slice(unit.data);
        fill_desc(&mut slot.desc, unit, size, None);

        self.publish(&mut state, unit.rtp_sequence);
        Ok(WriteStatus::Written(size))
    }

    fn write_h264(&self, unit: &VideoUnit<'_>) -> Result<WriteStatus, BufferError> {
        let mut state = self.state.lock();
        if !self.has_room(&state) {
            return Ok(WriteStatus::Full);
        }
        let pool = state.pool.clone().ok_or(BufferError::NoPool)?;

        let Some(mut packet) = pool.acquire() else {
            self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            return Ok(WriteStatus::PoolExhausted);
        };

        let size = unit.data.len();
        let offset = packet.payload_offset();
        let headroom = packet.capacity().saturating_sub(offset);
        if size > headroom {
            // packet goes back to the pool on drop
            return Err(BufferError::NoHeadroom {
                needed: size,
                headroom,
            });
        }
        packet.set_len(offset);
        packet.append(unit.data);

        let w = state.write_index;
        fill_desc(&mut state.slots[w].desc, unit, size, Some(packet));

        self.publish(&mut state, unit.rtp_sequence);
        Ok(WriteStatus::Written(size))
    }

    fn write_mpeg_ts(&self, unit: &VideoUnit<'_>) -> Result<WriteStatus, BufferError> {
        let stride = if unit.has_sph { SOURCE_PACKET_SIZE } else { TSP_SIZE };
        let size = unit.data.len();
        if size % stride != 0 {
            return Err(BufferError::PartialTransportPacket { size, unit: stride });
        }
        let max_tsps = self.max_packet_size / SOURCE_PACKET_SIZE;
        if size / stride > max_tsps {
            return Err(BufferError::NoHeadroom {
                needed: (size / stride) * SOURCE_PACKET_SIZE,
                headroom: max_tsps * SOURCE_PACKET_SIZE,
            });
        }

        let mut guard = self.state.lock();
        if !self.has_room(&guard) {
            return Ok(WriteStatus::Full);
        }
        let state = &mut *guard;
        let pool = state.pool.clone().ok_or(BufferError::NoPool)?;

        let n = state.slots.len();
        let w = state.write_index;
        let fill = state.fill_level();
        let recycle = w > 0
            && fill > RECYCLE_MARGIN
            && fill < n - RECYCLE_MARGIN
            && {
                let prev = &state.slots[w - 1].desc;
                prev.is_iec61883 && prev.packet.is_some() && prev.tsps_in_packet < max_tsps
            };

        let mut chunks = unit.data.chunks_exact(stride);
        let mut written = 0;

        if recycle {
            let prev = &mut state.slots[w - 1].desc;
            if let Some(packet) = prev.packet.as_mut() {
                while prev.tsps_in_packet < max_tsps && packet.headroom() >= SOURCE_PACKET_SIZE {
                    let Some(tsp) = chunks.next() else { break };
                    append_source_packet(packet, tsp, unit.has_sph);
                    prev.tsps_in_packet += 1;
                    written += tsp.len();
                }
                prev.size = packet.payload().len();
            }
        }

        if chunks.len() == 0 {
            state.last_rtp_sequence = unit.rtp_sequence;
            self.counters.written.fetch_add(1, Ordering::Relaxed);
            return Ok(WriteStatus::Written(written));
        }

        let Some(mut packet) = pool.acquire() else {
            self.counters.pool_exhausted.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(written, "Packet pool exhausted while packing transport packets");
            return Ok(if written > 0 {
                WriteStatus::Written(written)
            } else {
                WriteStatus::PoolExhausted
            });
        };
        packet.set_len(packet.payload_offset());

        let mut tsps = 0;
        for tsp in chunks {
            if tsps == max_tsps || packet.headroom() < SOURCE_PACKET_SIZE {
                break;
            }
            append_source_packet(&mut packet, tsp, unit.has_sph);
            tsps += 1;
            written += tsp.len();
        }

        let payload_len = packet.payload().len();
        let desc = &mut state.slots[w].desc;
        fill_desc(desc, unit, payload_len, Some(packet));
        desc.tsps_in_packet = tsps;

        self.publish(state, unit.rtp_sequence);
        Ok(WriteStatus::Written(written))
    }

    fn has_room(&self, state: &RingState) -> bool {
        let remaining = state.slots.len() - state.fill_level() - 1;
        if remaining == 0 {
            self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(capacity = state.slots.len(), "NO BUFFERS REMAINING");
            return false;
        }
        true
    }

    fn publish(&self, state: &mut RingState, rtp_sequence: u16) {
        let expected = state.last_rtp_sequence.wrapping_add(1);
        if state.last_rtp_sequence != 0 && rtp_sequence != expected {
            self.counters.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(expected, got = rtp_sequence, "RTP sequence gap on buffer write");
        }
        state.last_rtp_sequence = rtp_sequence;
        state.no_data_pending = false;
        state.advance_write();
        self.counters.written.fetch_add(1, Ordering::Relaxed);
        self.data_ready.notify_one();
    }

    /// Record that the producer side has no data; the next empty read reports it
    pub fn mark_no_data(&self) {
        let mut state = self.state.lock();
        state.no_data_pending = true;
        self.counters.no_data_marks.fetch_add(1, Ordering::Relaxed);
        self.data_ready.notify_one();
    }

    /// Take the oldest descriptor
    ///
    /// An attached packet moves into `desc`. In internal-buffer mode the
    /// payload is copied into `dest`, which must be large enough.
    pub fn read(&self, dest: &mut [u8], desc: &mut VideoDesc) -> Result<ReadStatus, BufferError> {
        let mut state = self.state.lock();
        self.read_locked(&mut state, dest, desc)
    }

    /// Like [`read`](Self::read) but waits up to `timeout` for data first
    pub fn read_timeout(
        &self,
        dest: &mut [u8],
        desc: &mut VideoDesc,
        timeout: Duration,
    ) -> Result<ReadStatus, BufferError> {
        let mut state = self.state.lock();
        if state.fill_level() == 0 && !state.no_data_pending {
            let _ = self.data_ready.wait_for(&mut state, timeout);
        }
        self.read_locked(&mut state, dest, desc)
    }

    fn read_locked(
        &self,
        state: &mut RingState,
        dest: &mut [u8],
        desc: &mut VideoDesc,
    ) -> Result<ReadStatus, BufferError> {
        if state.fill_level() == 0 {
            if state.no_data_pending {
                state.no_data_pending = false;
                return Ok(ReadStatus::NoData);
            }
            self.counters.underruns.fetch_add(1, Ordering::Relaxed);
            return Ok(ReadStatus::Empty);
        }

        let r = state.read_index;
        let slot = &mut state.slots[r];
        let size = slot.desc.size;

        if self.internal_buffers {
            if dest.len() < size {
                return Err(BufferError::DestinationTooSmall {
                    needed: size,
                    have: dest.len(),
                });
            }
            dest[..size].copy_from_slice(&slot.storage[..size]);
        }

        *desc = std::mem::take(&mut slot.desc);
        state.read_index = (r + 1) % state.slots.len();
        self.counters.read.fetch_add(1, Ordering::Relaxed);
        Ok(ReadStatus::Data(size))
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        BufferStats {
            capacity: state.slots.len(),
            fill_level: state.fill_level(),
            optimal_fill_level: state.optimal_fill_level,
            written: self.counters.written.load(Ordering::Relaxed),
            read: self.counters.read.load(Ordering::Relaxed),
            dropped_full: self.counters.dropped_full.load(Ordering::Relaxed),
            pool_exhausted: self.counters.pool_exhausted.load(Ordering::Relaxed),
            underruns: self.counters.underruns.load(Ordering::Relaxed),
            sequence_gaps: self.counters.sequence_gaps.load(Ordering::Relaxed),
            no_data_marks: self.counters.no_data_marks.load(Ordering::Relaxed),
        }
    }
}

fn fill_desc(desc: &mut VideoDesc, unit: &VideoUnit<'_>, size: usize, packet: Option<Packet>) {
    *desc = VideoDesc {
        size,
        tsps_in_packet: 0,
        has_sph: unit.has_sph,
        is_iec61883: unit.is_iec61883,
        pts: unit.pts,
        dts: unit.dts,
        rtp_timestamp: unit.rtp_timestamp,
        rtp_sequence: unit.rtp_sequence,
        mpt_field: unit.mpt_field,
        packet,
    };
}

/// Append one transport packet, leaving a zeroed SPH gap when the source lacks one
fn append_source_packet(packet: &mut Packet, tsp: &[u8], has_sph: bool) {
    if !has_sph {
        packet.append(&[0u8; SPH_SIZE]);
    }
    packet.append(tsp);
}

/// Thread-safe handle to a local video buffer
pub type SharedVideoBuffer = Arc<LocalVideoBuffer>;
