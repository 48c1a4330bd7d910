//! Fixed pool of pre-allocated transmit packets
//!
//! Every packet is allocated once when the pool is created. A [`Packet`]
//! is an owned handle to one arena slot; handing it to another stage
//! moves it, so two stages can never mutate the same packet. Releasing
//! a packet (explicitly or by dropping the handle) puts its slot back on
//! the free stack without freeing memory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::PoolError;

/// Largest packet the pool accepts: a VLAN-tagged Ethernet frame
pub const MAX_PACKET_SIZE: usize = 1514 + 4;

/// Largest number of packets in one pool
pub const MAX_POOL_SIZE: usize = 2048;

/// How long [`PacketPool::cleanup`] waits for outstanding packets
pub const CLEANUP_TIMEOUT: Duration = Duration::from_millis(50);

/// Arena slot storage
#[derive(Default)]
struct Slot {
    index: u16,
    data: Box<[u8]>,
    len: usize,
    payload_offset: usize,
    attime: u64,
    dmatime: u64,
    dummy: bool,
}

struct PoolShared {
    packet_size: usize,
    pool_size: usize,
    free: Mutex<Vec<Slot>>,
    acquired: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolShared {
    fn put_back(&self, mut slot: Slot) {
        slot.dummy = false;
        self.free.lock().push(slot);
    }
}

/// Owned handle to one pool packet
pub struct Packet {
    slot: Slot,
    home: Arc<PoolShared>,
}

impl Packet {
    /// Arena index of this packet within its home pool
    pub fn index(&self) -> u16 {
        self.slot.index
    }

    /// Full buffer capacity
    pub fn capacity(&self) -> usize {
        self.slot.data.len()
    }

    pub fn len(&self) -> usize {
        self.slot.len
    }

    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// Set the valid frame length, clamped to capacity
    pub fn set_len(&mut self, len: usize) {
        self.slot.len = len.min(self.slot.data.len());
    }

    pub fn payload_offset(&self) -> usize {
        self.slot.payload_offset
    }

    pub fn set_payload_offset(&mut self, offset: usize) {
        self.slot.payload_offset = offset.min(self.slot.data.len());
    }

    /// Scheduled transmit (launch) time
    pub fn attime(&self) -> u64 {
        self.slot.attime
    }

    pub fn set_attime(&mut self, attime: u64) {
        self.slot.attime = attime;
    }

    pub fn dmatime(&self) -> u64 {
        self.slot.dmatime
    }

    pub fn set_dmatime(&mut self, dmatime: u64) {
        self.slot.dmatime = dmatime;
    }

    pub fn is_dummy(&self) -> bool {
        self.slot.dummy
    }

    pub fn set_dummy(&mut self, dummy: bool) {
        self.slot.dummy = dummy;
    }

    /// The valid part of the frame
    pub fn frame(&self) -> &[u8] {
        &self.slot.data[..self.slot.len]
    }

    /// The whole buffer regardless of the current length
    pub fn buffer(&self) -> &[u8] {
        &self.slot.data
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.slot.data
    }

    /// Media payload: from the payload offset to the frame length
    pub fn payload(&self) -> &[u8] {
        let start = self.slot.payload_offset.min(self.slot.len);
        &self.slot.data[start..self.slot.len]
    }

    /// Room left behind the current frame end
    pub fn headroom(&self) -> usize {
        self.slot.data.len() - self.slot.len
    }

    /// Append bytes at the frame end; returns false if they do not fit
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let start = self.slot.len;
        let end = start + bytes.len();
        if end > self.slot.data.len() {
            return false;
        }
        self.slot.data[start..end].copy_from_slice(bytes);
        self.slot.len = end;
        true
    }

    /// Whether this packet belongs to `pool`
    pub fn is_home(&self, pool: &PacketPool) -> bool {
        Arc::ptr_eq(&self.home, &pool.shared)
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let slot = std::mem::take(&mut self.slot);
        self.home.put_back(slot);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("index", &self.slot.index)
            .field("len", &self.slot.len)
            .field("payload_offset", &self.slot.payload_offset)
            .field("attime", &self.slot.attime)
            .field("dummy", &self.slot.dummy)
            .finish_non_exhaustive()
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub free: usize,
    pub acquired: u64,
    pub exhausted: u64,
}

/// Fixed-size pool of packets
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    /// Allocate `pool_size` packets of `packet_size` bytes each
    pub fn new(packet_size: usize, pool_size: usize) -> Result<Self, PoolError> {
        if packet_size == 0 || packet_size > MAX_PACKET_SIZE {
            return Err(PoolError::InvalidPacketSize(packet_size));
        }
        if pool_size == 0 || pool_size > MAX_POOL_SIZE {
            return Err(PoolError::InvalidPoolSize(pool_size));
        }

        tracing::info!(packet_size, pool_size, "Creating packet pool");

        // Reverse order so the first acquire hands out index 0
        let free = (0..pool_size)
            .rev()
            .map(|index| Slot {
                index: index as u16,
                data: vec![0u8; packet_size].into_boxed_slice(),
                ..Slot::default()
            })
            .collect();

        Ok(Self {
            shared: Arc::new(PoolShared {
                packet_size,
                pool_size,
                free: Mutex::new(free),
                acquired: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        })
    }

    pub fn packet_size(&self) -> usize {
        self.shared.packet_size
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    pub fn free_count(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Packets currently held outside the pool
    pub fn outstanding(&self) -> usize {
        self.shared.pool_size - self.free_count()
    }

    /// Take a packet from the free stack; `None` means the pool is exhausted
    pub fn acquire(&self) -> Option<Packet> {
        let slot = self.shared.free.lock().pop();
        match slot {
            Some(mut slot) => {
                slot.dmatime = 0;
                slot.dummy = false;
                self.shared.acquired.fetch_add(1, Ordering::Relaxed);
                Some(Packet {
                    slot,
                    home: Arc::clone(&self.shared),
                })
            }
            None => {
                self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(pool_size = self.shared.pool_size, "Packet pool exhausted");
                None
            }
        }
    }

    /// Return a packet to this pool
    ///
    /// A packet from a different pool is still sent home, but the call
    /// reports [`PoolError::ForeignPacket`].
    pub fn release(&self, packet: Packet) -> Result<(), PoolError> {
        let home = packet.is_home(self);
        drop(packet);
        if home {
            Ok(())
        } else {
            tracing::error!("Packet released to a foreign pool");
            Err(PoolError::ForeignPacket)
        }
    }

    /// Acquire a packet flagged as a dummy (heartbeat) packet
    pub fn dummy_packet(&self) -> Option<Packet> {
        let mut packet = self.acquire()?;
        packet.set_dummy(true);
        Some(packet)
    }

    /// Copy the reference packet's frame and metadata into every free packet
    pub fn init_all_from_template(&self, template: &Packet) -> Result<(), PoolError> {
        let len = template.len();
        if len == 0 {
            return Err(PoolError::EmptyTemplate);
        }
        if len > self.shared.packet_size {
            return Err(PoolError::TemplateTooLarge {
                len,
                packet_size: self.shared.packet_size,
            });
        }

        let mut free = self.shared.free.lock();
        for slot in free.iter_mut() {
            slot.data[..len].copy_from_slice(template.frame());
            slot.len = len;
            slot.payload_offset = template.payload_offset();
            slot.attime = template.attime();
            slot.dmatime = template.dmatime();
            slot.dummy = template.is_dummy();
        }

        tracing::debug!(len, initialized = free.len(), "Initialized packets from template");
        Ok(())
    }

    /// Clear the metadata of every free packet
    pub fn reset(&self) {
        let mut free = self.shared.free.lock();
        for slot in free.iter_mut() {
            slot.len = 0;
            slot.payload_offset = 0;
            slot.attime = 0;
            slot.dmatime = 0;
            slot.dummy = false;
        }
        let outstanding = self.shared.pool_size - free.len();
        if outstanding > 0 {
            tracing::warn!(outstanding, "Pool reset with packets still in use");
        }
    }

    /// Wait up to [`CLEANUP_TIMEOUT`] for all packets to come home
    pub fn cleanup(&self) -> Result<(), PoolError> {
        let deadline = Instant::now() + CLEANUP_TIMEOUT;
        loop {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!(outstanding, "Packets not returned before pool cleanup");
                return Err(PoolError::Outstanding(outstanding));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.shared.pool_size,
            free: self.free_count(),
            acquired: self.shared.acquired.load(Ordering::Relaxed),
            exhausted: self.shared.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("packet_size", &self.shared.packet_size)
            .field("pool_size", &self.shared.pool_size)
            .field("free", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_and_reuse() {
        let pool = PacketPool::new(256, 4).unwrap();

        let mut held: Vec<Packet> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.stats().exhausted, 1);

        let released = held.pop().unwrap();
        let index = released.index();
        pool.release(released).unwrap();

        let again = pool.acquire().unwrap();
        assert_eq!(again.index(), index);
    }

    #[test]
    fn test_drop_returns_packet() {
        let pool = PacketPool::new(64, 2).unwrap();
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.outstanding(), 2);
        }
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.cleanup().is_ok());
    }

    #[test]
    fn test_invalid_geometry() {
        assert_eq!(
            PacketPool::new(0, 4).unwrap_err(),
            PoolError::InvalidPacketSize(0)
        );
        assert_eq!(
            PacketPool::new(MAX_PACKET_SIZE + 1, 4).unwrap_err(),
            PoolError::InvalidPacketSize(MAX_PACKET_SIZE + 1)
        );
        assert_eq!(PacketPool::new(64, 0).unwrap_err(), PoolError::InvalidPoolSize(0));
        assert_eq!(
            PacketPool::new(64, MAX_POOL_SIZE + 1).unwrap_err(),
            PoolError::InvalidPoolSize(MAX_POOL_SIZE + 1)
        );
    }

    #[test]
    fn test_foreign_release() {
        let a = PacketPool::new(64, 1).unwrap();
        let b = PacketPool::new(64, 1).unwrap();

        let packet = a.acquire().unwrap();
        assert_eq!(b.release(packet), Err(PoolError::ForeignPacket));
        // Still went back to its own pool
        assert_eq!(a.free_count(), 1);
        assert_eq!(b.free_count(), 1);
    }

    #[test]
    fn test_template_initializes_free_packets() {
        let pool = PacketPool::new(128, 3).unwrap();
        let mut template = pool.acquire().unwrap();
        assert!(template.append(&[0xAA; 42]));
        template.set_payload_offset(42);
        template.set_attime(99);

        pool.init_all_from_template(&template).unwrap();
        drop(template);

        let packets: Vec<Packet> = (0..2).map(|_| pool.acquire().unwrap()).collect();
        for packet in &packets {
            assert_eq!(packet.len(), 42);
            assert_eq!(packet.payload_offset(), 42);
            assert_eq!(packet.attime(), 99);
            assert!(packet.frame().iter().all(|&b| b == 0xAA));
            assert!(packet.payload().is_empty());
        }
    }

    #[test]
    fn test_empty_template_rejected() {
        let pool = PacketPool::new(128, 2).unwrap();
        let template = pool.acquire().unwrap();
        assert_eq!(
            pool.init_all_from_template(&template),
            Err(PoolError::EmptyTemplate)
        );
    }

    #[test]
    fn test_dummy_flag_cleared_on_return() {
        let pool = PacketPool::new(64, 1).unwrap();
        let dummy = pool.dummy_packet().unwrap();
        assert!(dummy.is_dummy());
        drop(dummy);
        assert!(!pool.acquire().unwrap().is_dummy());
    }

    #[test]
    fn test_append_respects_capacity() {
        let pool = PacketPool::new(8, 1).unwrap();
        let mut packet = pool.acquire().unwrap();
        assert!(packet.append(&[1, 2, 3, 4, 5]));
        assert!(!packet.append(&[6, 7, 8, 9]));
        assert_eq!(packet.len(), 5);
        assert_eq!(packet.headroom(), 3);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = PacketPool::new(64, 8).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(packet) = pool.acquire() {
                            pool.release(packet).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_count(), 8);
    }
}
