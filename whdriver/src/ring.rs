/// Per-channel circular packet store.
///
/// One producer (the interrupt handlers of a single channel) claims, fills
/// and publishes slots; one consumer (the blocking read) copies them out.
/// The counters are atomics and each is written from one side only:
/// `write_index` and `ready_count` by the producer, `read_index` and
/// `fetched_count` by the consumer.
///
/// There is no backpressure. A producer that laps the consumer overwrites
/// unread slots; the capacity is sized so that does not happen at the
/// packet rates the board produces.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::board::transfer::PACKET_SIZE;
use crate::packet::Packet;

pub struct Ring {
    slots: Box<[Mutex<Packet>]>,
    write_index: AtomicUsize,
    read_index: AtomicUsize,
    ready_count: AtomicU32,
    fetched_count: AtomicU32,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| Mutex::new(Packet::sentinel()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring {
            slots,
            write_index: AtomicUsize::new(0),
            read_index: AtomicUsize::new(0),
            ready_count: AtomicU32::new(0),
            fetched_count: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Forget all indices. Slot contents are left as they are.
    pub fn reset(&self) {
        self.write_index.store(0, Ordering::SeqCst);
        self.read_index.store(0, Ordering::SeqCst);
        self.ready_count.store(0, Ordering::SeqCst);
        self.fetched_count.store(0, Ordering::SeqCst);
    }

    /// Producer: take the next slot, fill it with the sentinel pattern and
    /// advance the write index. Returns the claimed slot index.
    pub fn claim(&self) -> usize {
        let index = self.write_index.load(Ordering::SeqCst);
        self.slots[index].lock().clear();
        let next = if index + 1 >= self.capacity() { 0 } else { index + 1 };
        self.write_index.store(next, Ordering::SeqCst);
        index
    }

    /// Producer: copy received bytes into a claimed slot at `offset`.
    pub fn store(&self, slot: usize, offset: usize, data: &[u8]) {
        let end = (offset + data.len()).min(PACKET_SIZE);
        if offset >= end {
            return;
        }
        let mut packet = self.slots[slot].lock();
        packet.bytes[offset..end].copy_from_slice(&data[..end - offset]);
    }

    /// Producer: the claimed slot is complete.
    pub fn publish(&self) {
        self.ready_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Unread slots. Exceeds the capacity once the producer has lapped.
    pub fn available(&self) -> u32 {
        self.ready_count
            .load(Ordering::SeqCst)
            .wrapping_sub(self.fetched_count.load(Ordering::SeqCst))
    }

    pub fn has_unread(&self) -> bool {
        self.available() != 0
    }

    /// Consumer: copy the next unread slot into `buf` and advance.
    /// Returns false when nothing is unread.
    pub fn fetch_into(&self, buf: &mut [u8]) -> bool {
        if !self.has_unread() {
            return false;
        }
        let index = self.read_index.load(Ordering::SeqCst);
        {
            let packet = self.slots[index].lock();
            let len = buf.len().min(PACKET_SIZE);
            buf[..len].copy_from_slice(&packet.bytes[..len]);
        }
        self.fetched_count.fetch_add(1, Ordering::SeqCst);
        let next = if index + 1 >= self.capacity() { 0 } else { index + 1 };
        self.read_index.store(next, Ordering::SeqCst);
        true
    }

    pub fn write_index(&self) -> usize {
        self.write_index.load(Ordering::SeqCst)
    }

    pub fn read_index(&self) -> usize {
        self.read_index.load(Ordering::SeqCst)
    }

    pub fn ready_count(&self) -> u32 {
        self.ready_count.load(Ordering::SeqCst)
    }

    pub fn fetched_count(&self) -> u32 {
        self.fetched_count.load(Ordering::SeqCst)
    }
}
