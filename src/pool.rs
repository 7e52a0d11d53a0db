//! Process-wide free list of packet buffers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on the free-list pool pattern used for byte-buffer chunks
//! elsewhere in the corpus (a `Vec` of spare buffers, `pop`/`push` to
//! recycle): allocation and release are O(1) amortized, and the hot paths
//! (master resend, slave delivery) never touch the general allocator once
//! the pool has warmed up.

use crate::packet::Packet;
use parking_lot::Mutex;

/// Maximum payload a single packet can carry. Sized like a conservative
/// Ethernet-MTU UDP payload, leaving room for the two leading header words.
pub const POOLED_PACKET_SIZE: usize = 1400;

/// A mutex-protected free list of [`Packet`] buffers.
///
/// Packets are recycled, never freed, on the hot path: [`PacketPool::release`]
/// pushes the buffer back instead of dropping it, and [`PacketPool::acquire`]
/// only reaches for a fresh heap allocation when the free list is empty.
pub struct PacketPool {
    free: Mutex<Vec<Box<[u8; POOLED_PACKET_SIZE]>>>,
}

impl PacketPool {
    /// Create an empty pool; buffers are allocated lazily on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a packet from the free list, or allocate a new one if empty.
    /// The returned packet has `len() == 0`; callers must [`Packet::fill`]
    /// it before use.
    #[must_use]
    pub fn acquire(&self) -> Packet {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new([0; POOLED_PACKET_SIZE]));
        Packet::with_buffer(buf)
    }

    /// Return a single packet's buffer to the free list.
    pub fn release(&self, packet: Packet) {
        self.free.lock().push(packet.into_buffer());
    }

    /// Return a whole batch of packets in one locked section, amortizing
    /// the lock acquisition the way a bulk discard of a retransmission
    /// window does (see `PipeState::apply_ack` in [`crate::pipe`]).
    pub fn release_all(&self, packets: impl IntoIterator<Item = Packet>) {
        let mut free = self.free.lock();
        free.extend(packets.into_iter().map(Packet::into_buffer));
    }

    /// Number of spare buffers currently sitting in the free list. Exposed
    /// for pool-conservation tests; not part of the steady-state API.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
