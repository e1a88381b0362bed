//! Packet memory buffers
//!
//! Packet memory is the arena shared by the CPU and the USB peripheral.
//! It's laid out as
//!
//! | Offset                    | Contents                        |
//! |---------------------------|---------------------------------|
//! | 0                         | buffer descriptor table         |
//! | `BTABLE_SIZE`             | endpoint zero TX buffer         |
//! | `BTABLE_SIZE + ep0`       | endpoint zero RX buffer         |
//! | `BTABLE_SIZE + 2 * ep0`   | dynamic area, up to `PMA_SIZE`  |
//!
//! Endpoint buffers in the dynamic area all share one lifetime, so the
//! allocator never frees single buffers. It's rewound as a whole when the
//! endpoints are deconfigured.

use crate::Peripheral;

/// Packet memory size, in bytes
pub const PMA_SIZE: u16 = 512;

/// Offset of the buffer descriptor table
pub const BTABLE: u16 = 0;

/// Size of the buffer descriptor table
pub const BTABLE_SIZE: u16 = 8 * crate::NUM_ENDPOINTS as u16;

/// Endpoint buffer allocator
///
/// A bump allocator over the dynamic area.
pub struct Allocator {
    ep0_size: u16,
    next: u16,
}

impl Allocator {
    /// Create an allocator for an endpoint zero max packet size of `ep0_size`
    pub const fn new(ep0_size: u16) -> Self {
        let mut alloc = Allocator { ep0_size, next: 0 };
        alloc.next = alloc.dynamic_area();
        alloc
    }

    /// Endpoint zero max packet size
    pub const fn ep0_size(&self) -> u16 {
        self.ep0_size
    }

    /// Endpoint zero TX buffer
    pub const fn ep0_tx(&self) -> u16 {
        BTABLE + BTABLE_SIZE
    }

    /// Endpoint zero RX buffer
    pub const fn ep0_rx(&self) -> u16 {
        self.ep0_tx() + self.ep0_size
    }

    const fn dynamic_area(&self) -> u16 {
        self.ep0_rx() + self.ep0_size
    }

    /// Allocates a buffer of `size`, rounded up to an even size
    ///
    /// Returns the packet memory offset of the buffer, or `None` if
    /// there isn't enough space left.
    pub fn allocate(&mut self, size: u16) -> Option<u16> {
        let size = size.checked_add(size & 1)?;
        let end = self.next.checked_add(size)?;
        if end > PMA_SIZE {
            warn!("Out of packet memory. Requested {=u16}, available {=u16}", size, PMA_SIZE - self.next);
            None
        } else {
            let ptr = self.next;
            self.next = end;
            Some(ptr)
        }
    }

    /// Release every buffer in the dynamic area
    pub fn reset(&mut self) {
        self.next = self.dynamic_area();
    }

    /// Bytes left in the dynamic area
    pub fn available(&self) -> u16 {
        PMA_SIZE - self.next
    }
}

/// Copy `data` into packet memory at `offset`
///
/// # Panics
///
/// Panics if the write would run past the end of packet memory.
pub fn copy_to<P: Peripheral>(hw: &P, offset: u16, data: &[u8]) {
    assert!(usize::from(offset) + data.len() <= usize::from(PMA_SIZE));
    let mut addr = offset;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        hw.write_packet_memory(addr, u16::from_le_bytes([word[0], word[1]]));
        addr += 2;
    }
    if let [last] = words.remainder() {
        hw.write_packet_memory(addr, u16::from(*last));
    }
}

/// Copy `data.len()` bytes out of packet memory, starting at `offset`
///
/// # Panics
///
/// Panics if the read would run past the end of packet memory.
pub fn copy_from<P: Peripheral>(hw: &P, offset: u16, data: &mut [u8]) {
    assert!(usize::from(offset) + data.len() <= usize::from(PMA_SIZE));
    let mut addr = offset;
    let mut words = data.chunks_exact_mut(2);
    for word in &mut words {
        word.copy_from_slice(&hw.read_packet_memory(addr).to_le_bytes());
        addr += 2;
    }
    if let [last] = words.into_remainder() {
        *last = hw.read_packet_memory(addr).to_le_bytes()[0];
    }
}
