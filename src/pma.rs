//! Packet memory: the USB SRAM shared between software and the USB engine
//!
//! Endpoint 0 always owns the first [`EP0_MAX_PACKET_SIZE`] bytes. Data
//! endpoints receive their regions from a simple allocator that hands out
//! memory from the top of the SRAM, down towards the endpoint 0 region.
//!
//! Copies are plain volatile byte copies. They don't chunk or flow-control;
//! the caller decides how many bytes make up a packet.

use core::ptr::NonNull;

/// Size of the USB packet SRAM, in bytes
pub const PACKET_MEMORY_SIZE: usize = 256;

/// Maximum packet size, and packet memory, for endpoint 0
pub const EP0_MAX_PACKET_SIZE: usize = 64;

/// A region of packet memory, owned by one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketBuffer {
    offset: usize,
    len: usize,
}

impl PacketBuffer {
    /// The fixed region for endpoint 0
    pub const EP0: PacketBuffer = PacketBuffer {
        offset: 0,
        len: EP0_MAX_PACKET_SIZE,
    };

    /// Byte offset from the start of packet memory
    ///
    /// This is the value programmed into the endpoint's buffer offset register.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// The packet memory and its allocator
pub struct PacketMemory {
    base: NonNull<u8>,
    /// Everything at or above `top` has been handed out.
    top: usize,
}

// Safety: the packet memory is exclusively owned by this object, so it's
// OK to move across execution contexts.
unsafe impl Send for PacketMemory {}

impl PacketMemory {
    /// # Safety
    ///
    /// `base` must point to [`PACKET_MEMORY_SIZE`] bytes that are only used
    /// by the USB engine and by this object.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        PacketMemory {
            base,
            top: PACKET_MEMORY_SIZE,
        }
    }

    /// Allocates a buffer of `size` bytes for a data endpoint
    ///
    /// Returns `None` if there isn't enough memory left.
    pub fn allocate(&mut self, size: usize) -> Option<PacketBuffer> {
        let offset = self.top.checked_sub(size)?;
        if offset < EP0_MAX_PACKET_SIZE {
            None
        } else {
            self.top = offset;
            Some(PacketBuffer { offset, len: size })
        }
    }

    /// Release every data endpoint buffer
    pub fn release_all(&mut self) {
        self.top = PACKET_MEMORY_SIZE;
    }

    /// Copy `buffer.len()` bytes out of the packet region `src`
    ///
    /// Returns the number of bytes copied, which is bounded by the size of `src`.
    pub fn read(&self, src: PacketBuffer, buffer: &mut [u8]) -> usize {
        debug_assert!(buffer.len() <= src.len);
        let size = buffer.len().min(src.len);
        // Safety: src was handed out by this allocator (or is EP0's region),
        // so the range is within the packet memory.
        let mut ptr = unsafe { self.base.as_ptr().add(src.offset) };
        for dst in &mut buffer[..size] {
            unsafe {
                *dst = ptr.read_volatile();
                ptr = ptr.add(1);
            }
        }
        size
    }

    /// Copy `buffer` into the packet region `dst`
    ///
    /// Returns the number of bytes copied, which is bounded by the size of `dst`.
    pub fn write(&mut self, dst: PacketBuffer, buffer: &[u8]) -> usize {
        debug_assert!(buffer.len() <= dst.len);
        let size = buffer.len().min(dst.len);
        // Safety: see read().
        let mut ptr = unsafe { self.base.as_ptr().add(dst.offset) };
        for src in &buffer[..size] {
            unsafe {
                ptr.write_volatile(*src);
                ptr = ptr.add(1);
            }
        }
        size
    }
}
