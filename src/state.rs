//! Transfer state for in-progress endpoint transfers
//!
//! Transfers own the caller's buffer until they complete, at which point
//! the driver hands the buffer back through the [`Handler`](crate::Handler).
//! A bus reset drops every transfer, along with its buffer.

/// An IN (device to host) transfer
#[derive(Debug)]
pub struct InTransfer {
    data: &'static [u8],
    /// Bytes that the host has acknowledged
    sent: usize,
    /// Size of the packet that's currently in flight
    last: usize,
}

impl InTransfer {
    pub fn new(data: &'static [u8]) -> Self {
        InTransfer {
            data,
            sent: 0,
            last: 0,
        }
    }

    /// Returns the first packet, and marks it as in flight
    pub fn first_packet(&mut self, max_packet_len: usize) -> &'static [u8] {
        self.sent = 0;
        self.next_packet(max_packet_len)
    }

    /// Account for the packet that the host just acknowledged
    ///
    /// Returns the number of bytes still to send.
    pub fn acknowledge(&mut self) -> usize {
        self.sent += self.last;
        self.remaining()
    }

    /// Returns the next packet, and marks it as in flight
    ///
    /// The packet is empty once all data is sent.
    pub fn next_packet(&mut self, max_packet_len: usize) -> &'static [u8] {
        let data: &'static [u8] = self.data;
        let size = self.remaining().min(max_packet_len);
        self.last = size;
        &data[self.sent..self.sent + size]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.sent
    }

    pub fn bytes_transferred(&self) -> usize {
        self.sent
    }

    /// Size of the packet in flight
    pub fn last_packet_len(&self) -> usize {
        self.last
    }

    pub fn into_data(self) -> &'static [u8] {
        self.data
    }
}

/// An OUT (host to device) transfer
#[derive(Debug)]
pub struct OutTransfer {
    buffer: &'static mut [u8],
    received: usize,
    packets_remaining: usize,
}

/// Outcome of an OUT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutProgress {
    /// More packets are expected
    Pending,
    /// The transfer is done
    Complete,
}

impl OutTransfer {
    /// Expect `buffer.len()` bytes, in packets of `max_packet_len`
    ///
    /// A zero-length transfer still expects one (zero-length) packet.
    pub fn new(buffer: &'static mut [u8], max_packet_len: usize) -> Self {
        let packets_remaining = if buffer.is_empty() {
            1
        } else {
            buffer.len().div_ceil(max_packet_len)
        };
        OutTransfer {
            buffer,
            received: 0,
            packets_remaining,
        }
    }

    /// The part of the buffer that hasn't been written yet
    ///
    /// Bounded by `max_packet_len`, so this is where the next packet lands.
    pub fn window(&mut self, max_packet_len: usize) -> &mut [u8] {
        let end = self.buffer.len().min(self.received + max_packet_len);
        &mut self.buffer[self.received..end]
    }

    /// Account for a packet of `packet_len` bytes, of which `copied`
    /// landed in the buffer
    pub fn commit(&mut self, packet_len: usize, copied: usize, max_packet_len: usize) -> OutProgress {
        self.received += copied;
        self.packets_remaining = self.packets_remaining.saturating_sub(1);
        if packet_len < max_packet_len || self.packets_remaining == 0 {
            OutProgress::Complete
        } else {
            OutProgress::Pending
        }
    }

    pub fn bytes_transferred(&self) -> usize {
        self.received
    }

    pub fn packets_remaining(&self) -> usize {
        self.packets_remaining
    }

    /// Release the buffer, along with the number of bytes received
    pub fn into_parts(self) -> (&'static mut [u8], usize) {
        (self.buffer, self.received)
    }
}

/// Control endpoint transfer state
///
/// Control transfers are half-duplex per stage, so there's at most one
/// transfer in progress.
#[derive(Debug, Default)]
pub enum ControlState {
    #[default]
    Idle,
    In(InTransfer),
    Out(OutTransfer),
}

impl ControlState {
    /// Take the state, leaving `Idle` behind
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ControlState::Idle)
    }
}

/// Data endpoint transfer state
///
/// Each direction is tracked independently.
#[derive(Debug, Default)]
pub struct DataState {
    pub tx: Option<InTransfer>,
    pub rx: Option<OutTransfer>,
}

impl DataState {
    pub const fn new() -> Self {
        DataState { tx: None, rx: None }
    }
}
