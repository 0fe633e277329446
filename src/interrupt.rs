//! Interrupt status decoding
//!
//! The ISR reads `INSTS` once, then hands the snapshot to [`classify`].
//! Event classes are serviced one group per interrupt, in the order of
//! [`PRIORITY`]. Any flags left set keep the interrupt line asserted, so the
//! hardware re-enters the handler for the remaining classes.

use bitflags::bitflags;

bitflags! {
    /// A snapshot of the USB interrupt status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt : u32 {
        const EP1_NAK = 1 << 0;
        const EP2_NAK = 1 << 1;
        const EP3_NAK = 1 << 2;
        const EP4_NAK = 1 << 3;
        const EP5_NAK = 1 << 4;
        const EP6_NAK = 1 << 5;
        const EP1_ACK = 1 << 8;
        const EP2_ACK = 1 << 9;
        const EP3_ACK = 1 << 10;
        const EP4_ACK = 1 << 11;
        const EP5_ACK = 1 << 12;
        const EP6_ACK = 1 << 13;
        const ERR_TIMEOUT = 1 << 17;
        /// Latched SETUP error. Never cleared by the driver.
        const ERR_SETUP = 1 << 18;
        const EP0_OUT_STALL = 1 << 19;
        const EP0_IN_STALL = 1 << 20;
        const EP0_OUT = 1 << 21;
        const EP0_IN = 1 << 22;
        const EP0_SETUP = 1 << 23;
        /// Raw "setup pending" indicator. It gates whether the hardware can
        /// latch the next SETUP, so the driver never clears it.
        const EP0_PRESETUP = 1 << 24;
        const SOF = 1 << 25;
        const BUS_WAKEUP = 1 << 28;
        const BUS_RESUME = 1 << 29;
        const BUS_SUSPEND = 1 << 30;
        const BUS_RESET = 1 << 31;
    }
}

impl Interrupt {
    /// Every data endpoint ACK flag
    pub const EP_ACK: Self = Self::from_bits_retain(0x3F << 8);
    /// Every data endpoint NAK flag
    pub const EP_NAK: Self = Self::from_bits_retain(0x3F);
    /// Bus lifecycle flags, excluding wakeup
    pub const BUS: Self = Self::BUS_RESET
        .union(Self::BUS_SUSPEND)
        .union(Self::BUS_RESUME);
    /// Both control endpoint stall flags. They're reported, and cleared, as a pair.
    pub const EP0_STALL: Self = Self::EP0_IN_STALL.union(Self::EP0_OUT_STALL);
    /// Control endpoint events
    pub const CONTROL: Self = Self::EP0_SETUP
        .union(Self::EP0_IN)
        .union(Self::EP0_OUT)
        .union(Self::EP0_STALL);
    /// Flags that software must never acknowledge
    pub const STICKY: Self = Self::EP0_PRESETUP.union(Self::ERR_SETUP);
    /// Flags the driver acknowledges without servicing
    pub const IGNORED: Self = Self::ERR_TIMEOUT;

    /// ACK flag for data endpoint `ep` (1..=6)
    pub const fn ack(ep: usize) -> Self {
        Self::from_bits_retain(1 << (8 + ep - 1))
    }

    /// NAK flag for data endpoint `ep` (1..=6)
    pub const fn nak(ep: usize) -> Self {
        Self::from_bits_retain(1 << (ep - 1))
    }

    /// Bits to write to the clear register to acknowledge `self`
    ///
    /// Sticky flags are always masked out.
    pub const fn clear_mask(self) -> u32 {
        self.difference(Self::STICKY).bits()
    }
}

/// A group of events that's serviced by a single handler pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EventClass {
    /// Remote wakeup signaling
    Wakeup,
    /// Bus reset, suspend or resume
    Bus,
    /// Control endpoint SETUP, IN, OUT or stall
    Control,
    /// Data endpoint transaction completed
    EndpointAck,
    /// Data endpoint NAKed a host transaction
    EndpointNak,
}

/// Dispatch order, highest priority first
///
/// Structural bus events come before any endpoint processing, since a reset
/// invalidates all in-flight transfer state.
pub const PRIORITY: [(Interrupt, EventClass); 5] = [
    (Interrupt::BUS_WAKEUP, EventClass::Wakeup),
    (Interrupt::BUS, EventClass::Bus),
    (Interrupt::CONTROL, EventClass::Control),
    (Interrupt::EP_ACK, EventClass::EndpointAck),
    (Interrupt::EP_NAK, EventClass::EndpointNak),
];

/// Selects the single event class to service for this status snapshot
///
/// Start-of-frame is not part of the priority list; it's serviced alongside
/// whatever class is chosen here.
pub fn classify(status: Interrupt) -> Option<EventClass> {
    PRIORITY
        .iter()
        .find(|(mask, _)| status.intersects(*mask))
        .map(|&(_, class)| class)
}

/// Data endpoints with a pending flag in `group`, lowest endpoint first
pub fn endpoints(status: Interrupt, group: fn(usize) -> Interrupt) -> impl Iterator<Item = usize> {
    (1..=crate::ral::DATA_ENDPOINTS).filter(move |&ep| status.contains(group(ep)))
}
