//! SN32F2xx USB register access layer
//!
//! The register block and field definitions follow the `ral-registers`
//! conventions, so the `read_reg!`, `write_reg!` and `modify_reg!` macros
//! work on them. Registers are `VCell`s rather than raw MMIO pointers; that
//! lets the tests back a register block with RAM.
//!
//! It also adds an indexed table for the per-endpoint registers, so that
//! endpoint count is a parameter instead of a `match` arm per endpoint.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;
use core::ptr::NonNull;

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Number of data endpoints (excluding the control endpoint)
pub const DATA_ENDPOINTS: usize = 6;

pub mod usb {
    use super::{VCell, DATA_ENDPOINTS};

    #[repr(C)]
    #[allow(dead_code)] // SGCTL and the PHY registers only hold the layout.
    pub struct RegisterBlock {
        /// Interrupt enable
        pub INTEN: VCell<u32>,
        /// Interrupt status
        pub INSTS: VCell<u32>,
        /// Interrupt status clear (write one to clear)
        pub INSTSC: VCell<u32>,
        /// Device address
        pub ADDR: VCell<u32>,
        /// Configuration
        pub CFG: VCell<u32>,
        /// Bus signal control
        pub SGCTL: VCell<u32>,
        /// EP0CTL through EP6CTL
        pub EPCTL: [VCell<u32>; DATA_ENDPOINTS + 1],
        _reserved0: [u32; 2],
        /// Data toggle reset, one bit per data endpoint
        pub EPTOGGLE: VCell<u32>,
        _reserved1: [u32; 1],
        /// EP1BUFOS through EP6BUFOS
        pub EPBUFOS: [VCell<u32>; DATA_ENDPOINTS],
        /// Frame number
        pub FRMNO: VCell<u32>,
        /// PHY parameters
        pub PHYPRM: VCell<u32>,
        _reserved2: [u32; 1],
        /// PHY parameters 2
        pub PHYPRM2: VCell<u32>,
    }

    #[cfg(test)]
    impl RegisterBlock {
        /// A register block with every register reset to zero
        pub const fn new() -> Self {
            const R: VCell<u32> = VCell::new(0);
            RegisterBlock {
                INTEN: R,
                INSTS: R,
                INSTSC: R,
                ADDR: R,
                CFG: R,
                SGCTL: R,
                EPCTL: [R, R, R, R, R, R, R],
                _reserved0: [0; 2],
                EPTOGGLE: R,
                _reserved1: [0; 1],
                EPBUFOS: [R, R, R, R, R, R],
                FRMNO: R,
                PHYPRM: R,
                _reserved2: [0; 1],
                PHYPRM2: R,
            }
        }
    }

    pub type Instance = &'static RegisterBlock;

    pub mod INTEN {
        pub mod EP_NAK_EN {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3F << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod SOF_IE {
            pub const offset: u32 = 29;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod BUS_IE {
            pub const offset: u32 = 30;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod USB_IE {
            pub const offset: u32 = 31;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod ADDR {
        pub mod UADDR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7F << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod CFG {
        /// One bit per data endpoint. Set for OUT, clear for IN.
        pub mod EP_DIR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3F << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod ESD_EN {
            pub const offset: u32 = 28;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        /// D+ pull-up
        pub mod DPPU_EN {
            pub const offset: u32 = 29;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod PHY_EN {
            pub const offset: u32 = 30;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod VREG33_EN {
            pub const offset: u32 = 31;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod EPTOGGLE {
        pub mod CLEAR {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3F << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    pub mod FRMNO {
        pub mod FRMNO {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x7FF << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }
}

/// The RAL macros need a named field for every register they touch. This
/// module gives each endpoint's control register the same name, so that
/// one set of field definitions covers EP0CTL through EP6CTL.
pub mod endpoint_control {
    use super::{usb, VCell};

    #[allow(non_snake_case)]
    pub struct EpCtl<'a> {
        pub EPCTL: &'a VCell<u32>,
    }

    #[allow(non_snake_case)]
    pub mod EPCTL {
        /// Byte count. Written by software for IN, by hardware for OUT.
        pub mod CNT {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x1FF << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        /// EP0 only
        pub mod OUT_STALL_EN {
            pub const offset: u32 = 27;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        /// EP0 only
        pub mod IN_STALL_EN {
            pub const offset: u32 = 28;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
        pub mod STATE {
            pub const offset: u32 = 29;
            pub const mask: u32 = 0b11 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {
                pub const NAK: u32 = 0b00;
                pub const ACK: u32 = 0b01;
                pub const STALL: u32 = 0b11;
            }
        }
        pub mod ENDP_EN {
            pub const offset: u32 = 31;
            pub const mask: u32 = 1 << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    }

    /// Returns the control register for `endpoint`
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` is out of range.
    pub fn register(usb: &usb::RegisterBlock, endpoint: usize) -> EpCtl<'_> {
        EpCtl {
            EPCTL: &usb.EPCTL[endpoint],
        }
    }
}

/// Per-endpoint register layout
///
/// Data endpoint `n` (1..=6) owns bit `n - 1` of `CFG.EP_DIR`, `EPTOGGLE`
/// and `INTEN.EP_NAK_EN`, plus the `EPBUFOS[n - 1]` buffer offset register.
#[derive(Clone, Copy)]
pub struct EndpointRegisters {
    index: usize,
}

impl EndpointRegisters {
    pub const fn new(index: usize) -> Self {
        Self { index }
    }
    /// Bit mask shared by CFG.EP_DIR, EPTOGGLE.CLEAR and INTEN.EP_NAK_EN
    ///
    /// Zero for the control endpoint, which has none of these bits.
    pub const fn mask(&self) -> u32 {
        if self.index == 0 {
            0
        } else {
            (1 << (usb::CFG::EP_DIR::offset + self.index as u32 - 1)) & usb::CFG::EP_DIR::mask
        }
    }
    /// The buffer offset register, if this endpoint has one
    pub fn buffer_offset<'a>(&self, usb: &'a usb::RegisterBlock) -> Option<&'a VCell<u32>> {
        self.index.checked_sub(1).and_then(|n| usb.EPBUFOS.get(n))
    }
    pub fn control<'a>(&self, usb: &'a usb::RegisterBlock) -> endpoint_control::EpCtl<'a> {
        endpoint_control::register(usb, self.index)
    }
}

/// Register and memory instances resolved from a [`Peripherals`](crate::Peripherals)
pub struct Instances {
    pub usb: usb::Instance,
    pub packet_memory: NonNull<u8>,
}

/// Converts the user's peripherals into register instances
///
/// # Panics
///
/// Panics if the packet memory pointer is null.
pub fn instances<P: crate::Peripherals>(peripherals: P) -> Instances {
    // Safety: Peripherals implementation guarantees that the pointers are
    // valid and that the blocks are owned by this driver.
    let usb = unsafe { &*peripherals.usb().cast::<usb::RegisterBlock>() };
    let packet_memory =
        NonNull::new(peripherals.packet_memory().cast_mut().cast::<u8>()).expect("Null packet memory");
    Instances { usb, packet_memory }
}

const _: () = assert!(core::mem::size_of::<usb::RegisterBlock>() == 0x6C);
// One mask covers all three per-endpoint bit fields.
const _: () = assert!(
    usb::CFG::EP_DIR::mask == usb::EPTOGGLE::CLEAR::mask
        && usb::CFG::EP_DIR::mask == usb::INTEN::EP_NAK_EN::mask
);
