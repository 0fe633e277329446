//! RAM-backed USB peripheral for host tests
//!
//! The register block and packet memory are leaked, so a `Fake` is `Copy`
//! and can be handed to the driver as its `Peripherals`. Tests play the
//! part of the hardware: they write status and byte counts, then call into
//! the dispatcher.

extern crate std;

use crate::{
    interrupt::Interrupt,
    pma::PACKET_MEMORY_SIZE,
    ral::{self, endpoint_control::EPCTL::STATE::RW::ACK},
    Driver, Handler, Peripherals,
};
use core::ptr::NonNull;
use std::{boxed::Box, vec, vec::Vec};

/// Leak a zeroed buffer, for use as a transfer buffer
pub fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

#[derive(Clone, Copy)]
pub struct Fake {
    pub usb: &'static ral::usb::RegisterBlock,
    sram: NonNull<u8>,
}

unsafe impl Peripherals for Fake {
    fn usb(&self) -> *const () {
        self.usb as *const _ as _
    }
    fn packet_memory(&self) -> *const () {
        self.sram.as_ptr() as *const ()
    }
}

/// Registers and packet memory, for before / after comparisons
#[derive(Debug, PartialEq, Eq)]
pub struct Snapshot {
    registers: Vec<u32>,
    sram: Vec<u8>,
}

impl Fake {
    pub fn new() -> Self {
        let sram: &'static mut [u8; PACKET_MEMORY_SIZE] = Box::leak(Box::new([0; PACKET_MEMORY_SIZE]));
        Fake {
            usb: Box::leak(Box::new(ral::usb::RegisterBlock::new())),
            sram: NonNull::from(sram).cast(),
        }
    }

    /// An initialized driver that uses this fake
    pub fn driver(&self) -> Driver {
        let mut usb = Driver::new(*self);
        usb.initialize();
        self.usb.INSTSC.write(0);
        usb
    }

    /// Raise `status`, and run the interrupt handler once
    pub fn fire(&self, usb: &mut Driver, handler: &mut Recorder, status: Interrupt) {
        self.usb.INSTSC.write(0);
        self.usb.INSTS.write(status.bits());
        usb.on_interrupt(handler);
        self.usb.INSTS.write(0);
    }

    /// Deliver a SETUP packet to endpoint 0
    pub fn setup(&self, usb: &mut Driver, handler: &mut Recorder, packet: [u8; 8]) {
        self.copy_in(0, &packet);
        self.fire(
            usb,
            handler,
            Interrupt::EP0_SETUP | Interrupt::EP0_PRESETUP,
        );
    }

    /// The flags written to the clear register by the most recent handler call
    ///
    /// Only the last write survives.
    pub fn cleared(&self) -> Interrupt {
        Interrupt::from_bits_retain(self.usb.INSTSC.read())
    }

    fn buffer_offset(&self, ep: usize) -> usize {
        if ep == 0 {
            0
        } else {
            self.usb.EPBUFOS[ep - 1].read() as usize
        }
    }

    fn copy_in(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PACKET_MEMORY_SIZE);
        for (idx, byte) in data.iter().enumerate() {
            unsafe { self.sram.as_ptr().add(offset + idx).write_volatile(*byte) };
        }
    }

    fn copy_out(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= PACKET_MEMORY_SIZE);
        (0..len)
            .map(|idx| unsafe { self.sram.as_ptr().add(offset + idx).read_volatile() })
            .collect()
    }

    /// Land an OUT packet in `ep`'s packet memory, and set its byte count
    pub fn receive(&self, ep: usize, data: &[u8]) {
        self.copy_in(self.buffer_offset(ep), data);
        let epctl = &self.usb.EPCTL[ep];
        epctl.write((epctl.read() & !0x1FF) | data.len() as u32);
    }

    /// The endpoint's STATE field
    pub fn state(&self, ep: usize) -> u32 {
        (self.usb.EPCTL[ep].read() >> 29) & 0b11
    }

    /// The endpoint's CNT field
    pub fn count(&self, ep: usize) -> usize {
        (self.usb.EPCTL[ep].read() & 0x1FF) as usize
    }

    /// The IN packet that `ep` is armed to send, if any
    pub fn armed(&self, ep: usize) -> Option<Vec<u8>> {
        (self.state(ep) == ACK).then(|| self.copy_out(self.buffer_offset(ep), self.count(ep)))
    }

    pub fn snapshot(&self) -> Snapshot {
        let usb = self.usb;
        let mut registers = vec![
            usb.INTEN.read(),
            usb.INSTSC.read(),
            usb.ADDR.read(),
            usb.CFG.read(),
            usb.EPTOGGLE.read(),
        ];
        registers.extend(usb.EPCTL.iter().map(|epctl| epctl.read()));
        registers.extend(usb.EPBUFOS.iter().map(|bufos| bufos.read()));
        Snapshot {
            registers,
            sram: self.copy_out(0, PACKET_MEMORY_SIZE),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    BusReset,
    Suspend,
    Wakeup,
    Setup([u8; 8]),
    /// Endpoint, and transfer size
    InComplete(usize, usize),
    /// Endpoint, and the bytes received
    OutComplete(usize, Vec<u8>),
    StartOfFrame,
}

type SetupHook = Box<dyn FnMut(&mut Driver)>;
type InHook = Box<dyn FnMut(&mut Driver, usize, &'static [u8])>;

/// A handler that records every callback
///
/// Hooks let a test respond from inside a callback, the way an upper
/// layer would.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
    setup: Option<SetupHook>,
    in_complete: Option<InHook>,
}

impl Recorder {
    pub fn with_setup(mut self, hook: impl FnMut(&mut Driver) + 'static) -> Self {
        self.setup = Some(Box::new(hook));
        self
    }

    pub fn with_in_complete(
        mut self,
        hook: impl FnMut(&mut Driver, usize, &'static [u8]) + 'static,
    ) -> Self {
        self.in_complete = Some(Box::new(hook));
        self
    }

    /// Take all events recorded so far
    pub fn take(&mut self) -> Vec<Event> {
        core::mem::take(&mut self.events)
    }
}

impl Handler for Recorder {
    fn on_bus_reset(&mut self, _: &mut Driver) {
        self.events.push(Event::BusReset);
    }
    fn on_suspend(&mut self, _: &mut Driver) {
        self.events.push(Event::Suspend);
    }
    fn on_wakeup(&mut self, _: &mut Driver) {
        self.events.push(Event::Wakeup);
    }
    fn on_setup(&mut self, usb: &mut Driver, ep: usize) {
        assert_eq!(ep, 0);
        let mut setup = [0; 8];
        usb.read_setup(&mut setup);
        self.events.push(Event::Setup(setup));
        if let Some(hook) = &mut self.setup {
            hook(usb);
        }
    }
    fn on_in_complete(&mut self, usb: &mut Driver, ep: usize, data: &'static [u8]) {
        self.events.push(Event::InComplete(ep, data.len()));
        if let Some(hook) = &mut self.in_complete {
            hook(usb, ep, data);
        }
    }
    fn on_out_complete(&mut self, _: &mut Driver, ep: usize, data: &'static mut [u8], len: usize) {
        self.events.push(Event::OutComplete(ep, data[..len].to_vec()));
    }
    fn on_start_of_frame(&mut self, _: &mut Driver) {
        self.events.push(Event::StartOfFrame);
    }
}
