//! USB driver and interrupt dispatcher
//!
//! The [`Driver`] owns the USB registers, the packet memory, and every
//! endpoint's transfer state. Foreground code starts transfers; the
//! interrupt handler advances them, one packet at a time, and reports
//! completion through a [`Handler`].

use crate::{
    endpoint::{self, Endpoint, EndpointConfig, EndpointStatus},
    interrupt::{self, EventClass, Interrupt},
    pma::{PacketBuffer, PacketMemory, EP0_MAX_PACKET_SIZE},
    ral,
    state::{ControlState, DataState, InTransfer, OutProgress, OutTransfer},
};
use core::sync::atomic::{AtomicU8, Ordering};
use usb_device::{UsbDirection, UsbError};

/// Number of endpoints, including the control endpoint
pub const ENDPOINT_COUNT: usize = ral::DATA_ENDPOINTS + 1;

const EP0_CONFIG: EndpointConfig = EndpointConfig::control(EP0_MAX_PACKET_SIZE as u16);

/// Callbacks into the upper USB layer
///
/// Every callback runs in interrupt context, and receives the driver. From
/// there, the upper layer may start (or chain) transfers, stall endpoints,
/// or set the device address. Callbacks must not block.
pub trait Handler {
    /// The host reset the bus
    ///
    /// By the time this runs, all data endpoints are disabled and all
    /// transfers are dropped. Only endpoint 0 is configured.
    fn on_bus_reset(&mut self, usb: &mut Driver) {
        let _ = usb;
    }
    /// The bus went idle
    fn on_suspend(&mut self, usb: &mut Driver) {
        let _ = usb;
    }
    /// The bus resumed, or signaled a remote wakeup
    fn on_wakeup(&mut self, usb: &mut Driver) {
        let _ = usb;
    }
    /// A SETUP packet arrived on control endpoint `ep`
    ///
    /// Read the packet with [`read_setup`](Driver::read_setup). The control
    /// endpoint NAKs until this callback starts a data stage, starts a
    /// status stage, or stalls.
    fn on_setup(&mut self, usb: &mut Driver, ep: usize);
    /// An IN transfer on `ep` completed
    ///
    /// `data` is the buffer given to [`start_in`](Driver::start_in). On the
    /// control endpoint, the driver has already armed a zero-length packet.
    fn on_in_complete(&mut self, usb: &mut Driver, ep: usize, data: &'static [u8]);
    /// An OUT transfer on `ep` completed, with `len` bytes in `data`
    ///
    /// `data` is the buffer given to [`start_out`](Driver::start_out). A
    /// control endpoint OUT without a transfer (typically a status stage)
    /// reports an empty buffer.
    fn on_out_complete(&mut self, usb: &mut Driver, ep: usize, data: &'static mut [u8], len: usize);
    /// Start of frame
    ///
    /// Only called when enabled with [`set_sof_interrupts`](Driver::set_sof_interrupts).
    fn on_start_of_frame(&mut self, usb: &mut Driver) {
        let _ = usb;
    }
}

/// A USB driver
///
/// After you create a `Driver` with [`new()`](Driver::new), you must
///
/// - call [`initialize()`](Driver::initialize) once
/// - enable interrupts with [`set_interrupts()`](Driver::set_interrupts)
/// - [`attach()`](Driver::attach) to the bus
///
/// then route the USB interrupt to [`on_interrupt()`](Driver::on_interrupt).
pub struct Driver {
    usb: ral::usb::Instance,
    pma: PacketMemory,
    endpoints: [Option<Endpoint>; ENDPOINT_COUNT],
    control: ControlState,
    /// Indexed by endpoint. Index 0 is unused; see `control`.
    data: [DataState; ENDPOINT_COUNT],
    /// Applied at the next control IN interrupt. Zero when nothing is pending.
    pending_address: AtomicU8,
}

const NO_ENDPOINT: Option<Endpoint> = None;
const NO_TRANSFERS: DataState = DataState::new();

fn lookup(endpoints: &[Option<Endpoint>], ep: usize) -> usb_device::Result<&Endpoint> {
    endpoints
        .get(ep)
        .and_then(Option::as_ref)
        .ok_or(UsbError::InvalidEndpoint)
}

impl Driver {
    /// Create a new `Driver`
    ///
    /// Creation does not touch the hardware. After creating the driver,
    /// call [`initialize()`](Driver::initialize).
    ///
    /// # Panics
    ///
    /// Panics if the peripherals' packet memory pointer is null.
    pub fn new<P: crate::Peripherals>(peripherals: P) -> Self {
        let ral::Instances { usb, packet_memory } = ral::instances(peripherals);
        Driver {
            usb,
            // Safety: Peripherals guarantees exclusive ownership of the
            // packet memory.
            pma: unsafe { PacketMemory::new(packet_memory) },
            endpoints: [NO_ENDPOINT; ENDPOINT_COUNT],
            control: ControlState::Idle,
            data: [NO_TRANSFERS; ENDPOINT_COUNT],
            pending_address: AtomicU8::new(0),
        }
    }

    /// Power the PHY and regulator, and configure the control endpoint
    ///
    /// Assumes that the USB clock is enabled. Interrupts stay disabled,
    /// and the device stays detached.
    pub fn initialize(&mut self) {
        ral::write_reg!(ral::usb, self.usb, INTEN, 0);
        ral::write_reg!(ral::usb, self.usb, CFG, VREG33_EN: 1, PHY_EN: 1, ESD_EN: 1);
        ral::write_reg!(ral::usb, self.usb, INSTSC, Interrupt::all().clear_mask());
        self.reset_endpoints();
    }

    /// Connect the D+ pull-up, so the host sees the device
    pub fn attach(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CFG, DPPU_EN: 1);
    }

    /// Disconnect the D+ pull-up
    pub fn detach(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CFG, DPPU_EN: 0);
    }

    /// Detach, disable interrupts, drop all transfers and power down the PHY
    ///
    /// Call [`initialize()`](Driver::initialize) to use the driver again.
    pub fn stop(&mut self) {
        self.detach();
        ral::write_reg!(ral::usb, self.usb, INTEN, 0);
        self.disable_endpoints();
        endpoint::disable(self.usb, 0);
        self.endpoints[0] = None;
        self.control = ControlState::Idle;
        self.pending_address.store(0, Ordering::SeqCst);
        ral::modify_reg!(ral::usb, self.usb, CFG, PHY_EN: 0);
        debug!("STOP");
    }

    /// Enable (`true`) or disable (`false`) the USB and bus interrupts
    pub fn set_interrupts(&mut self, enable: bool) {
        let enable = enable as u32;
        ral::modify_reg!(ral::usb, self.usb, INTEN, USB_IE: enable, BUS_IE: enable);
    }

    /// Enable (`true`) or disable (`false`) start-of-frame callbacks
    pub fn set_sof_interrupts(&mut self, enable: bool) {
        ral::modify_reg!(ral::usb, self.usb, INTEN, SOF_IE: enable as u32);
    }

    /// Enable (`true`) or disable (`false`) NAK events for a data endpoint
    ///
    /// NAK events re-arm OUT endpoints that have a transfer in progress.
    /// They're off by default.
    pub fn set_nak_interrupts(&mut self, ep: usize, enable: bool) -> usb_device::Result<()> {
        let endpoint = lookup(&self.endpoints, ep)?;
        if endpoint.config().is_control() {
            return Err(UsbError::InvalidEndpoint);
        }
        endpoint.set_nak_interrupt(self.usb, enable);
        Ok(())
    }

    /// Enable zero-length termination (ZLT) for the given IN endpoint
    ///
    /// With ZLT, a transfer whose size is a nonzero multiple of the max packet
    /// size is followed by a zero-length packet. By default, ZLT is off, and
    /// the transfer ends with its last full packet. The control endpoint always
    /// terminates with a zero-length packet, so this doesn't apply there.
    ///
    /// This call does nothing if the endpoint isn't configured.
    pub fn enable_zlt(&mut self, ep: usize) {
        if let Some(Some(endpoint)) = self.endpoints.get_mut(ep) {
            if !endpoint.config().is_control() {
                endpoint.enable_zlt();
            }
        }
    }

    /// Read the 11-bit frame number
    pub fn frame_number(&self) -> u16 {
        ral::read_reg!(ral::usb, self.usb, FRMNO, FRMNO) as u16
    }

    /// Set the device address
    ///
    /// The address takes effect at the next control IN interrupt, which is
    /// the end of the SET_ADDRESS status stage.
    pub fn set_address(&self, address: u8) {
        self.pending_address.store(address & 0x7F, Ordering::SeqCst);
    }

    /// Configure endpoint `ep`
    ///
    /// Endpoint 0 takes a control configuration, and always uses the fixed
    /// endpoint 0 packet memory. Data endpoints allocate packet memory the
    /// first time they're configured, and reuse it after that, if it's
    /// large enough. Configuring an endpoint drops any transfer in progress,
    /// and leaves the endpoint in NAK.
    pub fn configure(&mut self, ep: usize, config: EndpointConfig) -> usb_device::Result<()> {
        if ep >= ENDPOINT_COUNT || (ep == 0) != config.is_control() {
            return Err(UsbError::InvalidEndpoint);
        }
        let max_packet_len = config.max_packet_size() as usize;
        let buffer = if ep == 0 {
            PacketBuffer::EP0
        } else {
            match self.endpoints[ep].as_ref().map(Endpoint::buffer) {
                Some(buffer) if buffer.len() >= max_packet_len => buffer,
                _ => self
                    .pma
                    .allocate(max_packet_len)
                    .ok_or(UsbError::EndpointMemoryOverflow)?,
            }
        };

        let endpoint = Endpoint::new(ep, config, buffer);
        endpoint.configure(self.usb);
        if ep == 0 {
            self.control = ControlState::Idle;
        } else {
            self.data[ep] = DataState::new();
        }
        self.endpoints[ep] = Some(endpoint);
        debug!("CONFIGURE EP{} MPS {}", ep, max_packet_len);
        Ok(())
    }

    /// Disable endpoints 1 and up, and release their packet memory
    ///
    /// The control endpoint is untouched. Calling this more than once has
    /// no additional effect.
    pub fn disable_endpoints(&mut self) {
        for ep in 1..ENDPOINT_COUNT {
            endpoint::disable(self.usb, ep);
            self.endpoints[ep] = None;
            self.data[ep] = DataState::new();
        }
        self.pma.release_all();
    }

    /// Start sending `data` on IN endpoint `ep`
    ///
    /// The first packet is armed before this call returns. The driver holds
    /// `data` until it's handed back in [`Handler::on_in_complete`].
    pub fn start_in(&mut self, ep: usize, data: &'static [u8]) -> usb_device::Result<()> {
        let endpoint = lookup(&self.endpoints, ep)?;
        if !endpoint.config().supports(UsbDirection::In) {
            return Err(UsbError::InvalidEndpoint);
        }
        let busy = if ep == 0 {
            !self.control.is_idle()
        } else {
            self.data[ep].tx.is_some()
        };
        if busy {
            return Err(UsbError::WouldBlock);
        }

        let mut transfer = InTransfer::new(data);
        let packet = transfer.first_packet(endpoint.max_packet_len());
        self.pma.write(endpoint.buffer(), packet);
        // The transfer must be in place before the hardware can complete
        // the packet.
        if ep == 0 {
            self.control = ControlState::In(transfer);
        } else {
            self.data[ep].tx = Some(transfer);
        }
        endpoint.ack(self.usb, packet.len());
        trace!("EP{} START IN {}", ep, data.len());
        Ok(())
    }

    /// Start receiving into `buffer` on OUT endpoint `ep`
    ///
    /// The transfer completes when `buffer` is full, or when the host sends a
    /// short packet. The driver holds `buffer` until it's handed back in
    /// [`Handler::on_out_complete`].
    ///
    /// A control endpoint data stage must fit in a single packet; otherwise,
    /// this returns [`UsbError::BufferOverflow`].
    pub fn start_out(&mut self, ep: usize, buffer: &'static mut [u8]) -> usb_device::Result<()> {
        let endpoint = lookup(&self.endpoints, ep)?;
        if !endpoint.config().supports(UsbDirection::Out) {
            return Err(UsbError::InvalidEndpoint);
        }
        let max_packet_len = endpoint.max_packet_len();
        let busy = if ep == 0 {
            !self.control.is_idle()
        } else {
            self.data[ep].rx.is_some()
        };
        if busy {
            return Err(UsbError::WouldBlock);
        }
        if ep == 0 && buffer.len() > max_packet_len {
            return Err(UsbError::BufferOverflow);
        }

        trace!("EP{} START OUT {}", ep, buffer.len());
        let transfer = OutTransfer::new(buffer, max_packet_len);
        if ep == 0 {
            self.control = ControlState::Out(transfer);
        } else {
            self.data[ep].rx = Some(transfer);
        }
        endpoint.ack(self.usb, 0);
        Ok(())
    }

    /// Copy the SETUP packet out of endpoint 0's packet memory
    pub fn read_setup(&self, setup: &mut [u8; 8]) {
        self.pma.read(PacketBuffer::EP0, setup);
    }

    /// Copy bytes out of `ep`'s packet memory
    ///
    /// This is a plain copy that doesn't interact with transfers. Returns the
    /// number of bytes copied, at most the endpoint's packet memory size.
    pub fn read(&self, ep: usize, buffer: &mut [u8]) -> usb_device::Result<usize> {
        let endpoint = lookup(&self.endpoints, ep)?;
        let len = buffer.len().min(endpoint.max_packet_len());
        Ok(self.pma.read(endpoint.buffer(), &mut buffer[..len]))
    }

    /// Copy bytes into `ep`'s packet memory
    ///
    /// Like [`read()`](Driver::read), this doesn't arm the endpoint. Pair it
    /// with [`ack()`](Driver::ack).
    pub fn write(&mut self, ep: usize, buffer: &[u8]) -> usb_device::Result<usize> {
        let endpoint = lookup(&self.endpoints, ep)?;
        let len = buffer.len().min(endpoint.max_packet_len());
        Ok(self.pma.write(endpoint.buffer(), &buffer[..len]))
    }

    /// Arm `ep` to send or receive `count` bytes, and clear any stall
    ///
    /// The driver does this on its own for transfers. Use it for packets
    /// that bypass [`start_in`](Driver::start_in) and [`start_out`](Driver::start_out).
    pub fn ack(&self, ep: usize, count: usize) -> usb_device::Result<()> {
        lookup(&self.endpoints, ep)?.ack(self.usb, count);
        Ok(())
    }

    /// NAK the next host transaction on `ep`
    pub fn nak(&self, ep: usize) -> usb_device::Result<()> {
        lookup(&self.endpoints, ep)?.nak(self.usb);
        Ok(())
    }

    /// Stall `ep`
    ///
    /// Stalling the control endpoint stalls both directions, and abandons
    /// the control transfer. The next SETUP clears the stall. Data endpoints
    /// keep their transfers; see [`clear_stall`](Driver::clear_stall).
    pub fn stall(&mut self, ep: usize) -> usb_device::Result<()> {
        let endpoint = lookup(&self.endpoints, ep)?;
        endpoint.stall(self.usb);
        if ep == 0 {
            self.control = ControlState::Idle;
        }
        debug!("EP{} STALL", ep);
        Ok(())
    }

    /// Clear a stall, and reset the data toggle
    ///
    /// A data endpoint with a transfer in progress is armed again: OUT
    /// endpoints for the next packet, IN endpoints with the packet that was
    /// in flight when the endpoint stalled.
    pub fn clear_stall(&mut self, ep: usize) -> usb_device::Result<()> {
        let endpoint = lookup(&self.endpoints, ep)?;
        endpoint.clear_stall(self.usb);
        let state = &self.data[ep];
        if state.rx.is_some() {
            endpoint.ack(self.usb, 0);
        } else if let Some(transfer) = &state.tx {
            endpoint.ack(self.usb, transfer.last_packet_len());
        }
        debug!("EP{} UNSTALL", ep);
        Ok(())
    }

    /// Returns `ep`'s status
    ///
    /// Endpoints that don't exist report [`EndpointStatus::Disabled`].
    pub fn status(&self, ep: usize) -> EndpointStatus {
        if ep < ENDPOINT_COUNT {
            endpoint::status(self.usb, ep)
        } else {
            EndpointStatus::Disabled
        }
    }

    /// Returns the number of bytes moved by the transfer in progress
    ///
    /// Returns `None` if there's no transfer in progress for that endpoint
    /// and direction.
    pub fn bytes_transferred(&self, ep: usize, direction: UsbDirection) -> Option<usize> {
        if ep == 0 {
            match (&self.control, direction) {
                (ControlState::In(transfer), UsbDirection::In) => Some(transfer.bytes_transferred()),
                (ControlState::Out(transfer), UsbDirection::Out) => {
                    Some(transfer.bytes_transferred())
                }
                _ => None,
            }
        } else {
            let state = self.data.get(ep)?;
            match direction {
                UsbDirection::In => state.tx.as_ref().map(InTransfer::bytes_transferred),
                UsbDirection::Out => state.rx.as_ref().map(OutTransfer::bytes_transferred),
            }
        }
    }

    /// Returns the number of packets that the OUT transfer on `ep` still expects
    pub fn packets_remaining(&self, ep: usize) -> Option<usize> {
        if ep == 0 {
            match &self.control {
                ControlState::Out(transfer) => Some(transfer.packets_remaining()),
                _ => None,
            }
        } else {
            let state = self.data.get(ep)?;
            state.rx.as_ref().map(OutTransfer::packets_remaining)
        }
    }

    /// Indicates if a transfer is in progress on `ep` in `direction`
    pub fn is_busy(&self, ep: usize, direction: UsbDirection) -> bool {
        self.bytes_transferred(ep, direction).is_some()
    }

    /// Disable every data endpoint, drop every transfer, and configure
    /// endpoint 0 from scratch
    fn reset_endpoints(&mut self) {
        self.disable_endpoints();
        self.control = ControlState::Idle;
        self.pending_address.store(0, Ordering::SeqCst);
        ral::write_reg!(ral::usb, self.usb, ADDR, 0);
        ral::write_reg!(ral::usb, self.usb, EPTOGGLE, CLEAR: 0x3F);

        let ep0 = Endpoint::new(0, EP0_CONFIG, PacketBuffer::EP0);
        ep0.configure(self.usb);
        self.endpoints[0] = Some(ep0);
    }

    fn clear(&self, flags: Interrupt) {
        ral::write_reg!(ral::usb, self.usb, INSTSC, flags.clear_mask());
    }

    /// Service the USB interrupt
    ///
    /// Each call services the highest-priority class of pending events, plus
    /// start-of-frame. Events of other classes stay pending, so the interrupt
    /// fires again for them.
    pub fn on_interrupt<H: Handler + ?Sized>(&mut self, handler: &mut H) {
        let status = Interrupt::from_bits_retain(ral::read_reg!(ral::usb, self.usb, INSTS));
        if status.is_empty() {
            return;
        }

        // Reserved bits have no handler, and would otherwise re-enter forever.
        let ignored = (status & Interrupt::IGNORED) | status.difference(Interrupt::all());
        if !ignored.is_empty() {
            self.clear(ignored);
        }

        match interrupt::classify(status) {
            Some(EventClass::Wakeup) => {
                self.clear(Interrupt::BUS_WAKEUP);
                debug!("WAKEUP");
                handler.on_wakeup(self);
            }
            Some(EventClass::Bus) => self.on_bus_event(status, handler),
            Some(EventClass::Control) => self.on_control_event(status, handler),
            Some(EventClass::EndpointAck) => {
                for ep in interrupt::endpoints(status, Interrupt::ack) {
                    self.on_endpoint_ack(ep, handler);
                }
            }
            Some(EventClass::EndpointNak) => {
                for ep in interrupt::endpoints(status, Interrupt::nak) {
                    self.on_endpoint_nak(ep);
                }
            }
            None => {}
        }

        if status.contains(Interrupt::SOF) {
            self.clear(Interrupt::SOF);
            if ral::read_reg!(ral::usb, self.usb, INTEN, SOF_IE == 1) {
                handler.on_start_of_frame(self);
            }
        }
    }

    fn on_bus_event<H: Handler + ?Sized>(&mut self, status: Interrupt, handler: &mut H) {
        if status.contains(Interrupt::BUS_RESET) {
            self.clear(Interrupt::BUS_RESET);
            self.reset_endpoints();
            debug!("RESET");
            handler.on_bus_reset(self);
        } else if status.contains(Interrupt::BUS_SUSPEND) {
            self.clear(Interrupt::BUS_SUSPEND);
            debug!("SUSPEND");
            handler.on_suspend(self);
        } else if status.contains(Interrupt::BUS_RESUME) {
            self.clear(Interrupt::BUS_RESUME);
            debug!("RESUME");
            handler.on_wakeup(self);
        }
    }

    fn on_control_event<H: Handler + ?Sized>(&mut self, status: Interrupt, handler: &mut H) {
        let Some(ep0) = self.endpoints[0].as_ref() else {
            warn!("EP0 EVENT, not configured");
            self.clear(status & Interrupt::CONTROL);
            return;
        };

        if status.contains(Interrupt::EP0_SETUP) {
            // PRESETUP stays set; see Interrupt::STICKY.
            self.clear(Interrupt::EP0_SETUP | Interrupt::EP0_STALL);
            ep0.nak(self.usb);
            self.control = ControlState::Idle;
            trace!("SETUP");
            handler.on_setup(self, 0);
        } else if status.contains(Interrupt::EP0_IN) {
            self.clear(Interrupt::EP0_IN);
            self.on_control_in(handler);
        } else if status.contains(Interrupt::EP0_OUT) {
            self.clear(Interrupt::EP0_OUT);
            self.on_control_out(handler);
        } else if status.intersects(Interrupt::EP0_STALL) {
            ep0.stall(self.usb);
            self.clear(Interrupt::EP0_STALL);
        }
    }

    fn on_control_in<H: Handler + ?Sized>(&mut self, handler: &mut H) {
        let Some(ep0) = self.endpoints[0].as_ref() else {
            return;
        };

        let address = self.pending_address.load(Ordering::SeqCst);
        if address != 0 {
            self.pending_address.store(0, Ordering::SeqCst);
            ral::write_reg!(ral::usb, self.usb, ADDR, UADDR: address as u32);
            ep0.stall(self.usb);
            debug!("ADDRESS {}", address);
        } else {
            ep0.ack(self.usb, 0);
        }

        let max_packet_len = ep0.max_packet_len();
        match self.control.take() {
            ControlState::In(mut transfer) => {
                if transfer.acknowledge() > 0 {
                    let packet = transfer.next_packet(max_packet_len);
                    self.pma.write(ep0.buffer(), packet);
                    self.control = ControlState::In(transfer);
                    ep0.ack(self.usb, packet.len());
                } else {
                    ep0.ack(self.usb, 0);
                    trace!("EP0 IN {}", transfer.bytes_transferred());
                    handler.on_in_complete(self, 0, transfer.into_data());
                }
            }
            state => {
                // The trailing zero-length packet went out. Stay armed for
                // the status stage.
                self.control = state;
                ep0.ack(self.usb, 0);
            }
        }
    }

    fn on_control_out<H: Handler + ?Sized>(&mut self, handler: &mut H) {
        let Some(ep0) = self.endpoints[0].as_ref() else {
            return;
        };

        match self.control.take() {
            ControlState::Out(mut transfer) => {
                let max_packet_len = ep0.max_packet_len();
                let count = ep0.received(self.usb).min(max_packet_len);
                let window = transfer.window(max_packet_len);
                let len = count.min(window.len());
                let copied = self.pma.read(ep0.buffer(), &mut window[..len]);
                transfer.commit(count, copied, max_packet_len);
                let (buffer, received) = transfer.into_parts();
                trace!("EP0 OUT {}", received);
                handler.on_out_complete(self, 0, buffer, received);
            }
            // A status stage, or the host ended an IN data stage early.
            _ => handler.on_out_complete(self, 0, &mut [], 0),
        }
    }

    fn on_endpoint_ack<H: Handler + ?Sized>(&mut self, ep: usize, handler: &mut H) {
        self.clear(Interrupt::ack(ep));
        let direction = self.endpoints[ep]
            .as_ref()
            .and_then(|endpoint| endpoint.config().direction());
        match direction {
            Some(UsbDirection::Out) => self.on_data_out(ep, handler),
            Some(UsbDirection::In) => self.on_data_in(ep, handler),
            None => {
                warn!("EP{} ACK, not configured", ep);
            }
        }
    }

    fn on_data_out<H: Handler + ?Sized>(&mut self, ep: usize, handler: &mut H) {
        let Some(endpoint) = self.endpoints[ep].as_ref() else {
            return;
        };
        let max_packet_len = endpoint.max_packet_len();
        let count = endpoint.received(self.usb).min(max_packet_len);

        let Some(mut transfer) = self.data[ep].rx.take() else {
            warn!("EP{} OUT {}, no transfer", ep, count);
            endpoint.nak(self.usb);
            return;
        };

        // The endpoint is re-armed only after the copy, so the next packet
        // can't overwrite this one.
        let window = transfer.window(max_packet_len);
        let len = count.min(window.len());
        let copied = self.pma.read(endpoint.buffer(), &mut window[..len]);
        match transfer.commit(count, copied, max_packet_len) {
            OutProgress::Pending => {
                self.data[ep].rx = Some(transfer);
                endpoint.ack(self.usb, 0);
            }
            OutProgress::Complete => {
                endpoint.nak(self.usb);
                let (buffer, received) = transfer.into_parts();
                debug!("EP{} OUT COMPLETE {}", ep, received);
                handler.on_out_complete(self, ep, buffer, received);
            }
        }
    }

    fn on_data_in<H: Handler + ?Sized>(&mut self, ep: usize, handler: &mut H) {
        let Some(endpoint) = self.endpoints[ep].as_ref() else {
            return;
        };
        let max_packet_len = endpoint.max_packet_len();

        let Some(mut transfer) = self.data[ep].tx.take() else {
            warn!("EP{} IN, no transfer", ep);
            endpoint.nak(self.usb);
            return;
        };

        if transfer.acknowledge() > 0 {
            let packet = transfer.next_packet(max_packet_len);
            self.pma.write(endpoint.buffer(), packet);
            self.data[ep].tx = Some(transfer);
            endpoint.ack(self.usb, packet.len());
        } else if endpoint.is_zlt() && transfer.last_packet_len() == max_packet_len {
            // Sets the in-flight packet size to zero, so the next ACK completes.
            transfer.next_packet(max_packet_len);
            self.data[ep].tx = Some(transfer);
            endpoint.ack(self.usb, 0);
        } else {
            endpoint.nak(self.usb);
            debug!("EP{} IN COMPLETE {}", ep, transfer.bytes_transferred());
            handler.on_in_complete(self, ep, transfer.into_data());
        }
    }

    fn on_endpoint_nak(&mut self, ep: usize) {
        self.clear(Interrupt::nak(ep));
        let Some(endpoint) = self.endpoints[ep].as_ref() else {
            return;
        };
        if endpoint.status(self.usb) == EndpointStatus::Stalled {
            return;
        }
        match endpoint.config().direction() {
            Some(UsbDirection::Out) if self.data[ep].rx.is_some() => endpoint.ack(self.usb, 0),
            Some(UsbDirection::In) if self.data[ep].tx.is_some() => {}
            _ => endpoint.nak(self.usb),
        }
    }
}
