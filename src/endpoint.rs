//! Endpoint configuration and hardware control
//!
//! An [`Endpoint`] pairs a configuration with its packet memory region, and
//! knows how to arm (ACK), defer (NAK) and stall itself in hardware.

use crate::{
    pma::PacketBuffer,
    ral::{self, usb, EndpointRegisters},
};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Describes how an endpoint should behave
///
/// Construct these with `const fn`s so that an invalid max packet size is
/// caught when the firmware is built:
///
/// ```
/// use sn32_usbd::EndpointConfig;
/// use usb_device::{endpoint::EndpointType, UsbDirection};
///
/// const BULK_IN: EndpointConfig =
///     EndpointConfig::new(EndpointType::Bulk, UsbDirection::In, 64);
/// ```
///
/// ```compile_fail
/// use sn32_usbd::EndpointConfig;
/// use usb_device::{endpoint::EndpointType, UsbDirection};
///
/// const BROKEN: EndpointConfig =
///     EndpointConfig::new(EndpointType::Bulk, UsbDirection::In, 48);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    kind: EndpointType,
    /// `None` for control endpoints, which move data in both directions.
    direction: Option<UsbDirection>,
    max_packet_size: u16,
}

/// Returns `true` if the hardware supports `max_packet_size`
pub const fn is_supported_packet_size(max_packet_size: u16) -> bool {
    matches!(max_packet_size, 8 | 16 | 32 | 64)
}

impl EndpointConfig {
    /// A unidirectional data endpoint
    ///
    /// # Panics
    ///
    /// Panics if `max_packet_size` isn't one of 8, 16, 32 or 64, or if `kind`
    /// is a control endpoint. In a `const` context, this fails the build.
    pub const fn new(kind: EndpointType, direction: UsbDirection, max_packet_size: u16) -> Self {
        assert!(
            is_supported_packet_size(max_packet_size),
            "Invalid size for USB endpoint"
        );
        assert!(
            !matches!(kind, EndpointType::Control),
            "Data endpoints cannot be control endpoints"
        );
        EndpointConfig {
            kind,
            direction: Some(direction),
            max_packet_size,
        }
    }

    /// A bidirectional control endpoint
    ///
    /// # Panics
    ///
    /// Panics if `max_packet_size` isn't one of 8, 16, 32 or 64.
    pub const fn control(max_packet_size: u16) -> Self {
        assert!(
            is_supported_packet_size(max_packet_size),
            "Invalid size for USB endpoint"
        );
        EndpointConfig {
            kind: EndpointType::Control,
            direction: None,
            max_packet_size,
        }
    }

    pub const fn kind(&self) -> EndpointType {
        self.kind
    }

    /// The data direction, or `None` for a control endpoint
    pub const fn direction(&self) -> Option<UsbDirection> {
        self.direction
    }

    pub const fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub const fn is_control(&self) -> bool {
        self.direction.is_none()
    }

    /// Indicates if the endpoint can move data in `direction`
    pub fn supports(&self, direction: UsbDirection) -> bool {
        self.direction.map_or(true, |dir| dir == direction)
    }
}

/// Endpoint status, as seen by the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum EndpointStatus {
    /// The endpoint isn't enabled
    Disabled,
    /// The endpoint responds with STALL
    Stalled,
    /// The endpoint is enabled, and not stalled
    Active,
}

/// A configured endpoint
pub struct Endpoint {
    index: usize,
    config: EndpointConfig,
    buffer: PacketBuffer,
    zlt: bool,
}

impl Endpoint {
    /// Create an endpoint that uses `buffer` for packet I/O
    ///
    /// Does not touch hardware; call [`configure`](Endpoint::configure).
    pub fn new(index: usize, config: EndpointConfig, buffer: PacketBuffer) -> Self {
        debug_assert!(buffer.len() >= config.max_packet_size() as usize);
        Endpoint {
            index,
            config,
            buffer,
            zlt: false,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn buffer(&self) -> PacketBuffer {
        self.buffer
    }

    pub fn max_packet_len(&self) -> usize {
        self.config.max_packet_size() as usize
    }

    /// Enable zero-length termination for IN transfers
    pub fn enable_zlt(&mut self) {
        self.zlt = true;
    }

    pub fn is_zlt(&self) -> bool {
        self.zlt
    }

    fn registers(&self) -> EndpointRegisters {
        EndpointRegisters::new(self.index)
    }

    /// Program direction, buffer offset and enable into hardware
    ///
    /// Data endpoints start with a cleared data toggle, and in the NAK state.
    /// The driver arms them when a transfer starts.
    pub fn configure(&self, usb: &usb::RegisterBlock) {
        let regs = self.registers();
        let epctl = regs.control(usb);

        if let Some(bufos) = regs.buffer_offset(usb) {
            bufos.write(self.buffer.offset() as u32);
        }

        match self.config.direction() {
            Some(UsbDirection::Out) => {
                ral::modify_reg!(ral::usb, usb, CFG, |cfg| cfg | regs.mask())
            }
            Some(UsbDirection::In) => {
                ral::modify_reg!(ral::usb, usb, CFG, |cfg| cfg & !regs.mask())
            }
            None => {}
        }

        if !self.config.is_control() {
            ral::write_reg!(ral::usb, usb, EPTOGGLE, regs.mask());
        }

        ral::write_reg!(ral::endpoint_control, &epctl, EPCTL, ENDP_EN: 1, STATE: NAK);
    }

    /// Arm the endpoint for exactly `count` bytes, and clear any stall
    pub fn ack(&self, usb: &usb::RegisterBlock, count: usize) {
        let epctl = self.registers().control(usb);
        ral::modify_reg!(ral::endpoint_control, &epctl, EPCTL,
            OUT_STALL_EN: 0, IN_STALL_EN: 0, STATE: ACK, CNT: count as u32);
    }

    /// Defer the next host transaction
    pub fn nak(&self, usb: &usb::RegisterBlock) {
        let epctl = self.registers().control(usb);
        ral::modify_reg!(ral::endpoint_control, &epctl, EPCTL, STATE: NAK);
    }

    /// Respond to the host with STALL
    ///
    /// The control endpoint stalls both directions.
    pub fn stall(&self, usb: &usb::RegisterBlock) {
        let epctl = self.registers().control(usb);
        if self.config.is_control() {
            ral::modify_reg!(ral::endpoint_control, &epctl, EPCTL,
                OUT_STALL_EN: 1, IN_STALL_EN: 1, STATE: STALL);
        } else {
            ral::modify_reg!(ral::endpoint_control, &epctl, EPCTL, STATE: STALL);
        }
    }

    /// Leave the stalled state, and reset the data toggle
    ///
    /// The endpoint is left in NAK.
    pub fn clear_stall(&self, usb: &usb::RegisterBlock) {
        let regs = self.registers();
        let epctl = regs.control(usb);
        ral::modify_reg!(ral::endpoint_control, &epctl, EPCTL,
            OUT_STALL_EN: 0, IN_STALL_EN: 0, STATE: NAK);
        if !self.config.is_control() {
            ral::write_reg!(ral::usb, usb, EPTOGGLE, regs.mask());
        }
    }

    pub fn status(&self, usb: &usb::RegisterBlock) -> EndpointStatus {
        status(usb, self.index)
    }

    /// Number of bytes the hardware received in the last OUT transaction
    pub fn received(&self, usb: &usb::RegisterBlock) -> usize {
        let epctl = self.registers().control(usb);
        ral::read_reg!(ral::endpoint_control, &epctl, EPCTL, CNT) as usize
    }

    /// Enable or disable NAK interrupts for this endpoint
    pub fn set_nak_interrupt(&self, usb: &usb::RegisterBlock, enable: bool) {
        let mask = self.registers().mask();
        ral::modify_reg!(ral::usb, usb, INTEN, |inten| if enable {
            inten | mask
        } else {
            inten & !mask
        });
    }
}

/// Disable the endpoint at `index`, whether or not it's configured
pub fn disable(usb: &usb::RegisterBlock, index: usize) {
    let regs = EndpointRegisters::new(index);
    let epctl = regs.control(usb);
    ral::write_reg!(ral::endpoint_control, &epctl, EPCTL, 0);
    ral::modify_reg!(ral::usb, usb, INTEN, |inten| inten & !regs.mask());
}

/// Read the status of the endpoint at `index`, whether or not it's configured
pub fn status(usb: &usb::RegisterBlock, index: usize) -> EndpointStatus {
    let epctl = EndpointRegisters::new(index).control(usb);
    let (enabled, state) = ral::read_reg!(ral::endpoint_control, &epctl, EPCTL, ENDP_EN, STATE);
    if enabled == 0 {
        EndpointStatus::Disabled
    } else if state == ral::endpoint_control::EPCTL::STATE::RW::STALL {
        EndpointStatus::Stalled
    } else {
        EndpointStatus::Active
    }
}
