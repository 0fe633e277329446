//! A USB device driver for SN32F2xx microcontrollers
//!
//! `sn32-usbd` drives the full-speed USB device controller found on the
//! SN32F2xx family. It owns the controller's registers and its packet SRAM,
//! moves transfers through the endpoints one packet at a time, and reports
//! bus events and transfer completion to an upper USB layer through the
//! [`Handler`] trait.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the peripherals documentation for more information.
//!
//! # Usage
//!
//! 1. Create a [`Driver`] from your [`Peripherals`], and
//!    [`initialize()`](Driver::initialize) it.
//! 2. Wrap it in a [`BusAdapter`], so that the interrupt handler and your
//!    foreground code can share it.
//! 3. Enable the adapter, and call [`BusAdapter::on_interrupt`] from the USB
//!    interrupt with your [`Handler`].
//!
//! From inside the handler's callbacks, configure endpoints when the host
//! selects a configuration, start transfers with [`Driver::start_in`] and
//! [`Driver::start_out`], and chain follow-up transfers from the completion
//! callbacks. Transfer buffers are `'static`; the driver hands each buffer
//! back when its transfer completes.
//!
//! # Features
//!
//! Enable `defmt-03` to log driver events with `defmt` 0.3. Only enable it
//! when your logger doesn't use USB.

#![no_std]

// defmt's macros expand to `defmt::` paths.
#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

mod bus;
mod driver;
mod endpoint;
mod interrupt;
mod pma;
mod ral;
mod state;
mod vcell;

#[cfg(test)]
mod fake;

pub use bus::BusAdapter;
pub use driver::{Driver, Handler, ENDPOINT_COUNT};
pub use endpoint::{is_supported_packet_size, EndpointConfig, EndpointStatus};
pub use interrupt::{classify, EventClass, Interrupt};
pub use pma::{EP0_MAX_PACKET_SIZE, PACKET_MEMORY_SIZE};

/// A type that owns the USB peripheral
///
/// An implementation of `Peripherals` is expected to own
///
/// - the USB controller registers
/// - the USB packet SRAM
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the USB
/// register block and packet SRAM. The pointers returned by the methods are
/// assumed to be valid, and will be cast to a register definition and a
/// [`PACKET_MEMORY_SIZE`]-byte buffer.
///
/// # Example
///
/// A safe implementation of `Peripherals` for an SN32F24xB. The addresses
/// come from the reference manual.
///
/// ```
/// use sn32_usbd::Peripherals;
///
/// /// Only one of these may exist
/// struct Usb {
///     _private: (),
/// }
///
/// impl Usb {
///     /// # Safety
///     ///
///     /// Call once, and don't otherwise touch the USB peripheral.
///     pub unsafe fn steal() -> Self {
///         Usb { _private: () }
///     }
/// }
///
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         0x4005_C000 as *const ()
///     }
///     fn packet_memory(&self) -> *const () {
///         0x4005_C100 as *const ()
///     }
/// }
///
/// let usb = unsafe { Usb::steal() };
/// assert_eq!(usb.usb(), 0x4005_C000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB controller registers
    fn usb(&self) -> *const ();
    /// Returns the address of the USB packet SRAM
    fn packet_memory(&self) -> *const ();
}
