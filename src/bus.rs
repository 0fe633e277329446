//! Interrupt-safe driver access
//!
//! The USB interrupt handler and the foreground share one [`Driver`].
//! `BusAdapter` puts it behind a `cortex_m` mutex, so the foreground can
//! only touch it inside a critical section, and the interrupt handler can
//! never observe a half-started transfer.

use crate::{driver::Driver, endpoint::EndpointConfig, Handler};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// A USB driver that's shared with the USB interrupt handler
///
/// [`Driver::new`] isn't `const`, so the adapter can't initialize a plain
/// `static`. Create it at startup, and move it somewhere with a `'static`
/// lifetime that the USB interrupt can also reach. Then call
/// [`on_interrupt`](BusAdapter::on_interrupt) from the USB interrupt.
///
/// ```no_run
/// use sn32_usbd::{BusAdapter, Driver, Peripherals};
///
/// struct Usb;
/// unsafe impl Peripherals for Usb {
///     fn usb(&self) -> *const () {
///         0x4005_C000 as *const ()
///     }
///     fn packet_memory(&self) -> *const () {
///         0x4005_C100 as *const ()
///     }
/// }
///
/// let mut driver = Driver::new(Usb);
/// driver.initialize();
///
/// let bus: &'static BusAdapter =
///     cortex_m::singleton!(: BusAdapter = BusAdapter::new(driver)).unwrap();
/// bus.enable();
/// ```
pub struct BusAdapter {
    usb: Mutex<RefCell<Driver>>,
}

impl BusAdapter {
    /// Create a bus adapter from an initialized [`Driver`]
    ///
    /// Configure your endpoints before or after wrapping the driver; either
    /// way works. Enable interrupts last.
    pub const fn new(usb: Driver) -> Self {
        BusAdapter {
            usb: Mutex::new(RefCell::new(usb)),
        }
    }

    /// Interrupt-safe, immutable access to the USB driver
    pub fn with_usb<R>(&self, func: impl FnOnce(&Driver) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let usb = usb.borrow();
            func(&usb)
        })
    }

    /// Interrupt-safe, mutable access to the USB driver
    pub fn with_usb_mut<R>(&self, func: impl FnOnce(&mut Driver) -> R) -> R {
        interrupt::free(|cs| {
            let usb = self.usb.borrow(cs);
            let mut usb = usb.borrow_mut();
            func(&mut usb)
        })
    }

    /// Service the USB interrupt, calling back into `handler`
    pub fn on_interrupt<H: Handler + ?Sized>(&self, handler: &mut H) {
        self.with_usb_mut(|usb| usb.on_interrupt(handler));
    }

    /// Connect to the bus, and enable USB interrupts
    pub fn enable(&self) {
        self.with_usb_mut(|usb| {
            usb.set_interrupts(true);
            usb.attach();
        });
    }

    /// Disable USB interrupts, and disconnect from the bus
    pub fn disable(&self) {
        self.with_usb_mut(|usb| {
            usb.set_interrupts(false);
            usb.detach();
        });
    }

    pub fn configure(&self, ep: usize, config: EndpointConfig) -> usb_device::Result<()> {
        self.with_usb_mut(|usb| usb.configure(ep, config))
    }

    pub fn start_in(&self, ep: usize, data: &'static [u8]) -> usb_device::Result<()> {
        self.with_usb_mut(|usb| usb.start_in(ep, data))
    }

    pub fn start_out(&self, ep: usize, buffer: &'static mut [u8]) -> usb_device::Result<()> {
        self.with_usb_mut(|usb| usb.start_out(ep, buffer))
    }

    /// Set the device address
    ///
    /// See [`Driver::set_address`] for when it takes effect.
    pub fn set_address(&self, address: u8) {
        self.with_usb(|usb| {
            usb.set_address(address);
            debug!("SET ADDRESS {}", address);
        });
    }
}
