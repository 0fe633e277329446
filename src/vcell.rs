//! Volatile cell that conforms to the RAL's register API
//!
//! The USB register block is built from these cells. Since a `VCell` can be
//! constructed in a `const` context, the same register block can be backed by
//! ordinary RAM, which is how the unit tests drive the interrupt handler.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    #[cfg(test)]
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    #[inline(always)]
    pub fn read(&self) -> T {
        // Safety: pointer from UnsafeCell is always valid and aligned.
        unsafe { self.0.get().read_volatile() }
    }
    #[inline(always)]
    pub fn write(&self, val: T) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(val) }
    }
}

// Register access is only ever performed from one execution context at a
// time; see the BusAdapter for the critical section.
unsafe impl<T: Send> Sync for VCell<T> {}
