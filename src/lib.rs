//! A USB full-speed device stack for the STM32F1 USB peripheral
//!
//! `stm32f1-usbfs` enumerates the device, answers the standard control
//! requests on endpoint zero, configures the non-zero endpoints from your
//! configuration descriptors (double-buffering bulk endpoints), and exposes
//! blocking and non-blocking transfers to your application.
//!
//! The stack talks to hardware through a [`Peripheral`]. Use [`Instance`]
//! on real hardware. Blocking transfers park the calling thread through a
//! [`Scheduler`]; [`Wfe`] works for single-threaded firmware, and an RTOS
//! can provide its own.
//!
//! See [`Device`] for an example.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod buffer;
mod control;
mod descriptor;
mod device;
mod endpoint;
mod epr;
mod ral;
mod scheduler;
mod state;

#[cfg(test)]
mod sim;

pub use buffer::PMA_SIZE;
pub use control::ControlHandler;
pub use descriptor::{DescriptorError, Descriptors, TransferType};
pub use device::{
    BulkInPolicy, Callbacks, Config, Device, Endpoint, EndpointIo, Ep0Size, Incomplete,
};
pub use ral::{Control, Instance, Interrupt};
pub use scheduler::{Scheduler, Wfe};
pub use state::State;

/// Number of endpoint registers, including endpoint zero
pub const NUM_ENDPOINTS: usize = 8;

/// Largest packet a non-zero full-speed endpoint may declare
pub const MAX_PACKET_SIZE: u16 = 64;

/// Access to the USB peripheral registers and packet memory
///
/// The stack never caches register state: every operation reads the
/// hardware through this trait, and writes back exactly the value it
/// computes. Implementations must not add read-modify-write behavior of
/// their own.
///
/// Packet memory is addressed by byte offset from the start of the USB
/// view (0 through [`PMA_SIZE`]). Offsets are always even, and each access
/// moves one 16-bit word.
///
/// # Example
///
/// A `Peripheral` that wraps another one, and keeps the pull-up
/// on a GPIO.
///
/// ```
/// use stm32f1_usbfs::{Control, Instance, Interrupt, Peripheral};
///
/// struct WithPullup {
///     usb: Instance,
///     // gpio: ...
/// }
///
/// impl Peripheral for WithPullup {
///     fn endpoint_register(&self, index: usize) -> u16 { self.usb.endpoint_register(index) }
///     fn set_endpoint_register(&self, index: usize, value: u16) { self.usb.set_endpoint_register(index, value) }
///     fn control(&self) -> Control { self.usb.control() }
///     fn set_control(&self, control: Control) { self.usb.set_control(control) }
///     fn interrupt_status(&self) -> Interrupt { self.usb.interrupt_status() }
///     fn clear_interrupts(&self, interrupts: Interrupt) { self.usb.clear_interrupts(interrupts) }
///     fn set_address(&self, address: u8, enabled: bool) { self.usb.set_address(address, enabled) }
///     fn set_buffer_table(&self, offset: u16) { self.usb.set_buffer_table(offset) }
///     fn read_packet_memory(&self, offset: u16) -> u16 { self.usb.read_packet_memory(offset) }
///     fn write_packet_memory(&self, offset: u16, value: u16) { self.usb.write_packet_memory(offset, value) }
///     fn delay_us(&self, us: u32) { self.usb.delay_us(us) }
///     fn connect(&self, connected: bool) {
///         // Drive the pull-up GPIO...
///         # let _ = connected;
///     }
/// }
/// ```
pub trait Peripheral {
    /// Read endpoint register `EPnR`
    fn endpoint_register(&self, index: usize) -> u16;
    /// Write endpoint register `EPnR`
    ///
    /// The value is written as-is. The hardware toggles the bits written as
    /// one in the `STAT` and `DTOG` fields, and clears the `CTR` flags
    /// written as zero.
    fn set_endpoint_register(&self, index: usize, value: u16);

    fn control(&self) -> Control;
    fn set_control(&self, control: Control);

    fn interrupt_status(&self) -> Interrupt;
    /// Clear the interrupt flags in `interrupts`, and no others
    fn clear_interrupts(&self, interrupts: Interrupt);

    /// Set the device address and the function enable bit
    fn set_address(&self, address: u8, enabled: bool);
    /// Set the packet memory offset of the buffer descriptor table
    fn set_buffer_table(&self, offset: u16);

    fn read_packet_memory(&self, offset: u16) -> u16;
    fn write_packet_memory(&self, offset: u16, value: u16);

    /// Connect (`true`) or disconnect (`false`) the D+ pull-up
    ///
    /// The default does nothing, for boards with a fixed pull-up.
    fn connect(&self, connected: bool) {
        let _ = connected;
    }

    /// Busy-wait for `us` microseconds
    ///
    /// Used once, while the transceiver powers up.
    fn delay_us(&self, us: u32) {
        let _ = us;
    }
}

impl<P: Peripheral + ?Sized> Peripheral for &P {
    fn endpoint_register(&self, index: usize) -> u16 {
        (**self).endpoint_register(index)
    }
    fn set_endpoint_register(&self, index: usize, value: u16) {
        (**self).set_endpoint_register(index, value)
    }
    fn control(&self) -> Control {
        (**self).control()
    }
    fn set_control(&self, control: Control) {
        (**self).set_control(control)
    }
    fn interrupt_status(&self) -> Interrupt {
        (**self).interrupt_status()
    }
    fn clear_interrupts(&self, interrupts: Interrupt) {
        (**self).clear_interrupts(interrupts)
    }
    fn set_address(&self, address: u8, enabled: bool) {
        (**self).set_address(address, enabled)
    }
    fn set_buffer_table(&self, offset: u16) {
        (**self).set_buffer_table(offset)
    }
    fn read_packet_memory(&self, offset: u16) -> u16 {
        (**self).read_packet_memory(offset)
    }
    fn write_packet_memory(&self, offset: u16, value: u16) {
        (**self).write_packet_memory(offset, value)
    }
    fn connect(&self, connected: bool) {
        (**self).connect(connected)
    }
    fn delay_us(&self, us: u32) {
        (**self).delay_us(us)
    }
}
