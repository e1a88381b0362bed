//! USB full-speed peripheral registers
//!
//! The register block and its field modules follow the RAL layout, so the
//! `ral-registers` macros work with them. [`Instance`] is the production
//! [`Peripheral`](crate::Peripheral), bound to the memory-mapped registers
//! and the packet memory of an STM32F1.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{read_reg, write_reg, RORegister, RWRegister};

use crate::Peripheral;

/// USB register block base address
pub const USB_BASE: usize = 0x4000_5C00;
/// Packet memory base address, as seen by the CPU
pub const PMA_BASE: usize = 0x4000_6000;

#[repr(C)]
pub struct RegisterBlock {
    pub EPR: [RWRegister<u32>; 8],
    _reserved: [u32; 8],
    pub CNTR: RWRegister<u32>,
    pub ISTR: RWRegister<u32>,
    pub FNR: RORegister<u32>,
    pub DADDR: RWRegister<u32>,
    pub BTABLE: RWRegister<u32>,
}

const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x54) as usize];

pub mod CNTR {
    pub mod FRES {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod PDWN {
        pub const offset: u32 = 1;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod LP_MODE {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod FSUSP {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod RESUME {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Interrupt mask bits, ESOFM through CTRM
    pub mod MASKS {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod ISTR {
    pub mod EP_ID {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DIR {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Interrupt flags, ESOF through CTR
    pub mod FLAGS {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod DADDR {
    pub mod ADD {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod EF {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod BTABLE {
    pub mod BTABLE {
        pub const offset: u32 = 3;
        pub const mask: u32 = 0x1FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

bitflags::bitflags! {
    /// Control register (CNTR) bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Control : u16 {
        const FRES = CNTR::FRES::mask as u16;
        const PDWN = CNTR::PDWN::mask as u16;
        const LP_MODE = CNTR::LP_MODE::mask as u16;
        const FSUSP = CNTR::FSUSP::mask as u16;
        const RESUME = CNTR::RESUME::mask as u16;
        const ESOFM = 1 << 8;
        const SOFM = 1 << 9;
        const RESETM = 1 << 10;
        const SUSPM = 1 << 11;
        const WKUPM = 1 << 12;
        const ERRM = 1 << 13;
        const PMAOVRM = 1 << 14;
        const CTRM = 1 << 15;
    }
}

bitflags::bitflags! {
    /// Interrupt status register (ISTR) bits
    ///
    /// `EP_ID` and `DIR` describe the endpoint with the highest priority
    /// pending transfer; they are only meaningful while `CTR` is set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupt : u16 {
        const EP_ID = ISTR::EP_ID::mask as u16;
        const DIR = ISTR::DIR::mask as u16;
        const ESOF = 1 << 8;
        const SOF = 1 << 9;
        const RESET = 1 << 10;
        const SUSP = 1 << 11;
        const WKUP = 1 << 12;
        const ERR = 1 << 13;
        const PMAOVR = 1 << 14;
        const CTR = 1 << 15;
    }
}

impl Interrupt {
    /// The endpoint number reported by `EP_ID`
    pub fn endpoint(self) -> usize {
        usize::from(self.bits() & Self::EP_ID.bits())
    }
}

/// The memory-mapped USB peripheral of an STM32F1
///
/// Owns the USB register block and the packet memory. The packet memory
/// is 512 bytes, exposed to the CPU as 16-bit words on a 32-bit stride.
pub struct Instance {
    usb: *const RegisterBlock,
    pma: *mut u32,
    cycles_per_us: u32,
}

// Safety: the instance is the unique owner of the registers it points to.
unsafe impl Send for Instance {}

impl Instance {
    /// Take the USB peripheral
    ///
    /// `sysclk_hz` is the core clock frequency; it's used to time the
    /// analog power-up delay.
    ///
    /// # Safety
    ///
    /// There must be only one `Instance` at a time. The caller must have
    /// enabled the USB clock (48MHz, from the USB prescaler) before
    /// enabling the device.
    pub const unsafe fn new(sysclk_hz: u32) -> Self {
        Instance {
            usb: USB_BASE as *const RegisterBlock,
            pma: PMA_BASE as *mut u32,
            cycles_per_us: sysclk_hz / 1_000_000,
        }
    }

    fn usb(&self) -> &RegisterBlock {
        // Safety: the address is valid for the life of the program.
        unsafe { &*self.usb }
    }

    fn pma_word(&self, offset: u16) -> *mut u32 {
        debug_assert!(offset < crate::buffer::PMA_SIZE);
        // Safety: packet memory offsets never exceed PMA_SIZE.
        unsafe { self.pma.add(usize::from(offset) / 2) }
    }
}

impl Peripheral for Instance {
    fn endpoint_register(&self, index: usize) -> u16 {
        self.usb().EPR[index].read() as u16
    }

    fn set_endpoint_register(&self, index: usize, value: u16) {
        self.usb().EPR[index].write(u32::from(value));
    }

    fn control(&self) -> Control {
        Control::from_bits_retain(read_reg!(crate::ral, self.usb(), CNTR) as u16)
    }

    fn set_control(&self, control: Control) {
        write_reg!(crate::ral, self.usb(), CNTR, u32::from(control.bits()));
    }

    fn interrupt_status(&self) -> Interrupt {
        Interrupt::from_bits_retain(read_reg!(crate::ral, self.usb(), ISTR) as u16)
    }

    fn clear_interrupts(&self, interrupts: Interrupt) {
        // Flags are cleared by writing zero, and unaffected by writing one.
        let keep = !(u32::from(interrupts.bits()) >> ISTR::FLAGS::offset);
        write_reg!(crate::ral, self.usb(), ISTR, FLAGS: keep);
    }

    fn set_address(&self, address: u8, enabled: bool) {
        write_reg!(crate::ral, self.usb(), DADDR, ADD: u32::from(address), EF: u32::from(enabled));
    }

    fn set_buffer_table(&self, offset: u16) {
        write_reg!(crate::ral, self.usb(), BTABLE, BTABLE: u32::from(offset) >> 3);
    }

    fn read_packet_memory(&self, offset: u16) -> u16 {
        // Safety: see pma_word.
        unsafe { self.pma_word(offset).read_volatile() as u16 }
    }

    fn write_packet_memory(&self, offset: u16, value: u16) {
        // Safety: see pma_word.
        unsafe { self.pma_word(offset).write_volatile(u32::from(value)) }
    }

    fn delay_us(&self, us: u32) {
        cortex_m::asm::delay(self.cycles_per_us.saturating_mul(us).max(1));
    }
}
