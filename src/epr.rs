//! Endpoint registers
//!
//! Each `EPnR` mixes three kinds of bits:
//!
//! - `STAT_TX`, `STAT_RX`, `DTOG_TX` and `DTOG_RX` toggle when written with
//!   one, and don't change when written with zero.
//! - `CTR_TX` and `CTR_RX` clear when written with zero, and don't change
//!   when written with one. The hardware may set them at any time.
//! - Everything else is a plain read / write bit, except `SETUP` which is
//!   read only.
//!
//! A naive read-modify-write would toggle bits it meant to keep, and clear
//! transfer flags that arrived in between. Every mutation here starts from
//! [`Epr::untouched`], which turns a register value into the write that
//! changes nothing, then adds exactly the bits it needs.
//!
//! The same module owns the endpoint's entry in the buffer descriptor
//! table, since that's the other half of programming an endpoint.

use crate::{buffer::BTABLE, descriptor::TransferType, Peripheral};

bitflags::bitflags! {
    /// Endpoint register (`EPnR`) bits
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Epr : u16 {
        const EA = 0xF;
        const STAT_TX = 0b11 << 4;
        const DTOG_TX = 1 << 6;
        const CTR_TX = 1 << 7;
        const EP_KIND = 1 << 8;
        const EP_TYPE = 0b11 << 9;
        const SETUP = 1 << 11;
        const STAT_RX = 0b11 << 12;
        const DTOG_RX = 1 << 14;
        const CTR_RX = 1 << 15;

        const TOGGLES = Self::STAT_TX.bits() | Self::DTOG_TX.bits()
            | Self::STAT_RX.bits() | Self::DTOG_RX.bits();
        const FLAGS = Self::CTR_TX.bits() | Self::CTR_RX.bits();
    }
}

const STAT_TX_OFFSET: u16 = 4;
const STAT_RX_OFFSET: u16 = 12;
const EP_TYPE_OFFSET: u16 = 9;

/// Endpoint handshake status
///
/// Encoded the same way in `STAT_TX` and `STAT_RX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Disabled = 0b00,
    Stall = 0b01,
    Nak = 0b10,
    Valid = 0b11,
}

impl Status {
    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Status::Disabled,
            0b01 => Status::Stall,
            0b10 => Status::Nak,
            _ => Status::Valid,
        }
    }
}

/// Select one of the two buffer table slots of an endpoint
///
/// A single-buffered endpoint transmits from `Zero` and receives into
/// `One`. A double-buffered endpoint uses both slots for its one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Zero,
    One,
}

impl Slot {
    /// Offset of the address word in the buffer descriptor table
    fn address(self, endpoint: usize) -> u16 {
        let base = BTABLE + 8 * endpoint as u16;
        match self {
            Slot::Zero => base,
            Slot::One => base + 4,
        }
    }
    /// Offset of the count word in the buffer descriptor table
    fn count(self, endpoint: usize) -> u16 {
        self.address(endpoint) + 2
    }
}

/// Block-size flag of a receive count word
const BL_SIZE: u16 = 1 << 15;

/// Bits of a receive count word holding the received byte count
const COUNT_MASK: u16 = 0x3FF;

/// Encode a receive buffer size for the count word of the buffer table
///
/// Sizes up to 62 bytes are counted in two-byte blocks; larger sizes in
/// 32-byte blocks, with `BL_SIZE` set. `size` is rounded up to the
/// block size, so the buffer always holds `size` bytes.
pub fn rx_size_field(size: u16) -> u16 {
    if size > 62 {
        BL_SIZE | ((size.div_ceil(32) - 1) << 10)
    } else {
        size.div_ceil(2) << 10
    }
}

impl Epr {
    /// The value that, written back, changes nothing
    ///
    /// Toggle bits become zero and transfer flags become one.
    pub fn untouched(self) -> Epr {
        (self - Epr::TOGGLES) | Epr::FLAGS
    }

    pub fn tx_status(self) -> Status {
        Status::from_bits(self.bits() >> STAT_TX_OFFSET)
    }

    pub fn rx_status(self) -> Status {
        Status::from_bits(self.bits() >> STAT_RX_OFFSET)
    }

    /// Compute the write that sets the TX status
    pub fn with_tx_status(self, status: Status) -> Epr {
        let toggle = (self & Epr::STAT_TX).bits() ^ ((status as u16) << STAT_TX_OFFSET);
        self.untouched() | Epr::from_bits_retain(toggle)
    }

    /// Compute the write that sets the RX status
    pub fn with_rx_status(self, status: Status) -> Epr {
        let toggle = (self & Epr::STAT_RX).bits() ^ ((status as u16) << STAT_RX_OFFSET);
        self.untouched() | Epr::from_bits_retain(toggle)
    }

    /// Compute the write that sets the DTOG_TX bit to `value`
    pub fn with_dtog_tx(self, value: bool) -> Epr {
        let toggle = self.contains(Epr::DTOG_TX) != value;
        self.untouched() | if toggle { Epr::DTOG_TX } else { Epr::empty() }
    }

    /// Compute the write that sets the DTOG_RX bit to `value`
    pub fn with_dtog_rx(self, value: bool) -> Epr {
        let toggle = self.contains(Epr::DTOG_RX) != value;
        self.untouched() | if toggle { Epr::DTOG_RX } else { Epr::empty() }
    }

    /// Compute the write that sets the transfer type
    pub fn with_type(self, kind: TransferType) -> Epr {
        let bits = match kind {
            TransferType::Bulk => 0b00,
            TransferType::Control => 0b01,
            TransferType::Isochronous => 0b10,
            TransferType::Interrupt => 0b11,
        };
        (self.untouched() - Epr::EP_TYPE) | Epr::from_bits_retain(bits << EP_TYPE_OFFSET)
    }

    pub fn transfer_type(self) -> TransferType {
        match (self & Epr::EP_TYPE).bits() >> EP_TYPE_OFFSET {
            0b00 => TransferType::Bulk,
            0b01 => TransferType::Control,
            0b10 => TransferType::Isochronous,
            _ => TransferType::Interrupt,
        }
    }

    /// Compute the write that sets or clears `EP_KIND`
    pub fn with_kind(self, kind: bool) -> Epr {
        let write = self.untouched() - Epr::EP_KIND;
        if kind {
            write | Epr::EP_KIND
        } else {
            write
        }
    }

    /// Compute the write that clears `CTR_TX`, and nothing else
    pub fn clear_ctr_tx(self) -> Epr {
        self.untouched() - Epr::CTR_TX
    }

    /// Compute the write that clears `CTR_RX`, and nothing else
    pub fn clear_ctr_rx(self) -> Epr {
        self.untouched() - Epr::CTR_RX
    }

    /// Compute the write that returns the register to its reset state
    ///
    /// Both directions disabled, both data toggles zero, no pending
    /// transfers, bulk type, and the endpoint address field set to `address`.
    pub fn reset(self, address: u8) -> Epr {
        (self & Epr::TOGGLES) | Epr::from_bits_retain(u16::from(address)) & Epr::EA
    }
}

/// One endpoint's register and buffer table entry
pub struct EndpointRegister<'a, P> {
    hw: &'a P,
    index: usize,
}

impl<'a, P: Peripheral> EndpointRegister<'a, P> {
    /// # Panics
    ///
    /// Panics if `index` isn't a valid endpoint register.
    pub fn new(hw: &'a P, index: usize) -> Self {
        assert!(index < crate::NUM_ENDPOINTS);
        EndpointRegister { hw, index }
    }

    pub fn read(&self) -> Epr {
        Epr::from_bits_retain(self.hw.endpoint_register(self.index))
    }

    fn write(&self, epr: Epr) {
        self.hw.set_endpoint_register(self.index, epr.bits());
    }

    /// Disable the endpoint, and clear its flags and toggles
    pub fn reset(&self) {
        self.write(self.read().reset(self.index as u8));
    }

    pub fn set_type(&self, kind: TransferType) {
        self.write(self.read().with_type(kind));
    }

    pub fn tx_status(&self) -> Status {
        self.read().tx_status()
    }

    pub fn set_tx_status(&self, status: Status) {
        self.write(self.read().with_tx_status(status));
    }

    pub fn rx_status(&self) -> Status {
        self.read().rx_status()
    }

    pub fn set_rx_status(&self, status: Status) {
        self.write(self.read().with_rx_status(status));
    }

    /// Set `EP_KIND`
    ///
    /// On a bulk endpoint, this enables double buffering. On a control
    /// endpoint, this makes the RX side accept zero length packets only.
    pub fn set_kind(&self, kind: bool) {
        self.write(self.read().with_kind(kind));
    }

    pub fn dtog_tx(&self) -> bool {
        self.read().contains(Epr::DTOG_TX)
    }

    pub fn set_dtog_tx(&self, value: bool) {
        self.write(self.read().with_dtog_tx(value));
    }

    pub fn toggle_dtog_tx(&self) {
        self.write(self.read().untouched() | Epr::DTOG_TX);
    }

    pub fn dtog_rx(&self) -> bool {
        self.read().contains(Epr::DTOG_RX)
    }

    pub fn set_dtog_rx(&self, value: bool) {
        self.write(self.read().with_dtog_rx(value));
    }

    pub fn toggle_dtog_rx(&self) {
        self.write(self.read().untouched() | Epr::DTOG_RX);
    }

    pub fn clear_ctr_tx(&self) {
        self.write(self.read().clear_ctr_tx());
    }

    pub fn clear_ctr_rx(&self) {
        self.write(self.read().clear_ctr_rx());
    }

    /// Point the transmit side of `slot` at `addr`, with `count` bytes to send
    pub fn set_tx_buffer(&self, slot: Slot, addr: u16, count: u16) {
        self.hw.write_packet_memory(slot.address(self.index), addr & !1);
        self.set_tx_count(slot, count);
    }

    /// Set the number of bytes to send from `slot`
    pub fn set_tx_count(&self, slot: Slot, count: u16) {
        self.hw.write_packet_memory(slot.count(self.index), count);
    }

    /// Point the receive side of `slot` at `addr`, able to hold `size` bytes
    pub fn set_rx_buffer(&self, slot: Slot, addr: u16, size: u16) {
        self.hw.write_packet_memory(slot.address(self.index), addr & !1);
        self.hw.write_packet_memory(slot.count(self.index), rx_size_field(size));
    }

    /// Number of bytes received into `slot`
    pub fn received(&self, slot: Slot) -> u16 {
        self.hw.read_packet_memory(slot.count(self.index)) & COUNT_MASK
    }
}
