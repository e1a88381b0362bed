//! A software USB peripheral, and the host at the other end of the cable
//!
//! [`Sim`] implements [`Peripheral`] with the register semantics of the
//! real part: toggle bits flip when written with one, transfer flags clear
//! when written with zero, and the interrupt status is computed from the
//! endpoint registers. The `host_*` methods issue tokens the way a host
//! controller would, honoring endpoint status, `EP_KIND`, and double
//! buffering.

use crate::{
    control::ControlHandler,
    device::{Callbacks, EndpointIo},
    epr::Epr,
    ral::{Control, Interrupt},
    scheduler::Scheduler,
    state::State,
    Peripheral, NUM_ENDPOINTS,
};
use bare_metal::CriticalSection;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    thread::{Thread, ThreadId},
    vec::Vec,
};
use usb_device::{control::Request, UsbDirection};

/// How the simulated device answered a token
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handshake {
    Ack,
    Nak,
    Stall,
    /// Data from an IN token
    Data(Vec<u8>),
    /// No answer; the endpoint or the address isn't enabled
    Timeout,
}

const WORDS: usize = crate::buffer::PMA_SIZE as usize / 2;

struct Registers {
    epr: [u16; NUM_ENDPOINTS],
    control: u16,
    /// ISTR flags, ESOF through PMAOVR. CTR is computed.
    istr: u16,
    address: u8,
    function_enabled: bool,
    btable: u16,
    connected: bool,
    pma: [u16; WORDS],
    /// Double-buffered endpoints: buffers queued for IN, or holding unread OUT data
    queued: [u8; NUM_ENDPOINTS],
    host_address: u8,
    host_ep0_size: usize,
}

pub struct Sim {
    regs: Mutex<Registers>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

fn is_double_buffered(epr: Epr) -> bool {
    epr.contains(Epr::EP_KIND) && epr.transfer_type() == crate::descriptor::TransferType::Bulk
}

fn status_bits(epr: u16, offset: u16) -> u16 {
    (epr >> offset) & 0b11
}

const TX: u16 = 4;
const RX: u16 = 12;
const DISABLED: u16 = 0b00;
const STALL: u16 = 0b01;
const NAK: u16 = 0b10;

impl Registers {
    fn set_status(&mut self, index: usize, offset: u16, status: u16) {
        let mask = 0b11 << offset;
        self.epr[index] = (self.epr[index] & !mask) | (status << offset);
    }

    fn accepts(&self) -> bool {
        self.function_enabled && self.address == self.host_address
    }

    fn slot_words(&self, index: usize, slot: u16) -> (usize, usize) {
        let base = usize::from(self.btable) + 8 * index + 4 * usize::from(slot);
        (base / 2, base / 2 + 1)
    }

    fn read_bytes(&self, offset: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let byte = usize::from(offset) + i;
                self.pma[byte / 2].to_le_bytes()[byte % 2]
            })
            .collect()
    }

    fn write_bytes(&mut self, offset: u16, data: &[u8]) {
        for (i, value) in data.iter().enumerate() {
            let byte = usize::from(offset) + i;
            let mut word = self.pma[byte / 2].to_le_bytes();
            word[byte % 2] = *value;
            self.pma[byte / 2] = u16::from_le_bytes(word);
        }
    }
}

/// Capacity of a receive buffer, decoded from its count word
fn rx_capacity(count: u16) -> usize {
    let blocks = usize::from((count >> 10) & 0x1F);
    if count & 0x8000 != 0 {
        (blocks + 1) * 32
    } else {
        blocks * 2
    }
}

impl Sim {
    pub fn new() -> Self {
        Sim {
            regs: Mutex::new(Registers {
                epr: [0; NUM_ENDPOINTS],
                control: (Control::FRES | Control::PDWN).bits(),
                istr: 0,
                address: 0,
                // Answer on address zero until the first bus reset
                function_enabled: true,
                btable: 0,
                connected: false,
                pma: [0; WORDS],
                queued: [0; NUM_ENDPOINTS],
                host_address: 0,
                host_ep0_size: 32,
            }),
        }
    }

    fn regs(&self) -> MutexGuard<'_, Registers> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pma_word(&self, offset: u16) -> u16 {
        self.regs().pma[usize::from(offset) / 2]
    }

    pub fn set_pma_word(&self, offset: u16, value: u16) {
        self.regs().pma[usize::from(offset) / 2] = value;
    }

    /// Set transfer flags, as the hardware would
    pub fn raise_ctr(&self, index: usize, flags: Epr) {
        self.regs().epr[index] |= (flags & Epr::FLAGS).bits();
    }

    /// The device address and function enable bit
    pub fn address(&self) -> (u8, bool) {
        let regs = self.regs();
        (regs.address, regs.function_enabled)
    }

    pub fn is_connected(&self) -> bool {
        self.regs().connected
    }

    /// Address the host uses for its tokens
    pub fn set_host_address(&self, address: u8) {
        self.regs().host_address = address;
    }

    /// Signal a bus reset
    pub fn host_reset(&self) {
        let mut regs = self.regs();
        regs.epr = [0; NUM_ENDPOINTS];
        regs.queued = [0; NUM_ENDPOINTS];
        regs.address = 0;
        regs.function_enabled = false;
        regs.host_address = 0;
        regs.istr |= Interrupt::RESET.bits();
    }

    /// Stop sending frames
    pub fn host_suspend(&self) {
        self.regs().istr |= Interrupt::SUSP.bits();
    }

    /// Resume sending frames
    pub fn host_resume(&self) {
        let mut regs = self.regs();
        regs.istr |= Interrupt::WKUP.bits();
        regs.control &= !Control::LP_MODE.bits();
    }

    /// Send a SETUP packet to endpoint zero
    pub fn host_setup(&self, packet: [u8; 8]) -> Handshake {
        let mut regs = self.regs();
        let epr = Epr::from_bits_retain(regs.epr[0]);
        if !regs.accepts() || status_bits(epr.bits(), RX) == DISABLED {
            return Handshake::Timeout;
        }
        let (address, count) = regs.slot_words(0, 1);
        let offset = regs.pma[address];
        regs.write_bytes(offset, &packet);
        regs.pma[count] = (regs.pma[count] & !0x3FF) | 8;
        regs.epr[0] |= (Epr::SETUP | Epr::CTR_RX).bits();
        regs.set_status(0, TX, NAK);
        regs.set_status(0, RX, NAK);
        Handshake::Ack
    }

    /// Send an IN token
    pub fn host_in(&self, index: usize) -> Handshake {
        let mut regs = self.regs();
        if !regs.accepts() {
            return Handshake::Timeout;
        }
        let epr = Epr::from_bits_retain(regs.epr[index]);
        match status_bits(epr.bits(), TX) {
            DISABLED => return Handshake::Timeout,
            STALL => return Handshake::Stall,
            NAK => return Handshake::Nak,
            _ => {}
        }
        let double_buffered = is_double_buffered(epr);
        let slot = if double_buffered {
            if regs.queued[index] == 0 {
                return Handshake::Nak;
            }
            regs.queued[index] -= 1;
            u16::from(epr.contains(Epr::DTOG_TX))
        } else {
            0
        };
        let (address, count) = regs.slot_words(index, slot);
        let data = regs.read_bytes(regs.pma[address], usize::from(regs.pma[count] & 0x3FF));
        regs.epr[index] ^= Epr::DTOG_TX.bits();
        if !double_buffered {
            regs.set_status(index, TX, NAK);
        }
        regs.epr[index] |= Epr::CTR_TX.bits();
        Handshake::Data(data)
    }

    /// Send an OUT token and its data
    pub fn host_out(&self, index: usize, data: &[u8]) -> Handshake {
        let mut regs = self.regs();
        if !regs.accepts() {
            return Handshake::Timeout;
        }
        let epr = Epr::from_bits_retain(regs.epr[index]);
        match status_bits(epr.bits(), RX) {
            DISABLED => return Handshake::Timeout,
            STALL => return Handshake::Stall,
            NAK => return Handshake::Nak,
            _ => {}
        }
        let control = epr.transfer_type() == crate::descriptor::TransferType::Control;
        if control && epr.contains(Epr::EP_KIND) && !data.is_empty() {
            return Handshake::Stall;
        }
        let double_buffered = is_double_buffered(epr);
        let slot = if double_buffered {
            if regs.queued[index] >= 2 {
                return Handshake::Nak;
            }
            u16::from(epr.contains(Epr::DTOG_RX))
        } else {
            1
        };
        let (address, count) = regs.slot_words(index, slot);
        if data.len() > rx_capacity(regs.pma[count]) {
            return Handshake::Timeout;
        }
        if double_buffered {
            regs.queued[index] += 1;
        }
        let offset = regs.pma[address];
        regs.write_bytes(offset, data);
        regs.pma[count] = (regs.pma[count] & !0x3FF) | data.len() as u16;
        regs.epr[index] ^= Epr::DTOG_RX.bits();
        if !double_buffered {
            regs.set_status(index, RX, NAK);
        }
        regs.epr[index] = (regs.epr[index] & !Epr::SETUP.bits()) | Epr::CTR_RX.bits();
        Handshake::Ack
    }

    /// A control read: SETUP, IN data until a short packet, then the status OUT
    ///
    /// Runs `isr` after every token the device acknowledges.
    pub fn control_in(&self, setup: [u8; 8], isr: &mut dyn FnMut()) -> Result<Vec<u8>, Handshake> {
        let length = usize::from(u16::from_le_bytes([setup[6], setup[7]]));
        let ep0_size = self.regs().host_ep0_size;
        match self.host_setup(setup) {
            Handshake::Ack => isr(),
            other => return Err(other),
        }
        let mut data = Vec::new();
        loop {
            match self.host_in(0) {
                Handshake::Data(packet) => {
                    isr();
                    let short = packet.len() < ep0_size;
                    data.extend_from_slice(&packet);
                    if short || data.len() >= length {
                        break;
                    }
                }
                other => return Err(other),
            }
        }
        match self.host_out(0, &[]) {
            Handshake::Ack => isr(),
            other => return Err(other),
        }
        Ok(data)
    }

    /// A control write: SETUP, OUT data, then the status IN
    pub fn control_out(&self, setup: [u8; 8], data: &[u8], isr: &mut dyn FnMut()) -> Result<(), Handshake> {
        let ep0_size = self.regs().host_ep0_size;
        match self.host_setup(setup) {
            Handshake::Ack => isr(),
            other => return Err(other),
        }
        for chunk in data.chunks(ep0_size) {
            match self.host_out(0, chunk) {
                Handshake::Ack => isr(),
                other => return Err(other),
            }
        }
        match self.host_in(0) {
            Handshake::Data(status) if status.is_empty() => {
                isr();
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl Peripheral for Sim {
    fn endpoint_register(&self, index: usize) -> u16 {
        self.regs().epr[index]
    }

    fn set_endpoint_register(&self, index: usize, value: u16) {
        let mut regs = self.regs();
        let old = regs.epr[index];
        let toggles = Epr::TOGGLES.bits();
        let flags = Epr::FLAGS.bits();
        let setup = Epr::SETUP.bits();
        let plain = !(toggles | flags | setup);
        let new = (old & setup) | (value & plain) | ((old ^ value) & toggles) | (old & value & flags);
        regs.epr[index] = new;

        let epr = Epr::from_bits_retain(new);
        if !is_double_buffered(epr) {
            regs.queued[index] = 0;
            return;
        }
        // Software flips SW_BUF to hand a buffer to the hardware
        if value & Epr::DTOG_RX.bits() != 0 && status_bits(new, TX) != DISABLED {
            regs.queued[index] = (regs.queued[index] + 1).min(2);
        }
        if value & Epr::DTOG_TX.bits() != 0 && status_bits(new, RX) != DISABLED {
            regs.queued[index] = regs.queued[index].saturating_sub(1);
        }
    }

    fn control(&self) -> Control {
        Control::from_bits_retain(self.regs().control)
    }

    fn set_control(&self, control: Control) {
        self.regs().control = control.bits();
    }

    fn interrupt_status(&self) -> Interrupt {
        let regs = self.regs();
        let mut istr = regs.istr;
        let pending = regs
            .epr
            .iter()
            .position(|epr| epr & Epr::FLAGS.bits() != 0);
        if let Some(index) = pending {
            istr |= Interrupt::CTR.bits() | index as u16;
            if regs.epr[index] & Epr::CTR_RX.bits() != 0 {
                istr |= Interrupt::DIR.bits();
            }
        }
        Interrupt::from_bits_retain(istr)
    }

    fn clear_interrupts(&self, interrupts: Interrupt) {
        self.regs().istr &= !(interrupts.bits() & 0xFF00);
    }

    fn set_address(&self, address: u8, enabled: bool) {
        let mut regs = self.regs();
        regs.address = address;
        regs.function_enabled = enabled;
    }

    fn set_buffer_table(&self, offset: u16) {
        self.regs().btable = offset;
    }

    fn read_packet_memory(&self, offset: u16) -> u16 {
        assert!(offset % 2 == 0);
        self.regs().pma[usize::from(offset) / 2]
    }

    fn write_packet_memory(&self, offset: u16, value: u16) {
        assert!(offset % 2 == 0);
        self.regs().pma[usize::from(offset) / 2] = value;
    }

    fn connect(&self, connected: bool) {
        self.regs().connected = connected;
    }
}

/// Parks and wakes native threads
///
/// Critical sections serialize on one lock. Like `interrupt::free`, they
/// nest: a thread inside a critical section may enter another.
#[derive(Default)]
pub struct StdScheduler {
    lock: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
    sections: AtomicUsize,
}

impl StdScheduler {
    /// Outermost critical sections entered so far
    pub fn sections(&self) -> usize {
        self.sections.load(Ordering::SeqCst)
    }

    fn owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases ownership of the critical section, even if `f` panics
struct Owned<'s>(&'s StdScheduler);

impl Drop for Owned<'_> {
    fn drop(&mut self) {
        *self.0.owner() = None;
    }
}

unsafe impl Scheduler for StdScheduler {
    type Thread = Thread;

    fn free<R>(&self, f: impl FnOnce(&CriticalSection) -> R) -> R {
        let me = std::thread::current().id();
        if *self.owner() == Some(me) {
            // Safety: this thread already holds the lock.
            return f(unsafe { &CriticalSection::new() });
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        *self.owner() = Some(me);
        let _owned = Owned(self);
        self.sections.fetch_add(1, Ordering::SeqCst);
        // Safety: the lock excludes every other critical section.
        f(unsafe { &CriticalSection::new() })
    }

    fn current(&self) -> Thread {
        std::thread::current()
    }

    fn park(&self) {
        std::thread::park();
    }

    fn wake(&self, thread: &Thread) {
        thread.unpark();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Endpoint(u8, UsbDirection),
    Suspend,
    Resume,
    Reset,
}

/// Callbacks that remember every call
#[derive(Default)]
pub struct Recorder {
    pub states: Vec<State>,
    pub configurations: Vec<u8>,
    pub events: Vec<Event>,
}

impl Callbacks for Recorder {
    fn endpoint(&mut self, _: &mut dyn EndpointIo, number: u8, direction: UsbDirection) {
        self.events.push(Event::Endpoint(number, direction));
    }
    fn state_changed(&mut self, state: State) {
        self.states.push(state);
    }
    fn configuration_changed(&mut self, configuration: u8) {
        self.configurations.push(configuration);
    }
    fn suspend(&mut self) {
        self.events.push(Event::Suspend);
    }
    fn resume(&mut self) {
        self.events.push(Event::Resume);
    }
    fn reset(&mut self) {
        self.events.push(Event::Reset);
    }
}

/// A vendor request handler with a 128 byte data buffer
///
/// Accepts vendor requests with `bRequest == 1`, and as much data as fits.
pub struct Vendor {
    pub buffer: [u8; 128],
    pub requests: Vec<Request>,
    pub completed: usize,
    pub acknowledge: bool,
}

impl Default for Vendor {
    fn default() -> Self {
        Vendor {
            buffer: [0; 128],
            requests: Vec::new(),
            completed: 0,
            acknowledge: true,
        }
    }
}

impl ControlHandler for Vendor {
    fn setup(&mut self, request: &Request) -> bool {
        self.requests.push(*request);
        request.request_type == usb_device::control::RequestType::Vendor && request.request == 1
    }
    fn data_buffer(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.buffer)
    }
    fn end_of_out_data_stage(&mut self, _: &Request) -> bool {
        self.completed += 1;
        self.acknowledge
    }
}

/// Build a SETUP packet
pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [v0, v1] = value.to_le_bytes();
    let [i0, i1] = index.to_le_bytes();
    let [l0, l1] = length.to_le_bytes();
    [request_type, request, v0, v1, i0, i1, l0, l1]
}

pub mod fixtures {
    use std::vec::Vec;

    /// Full speed, 32 byte control packets, one configuration
    pub const DEVICE: [u8; 18] = [
        18, 1, 0x00, 0x02, 0xFF, 0x00, 0x00, 32, 0x83, 0x04, 0x50, 0x57, 0x00, 0x01, 1, 2, 0, 1,
    ];

    /// Self powered, bulk IN 1, bulk OUT 2, interrupt IN and OUT 3
    pub const CONFIGURATION: [u8; 46] = [
        9, 2, 46, 0, 1, 1, 0, 0xC0, 50, //
        9, 4, 0, 0, 4, 0xFF, 0, 0, 0, //
        7, 5, 0x81, 0x02, 64, 0, 0, //
        7, 5, 0x02, 0x02, 64, 0, 0, //
        7, 5, 0x83, 0x03, 16, 0, 1, //
        7, 5, 0x03, 0x03, 16, 0, 1,
    ];

    pub static STRINGS: [&[u8]; 3] = [
        &[4, 3, 0x09, 0x04],
        &[8, 3, b'S', 0, b'i', 0, b'm', 0],
        &[6, 3, b'U', 0, b'1', 0],
    ];

    /// Write the length of `raw` into its `wTotalLength`
    pub fn fix_total_length(raw: &mut [u8]) {
        let [lo, hi] = (raw.len() as u16).to_le_bytes();
        raw[2] = lo;
        raw[3] = hi;
    }

    /// Configuration 1 with one interface holding `endpoints`
    pub fn config_with_endpoints(endpoints: &[[u8; 7]]) -> Vec<u8> {
        let mut raw = std::vec![
            9, 2, 0, 0, 1, 1, 0, 0x80, 50, //
            9, 4, 0, 0, endpoints.len() as u8, 0xFF, 0, 0, 0,
        ];
        for endpoint in endpoints {
            raw.extend_from_slice(endpoint);
        }
        fix_total_length(&mut raw);
        raw
    }
}
