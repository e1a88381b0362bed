//! Non-zero endpoint management
//!
//! An endpoint number has two sides, IN and OUT. Interrupt endpoints get
//! one buffer per side, and may use both sides of the same number. Bulk
//! endpoints get two buffers for their one side, and run double-buffered.
//!
//! Under double buffering the hardware repurposes the data toggle bits.
//! The toggle of the endpoint's own direction points at the buffer the
//! hardware uses next, and the other direction's toggle (`SW_BUF`) points
//! at the buffer software uses next. Neither is the USB data toggle.

use crate::{
    buffer::{self, Allocator},
    descriptor::{ConfigurationDescriptor, EndpointDescriptor, TransferType},
    epr::{EndpointRegister, Slot, Status},
    Peripheral, MAX_PACKET_SIZE, NUM_ENDPOINTS,
};
use usb_device::{descriptor::descriptor_type, UsbDirection, UsbError};

/// How many buffers a bulk IN endpoint may have queued for the host
///
/// With two buffers queued, some parts send the active buffer twice and
/// an empty buffer once. Queueing one at a time avoids that, at the cost
/// of throughput. This is a workaround for one peripheral, not a rule of
/// the protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BulkInPolicy {
    #[default]
    OneOutstanding,
    TwoOutstanding,
}

impl BulkInPolicy {
    const fn limit(self) -> u8 {
        match self {
            BulkInPolicy::OneOutstanding => 1,
            BulkInPolicy::TwoOutstanding => 2,
        }
    }
}

/// Why an endpoint couldn't be configured
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigureError {
    /// The endpoint number is zero, or out of range
    Address,
    /// This side of the endpoint is already enabled
    AlreadyEnabled,
    /// Both sides of a number are in use, but not both as interrupt
    Shared,
    /// Control and isochronous endpoints aren't supported
    Type,
    /// `wMaxPacketSize` is zero or too large
    PacketSize,
    /// Not enough packet memory for the endpoint's buffers
    OutOfMemory,
    /// A sub-descriptor of the configuration is malformed
    Malformed,
}

/// A packet memory buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    pub offset: u16,
    pub size: u16,
}

/// State of one endpoint number
pub struct EndpointState<T> {
    enabled_in: bool,
    enabled_out: bool,
    kind: TransferType,
    /// Indexed by `Slot`
    buffers: [Buffer; 2],
    /// Double-buffered only. OUT: buffers holding data. IN: buffers queued.
    outstanding: u8,
    waiting_in: Option<T>,
    waiting_out: Option<T>,
}

impl<T> EndpointState<T> {
    const fn new() -> Self {
        EndpointState {
            enabled_in: false,
            enabled_out: false,
            kind: TransferType::Interrupt,
            buffers: [Buffer { offset: 0, size: 0 }; 2],
            outstanding: 0,
            waiting_in: None,
            waiting_out: None,
        }
    }

    fn is_bulk(&self) -> bool {
        (self.enabled_in || self.enabled_out) && self.kind == TransferType::Bulk
    }

    fn buffer(&self, slot: Slot) -> Buffer {
        self.buffers[slot as usize]
    }

    /// Size of the IN buffer, or zero if the IN side is disabled
    pub fn in_size(&self) -> u16 {
        if self.enabled_in {
            self.buffer(Slot::Zero).size
        } else {
            0
        }
    }

    /// Size of the OUT buffer, or zero if the OUT side is disabled
    pub fn out_size(&self) -> u16 {
        match (self.enabled_out, self.kind) {
            (false, _) => 0,
            (true, TransferType::Bulk) => self.buffer(Slot::Zero).size,
            (true, _) => self.buffer(Slot::One).size,
        }
    }

    pub fn is_in_enabled(&self) -> bool {
        self.enabled_in
    }

    pub fn is_out_enabled(&self) -> bool {
        self.enabled_out
    }
}

/// Every non-zero endpoint
pub struct Endpoints<T> {
    // Index zero is never used, so that endpoint numbers index directly.
    eps: [EndpointState<T>; NUM_ENDPOINTS],
}

impl<T> Endpoints<T> {
    pub const fn new() -> Self {
        Endpoints {
            eps: [
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
                EndpointState::new(),
            ],
        }
    }

    /// Endpoint `number`, if it's a valid non-zero endpoint
    pub fn get(&self, number: usize) -> Option<&EndpointState<T>> {
        (1..NUM_ENDPOINTS).contains(&number).then(|| &self.eps[number])
    }

    fn get_mut(&mut self, number: usize) -> Result<&mut EndpointState<T>, UsbError> {
        if (1..NUM_ENDPOINTS).contains(&number) {
            Ok(&mut self.eps[number])
        } else {
            Err(UsbError::InvalidEndpoint)
        }
    }

    /// Configure every endpoint described in `config`
    ///
    /// Stops at the first endpoint that can't be configured. The caller
    /// should then deconfigure everything.
    pub fn configure_all<P: Peripheral>(
        &mut self,
        hw: &P,
        memory: &mut Allocator,
        config: ConfigurationDescriptor<'_>,
    ) -> Result<(), ConfigureError> {
        for desc in config.sub_descriptors() {
            let desc = desc.map_err(|_| ConfigureError::Malformed)?;
            if desc[1] != descriptor_type::ENDPOINT {
                continue;
            }
            let ep = EndpointDescriptor::new(desc).ok_or(ConfigureError::Malformed)?;
            self.configure(hw, memory, ep).map_err(|err| {
                warn!("Failed to configure endpoint {=u8}", ep.address());
                err
            })?;
        }
        Ok(())
    }

    /// Configure one side of an endpoint
    ///
    /// On failure, the endpoint and the packet memory are untouched.
    pub fn configure<P: Peripheral>(
        &mut self,
        hw: &P,
        memory: &mut Allocator,
        ep: EndpointDescriptor<'_>,
    ) -> Result<(), ConfigureError> {
        let number = usize::from(ep.number());
        if number == 0 || number >= NUM_ENDPOINTS {
            return Err(ConfigureError::Address);
        }
        let state = &mut self.eps[number];
        let direction = ep.direction();
        let (this_enabled, other_enabled) = match direction {
            UsbDirection::In => (state.enabled_in, state.enabled_out),
            UsbDirection::Out => (state.enabled_out, state.enabled_in),
        };
        if this_enabled {
            return Err(ConfigureError::AlreadyEnabled);
        }
        let kind = ep.transfer_type();
        if !matches!(kind, TransferType::Bulk | TransferType::Interrupt) {
            return Err(ConfigureError::Type);
        }
        if other_enabled && (kind != TransferType::Interrupt || state.kind != TransferType::Interrupt) {
            return Err(ConfigureError::Shared);
        }
        let size = ep.max_packet_size();
        if size == 0 || size > MAX_PACKET_SIZE {
            return Err(ConfigureError::PacketSize);
        }
        let buffers = if kind == TransferType::Bulk { 2 } else { 1 };
        if memory.available() < buffers * (size + (size & 1)) {
            return Err(ConfigureError::OutOfMemory);
        }

        debug!("Configuring endpoint {=u8}", ep.address());
        let epr = EndpointRegister::new(hw, number);
        if !other_enabled {
            epr.reset();
        }
        let mut allocate = || {
            let offset = memory.allocate(size).ok_or(ConfigureError::OutOfMemory)?;
            Ok::<_, ConfigureError>(Buffer { offset, size })
        };

        match (kind, direction) {
            (TransferType::Interrupt, UsbDirection::In) => {
                let buffer = allocate()?;
                epr.set_kind(false);
                epr.set_type(TransferType::Interrupt);
                epr.set_dtog_tx(false);
                epr.set_tx_buffer(Slot::Zero, buffer.offset, 0);
                epr.set_tx_status(Status::Nak);
                state.buffers[Slot::Zero as usize] = buffer;
                state.enabled_in = true;
            }
            (TransferType::Interrupt, UsbDirection::Out) => {
                let buffer = allocate()?;
                epr.set_kind(false);
                epr.set_type(TransferType::Interrupt);
                epr.set_dtog_rx(false);
                epr.set_rx_buffer(Slot::One, buffer.offset, size);
                epr.set_rx_status(Status::Valid);
                state.buffers[Slot::One as usize] = buffer;
                state.enabled_out = true;
            }
            (_, UsbDirection::In) => {
                let first = allocate()?;
                let second = allocate()?;
                epr.set_type(TransferType::Bulk);
                epr.set_kind(true);
                epr.set_dtog_tx(false);
                epr.set_dtog_rx(false);
                epr.set_tx_buffer(Slot::Zero, first.offset, 0);
                epr.set_tx_buffer(Slot::One, second.offset, 0);
                epr.set_tx_status(Status::Nak);
                state.buffers = [first, second];
                state.enabled_in = true;
            }
            (_, UsbDirection::Out) => {
                let first = allocate()?;
                let second = allocate()?;
                epr.set_type(TransferType::Bulk);
                epr.set_kind(true);
                epr.set_dtog_rx(false);
                epr.set_dtog_tx(false);
                epr.set_rx_buffer(Slot::Zero, first.offset, size);
                epr.set_rx_buffer(Slot::One, second.offset, size);
                epr.set_rx_status(Status::Valid);
                state.buffers = [first, second];
                state.enabled_out = true;
            }
        }
        state.kind = kind;
        state.outstanding = 0;
        Ok(())
    }

    /// Disable both sides of endpoint `number`, and wake its waiting threads
    pub fn deconfigure<P: Peripheral>(&mut self, hw: &P, number: usize, wake: &mut dyn FnMut(T)) {
        let state = &mut self.eps[number];
        EndpointRegister::new(hw, number).reset();
        state.enabled_in = false;
        state.enabled_out = false;
        state.outstanding = 0;
        if let Some(thread) = state.waiting_in.take() {
            wake(thread);
        }
        if let Some(thread) = state.waiting_out.take() {
            wake(thread);
        }
    }

    /// Disable every endpoint, and release their packet memory
    pub fn deconfigure_all<P: Peripheral>(
        &mut self,
        hw: &P,
        memory: &mut Allocator,
        wake: &mut dyn FnMut(T),
    ) {
        for number in 1..NUM_ENDPOINTS {
            self.deconfigure(hw, number, wake);
        }
        memory.reset();
    }

    /// Queue as much of `data` as fits for the host to read
    ///
    /// Returns the number of bytes queued, which is zero when there's no
    /// room yet.
    pub fn write<P: Peripheral>(
        &mut self,
        hw: &P,
        number: usize,
        data: &[u8],
        policy: BulkInPolicy,
    ) -> Result<usize, UsbError> {
        let state = self.get_mut(number)?;
        if !state.enabled_in {
            return Err(UsbError::InvalidEndpoint);
        }
        let epr = EndpointRegister::new(hw, number);
        let status = epr.tx_status();
        if status == Status::Stall {
            return Err(UsbError::InvalidState);
        }

        let slot = if state.kind == TransferType::Bulk {
            if state.outstanding >= policy.limit() {
                return Ok(0);
            }
            state.outstanding += 1;
            if epr.dtog_rx() {
                Slot::One
            } else {
                Slot::Zero
            }
        } else {
            if status != Status::Nak {
                return Ok(0);
            }
            Slot::Zero
        };

        let buffer = state.buffer(slot);
        let len = data.len().min(usize::from(buffer.size));
        buffer::copy_to(hw, buffer.offset, &data[..len]);
        epr.set_tx_count(slot, len as u16);
        if state.kind == TransferType::Bulk {
            epr.toggle_dtog_rx();
        }
        epr.set_tx_status(Status::Valid);
        trace!("Endpoint {=usize} IN buffer filled with {=usize} bytes", number, len);
        Ok(len)
    }

    /// Read one packet from the host into `data`
    ///
    /// `data` must hold at least the endpoint's OUT size. Returns the
    /// number of bytes read, which is zero when there's nothing to read.
    pub fn read<P: Peripheral>(
        &mut self,
        hw: &P,
        number: usize,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        let state = self.get_mut(number)?;
        if !state.enabled_out {
            return Err(UsbError::InvalidEndpoint);
        }
        if data.len() < usize::from(state.out_size()) {
            return Err(UsbError::BufferOverflow);
        }
        let epr = EndpointRegister::new(hw, number);
        let status = epr.rx_status();
        if status == Status::Stall {
            return Err(UsbError::InvalidState);
        }

        let slot = if state.kind == TransferType::Bulk {
            if state.outstanding == 0 {
                return Ok(0);
            }
            state.outstanding -= 1;
            if epr.dtog_tx() {
                Slot::One
            } else {
                Slot::Zero
            }
        } else {
            if status != Status::Nak {
                return Ok(0);
            }
            Slot::One
        };

        let buffer = state.buffer(slot);
        let len = usize::from(epr.received(slot).min(buffer.size));
        buffer::copy_from(hw, buffer.offset, &mut data[..len]);
        if state.kind == TransferType::Bulk {
            epr.toggle_dtog_tx();
        } else {
            epr.set_rx_status(Status::Valid);
        }
        trace!("Endpoint {=usize} OUT buffer read, {=usize} bytes", number, len);
        Ok(len)
    }

    /// Register `thread` to be woken when the IN side of `number` completes a transfer
    pub fn wait_in(&mut self, number: usize, thread: T) {
        if let Ok(state) = self.get_mut(number) {
            state.waiting_in = Some(thread);
        }
    }

    /// Register `thread` to be woken when the OUT side of `number` completes a transfer
    pub fn wait_out(&mut self, number: usize, thread: T) {
        if let Ok(state) = self.get_mut(number) {
            state.waiting_out = Some(thread);
        }
    }

    /// The host wrote a packet to `number`
    ///
    /// Clears the transfer flag, and returns the thread to wake.
    pub fn on_out_complete<P: Peripheral>(&mut self, hw: &P, number: usize) -> Option<T> {
        EndpointRegister::new(hw, number).clear_ctr_rx();
        let state = self.get_mut(number).ok()?;
        if state.is_bulk() {
            state.outstanding = (state.outstanding + 1).min(2);
        }
        state.waiting_out.take()
    }

    /// The host read a packet from `number`
    ///
    /// Clears the transfer flag, and returns the thread to wake.
    pub fn on_in_complete<P: Peripheral>(&mut self, hw: &P, number: usize) -> Option<T> {
        let epr = EndpointRegister::new(hw, number);
        epr.clear_ctr_tx();
        let state = self.get_mut(number).ok()?;
        if state.is_bulk() {
            // If the host reads again before the next write, it gets an
            // empty packet rather than a repeat of this one.
            let sent = if epr.dtog_tx() { Slot::Zero } else { Slot::One };
            epr.set_tx_count(sent, 0);
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        state.waiting_in.take()
    }

    /// Is `number` a double-buffered endpoint?
    pub fn is_double_buffered(&self, number: usize) -> bool {
        self.get(number).map_or(false, EndpointState::is_bulk)
    }

    /// Is a thread waiting on `direction` of endpoint `number`?
    #[cfg(test)]
    pub fn is_waiting(&self, number: usize, direction: UsbDirection) -> bool {
        self.get(number).map_or(false, |state| match direction {
            UsbDirection::In => state.waiting_in.is_some(),
            UsbDirection::Out => state.waiting_out.is_some(),
        })
    }
}
