//! Endpoint zero control transfers
//!
//! The control pipe answers the standard requests the stack owns, and
//! forwards class and vendor requests to a [`ControlHandler`].
//!
//! Each endpoint zero interrupt runs between [`ControlPipe::status_nak`] and
//! [`ControlPipe::restore_status`]. The service routine arms the
//! directions it expects the host to use next; every other direction goes
//! back to STALL, or to NAK while the last packet of an OUT data stage is
//! outstanding. Without that NAK, a fast host could see a STALL on the
//! status stage before the final OUT packet is processed.

use crate::{
    buffer,
    descriptor::ConfigurationDescriptor,
    device::Context,
    epr::{EndpointRegister, Slot, Status},
    state::State,
    Peripheral,
};
use usb_device::{
    control::{Recipient, Request, RequestType},
    descriptor::descriptor_type,
    UsbDirection,
};

/// Handles class and vendor requests on endpoint zero
///
/// The stack calls these methods from the USB interrupt.
///
/// # Example
///
/// Accept a vendor request that sends four bytes to the device.
///
/// ```
/// use stm32f1_usbfs::ControlHandler;
/// use usb_device::control::{Request, RequestType};
///
/// struct Vendor {
///     buffer: [u8; 4],
/// }
///
/// impl ControlHandler for Vendor {
///     fn setup(&mut self, request: &Request) -> bool {
///         request.request_type == RequestType::Vendor
///             && request.request == 0x42
///             && usize::from(request.length) <= self.buffer.len()
///     }
///     fn data_buffer(&mut self) -> Option<&mut [u8]> {
///         Some(&mut self.buffer)
///     }
///     fn end_of_out_data_stage(&mut self, _: &Request) -> bool {
///         true
///     }
/// }
/// ```
pub trait ControlHandler {
    /// A non-standard request arrived
    ///
    /// Return `true` to accept the request. If `request.length` is non-zero,
    /// [`data_buffer`](Self::data_buffer) must then supply at least that
    /// many bytes, or the request is stalled.
    fn setup(&mut self, request: &Request) -> bool;

    /// The data stage buffer of the accepted request
    ///
    /// For an IN request, it holds the data to send. For an OUT request,
    /// the stack fills it with the data from the host. This is called once
    /// per packet, and must return the same buffer each time.
    fn data_buffer(&mut self) -> Option<&mut [u8]> {
        None
    }

    /// The OUT data stage of an accepted request completed
    ///
    /// Return `true` to acknowledge the data, or `false` to stall the status
    /// stage. Not called for IN requests, or for requests without data.
    fn end_of_out_data_stage(&mut self, request: &Request) -> bool {
        let _ = request;
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    NoRequestPending,
    /// Waiting for the host to read the zero length status packet
    OutStatusPending,
    /// More IN data to send after the current packet
    InDataInProgress,
    /// The last IN data packet is queued
    InStatusBegin,
    /// Waiting for the host's zero length status packet
    InStatusEnd,
    /// Like `OutStatusPending`, then apply the address
    SetAddressPending,
    /// Receiving OUT data for a handler
    CustomOutInProgress,
}

/// Where the data stage bytes live
#[derive(Clone, Copy)]
enum Data<'a> {
    Static(&'a [u8]),
    Scratch,
    Handler,
}

const NO_REQUEST: Request = Request {
    direction: UsbDirection::Out,
    request_type: RequestType::Standard,
    recipient: Recipient::Device,
    request: 0,
    value: 0,
    index: 0,
    length: 0,
};

/// Parse the eight bytes of a SETUP packet
pub fn parse_setup(packet: &[u8; 8]) -> Request {
    let request_type = packet[0];
    Request {
        direction: if request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        request_type: match (request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        },
        recipient: match request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        },
        request: packet[1],
        value: u16::from_le_bytes([packet[2], packet[3]]),
        index: u16::from_le_bytes([packet[4], packet[5]]),
        length: u16::from_le_bytes([packet[6], packet[7]]),
    }
}

/// The endpoint zero state machine
pub struct ControlPipe<'a> {
    stage: Stage,
    request: Request,
    data: Data<'a>,
    /// Bytes of the data stage already transferred
    cursor: usize,
    /// Bytes of the data stage left to transfer
    remaining: usize,
    scratch: [u8; 2],
    timing_fix: bool,
    tx_untouched: bool,
    rx_untouched: bool,
}

impl<'a> ControlPipe<'a> {
    pub const fn new() -> Self {
        ControlPipe {
            stage: Stage::NoRequestPending,
            request: NO_REQUEST,
            data: Data::Scratch,
            cursor: 0,
            remaining: 0,
            scratch: [0; 2],
            timing_fix: false,
            tx_untouched: false,
            rx_untouched: false,
        }
    }

    /// Program endpoint zero after a bus reset, and forget any transfer
    pub fn default_status<P: Peripheral>(&mut self, hw: &P, ep0_tx: u16, ep0_rx: u16, ep0_size: u16) {
        self.stage = Stage::NoRequestPending;
        self.timing_fix = false;
        let epr = EndpointRegister::new(hw, 0);
        epr.reset();
        epr.set_type(crate::descriptor::TransferType::Control);
        epr.set_tx_buffer(Slot::Zero, ep0_tx, 0);
        epr.set_rx_buffer(Slot::One, ep0_rx, ep0_size);
        epr.set_tx_status(Status::Stall);
        epr.set_rx_status(Status::Stall);
    }

    /// NAK both directions while the service routine runs
    pub fn status_nak<P: Peripheral>(&mut self, hw: &P) {
        let epr = EndpointRegister::new(hw, 0);
        epr.set_tx_status(Status::Nak);
        epr.set_rx_status(Status::Nak);
        self.tx_untouched = true;
        self.rx_untouched = true;
    }

    /// Park every direction the service routine didn't arm
    pub fn restore_status<P: Peripheral>(&self, hw: &P) {
        let status = if self.timing_fix {
            Status::Nak
        } else {
            Status::Stall
        };
        let epr = EndpointRegister::new(hw, 0);
        if self.tx_untouched {
            epr.set_tx_status(status);
        }
        if self.rx_untouched {
            epr.set_rx_status(status);
        }
    }

    fn arm_tx<P: Peripheral>(&mut self, hw: &P) {
        EndpointRegister::new(hw, 0).set_tx_status(Status::Valid);
        self.tx_untouched = false;
    }

    fn arm_rx<P: Peripheral>(&mut self, hw: &P) {
        EndpointRegister::new(hw, 0).set_rx_status(Status::Valid);
        self.rx_untouched = false;
    }

    /// Queue the zero length packet that completes a request without IN data
    fn send_status<P: Peripheral>(&mut self, hw: &P) {
        EndpointRegister::new(hw, 0).set_tx_count(Slot::Zero, 0);
        self.arm_tx(hw);
    }

    /// A SETUP packet arrived
    pub fn on_setup<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        trace!("EP0 SETUP");
        let epr = EndpointRegister::new(cx.hw, 0);
        if epr.received(Slot::One) != 8 {
            return;
        }
        let mut packet = [0; 8];
        buffer::copy_from(cx.hw, cx.memory.ep0_rx(), &mut packet);
        let request = parse_setup(&packet);
        debug!(
            "Setup bmRequestType={=u8} bRequest={=u8} wValue={=u16} wIndex={=u16} wLength={=u16}",
            packet[0],
            request.request,
            request.value,
            request.index,
            request.length
        );

        if self.stage != Stage::NoRequestPending {
            warn!("SETUP interrupted a control transfer");
            self.stage = Stage::NoRequestPending;
            epr.set_kind(false);
            self.timing_fix = false;
        }
        self.request = request;

        if request.request_type != RequestType::Standard {
            self.custom_setup(cx);
            return;
        }

        match request.request {
            Request::GET_CONFIGURATION => self.get_configuration(cx),
            Request::GET_DESCRIPTOR => self.get_descriptor(cx),
            Request::GET_STATUS => self.get_status(cx),
            Request::SET_ADDRESS => self.set_address(cx),
            Request::SET_CONFIGURATION => self.set_configuration(cx),
            _other => {
                warn!("Unsupported standard request {=u8}", _other);
            }
        }
    }

    /// The host read the packet queued on endpoint zero
    pub fn on_in<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        trace!("EP0 IN");
        match self.stage {
            Stage::InDataInProgress => self.continue_in_data(cx),
            Stage::InStatusBegin => {
                self.stage = Stage::InStatusEnd;
                EndpointRegister::new(cx.hw, 0).set_kind(true);
                self.arm_rx(cx.hw);
            }
            Stage::SetAddressPending => {
                self.stage = Stage::NoRequestPending;
                let address = self.request.value as u8;
                cx.hw.set_address(address, true);
                debug!("Address set to {=u8}", address);
                cx.set_state(if address != 0 {
                    State::Address
                } else {
                    State::Default
                });
            }
            Stage::OutStatusPending => {
                self.stage = Stage::NoRequestPending;
                trace!("EP0 status OUT complete");
            }
            _ => {}
        }
    }

    /// The host wrote a packet to endpoint zero
    pub fn on_out<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        trace!("EP0 OUT");
        match self.stage {
            Stage::InStatusEnd => {
                self.stage = Stage::NoRequestPending;
                EndpointRegister::new(cx.hw, 0).set_kind(false);
                trace!("EP0 status IN complete");
            }
            Stage::CustomOutInProgress => self.custom_out_data(cx),
            Stage::InDataInProgress | Stage::InStatusBegin => {
                // Either the host ended the data stage early, or the status
                // OUT and the last IN completed in the same interrupt. The
                // order of the two can't be recovered; both are fine.
                self.stage = Stage::NoRequestPending;
                EndpointRegister::new(cx.hw, 0).set_kind(false);
                warn!("EP0 IN data stage aborted by host");
            }
            _ => {}
        }
    }

    fn custom_setup<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        let Some(handler) = cx.handler.as_deref_mut() else {
            return;
        };
        if !handler.setup(&request) {
            return;
        }

        let length = usize::from(request.length);
        if length == 0 {
            // Without a data stage, the direction bit doesn't matter. The
            // status stage is always IN.
            self.stage = Stage::OutStatusPending;
            self.send_status(cx.hw);
            return;
        }
        if handler.data_buffer().map_or(true, |buffer| buffer.len() < length) {
            warn!("Accepted request {=u8} without a data buffer", request.request);
            return;
        }

        if request.direction == UsbDirection::In {
            self.start_in_data(cx, Data::Handler, length);
        } else {
            self.data = Data::Handler;
            self.cursor = 0;
            self.remaining = length;
            self.stage = Stage::CustomOutInProgress;
            self.arm_rx(cx.hw);
        }
    }

    fn get_descriptor<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        if request.direction != UsbDirection::In || request.recipient != Recipient::Device {
            return;
        }
        let kind = (request.value >> 8) as u8;
        let index = request.value as u8;
        let descriptors = cx.descriptors;
        let bytes = match kind {
            descriptor_type::DEVICE if request.index == 0 && index == 0 => Some(descriptors.device()),
            descriptor_type::CONFIGURATION if request.index == 0 => index
                .checked_add(1)
                .and_then(|value| descriptors.configuration(value))
                .map(|config| config.bytes()),
            descriptor_type::STRING
                if request.index == 0 || Some(request.index) == descriptors.language_id() =>
            {
                descriptors.string(index)
            }
            descriptor_type::DEVICE | descriptor_type::CONFIGURATION | descriptor_type::STRING => None,
            _other => {
                warn!("Unsupported descriptor type {=u8}", _other);
                None
            }
        };
        if let Some(bytes) = bytes {
            let length = bytes.len().min(usize::from(request.length));
            self.start_in_data(cx, Data::Static(bytes), length);
        }
    }

    fn get_configuration<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        if request.direction != UsbDirection::In || request.recipient != Recipient::Device {
            return;
        }
        if request.value != 0 || request.index != 0 || request.length != 1 {
            return;
        }
        self.scratch[0] = cx.state.configuration();
        self.start_in_data(cx, Data::Scratch, 1);
    }

    fn get_status<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        if request.direction != UsbDirection::In || request.value != 0 || request.length != 2 {
            return;
        }
        let status: u16 = match request.recipient {
            Recipient::Device => {
                if cx.state.state() != State::Configured {
                    return;
                }
                // Remote wakeup isn't supported, so only self-powered is reported
                let self_powered = cx
                    .descriptors
                    .configuration(cx.state.configuration())
                    .map_or(false, |config| config.is_self_powered());
                u16::from(self_powered)
            }
            Recipient::Interface => 0,
            _ => {
                warn!("Unsupported GET_STATUS recipient");
                return;
            }
        };
        self.scratch = status.to_le_bytes();
        self.start_in_data(cx, Data::Scratch, 2);
    }

    fn set_address<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        if request.direction != UsbDirection::Out || request.recipient != Recipient::Device {
            return;
        }
        if request.index != 0 || request.length != 0 || request.value > 127 {
            return;
        }
        // The new address applies once the status stage completes
        self.stage = Stage::SetAddressPending;
        self.send_status(cx.hw);
    }

    fn set_configuration<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let request = self.request;
        if request.direction != UsbDirection::Out || request.recipient != Recipient::Device {
            return;
        }
        if request.index != 0 || request.length != 0 || request.value & 0xFF00 != 0 {
            return;
        }
        let configuration = request.value as u8;
        let descriptor: Option<ConfigurationDescriptor<'a>> = match configuration {
            0 => None,
            value => match cx.descriptors.configuration(value) {
                Some(descriptor) => Some(descriptor),
                None => return,
            },
        };

        cx.deconfigure_all();
        if let Some(descriptor) = descriptor {
            cx.state.set_configuration(configuration, cx.callbacks);
            if cx.configure_all(descriptor).is_err() {
                warn!("Failed to apply configuration {=u8}", configuration);
                cx.deconfigure_all();
                cx.state.set_configuration(0, cx.callbacks);
                cx.set_state(State::Address);
                return;
            }
            cx.set_state(State::Configured);
        } else {
            cx.state.set_configuration(0, cx.callbacks);
            cx.set_state(State::Address);
        }
        self.stage = Stage::OutStatusPending;
        self.send_status(cx.hw);
    }

    fn start_in_data<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>, data: Data<'a>, length: usize) {
        self.data = data;
        self.cursor = 0;
        self.remaining = length;
        self.continue_in_data(cx);
    }

    /// Queue the next IN data packet
    ///
    /// A transfer ends with a short packet. If the data is a multiple of the
    /// packet size, a zero length packet follows the last full one.
    fn continue_in_data<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let ep0_size = usize::from(cx.memory.ep0_size());
        let len = self.remaining.min(ep0_size);
        let range = self.cursor..self.cursor + len;
        let source: Option<&[u8]> = match self.data {
            Data::Static(bytes) => Some(bytes),
            Data::Scratch => Some(&self.scratch),
            Data::Handler => cx
                .handler
                .as_deref_mut()
                .and_then(|handler| handler.data_buffer())
                .map(|buffer| &*buffer),
        };
        let Some(chunk) = source.and_then(|bytes| bytes.get(range)) else {
            warn!("EP0 IN data went away");
            self.stage = Stage::NoRequestPending;
            return;
        };
        buffer::copy_to(cx.hw, cx.memory.ep0_tx(), chunk);

        let epr = EndpointRegister::new(cx.hw, 0);
        epr.set_tx_count(Slot::Zero, len as u16);
        self.stage = if self.remaining >= ep0_size {
            Stage::InDataInProgress
        } else {
            Stage::InStatusBegin
        };
        self.cursor += len;
        self.remaining -= len;
        trace!("EP0 IN buffer filled with {=usize} bytes", len);
        self.arm_tx(cx.hw);

        // The host may end the data stage early with the status OUT. Accept
        // zero length packets to notice.
        epr.set_kind(true);
        self.arm_rx(cx.hw);
    }

    fn custom_out_data<P: Peripheral, T>(&mut self, cx: &mut Context<'_, 'a, P, T>) {
        let received = usize::from(EndpointRegister::new(cx.hw, 0).received(Slot::One));
        trace!("EP0 OUT buffer read, {=usize} bytes", received);
        if received > self.remaining {
            warn!("EP0 OUT overrun");
            self.stage = Stage::NoRequestPending;
            self.timing_fix = false;
            return;
        }

        let range = self.cursor..self.cursor + received;
        let destination = cx
            .handler
            .as_deref_mut()
            .and_then(|handler| handler.data_buffer())
            .and_then(|buffer| buffer.get_mut(range));
        let Some(destination) = destination else {
            warn!("EP0 OUT buffer went away");
            self.stage = Stage::NoRequestPending;
            self.timing_fix = false;
            return;
        };
        buffer::copy_from(cx.hw, cx.memory.ep0_rx(), destination);
        self.cursor += received;
        self.remaining -= received;

        if self.remaining > 0 {
            if self.remaining <= usize::from(cx.memory.ep0_size()) {
                self.timing_fix = true;
            }
            self.arm_rx(cx.hw);
            return;
        }

        self.timing_fix = false;
        self.stage = Stage::NoRequestPending;
        let request = self.request;
        let accepted = cx
            .handler
            .as_deref_mut()
            .map_or(false, |handler| handler.end_of_out_data_stage(&request));
        if accepted {
            self.stage = Stage::OutStatusPending;
            self.send_status(cx.hw);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{parse_setup, ControlPipe};
    use crate::{
        epr::{EndpointRegister, Epr, Status},
        sim::Sim,
    };
    use usb_device::{
        control::{Recipient, Request, RequestType},
        UsbDirection,
    };

    #[test]
    fn parse_get_descriptor() {
        let request = parse_setup(&[0x80, 6, 0x00, 0x02, 0, 0, 0xFF, 0x00]);
        assert_eq!(request.direction, UsbDirection::In);
        assert_eq!(request.request_type, RequestType::Standard);
        assert_eq!(request.recipient, Recipient::Device);
        assert_eq!(request.request, Request::GET_DESCRIPTOR);
        assert_eq!(request.value, 0x0200);
        assert_eq!(request.length, 255);
    }

    #[test]
    fn parse_vendor_interface() {
        let request = parse_setup(&[0x41, 0x42, 0x34, 0x12, 0x02, 0x00, 0x80, 0x00]);
        assert_eq!(request.direction, UsbDirection::Out);
        assert_eq!(request.request_type, RequestType::Vendor);
        assert_eq!(request.recipient, Recipient::Interface);
        assert_eq!(request.value, 0x1234);
        assert_eq!(request.index, 2);
        assert_eq!(request.length, 128);

        let request = parse_setup(&[0x7F, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(request.request_type, RequestType::Reserved);
        assert_eq!(request.recipient, Recipient::Reserved);
    }

    #[test]
    fn default_status_stalls_both_directions() {
        let sim = Sim::new();
        let mut pipe = ControlPipe::new();
        pipe.default_status(&sim, 64, 96, 32);
        let epr = EndpointRegister::new(&sim, 0);
        assert_eq!(epr.tx_status(), Status::Stall);
        assert_eq!(epr.rx_status(), Status::Stall);
        assert_eq!(epr.read().transfer_type(), crate::descriptor::TransferType::Control);
        assert_eq!(sim.pma_word(0), 64);
        assert_eq!(sim.pma_word(4), 96);
        assert_eq!(sim.pma_word(6), 16 << 10);
    }

    #[test]
    fn restore_stalls_only_untouched_directions() {
        let sim = Sim::new();
        let mut pipe = ControlPipe::new();
        pipe.default_status(&sim, 64, 96, 32);
        pipe.status_nak(&sim);
        let epr = EndpointRegister::new(&sim, 0);
        assert_eq!(epr.tx_status(), Status::Nak);
        assert_eq!(epr.rx_status(), Status::Nak);

        pipe.send_status(&sim);
        pipe.restore_status(&sim);
        assert_eq!(epr.tx_status(), Status::Valid);
        assert_eq!(epr.rx_status(), Status::Stall);
        assert!(!epr.read().contains(Epr::EP_KIND));
    }

    #[test]
    fn timing_fix_naks_instead_of_stalling() {
        let sim = Sim::new();
        let mut pipe = ControlPipe::new();
        pipe.default_status(&sim, 64, 96, 32);
        pipe.status_nak(&sim);
        pipe.timing_fix = true;
        pipe.arm_rx(&sim);
        pipe.restore_status(&sim);
        let epr = EndpointRegister::new(&sim, 0);
        assert_eq!(epr.tx_status(), Status::Nak);
        assert_eq!(epr.rx_status(), Status::Valid);
    }
}
