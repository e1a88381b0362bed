//! The device handle, interrupt handlers, and transfers

use crate::{
    buffer::{self, Allocator},
    control::{ControlHandler, ControlPipe},
    descriptor::{ConfigurationDescriptor, DescriptorError, Descriptors},
    endpoint::{ConfigureError, Endpoints},
    epr::{EndpointRegister, Epr},
    ral::{Control, Interrupt},
    scheduler::Scheduler,
    state::{DeviceState, State},
    Peripheral,
};
use bare_metal::CriticalSection;
use core::cell::RefCell;
use cortex_m::interrupt::Mutex;
use usb_device::{UsbDirection, UsbError};

pub use crate::endpoint::BulkInPolicy;

/// Endpoint zero max packet size
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ep0Size {
    Bytes8,
    Bytes16,
    #[default]
    Bytes32,
    Bytes64,
}

impl Ep0Size {
    pub const fn bytes(self) -> u16 {
        match self {
            Ep0Size::Bytes8 => 8,
            Ep0Size::Bytes16 => 16,
            Ep0Size::Bytes32 => 32,
            Ep0Size::Bytes64 => 64,
        }
    }
}

/// Device configuration, applied by [`Device::enable`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Must match `bMaxPacketSize0` of the device descriptor
    pub ep0_max_packet_size: Ep0Size,
    pub bulk_in: BulkInPolicy,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            ep0_max_packet_size: Ep0Size::Bytes32,
            bulk_in: BulkInPolicy::OneOutstanding,
        }
    }
}

/// A blocking write that stopped early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Incomplete {
    /// Bytes queued before the error
    pub written: usize,
    pub error: UsbError,
}

/// Non-blocking transfers, for use inside [`Callbacks`]
///
/// Behaves like [`Endpoint::try_write`] and [`Endpoint::try_read`].
pub trait EndpointIo {
    fn write(&mut self, number: u8, data: &[u8]) -> Result<usize, UsbError>;
    fn read(&mut self, number: u8, data: &mut [u8]) -> Result<usize, UsbError>;
}

/// Device event notifications
///
/// Every method defaults to doing nothing. They're called from the USB
/// interrupt handlers, with the device locked. A callback may still ask the
/// [`Device`] for its [`state`](Device::state) and
/// [`configuration`](Device::configuration). Re-entering an interrupt
/// handler, `enable`, or `disable` does nothing.
///
/// Move data with the [`EndpointIo`]. Calling [`Endpoint`] methods or
/// `set_callbacks` from a callback panics.
pub trait Callbacks {
    /// Endpoint `number` completed a transfer in `direction`
    fn endpoint(&mut self, io: &mut dyn EndpointIo, number: u8, direction: UsbDirection) {
        let _ = (io, number, direction);
    }
    fn state_changed(&mut self, state: State) {
        let _ = state;
    }
    /// The host selected `configuration`, possibly the one already active
    fn configuration_changed(&mut self, configuration: u8) {
        let _ = configuration;
    }
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
    fn reset(&mut self) {}
}

struct NoCallbacks;
impl Callbacks for NoCallbacks {}

/// Everything the interrupt handlers share with the transfer calls
struct Stack<'a, P, T> {
    hw: P,
    memory: Allocator,
    endpoints: Endpoints<T>,
    control: ControlPipe<'a>,
    /// `None` while disabled
    descriptors: Option<Descriptors<'a>>,
    bulk_in: BulkInPolicy,
}

/// Application hooks, swapped independently of the stack
struct Hooks<'a> {
    callbacks: Option<&'a mut (dyn Callbacks + Send)>,
    handler: Option<&'a mut (dyn ControlHandler + Send)>,
}

/// The stack, borrowed for one interrupt
pub(crate) struct Context<'c, 'a, P, T> {
    pub hw: &'c P,
    pub memory: &'c mut Allocator,
    pub endpoints: &'c mut Endpoints<T>,
    pub state: &'c DeviceState<T>,
    pub descriptors: &'c Descriptors<'a>,
    pub callbacks: &'c mut dyn Callbacks,
    pub handler: Option<&'c mut dyn ControlHandler>,
    pub wake: &'c mut dyn FnMut(T),
    pub bulk_in: BulkInPolicy,
}

impl<'a, P: Peripheral, T> Context<'_, 'a, P, T> {
    /// Change the device state, waking the thread waiting for the configured state
    pub fn set_state(&mut self, state: State) {
        if let Some(thread) = self.state.set_state(state, self.callbacks) {
            (self.wake)(thread);
        }
    }

    /// Disable every endpoint, and fail the blocking calls using them
    pub fn deconfigure_all(&mut self) {
        self.endpoints.deconfigure_all(self.hw, self.memory, self.wake);
        self.state.advance_epoch();
    }

    pub fn configure_all(&mut self, config: ConfigurationDescriptor<'a>) -> Result<(), ConfigureError> {
        self.endpoints.configure_all(self.hw, self.memory, config)
    }

    /// Forget everything the host set up
    fn detach(&mut self, control: &mut ControlPipe<'a>) {
        self.deconfigure_all();
        *control = ControlPipe::new();
        EndpointRegister::new(self.hw, 0).reset();
        self.state.set_suspended(false);
        if self.state.configuration() != 0 {
            self.state.set_configuration(0, self.callbacks);
        }
    }

    fn on_reset(&mut self, control: &mut ControlPipe<'a>) {
        debug!("USB reset");
        let hw = self.hw;
        hw.set_address(0, false);
        hw.clear_interrupts(Interrupt::all());
        hw.set_buffer_table(buffer::BTABLE);
        self.deconfigure_all();
        control.default_status(hw, self.memory.ep0_tx(), self.memory.ep0_rx(), self.memory.ep0_size());
        hw.set_address(0, true);
        hw.set_control(Control::CTRM | Control::SUSPM | Control::WKUPM | Control::RESETM);

        self.state.set_suspended(false);
        if self.state.configuration() != 0 {
            self.state.set_configuration(0, self.callbacks);
        }
        self.set_state(State::Default);
        self.callbacks.reset();
    }

    fn on_suspend(&mut self) {
        debug!("USB suspend");
        let hw = self.hw;
        hw.clear_interrupts(Interrupt::SUSP);
        hw.set_control(hw.control() | Control::FSUSP | Control::LP_MODE);
        self.state.set_suspended(true);
        if self.state.state() == State::Configured {
            self.deconfigure_all();
        }
        self.callbacks.suspend();
    }

    fn on_wakeup(&mut self) {
        debug!("USB wakeup");
        let hw = self.hw;
        hw.clear_interrupts(Interrupt::WKUP);
        hw.set_control(hw.control() - Control::FSUSP);
        let was_suspended = self.state.is_suspended();
        self.state.set_suspended(false);
        self.callbacks.resume();

        if !was_suspended || self.state.state() != State::Configured {
            return;
        }
        let configuration = self.state.configuration();
        if let Some(config) = self.descriptors.configuration(configuration) {
            if self.configure_all(config).is_err() {
                warn!("Failed to restore configuration {=u8}", configuration);
                self.deconfigure_all();
                self.state.set_configuration(0, self.callbacks);
                self.set_state(State::Address);
            }
        }
    }

    /// Service one completed transfer, if there is one
    fn on_transfer(&mut self, control: &mut ControlPipe<'a>) -> bool {
        let istr = self.hw.interrupt_status();
        if !istr.contains(Interrupt::CTR) {
            return false;
        }
        let number = istr.endpoint();
        trace!("CTR endpoint {=usize}", number);
        if number == 0 {
            self.on_control(control);
        } else {
            self.on_endpoint(number);
        }
        true
    }

    fn on_control(&mut self, control: &mut ControlPipe<'a>) {
        let epr = EndpointRegister::new(self.hw, 0);
        let value = epr.read();
        control.status_nak(self.hw);
        if value.contains(Epr::CTR_RX) {
            epr.clear_ctr_rx();
            if value.contains(Epr::SETUP) {
                control.on_setup(self);
            } else {
                control.on_out(self);
            }
        }
        if value.contains(Epr::CTR_TX) {
            epr.clear_ctr_tx();
            control.on_in(self);
        }
        control.restore_status(self.hw);
    }

    fn on_endpoint(&mut self, number: usize) {
        let value = EndpointRegister::new(self.hw, number).read();
        if value.contains(Epr::CTR_RX) {
            let waiter = self.endpoints.on_out_complete(self.hw, number);
            self.notify(number, UsbDirection::Out);
            if let Some(thread) = waiter {
                (self.wake)(thread);
            }
        }
        if value.contains(Epr::CTR_TX) {
            let waiter = self.endpoints.on_in_complete(self.hw, number);
            self.notify(number, UsbDirection::In);
            if let Some(thread) = waiter {
                (self.wake)(thread);
            }
        }
    }

    fn notify(&mut self, number: usize, direction: UsbDirection) {
        let mut io = Io {
            hw: self.hw,
            endpoints: &mut *self.endpoints,
            bulk_in: self.bulk_in,
        };
        self.callbacks.endpoint(&mut io, number as u8, direction);
    }
}

struct Io<'c, P, T> {
    hw: &'c P,
    endpoints: &'c mut Endpoints<T>,
    bulk_in: BulkInPolicy,
}

impl<P: Peripheral, T> EndpointIo for Io<'_, P, T> {
    fn write(&mut self, number: u8, data: &[u8]) -> Result<usize, UsbError> {
        self.endpoints.write(self.hw, usize::from(number), data, self.bulk_in)
    }
    fn read(&mut self, number: u8, data: &mut [u8]) -> Result<usize, UsbError> {
        self.endpoints.read(self.hw, usize::from(number), data)
    }
}

/// A USB device
///
/// `Device` owns the [`Peripheral`] and everything the stack knows about
/// it. Share it by reference between the interrupt handlers and your
/// threads; a `static` works.
///
/// # Example
///
/// ```no_run
/// use stm32f1_usbfs::{Config, Descriptors, Device, Instance, Wfe};
///
/// static DEVICE: [u8; 18] = [
///     18, 1, 0x00, 0x02, 0xFF, 0, 0, 32, 0x83, 0x04, 0x50, 0x57, 0x00, 0x01, 0, 0, 0, 1,
/// ];
/// static CONFIGURATION: [u8; 32] = [
///     9, 2, 32, 0, 1, 1, 0, 0x80, 50,
///     9, 4, 0, 0, 2, 0xFF, 0, 0, 0,
///     7, 5, 0x81, 0x02, 64, 0, 0,
///     7, 5, 0x02, 0x02, 64, 0, 0,
/// ];
/// static CONFIGURATIONS: [&[u8]; 1] = [&CONFIGURATION];
///
/// // Safety: the only Instance.
/// static USB: Device<Instance, Wfe> = Device::new(unsafe { Instance::new(72_000_000) }, Wfe);
///
/// // In USB_LP_CAN_RX0: USB.on_low_priority_interrupt();
/// // In USB_HP_CAN_TX: USB.on_high_priority_interrupt();
///
/// USB.enable(Descriptors::new(&DEVICE, &CONFIGURATIONS, &[]), Config::new()).unwrap();
/// USB.wait_until_configured();
///
/// let mut buffer = [0; 64];
/// loop {
///     let Ok(len) = USB.endpoint(2).read(&mut buffer) else { continue };
///     let _ = USB.endpoint(1).write(&buffer[..len]);
/// }
/// ```
pub struct Device<'a, P, S: Scheduler> {
    stack: Mutex<RefCell<Stack<'a, P, S::Thread>>>,
    state: Mutex<DeviceState<S::Thread>>,
    hooks: Mutex<RefCell<Hooks<'a>>>,
    scheduler: S,
}

impl<'a, P: Peripheral, S: Scheduler> Device<'a, P, S> {
    /// Create a disabled device
    pub const fn new(peripheral: P, scheduler: S) -> Self {
        Device {
            stack: Mutex::new(RefCell::new(Stack {
                hw: peripheral,
                memory: Allocator::new(Ep0Size::Bytes32.bytes()),
                endpoints: Endpoints::new(),
                control: ControlPipe::new(),
                descriptors: None,
                bulk_in: BulkInPolicy::OneOutstanding,
            })),
            state: Mutex::new(DeviceState::new()),
            hooks: Mutex::new(RefCell::new(Hooks {
                callbacks: None,
                handler: None,
            })),
            scheduler,
        }
    }

    fn with_stack<R>(
        &self,
        func: impl FnOnce(&mut Stack<'a, P, S::Thread>, &DeviceState<S::Thread>) -> R,
    ) -> R {
        self.scheduler.free(|cs| {
            let stack = self.stack.borrow(cs);
            let mut stack = stack.borrow_mut();
            func(&mut stack, self.state.borrow(cs))
        })
    }

    fn with_state<R>(&self, func: impl FnOnce(&DeviceState<S::Thread>) -> R) -> R {
        self.scheduler.free(|cs| func(self.state.borrow(cs)))
    }

    /// Run `func` with the stack and the hooks, if the device is enabled
    ///
    /// Does nothing when called from a callback.
    fn with_context<R>(
        &self,
        func: impl FnOnce(&mut Context<'_, 'a, P, S::Thread>, &mut ControlPipe<'a>) -> R,
    ) -> Option<R> {
        self.scheduler.free(|cs| {
            let (Ok(mut stack), Ok(mut hooks)) = (
                self.stack.borrow(cs).try_borrow_mut(),
                self.hooks.borrow(cs).try_borrow_mut(),
            ) else {
                warn!("Device re-entered from a callback");
                return None;
            };
            let Stack {
                hw,
                memory,
                endpoints,
                control,
                descriptors,
                bulk_in,
            } = &mut *stack;
            let descriptors = descriptors.as_ref()?;
            let Hooks { callbacks, handler } = &mut *hooks;

            let mut fallback = NoCallbacks;
            let callbacks: &mut dyn Callbacks = match callbacks {
                Some(callbacks) => &mut **callbacks,
                None => &mut fallback,
            };
            let handler = handler
                .as_deref_mut()
                .map(|handler| handler as &mut dyn ControlHandler);
            let mut wake = |thread: S::Thread| self.scheduler.wake(&thread);

            let mut cx = Context {
                hw,
                memory,
                endpoints,
                state: self.state.borrow(cs),
                descriptors,
                callbacks,
                handler,
                wake: &mut wake,
                bulk_in: *bulk_in,
            };
            Some(func(&mut cx, control))
        })
    }

    /// Connect to the host
    ///
    /// Checks the descriptors, powers up the transceiver, and waits for the
    /// host's bus reset. Nothing changes if the descriptors are rejected.
    /// The descriptors stay borrowed until the device is dropped.
    ///
    /// Enabling an enabled device starts over: the device returns to the
    /// default state, with no configuration.
    pub fn enable(&self, descriptors: Descriptors<'a>, config: Config) -> Result<(), DescriptorError> {
        let ep0_size = config.ep0_max_packet_size.bytes();
        descriptors.validate(ep0_size)?;
        self.with_stack(|stack, _| {
            stack.descriptors = Some(descriptors);
            stack.bulk_in = config.bulk_in;
            stack.memory = Allocator::new(ep0_size);
        });
        self.with_context(|cx, control| {
            debug!("Enabling, endpoint zero max packet size {=u16}", ep0_size);
            cx.detach(control);
            let hw = cx.hw;
            hw.connect(true);
            // Power up the transceiver, then release the reset after it settles
            hw.set_control(Control::FRES);
            hw.delay_us(1);
            hw.set_control(Control::empty());
            hw.clear_interrupts(Interrupt::all());
            hw.set_control(Control::RESETM);
            cx.set_state(State::Default);
        });
        Ok(())
    }

    /// Disconnect from the host, and power down the transceiver
    ///
    /// Blocked transfers fail. Does nothing if the device isn't enabled.
    pub fn disable(&self) {
        let enabled = self.with_context(|cx, control| {
            debug!("Disabling");
            cx.detach(control);
            let hw = cx.hw;
            hw.set_control(Control::FRES | Control::PDWN);
            hw.clear_interrupts(Interrupt::all());
            hw.set_address(0, false);
            hw.connect(false);
            cx.set_state(State::Default);
        });
        if enabled.is_some() {
            self.with_stack(|stack, _| stack.descriptors = None);
        }
    }

    pub fn state(&self) -> State {
        self.with_state(DeviceState::state)
    }

    /// The active configuration value, or zero
    pub fn configuration(&self) -> u8 {
        self.with_state(DeviceState::configuration)
    }

    pub fn is_suspended(&self) -> bool {
        self.with_state(DeviceState::is_suspended)
    }

    /// Park the calling thread until the host configures the device
    ///
    /// Only one thread may wait at a time.
    pub fn wait_until_configured(&self) {
        loop {
            let configured = self.with_state(|state| {
                if state.state() == State::Configured {
                    true
                } else {
                    state.wait_for_configured(self.scheduler.current());
                    false
                }
            });
            if configured {
                return;
            }
            self.scheduler.park();
        }
    }

    /// A handle to endpoint `number`
    ///
    /// Any number is accepted; transfers on an endpoint that doesn't exist
    /// fail with [`UsbError::InvalidEndpoint`].
    pub fn endpoint(&self, number: u8) -> Endpoint<'_, 'a, P, S> {
        Endpoint {
            device: self,
            number: usize::from(number),
        }
    }

    /// Install the event callbacks, returning the previous ones
    pub fn set_callbacks(
        &self,
        callbacks: Option<&'a mut (dyn Callbacks + Send)>,
    ) -> Option<&'a mut (dyn Callbacks + Send)> {
        self.scheduler
            .free(|cs| core::mem::replace(&mut self.hooks.borrow(cs).borrow_mut().callbacks, callbacks))
    }

    /// Install the handler for class and vendor requests, returning the previous one
    pub fn set_control_handler(
        &self,
        handler: Option<&'a mut (dyn ControlHandler + Send)>,
    ) -> Option<&'a mut (dyn ControlHandler + Send)> {
        self.scheduler
            .free(|cs| core::mem::replace(&mut self.hooks.borrow(cs).borrow_mut().handler, handler))
    }

    /// Service the low priority USB interrupt
    ///
    /// Handles bus events, endpoint zero, and single-buffered endpoints.
    /// Each transfer is serviced in its own critical section, so the high
    /// priority handler waits for at most one of them.
    pub fn on_low_priority_interrupt(&self) {
        let bus_reset = self.with_context(|cx, control| {
            let istr = cx.hw.interrupt_status();
            if istr.contains(Interrupt::RESET) {
                cx.on_reset(control);
                return true;
            }
            if istr.contains(Interrupt::SUSP) {
                cx.on_suspend();
            }
            if istr.contains(Interrupt::WKUP) {
                cx.on_wakeup();
            }
            false
        });
        if bus_reset != Some(false) {
            return;
        }
        while self.with_context(|cx, control| cx.on_transfer(control)) == Some(true) {}
    }

    /// Service the high priority USB interrupt
    ///
    /// Only double-buffered bulk endpoints complete here. Other transfers
    /// are left for the low priority handler.
    pub fn on_high_priority_interrupt(&self) {
        self.with_context(|cx, _| {
            let mut istr = cx.hw.interrupt_status();
            while istr.contains(Interrupt::CTR) {
                let number = istr.endpoint();
                if number == 0 || !cx.endpoints.is_double_buffered(number) {
                    break;
                }
                cx.on_endpoint(number);
                istr = cx.hw.interrupt_status();
            }
        });
    }
}

/// A non-zero endpoint of a [`Device`]
///
/// Blocking calls park the calling thread, and must not be used from
/// interrupt handlers. A blocking call fails with
/// [`UsbError::InvalidState`] if the endpoints are deconfigured while it
/// runs, which happens on a bus reset, a suspend, or a `SET_CONFIGURATION`.
pub struct Endpoint<'d, 'a, P, S: Scheduler> {
    device: &'d Device<'a, P, S>,
    number: usize,
}

impl<'a, P: Peripheral, S: Scheduler> Endpoint<'_, 'a, P, S> {
    /// Send all of `data` to the host
    ///
    /// Returns once the last packet is queued. An empty `data` queues one
    /// zero length packet if a buffer is free, and returns `Ok(0)` without
    /// waiting either way.
    pub fn write(&self, data: &[u8]) -> Result<usize, Incomplete> {
        let device = self.device;
        let epoch = device.with_state(DeviceState::epoch);
        let mut written = 0;
        loop {
            let result = device.with_stack(|stack, state| {
                if state.epoch() != epoch {
                    return Err(UsbError::InvalidState);
                }
                let rest = &data[written..];
                let Stack {
                    hw,
                    endpoints,
                    bulk_in,
                    ..
                } = stack;
                let queued = endpoints.write(&*hw, self.number, rest, *bulk_in)?;
                if queued == 0 && !rest.is_empty() {
                    endpoints.wait_in(self.number, device.scheduler.current());
                }
                Ok(queued)
            });
            match result {
                Ok(queued) => {
                    written += queued;
                    if written == data.len() {
                        return Ok(written);
                    }
                    if queued == 0 {
                        device.scheduler.park();
                    }
                }
                Err(error) => return Err(Incomplete { written, error }),
            }
        }
    }

    /// Receive one packet from the host
    ///
    /// `data` must hold at least [`out_size`](Self::out_size) bytes.
    /// Zero length packets are skipped.
    pub fn read(&self, data: &mut [u8]) -> Result<usize, UsbError> {
        let device = self.device;
        let epoch = device.with_state(DeviceState::epoch);
        loop {
            let received = device.with_stack(|stack, state| {
                if state.epoch() != epoch {
                    return Err(UsbError::InvalidState);
                }
                let Stack { hw, endpoints, .. } = stack;
                let received = endpoints.read(&*hw, self.number, &mut *data)?;
                if received == 0 {
                    endpoints.wait_out(self.number, device.scheduler.current());
                }
                Ok(received)
            })?;
            if received > 0 {
                return Ok(received);
            }
            device.scheduler.park();
        }
    }

    /// Queue as much of `data` as there's room for
    ///
    /// Returns zero if there's no room yet. Fails with
    /// [`UsbError::WouldBlock`] when called from a [`Callbacks`] method.
    pub fn try_write(&self, cs: &CriticalSection, data: &[u8]) -> Result<usize, UsbError> {
        let mut stack = self
            .device
            .stack
            .borrow(cs)
            .try_borrow_mut()
            .map_err(|_| UsbError::WouldBlock)?;
        let Stack {
            hw,
            endpoints,
            bulk_in,
            ..
        } = &mut *stack;
        endpoints.write(&*hw, self.number, data, *bulk_in)
    }

    /// Read a packet, if one arrived
    ///
    /// Returns zero if there's nothing to read.
    pub fn try_read(&self, cs: &CriticalSection, data: &mut [u8]) -> Result<usize, UsbError> {
        let mut stack = self
            .device
            .stack
            .borrow(cs)
            .try_borrow_mut()
            .map_err(|_| UsbError::WouldBlock)?;
        let Stack { hw, endpoints, .. } = &mut *stack;
        endpoints.read(&*hw, self.number, data)
    }

    pub fn is_in_enabled(&self) -> bool {
        self.device
            .with_stack(|stack, _| stack.endpoints.get(self.number).map_or(false, |ep| ep.is_in_enabled()))
    }

    pub fn is_out_enabled(&self) -> bool {
        self.device
            .with_stack(|stack, _| stack.endpoints.get(self.number).map_or(false, |ep| ep.is_out_enabled()))
    }

    /// Max packet size of the IN side, or zero if it's disabled
    pub fn in_size(&self) -> u16 {
        self.device
            .with_stack(|stack, _| stack.endpoints.get(self.number).map_or(0, |ep| ep.in_size()))
    }

    /// Max packet size of the OUT side, or zero if it's disabled
    pub fn out_size(&self) -> u16 {
        self.device
            .with_stack(|stack, _| stack.endpoints.get(self.number).map_or(0, |ep| ep.out_size()))
    }
}
