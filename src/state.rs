//! Device state tracking

use crate::device::Callbacks;
use core::cell::Cell;

/// USB device state
///
/// Suspension is tracked separately; a suspended device keeps its state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Reset, responding on address zero
    Default,
    /// Address assigned, no configuration selected
    Address,
    /// A configuration is selected, and its endpoints are enabled
    Configured,
}

/// The device state, the active configuration, and the thread waiting for
/// the configured state
///
/// `epoch` counts endpoint deconfigurations. A blocking transfer that sees
/// the epoch change knows its endpoint was torn down underneath it.
///
/// Everything is behind a `Cell`, so the callbacks may query the state
/// while an interrupt handler changes it.
pub struct DeviceState<T> {
    state: Cell<State>,
    configuration: Cell<u8>,
    suspended: Cell<bool>,
    epoch: Cell<u32>,
    configured_waiter: Cell<Option<T>>,
}

impl<T> DeviceState<T> {
    pub const fn new() -> Self {
        DeviceState {
            state: Cell::new(State::Default),
            configuration: Cell::new(0),
            suspended: Cell::new(false),
            epoch: Cell::new(0),
            configured_waiter: Cell::new(None),
        }
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    /// Change the state, and notify the callbacks
    ///
    /// Does nothing if the state doesn't change. Returns the thread to wake,
    /// if the device just became configured.
    pub fn set_state(&self, state: State, callbacks: &mut dyn Callbacks) -> Option<T> {
        let previous = self.state.replace(state);
        if previous == state {
            return None;
        }
        debug!("Device state {=u8} -> {=u8}", previous as u8, state as u8);
        let waiter = if state == State::Configured {
            self.configured_waiter.take()
        } else {
            None
        };
        callbacks.state_changed(state);
        waiter
    }

    pub fn configuration(&self) -> u8 {
        self.configuration.get()
    }

    /// Record the active configuration, and notify the callbacks
    ///
    /// The callbacks run even if `configuration` is the current value, so
    /// applications see a configuration being selected again after a reset.
    pub fn set_configuration(&self, configuration: u8, callbacks: &mut dyn Callbacks) {
        self.configuration.set(configuration);
        callbacks.configuration_changed(configuration);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.get()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.set(suspended);
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.get()
    }

    /// Note that every endpoint was deconfigured
    pub fn advance_epoch(&self) {
        self.epoch.set(self.epoch.get().wrapping_add(1));
    }

    /// Register `thread` to be woken when the device is configured
    ///
    /// Replaces any other waiting thread.
    pub fn wait_for_configured(&self, thread: T) {
        self.configured_waiter.set(Some(thread));
    }
}

#[cfg(test)]
mod test {
    use super::{DeviceState, State};
    use crate::sim::Recorder;

    #[test]
    fn unchanged_state_is_silent() {
        let mut recorder = Recorder::default();
        let state = DeviceState::<u32>::new();
        assert_eq!(state.set_state(State::Default, &mut recorder), None);
        assert!(recorder.states.is_empty());

        state.set_state(State::Address, &mut recorder);
        state.set_state(State::Address, &mut recorder);
        assert_eq!(recorder.states, [State::Address]);
    }

    #[test]
    fn configured_wakes_waiter() {
        let mut recorder = Recorder::default();
        let state = DeviceState::new();
        state.wait_for_configured(7u32);
        assert_eq!(state.set_state(State::Address, &mut recorder), None);
        assert_eq!(state.set_state(State::Configured, &mut recorder), Some(7));
        assert_eq!(state.set_state(State::Address, &mut recorder), None);
        assert_eq!(state.set_state(State::Configured, &mut recorder), None);
    }

    #[test]
    fn configuration_always_notifies() {
        let mut recorder = Recorder::default();
        let state = DeviceState::<u32>::new();
        state.set_configuration(1, &mut recorder);
        state.set_configuration(1, &mut recorder);
        assert_eq!(state.configuration(), 1);
        assert_eq!(recorder.configurations, [1, 1]);
    }

    #[test]
    fn epoch_wraps() {
        let state = DeviceState::<u32>::new();
        state.epoch.set(u32::MAX);
        state.advance_epoch();
        assert_eq!(state.epoch(), 0);
    }
}
