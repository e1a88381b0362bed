//! Thread suspension and critical sections
//!
//! Blocking transfers need two things from their environment: a way to
//! run code with the USB interrupts masked, and a way to put the calling
//! thread to sleep until an interrupt handler wakes it. [`Scheduler`]
//! supplies both, so the stack doesn't depend on a specific RTOS.

use bare_metal::CriticalSection;

/// Critical sections, and parking / waking threads
///
/// `park` follows park-token semantics: a `wake` that arrives before the
/// thread parks makes the next `park` return immediately. `park` may also
/// return spuriously; callers always re-check their condition.
///
/// # Safety
///
/// `free` must prevent the USB interrupt handlers, and every other caller
/// of `free` on the same device, from running until `f` returns. The
/// stack relies on this to share its state with interrupt handlers.
pub unsafe trait Scheduler {
    /// A handle to a parked thread
    type Thread;

    /// Run `f` with the USB interrupts masked
    fn free<R>(&self, f: impl FnOnce(&CriticalSection) -> R) -> R;

    /// A handle to the calling thread
    fn current(&self) -> Self::Thread;

    /// Suspend the calling thread until it's woken
    ///
    /// Called outside of any critical section.
    fn park(&self);

    /// Wake `thread`
    ///
    /// Called from interrupt handlers, inside a critical section.
    fn wake(&self, thread: &Self::Thread);
}

/// A scheduler for firmware without threads
///
/// Critical sections disable all interrupts. Parking sleeps the core with
/// `WFE`, and waking signals an event with `SEV`. The event register
/// latches a wake that arrives before the `WFE`.
///
/// Since every interrupt is masked, the high priority USB handler can't
/// preempt the low priority one. It waits for the transfer or bus event
/// being serviced, never for a whole low priority interrupt. If that's too
/// long, implement [`Scheduler`] with critical sections that mask only the
/// two USB interrupts, for example by raising `BASEPRI`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Wfe;

unsafe impl Scheduler for Wfe {
    type Thread = ();

    fn free<R>(&self, f: impl FnOnce(&CriticalSection) -> R) -> R {
        cortex_m::interrupt::free(f)
    }

    fn current(&self) -> Self::Thread {}

    fn park(&self) {
        cortex_m::asm::wfe();
    }

    fn wake(&self, _: &Self::Thread) {
        cortex_m::asm::sev();
    }
}
