use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;

/// Debounce and trigger bookkeeping for a pin with edge detection enabled.
///
/// A `TriggerState` is shared between a [`GpioPort`] and the event poller it's
/// registered with. The port configures the bounce time and arms the initial
/// trigger suppression when edge detection is added, while the poller calls
/// [`accept`] for every readiness event it sees on the pin's value descriptor.
/// Every field is synchronized individually, so both sides can access the state
/// at the same time.
///
/// The port calls [`disarm`] before closing the value descriptor. Once it
/// returns, the poller won't read from that descriptor number again, even if
/// it still holds a readiness event for it.
///
/// [`GpioPort`]: struct.GpioPort.html
/// [`accept`]: #method.accept
/// [`disarm`]: #method.disarm
#[derive(Debug, Default)]
pub struct TriggerState {
    bounce_time_ms: AtomicU32,
    initial_trigger: AtomicBool,
    last_call: Mutex<Option<Instant>>,
    watching: Mutex<bool>,
}

impl TriggerState {
    /// Constructs a new `TriggerState` without a bounce time.
    pub fn new() -> TriggerState {
        TriggerState::default()
    }

    /// Returns the debounce window.
    pub fn bounce_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.bounce_time_ms.load(Ordering::SeqCst)))
    }

    /// Sets the debounce window. Triggers that follow an accepted trigger within
    /// `bounce_time` are ignored.
    ///
    /// The window has millisecond resolution.
    pub fn set_bounce_time(&self, bounce_time: Duration) {
        let ms = bounce_time.as_millis().min(u128::from(u32::MAX)) as u32;
        self.bounce_time_ms.store(ms, Ordering::SeqCst);
    }

    /// Returns `true` if the next readiness event will be ignored.
    pub fn initial_trigger(&self) -> bool {
        self.initial_trigger.load(Ordering::SeqCst)
    }

    /// When set, the next readiness event is ignored.
    ///
    /// The kernel flags a freshly opened value file as ready immediately, even
    /// when no edge has occurred yet.
    pub fn set_initial_trigger(&self, initial_trigger: bool) {
        self.initial_trigger.store(initial_trigger, Ordering::SeqCst);
    }

    /// Returns the time of the last accepted trigger.
    pub fn last_call(&self) -> Option<Instant> {
        *self.lock_last_call()
    }

    /// Overrides the time of the last accepted trigger.
    pub fn set_last_call(&self, last_call: Option<Instant>) {
        *self.lock_last_call() = last_call;
    }

    // Resets the state for a fresh edge detection session.
    pub(crate) fn arm(&self, bounce_time: Duration) {
        self.set_bounce_time(bounce_time);
        self.set_last_call(None);
        self.set_initial_trigger(true);
        *self.lock_watching() = true;
    }

    /// Returns `true` between arming edge detection and [`disarm`].
    ///
    /// [`disarm`]: #method.disarm
    pub fn is_watching(&self) -> bool {
        *self.lock_watching()
    }

    /// Marks the value descriptor as closing.
    ///
    /// Blocks until a read that's currently in progress through
    /// [`while_watching`] has finished.
    ///
    /// [`while_watching`]: #method.while_watching
    pub fn disarm(&self) {
        *self.lock_watching() = false;
    }

    /// Runs `read` unless the state has been disarmed, and keeps [`disarm`]
    /// from completing until `read` returns.
    ///
    /// [`disarm`]: #method.disarm
    pub fn while_watching<T, F: FnOnce() -> T>(&self, read: F) -> Option<T> {
        let watching = self.lock_watching();

        if *watching {
            Some(read())
        } else {
            None
        }
    }

    /// Decides whether a readiness event that occurred at `now` is a real
    /// trigger, and records it as the last accepted trigger if it is.
    pub fn accept(&self, now: Instant) -> bool {
        if self.initial_trigger.swap(false, Ordering::SeqCst) {
            trace!("Ignoring initial trigger");
            return false;
        }

        let bounce_time = self.bounce_time();
        let mut last_call = self.lock_last_call();

        if let Some(last) = *last_call {
            if now.saturating_duration_since(last) < bounce_time {
                trace!("Ignoring trigger within {:?} bounce time", bounce_time);
                return false;
            }
        }

        *last_call = Some(now);

        true
    }

    fn lock_last_call(&self) -> MutexGuard<'_, Option<Instant>> {
        // A panicking callback can't leave an Option<Instant> in an invalid state
        self.last_call.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_watching(&self) -> MutexGuard<'_, bool> {
        self.watching.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(state: &TriggerState, events: &[Instant]) -> usize {
        events.iter().filter(|&&now| state.accept(now)).count()
    }

    #[test]
    fn bounce_window() {
        let start = Instant::now();

        let state = TriggerState::new();
        state.set_bounce_time(Duration::from_millis(200));
        assert_eq!(
            accepted(&state, &[start, start + Duration::from_millis(50)]),
            1
        );

        let state = TriggerState::new();
        state.set_bounce_time(Duration::from_millis(200));
        assert_eq!(
            accepted(&state, &[start, start + Duration::from_millis(250)]),
            2
        );
    }

    #[test]
    fn initial_trigger_is_ignored_once() {
        let start = Instant::now();
        let state = TriggerState::new();
        state.arm(Duration::from_millis(0));

        assert!(!state.accept(start));
        assert!(!state.initial_trigger());
        assert!(state.accept(start + Duration::from_millis(1)));
        assert_eq!(state.last_call(), Some(start + Duration::from_millis(1)));
    }

    #[test]
    fn rejected_trigger_keeps_last_call() {
        let start = Instant::now();
        let state = TriggerState::new();
        state.set_bounce_time(Duration::from_millis(100));

        assert!(state.accept(start));
        assert!(!state.accept(start + Duration::from_millis(60)));
        // Measured from the last accepted trigger, not the last rejected one
        assert!(state.accept(start + Duration::from_millis(120)));
    }

    #[test]
    fn arm_clears_previous_session() {
        let state = TriggerState::new();
        state.set_last_call(Some(Instant::now()));

        state.arm(Duration::from_millis(200));

        assert_eq!(state.last_call(), None);
        assert!(state.initial_trigger());
        assert_eq!(state.bounce_time(), Duration::from_millis(200));
        assert!(state.is_watching());
    }

    #[test]
    fn disarmed_state_skips_reads() {
        let state = TriggerState::new();
        assert_eq!(state.while_watching(|| 1), None);

        state.arm(Duration::from_millis(0));
        assert_eq!(state.while_watching(|| 2), Some(2));

        state.disarm();
        assert!(!state.is_watching());
        assert_eq!(state.while_watching(|| 3), None);
    }
}
