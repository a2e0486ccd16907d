//! Event-count rendezvous used by hop barriers and blocking waits.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Condition rendezvous with a generation counter.
///
/// Waiters re-check their predicate under the internal mutex, so a notifier
/// that changes shared state before calling [`EventCount::notify`] can never
/// lose a wakeup. The predicate answers "should I keep waiting".
#[derive(Debug, Default)]
pub struct EventCount {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl EventCount {
    /// Creates an event count with generation zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes all current waiters.
    pub fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks the calling thread while `keep_waiting` returns true.
    pub fn await_while(&self, mut keep_waiting: impl FnMut() -> bool) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while keep_waiting() {
            generation = self
                .cond
                .wait(generation)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Blocks while `keep_waiting` returns true, up to `deadline`.
    ///
    /// Returns `true` iff the deadline elapsed with the predicate still
    /// asking to wait.
    pub fn await_while_until(
        &self,
        mut keep_waiting: impl FnMut() -> bool,
        deadline: Instant,
    ) -> bool {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if !keep_waiting() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _timeout) = self
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            generation = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    fn await_while_returns_once_predicate_clears() {
        let ec = Arc::new(EventCount::new());
        let ready = Arc::new(AtomicBool::new(false));

        let notifier = {
            let ec = Arc::clone(&ec);
            let ready = Arc::clone(&ready);
            std::thread::spawn(move || {
                ready.store(true, Ordering::Release);
                ec.notify();
            })
        };

        ec.await_while(|| !ready.load(Ordering::Acquire));
        notifier.join().expect("notifier thread must not panic");
        assert_that!(ready.load(Ordering::Acquire), eq(true));
    }

    #[rstest]
    fn await_until_reports_deadline_expiry() {
        let ec = EventCount::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        let timed_out = ec.await_while_until(|| true, deadline);
        assert_that!(timed_out, eq(true));
    }

    #[rstest]
    fn await_until_returns_early_when_predicate_clears() {
        let ec = EventCount::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let timed_out = ec.await_while_until(|| false, deadline);
        assert_that!(timed_out, eq(false));
    }
}
