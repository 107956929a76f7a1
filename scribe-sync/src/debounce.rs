//! Coalescing timer.
//!
//! A [`Debouncer`] holds at most one pending payload. Arming while armed
//! replaces the payload and pushes the deadline out; nothing queues. The
//! owner polls it from its event loop (typically via
//! [`Debouncer::deadline`] in a `select!`), so no task or callback is
//! involved and cancellation is just dropping the payload.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(Instant, T)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or re-arm) with `payload`, expiring `delay` after `now`.
    ///
    /// Returns `true` if a previous payload was replaced.
    pub fn arm(&mut self, payload: T, now: Instant) -> bool {
        self.pending.replace((now + self.delay, payload)).is_some()
    }

    /// Drop the pending payload without firing.
    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take().map(|(_, payload)| payload)
    }

    /// Fire now regardless of the deadline.
    pub fn flush(&mut self) -> Option<T> {
        self.cancel()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(at, _)| *at)
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the payload if its deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((at, _)) if *at <= now => self.cancel(),
            _ => None,
        }
    }
}
