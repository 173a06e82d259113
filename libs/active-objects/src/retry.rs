// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::object::{ActiveObject, Context};
use crate::task::TaskCore;
use crate::time::Instant;
use core::time::Duration;

/// Decorator that retries a failing hook with base-2 exponential backoff.
///
/// While an error is outstanding, invocations before the retry deadline
/// return cleanly without running the inner hook, so an external signal
/// cannot shorten a backoff. When the deadline arrives the inner hook runs again; a
/// clean return clears the error, another failure doubles the interval
/// (clamped to the maximum) and re-raises, so the caller's error policy still
/// observes every failure.
pub struct WithRetries<T> {
    inner: T,
    min_retry_interval: Duration,
    max_retry_interval: Duration,
    next_retry: Option<Instant>,
    next_interval: Option<Duration>,
}

// === impl WithRetries ===

impl<T: ActiveObject> WithRetries<T> {
    /// Wraps `inner` with the default backoff window of 1s..60s.
    pub fn new(inner: T) -> Self {
        Self::with_intervals(inner, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Wraps `inner` with a custom backoff window. The very first failure
    /// retries after `min_retry_interval` verbatim.
    pub fn with_intervals(
        inner: T,
        min_retry_interval: Duration,
        max_retry_interval: Duration,
    ) -> Self {
        Self {
            inner,
            min_retry_interval,
            max_retry_interval,
            next_retry: None,
            next_interval: None,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: ActiveObject> ActiveObject for WithRetries<T> {
    fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()> {
        if let Some(at) = self.next_retry {
            if !cx.reached(Some(at)) {
                // not yet time to retry; `reached` kept us scheduled for it
                return Ok(());
            }
        }
        match self.inner.process(cx) {
            Ok(()) => {
                self.next_retry = None;
                Ok(())
            }
            Err(err) => {
                let interval = match (self.next_retry, self.next_interval) {
                    (Some(_), Some(previous)) => {
                        previous.saturating_mul(2).min(self.max_retry_interval)
                    }
                    _ => self.min_retry_interval,
                };
                self.next_interval = Some(interval);
                self.next_retry = Some(cx.schedule_delay(interval));
                Err(err)
            }
        }
    }

    fn task(&self) -> Option<&TaskCore> {
        self.inner.task()
    }

    fn task_mut(&mut self) -> Option<&mut TaskCore> {
        self.inner.task_mut()
    }

    fn cancel(&mut self, cx: &mut Context<'_>, kill: bool) {
        self.inner.cancel(cx, kill);
    }

    fn on_close(&mut self, cx: &mut Context<'_>) {
        self.inner.on_close(cx);
    }

    fn was_error(&self) -> bool {
        self.next_retry.is_some()
    }
}
