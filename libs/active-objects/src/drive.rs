// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drive loops: three strategies for repeatedly ticking a [`Controller`].
//!
//! - [`async_loop`] sleeps cooperatively on the tokio runtime and is woken by
//!   [`Handle::wakeup`](crate::Handle::wakeup);
//! - [`simple_loop`] blocks the thread, for tests and single-threaded
//!   daemons with no external wakeups;
//! - [`emulate_asap`] never sleeps at all: virtual time jumps to each tick's
//!   returned deadline, which makes runs deterministic.

use crate::controller::Controller;
use crate::error::{DriveError, HookError};
use crate::time::Instant;
use core::time::Duration;

/// Drives the controller on the tokio runtime: tick, then sleep until the
/// next deadline or until woken, whichever comes first.
///
/// Returns when the controller is terminated.
///
/// # Errors
///
/// Propagates the first unhandled hook failure.
pub async fn async_loop(controller: &mut Controller) -> Result<(), HookError> {
    controller.prepare_drive(None);
    let shared = controller.shared();

    loop {
        let next_time = controller.process()?;
        if controller.is_terminated() {
            return Ok(());
        }
        if !shared.wakeup.is_set() {
            match next_time {
                Some(next) => {
                    let delta = next.duration_since(controller.now());
                    if delta > Duration::ZERO {
                        tracing::trace!(?delta, "sleeping until the next deadline");
                        let _ = tokio::time::timeout(delta, shared.wakeup.wait()).await;
                    }
                }
                None => {
                    tracing::trace!("no pending deadline, sleeping until woken");
                    shared.wakeup.wait().await;
                }
            }
        }
        shared.wakeup.clear();
    }
}

/// Drives the controller by blocking the current thread between ticks.
/// There is no wakeup: sleeps end only when the next deadline arrives.
///
/// Returns when the controller is terminated.
///
/// # Errors
///
/// Propagates the first unhandled hook failure.
pub fn simple_loop(controller: &mut Controller) -> Result<(), HookError> {
    controller.prepare_drive(None);

    loop {
        let next_time = controller.process()?;
        if controller.is_terminated() {
            return Ok(());
        }
        if let Some(next) = next_time {
            let delta = next.duration_since(controller.now());
            if delta > Duration::ZERO {
                std::thread::sleep(delta);
            }
        }
    }
}

/// Drives the controller under emulated time starting at `start_time`,
/// advancing the clock to each tick's returned deadline instead of sleeping.
///
/// Returns cleanly when the controller is terminated or when every object
/// has closed itself.
///
/// # Errors
///
/// [`DriveError::Stalled`] when live objects remain but no deadline is
/// pending (virtual time can never advance); hook failures are propagated as
/// [`DriveError::Hook`].
pub fn emulate_asap(controller: &mut Controller, start_time: Instant) -> Result<(), DriveError> {
    controller.prepare_drive(Some(start_time));

    loop {
        let next_time = controller.process()?;
        if controller.is_terminated() {
            return Ok(());
        }
        match next_time {
            Some(next) => controller.set_emulated_time(Some(next)),
            None if controller.object_count() == 0 => return Ok(()),
            None => return Err(DriveError::Stalled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Context;
    use crate::test_util::{init_tracing, log, push};
    use std::sync::{Arc, Mutex};

    /// An agent that arms a deadline on its first (spawn-signaled) run and
    /// logs the observed time when the deadline fires.
    fn deadline_agent(
        label: u32,
        at: Instant,
        log: &crate::test_util::Log,
        close_after: bool,
    ) -> impl crate::ActiveObject {
        let log = log.clone();
        let mut armed = false;
        move |cx: &mut Context<'_>| {
            if !armed {
                armed = true;
                cx.schedule(at);
            } else {
                push(&log, label);
                push(&log, u32::try_from(cx.now().as_unix().as_secs()).unwrap());
                if close_after {
                    cx.close();
                }
            }
            Ok(())
        }
    }

    #[test]
    fn asap_advances_to_each_deadline_and_detects_the_stall() {
        init_tracing();
        let start = Instant::from_secs(100);
        let log = log();
        let mut controller = Controller::new(1);
        controller
            .build_object()
            .spawn(deadline_agent(1, start + Duration::from_secs(1), &log, false));
        controller
            .build_object()
            .spawn(deadline_agent(2, start + Duration::from_secs(3), &log, false));
        {
            let log = log.clone();
            controller.build_object().spawn(move |cx: &mut Context<'_>| {
                push(&log, 3);
                push(&log, u32::try_from(cx.now().as_unix().as_secs()).unwrap());
                Ok(())
            });
        }

        let result = emulate_asap(&mut controller, start);

        // C at T, A at T+1, B at T+3, then virtual time is stuck
        assert!(matches!(result, Err(DriveError::Stalled)));
        assert_eq!(*log.lock().unwrap(), [3, 100, 1, 101, 2, 103]);
    }

    #[test]
    fn asap_ends_cleanly_when_every_object_closes() {
        let start = Instant::from_secs(0);
        let log = log();
        let mut controller = Controller::new(1);
        controller
            .build_object()
            .spawn(deadline_agent(1, start + Duration::from_secs(1), &log, true));
        controller
            .build_object()
            .spawn(deadline_agent(2, start + Duration::from_secs(3), &log, true));
        {
            let log = log.clone();
            controller.build_object().spawn(move |cx: &mut Context<'_>| {
                push(&log, 3);
                cx.close();
                Ok(())
            });
        }

        emulate_asap(&mut controller, start).unwrap();

        assert_eq!(controller.object_count(), 0);
        assert_eq!(*log.lock().unwrap(), [3, 1, 1, 2, 3]);
    }

    #[test]
    fn asap_surfaces_hook_errors() {
        let mut controller = Controller::new(1);
        controller
            .build_object()
            .spawn(|_: &mut Context<'_>| anyhow::bail!("broken"));

        let result = emulate_asap(&mut controller, Instant::from_secs(0));

        assert!(matches!(result, Err(DriveError::Hook(_))));
    }

    #[test]
    fn simple_loop_sleeps_between_reschedules() {
        let runs = Arc::new(Mutex::new(0u32));
        let seen = runs.clone();
        let mut controller = Controller::new(1);
        controller.build_object().spawn(move |cx: &mut Context<'_>| {
            let mut runs = seen.lock().unwrap();
            *runs += 1;
            if *runs < 3 {
                cx.schedule_milliseconds(5);
            } else {
                cx.close();
                cx.controller().terminate();
            }
            Ok(())
        });

        simple_loop(&mut controller).unwrap();

        assert_eq!(*runs.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn async_loop_wakes_on_async_calls() {
        let mut controller = Controller::new(1);
        let handle = controller.handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.async_call(|controller| {
                controller.terminate();
                Ok(())
            });
        });

        // with nothing scheduled the loop sleeps indefinitely until woken
        tokio::time::timeout(Duration::from_secs(5), async_loop(&mut controller))
            .await
            .expect("the wakeup must end the indefinite sleep")
            .unwrap();

        assert!(controller.is_terminated());
    }

    #[tokio::test]
    async fn async_loop_honors_deadlines() {
        let runs = Arc::new(Mutex::new(0u32));
        let seen = runs.clone();
        let mut controller = Controller::new(1);
        controller.build_object().spawn(move |cx: &mut Context<'_>| {
            let mut runs = seen.lock().unwrap();
            *runs += 1;
            if *runs < 3 {
                cx.schedule_milliseconds(5);
            } else {
                cx.controller().terminate();
            }
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(5), async_loop(&mut controller))
            .await
            .expect("deadlines must keep the loop moving")
            .unwrap();

        assert_eq!(*runs.lock().unwrap(), 3);
    }
}
