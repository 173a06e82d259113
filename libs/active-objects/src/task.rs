// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The tasks layer: cooperative task agents that expose a completion
//! signaler, an async-task agent driven by a spawned future, and a
//! system-process agent.
//!
//! A task's in-flight computation runs in the host async runtime, not on the
//! loop thread; it rejoins the scheduler strictly through
//! [`Handle::async_call`](crate::Handle::async_call), which records the exit
//! code, fans out the completion signaler and wakes the loop.

use crate::controller::Controller;
use crate::object::{ActiveObject, Context, ObjectRef};
use crate::signal::{Listener, Signaler};
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// The join handle of the in-flight computation, shared between the agent
/// body and the spawner (the handle only exists after the body is already
/// registered).
type SharedJoin = Arc<Mutex<Option<JoinHandle<()>>>>;

fn lock_join(join: &SharedJoin) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    join.lock().unwrap_or_else(|err| err.into_inner())
}

/// Task state embedded in task-shaped agents: an exit code (absent while
/// running), cancel/kill request bits, a captured error and the completion
/// signaler.
///
/// Agents embedding a `TaskCore` expose it through
/// [`ActiveObject::task`]/[`ActiveObject::task_mut`], which is what makes the
/// controller's task operations ([`Controller::set_exit_code`],
/// [`Controller::cancel`], …) reach it.
pub struct TaskCore {
    pub(crate) exit_code: Option<i32>,
    pub(crate) cancel_requested: bool,
    pub(crate) kill_requested: bool,
    pub(crate) error: Option<anyhow::Error>,
    pub(crate) completed_signal: Signaler,
}

// === impl TaskCore ===

impl TaskCore {
    pub fn new(controller: &mut Controller) -> Self {
        Self {
            exit_code: None,
            cancel_requested: false,
            kill_requested: false,
            error: None,
            completed_signal: Signaler::new(controller),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_completed(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested
    }

    pub fn is_kill_requested(&self) -> bool {
        self.kill_requested
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    /// The signaler fanned out when the task completes.
    pub fn completed_signal(&self) -> Signaler {
        self.completed_signal
    }

    /// Flips the request bits and re-signals the owning object so its hook
    /// observes the change.
    pub fn request_cancel(&mut self, cx: &mut Context<'_>, kill: bool) {
        if !self.cancel_requested {
            self.cancel_requested = true;
            cx.signal();
        }
        if kill && !self.kill_requested {
            self.kill_requested = true;
            cx.signal();
        }
    }

    /// The abstract task hook body: once an exit code is present, fans out
    /// the completion signaler and reports `true`; the caller then closes
    /// the object.
    pub fn poll_completion(&mut self, cx: &mut Context<'_>) -> bool {
        if self.exit_code.is_some() {
            self.completed_signal.signal_all(cx.controller());
            true
        } else {
            false
        }
    }

    /// Drains and frees the completion signaler; call from `on_close`.
    pub fn close(&mut self, cx: &mut Context<'_>) {
        self.completed_signal.close(cx.controller());
    }
}

// === impl Controller (task operations) ===

impl Controller {
    fn task_core_mut(&mut self, object: ObjectRef) -> Option<&mut TaskCore> {
        self.objects
            .get_mut(object.index, object.generation)?
            .body
            .as_mut()?
            .task_mut()
    }

    fn task_core(&self, object: ObjectRef) -> Option<&TaskCore> {
        self.objects
            .get(object.index, object.generation)?
            .body
            .as_ref()?
            .task()
    }

    /// Records a task's exit code. Idempotent: only the first code sticks.
    ///
    /// The object is signaled *before* the code is written, matching the
    /// original ordering; the model is single-threaded, so the intermediate
    /// state is unobservable.
    pub fn set_exit_code(&mut self, object: ObjectRef, exit_code: i32) {
        let pending = self
            .task_core_mut(object)
            .is_some_and(|task| task.exit_code.is_none());
        if !pending {
            return;
        }
        self.signal(object);
        if let Some(task) = self.task_core_mut(object) {
            task.exit_code = Some(exit_code);
        }
    }

    /// Requests cooperative cancellation of a task-shaped agent; `kill`
    /// requests the forceful flavor. Delegates to the agent's
    /// [`ActiveObject::cancel`].
    pub fn cancel(&mut self, object: ObjectRef, kill: bool) {
        let _ = self.with_body(object, |body, cx| body.cancel(cx, kill));
    }

    /// A completed task's exit code, while the task object is still alive.
    pub fn task_exit_code(&self, object: ObjectRef) -> Option<i32> {
        self.task_core(object)?.exit_code
    }

    pub fn is_task_cancelled(&self, object: ObjectRef) -> bool {
        self.task_core(object).is_some_and(TaskCore::is_cancelled)
    }

    /// Returns whether the task has completed; when it has not and a
    /// listener is given, parks the listener on the completion signaler.
    pub fn is_task_completed(&mut self, object: ObjectRef, listener: Option<Listener>) -> bool {
        let Some(task) = self.task_core(object) else {
            // a closed (freed) task counts as completed
            return true;
        };
        if task.exit_code.is_some() {
            return true;
        }
        let signaler = task.completed_signal;
        if let Some(listener) = listener {
            listener.wait(self, signaler);
        }
        false
    }

    /// Takes the task's captured error, if any.
    pub fn take_task_error(&mut self, object: ObjectRef) -> Option<anyhow::Error> {
        self.task_core_mut(object)?.take_error()
    }

    /// The task's completion signaler.
    pub fn task_completed_signal(&self, object: ObjectRef) -> Option<Signaler> {
        Some(self.task_core(object)?.completed_signal)
    }

    /// Completion path shared by the async-task agents: records the result,
    /// fans out the completion signaler. Runs on the loop thread via the
    /// async inbox.
    fn finish_task(&mut self, object: ObjectRef, result: anyhow::Result<i32>, reset_cancel: bool) {
        match result {
            Ok(exit_code) => {
                if reset_cancel {
                    if let Some(task) = self.task_core_mut(object) {
                        task.cancel_requested = false;
                    }
                }
                self.set_exit_code(object, exit_code);
            }
            Err(err) => {
                if let Some(task) = self.task_core_mut(object) {
                    task.error = Some(err);
                }
                self.set_exit_code(object, -1);
            }
        }
        if let Some(signaler) = self.task_completed_signal(object) {
            signaler.signal_all(self);
        }
    }
}

/// Registers a task body and spawns its computation on the host runtime.
///
/// Must be called from within a tokio runtime.
fn spawn_task(
    controller: &mut Controller,
    body: impl ActiveObject,
    join: SharedJoin,
    future: BoxFuture<'static, anyhow::Result<i32>>,
    reset_cancel: bool,
) -> ObjectRef {
    let object = controller.build_object().spawn(body);
    let handle = controller.handle();
    let task = tokio::spawn(async move {
        let result = future.await;
        handle.async_call(move |controller| {
            controller.finish_task(object, result, reset_cancel);
            Ok(())
        });
    });
    *lock_join(&join) = Some(task);
    object
}

/// An agent wrapping an externally driven asynchronous computation.
///
/// The computation is spawned on construction; on completion (success,
/// failure, or outside cancellation) the exit code is recorded (−1 on
/// error), any error captured, the completion signaler fanned out and the
/// loop woken. The agent's own hook then observes completion and closes the
/// object.
pub struct AsyncTask {
    core: TaskCore,
    join: SharedJoin,
    /// Whether [`Controller::cancel`] also aborts the in-flight computation.
    cancel_async_task: bool,
}

// === impl AsyncTask ===

impl AsyncTask {
    /// Spawns `future` as the task's computation.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn<F>(controller: &mut Controller, future: F) -> ObjectRef
    where
        F: Future<Output = anyhow::Result<i32>> + Send + 'static,
    {
        let core = TaskCore::new(controller);
        let join = SharedJoin::default();
        let body = AsyncTask {
            core,
            join: join.clone(),
            cancel_async_task: true,
        };
        spawn_task(controller, body, join, Box::pin(future), true)
    }

    /// Aborts the in-flight computation, reporting exit code −1.
    fn abort_async(&mut self, cx: &mut Context<'_>, kill: bool) {
        let aborted = {
            let guard = lock_join(&self.join);
            match guard.as_ref() {
                Some(task) if !task.is_finished() => {
                    task.abort();
                    true
                }
                _ => false,
            }
        };
        if !aborted {
            return;
        }
        tracing::debug!(
            reason = if kill { "killed" } else { "canceled" },
            "aborted async task"
        );
        if self.core.exit_code.is_none() {
            cx.signal();
            self.core.exit_code = Some(-1);
        }
        self.core.completed_signal.signal_all(cx.controller());
    }
}

impl ActiveObject for AsyncTask {
    fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()> {
        if self.core.poll_completion(cx) {
            cx.close();
        }
        Ok(())
    }

    fn task(&self) -> Option<&TaskCore> {
        Some(&self.core)
    }

    fn task_mut(&mut self) -> Option<&mut TaskCore> {
        Some(&mut self.core)
    }

    fn cancel(&mut self, cx: &mut Context<'_>, kill: bool) {
        self.core.request_cancel(cx, kill);
        if self.cancel_async_task {
            self.abort_async(cx, kill);
        }
    }

    fn on_close(&mut self, cx: &mut Context<'_>) {
        if let Some(task) = lock_join(&self.join).take() {
            task.abort();
        }
        self.core.close(cx);
    }
}

/// A task agent whose computation spawns an OS process and waits for its
/// exit. Stdout and stderr are discarded.
///
/// Cancellation is conveyed to the process itself (SIGTERM for cancel,
/// SIGKILL for kill), so the in-flight wait is left to observe the exit.
/// Only before the process has been spawned does cancellation fall back to
/// the generic abort path; once a pid exists the signal is best effort and
/// the wait keeps the child's real exit status.
pub struct SystemTask {
    task: AsyncTask,
    pid: Arc<AtomicU32>,
}

// === impl SystemTask ===

impl SystemTask {
    /// Spawns `argv[0]` with the remaining arguments, optionally in `cwd`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(
        controller: &mut Controller,
        argv: Vec<String>,
        cwd: Option<std::path::PathBuf>,
    ) -> ObjectRef {
        let core = TaskCore::new(controller);
        let join = SharedJoin::default();
        let pid = Arc::new(AtomicU32::new(0));
        let body = SystemTask {
            task: AsyncTask {
                core,
                join: join.clone(),
                cancel_async_task: false,
            },
            pid: pid.clone(),
        };
        spawn_task(controller, body, join, Box::pin(run_process(argv, cwd, pid)), false)
    }

    /// Delivers the cancellation signal to the child. Returns `false` only
    /// while no pid has been published yet, i.e. the child has not been
    /// spawned.
    fn deliver_signal(&self, kill: bool) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }
        // fire and forget: if the child exited just as the cancel raced in,
        // the pending wait still resolves with its real exit status
        signal_process(pid, kill);
        true
    }
}

async fn run_process(
    argv: Vec<String>,
    cwd: Option<std::path::PathBuf>,
    pid: Arc<AtomicU32>,
) -> anyhow::Result<i32> {
    anyhow::ensure!(!argv.is_empty(), "empty argument vector");
    let mut command = tokio::process::Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let mut child = command.spawn()?;
    if let Some(id) = child.id() {
        pid.store(id, Ordering::Release);
    }
    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(unix)]
fn signal_process(pid: u32, kill: bool) {
    let Ok(pid) = i32::try_from(pid) else { return };
    let signal = if kill { libc::SIGKILL } else { libc::SIGTERM };
    // Safety: sending a signal to a pid is memory-safe; at worst the pid no
    // longer exists and kill(2) reports ESRCH.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        tracing::debug!(pid, "kill(2) failed; the child has likely already exited");
    }
}

#[cfg(not(unix))]
fn signal_process(pid: u32, kill: bool) {
    let _ = (pid, kill);
    tracing::debug!("no process signals on this platform; waiting for the child to exit");
}

impl ActiveObject for SystemTask {
    fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()> {
        self.task.process(cx)
    }

    fn task(&self) -> Option<&TaskCore> {
        self.task.task()
    }

    fn task_mut(&mut self) -> Option<&mut TaskCore> {
        self.task.task_mut()
    }

    fn cancel(&mut self, cx: &mut Context<'_>, kill: bool) {
        self.task.core.request_cancel(cx, kill);
        if !self.deliver_signal(kill) {
            // not spawned yet; fall back to aborting the computation
            self.task.abort_async(cx, kill);
        }
    }

    fn on_close(&mut self, cx: &mut Context<'_>) {
        self.task.on_close(cx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ProcessOptions;
    use core::time::Duration;

    /// Drives the controller until `object` is gone, returning the exit code
    /// observed through `on_before` just before the task's final run.
    async fn drive_to_completion(controller: &mut Controller, object: ObjectRef) -> Option<i32> {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        for _ in 0..500 {
            let observer = seen.clone();
            let mut on_before = move |controller: &mut Controller, current: ObjectRef| {
                if current == object {
                    if let Some(code) = controller.task_exit_code(current) {
                        *observer.lock().unwrap() = Some(code);
                    }
                }
                false
            };
            controller
                .process_with(ProcessOptions {
                    on_before: Some(&mut on_before),
                    ..ProcessOptions::default()
                })
                .unwrap();
            if !controller.contains(object) {
                let code = *seen.lock().unwrap();
                return code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task did not complete");
    }

    #[tokio::test]
    async fn async_task_reports_its_exit_code() {
        let mut controller = Controller::new(1);
        let object = AsyncTask::spawn(&mut controller, async { Ok(7) });

        let code = drive_to_completion(&mut controller, object).await;

        assert_eq!(code, Some(7));
        assert!(!controller.contains(object));
    }

    #[tokio::test]
    async fn async_task_failure_is_minus_one_with_the_error_captured() {
        let mut controller = Controller::new(1);
        let object = AsyncTask::spawn(&mut controller, async {
            anyhow::bail!("computation failed")
        });

        // wait for the completion call to land, then inspect before the
        // task's own hook closes it
        let mut error = None;
        let mut code = None;
        for _ in 0..500 {
            let mut on_before = |controller: &mut Controller, current: ObjectRef| {
                if controller.task_exit_code(current).is_some() {
                    code = controller.task_exit_code(current);
                    error = controller.take_task_error(current);
                }
                false
            };
            controller
                .process_with(ProcessOptions {
                    on_before: Some(&mut on_before),
                    ..ProcessOptions::default()
                })
                .unwrap();
            if !controller.contains(object) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(code, Some(-1));
        assert!(error.unwrap().to_string().contains("computation failed"));
    }

    #[tokio::test]
    async fn cancel_aborts_the_computation() {
        let mut controller = Controller::new(1);
        let object = AsyncTask::spawn(&mut controller, async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(0)
        });
        // consume the spawn signal so only completion will re-signal
        controller.process().unwrap();

        controller.cancel(object, false);
        assert!(controller.is_task_cancelled(object));

        let code = drive_to_completion(&mut controller, object).await;
        assert_eq!(code, Some(-1));
    }

    #[tokio::test]
    async fn completion_listener_is_notified() {
        let mut controller = Controller::new(1);
        let ran = std::sync::Arc::new(std::sync::Mutex::new(false));
        let observed = ran.clone();
        let watcher = controller.build_object().spawn(move |_: &mut Context<'_>| {
            *observed.lock().unwrap() = true;
            Ok(())
        });
        // gate the computation so the listener parks before completion
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let object = AsyncTask::spawn(&mut controller, async {
            let _ = gate.await;
            Ok(0)
        });
        // quiesce both objects, then park a bound listener on the completion
        controller.process().unwrap();
        *ran.lock().unwrap() = false;
        let listener = Listener::bound(&mut controller, watcher);
        assert!(!controller.is_task_completed(object, Some(listener)));

        release.send(()).unwrap();
        drive_to_completion(&mut controller, object).await;

        // completion fanned out to the listener, which signaled the watcher
        assert!(*ran.lock().unwrap());
        // a freed task counts as completed
        assert!(controller.is_task_completed(object, None));
    }

    #[tokio::test]
    async fn system_task_runs_a_process() {
        let mut controller = Controller::new(1);
        let object = SystemTask::spawn(
            &mut controller,
            vec!["sh".into(), "-c".into(), "exit 7".into()],
            None,
        );

        let code = drive_to_completion(&mut controller, object).await;

        assert_eq!(code, Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelling_a_system_task_stops_the_process() {
        let mut controller = Controller::new(1);
        let object = SystemTask::spawn(
            &mut controller,
            vec!["sleep".into(), "600".into()],
            None,
        );
        controller.process().unwrap();
        // give the child a moment to spawn so the pid path is exercised
        tokio::time::sleep(Duration::from_millis(100)).await;

        controller.cancel(object, false);

        let code = drive_to_completion(&mut controller, object).await;
        // killed by signal (or aborted before the pid was known): -1
        assert_eq!(code, Some(-1));
    }
}
