// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::controller::Controller;
use crate::slab::define_handle;
use crate::task::TaskCore;
use crate::time::Instant;
use core::time::Duration;

define_handle! {
    /// Handle to an active object registered with a [`Controller`].
    ///
    /// Handles are generation-checked: after the object is closed, every
    /// operation through an outstanding handle becomes an inert no-op (or
    /// `None`/`false` for queries).
    ObjectRef
}

/// A stable per-class discriminator; together with the user-assigned `u64` id
/// it forms an object's identity in the controller's identity index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Kind(pub u32);

/// A long-lived stateful agent driven by the scheduler.
///
/// Implementors supply [`ActiveObject::process`], the hook the controller
/// invokes whenever the object is dispatched from a ready queue. The hook
/// receives a [`Context`] that targets the object itself and reaches the
/// whole controller, so it can reschedule itself, signal peers, or spawn and
/// close objects.
///
/// The remaining methods are capability probes with inert defaults: decorator
/// types such as [`WithRetries`](crate::WithRetries) wrap the hook, task
/// agents expose their [`TaskCore`], and cancellable agents override
/// [`ActiveObject::cancel`].
///
/// Any `FnMut(&mut Context<'_>) -> anyhow::Result<()>` closure is an active
/// object.
pub trait ActiveObject: Send + 'static {
    /// The process hook.
    fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()>;

    /// The embedded task state, for agents that are tasks.
    fn task(&self) -> Option<&TaskCore> {
        None
    }

    /// Mutable access to the embedded task state.
    fn task_mut(&mut self) -> Option<&mut TaskCore> {
        None
    }

    /// Cooperative cancellation request; `kill` asks for the forceful flavor.
    fn cancel(&mut self, cx: &mut Context<'_>, kill: bool) {
        let _ = (cx, kill);
    }

    /// Teardown run while the object is being closed, before its slot is
    /// freed.
    fn on_close(&mut self, cx: &mut Context<'_>) {
        let _ = cx;
    }

    /// Whether the most recent hook invocation left an outstanding error.
    fn was_error(&self) -> bool {
        false
    }
}

impl<F> ActiveObject for F
where
    F: FnMut(&mut Context<'_>) -> anyhow::Result<()> + Send + 'static,
{
    fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()> {
        self(cx)
    }
}

/// The view a process hook gets of the world: the controller, plus
/// conveniences that target the object being processed.
pub struct Context<'a> {
    pub(crate) controller: &'a mut Controller,
    pub(crate) object: ObjectRef,
}

// === impl Context ===

impl Context<'_> {
    /// The object this context targets.
    #[inline]
    pub fn me(&self) -> ObjectRef {
        self.object
    }

    /// The whole controller, for operations on other objects.
    #[inline]
    pub fn controller(&mut self) -> &mut Controller {
        &mut *self.controller
    }

    pub fn now(&self) -> Instant {
        self.controller.now()
    }

    /// Schedules this object for `t`; later times than an already pending
    /// wakeup are ignored.
    pub fn schedule(&mut self, t: Instant) {
        self.controller.schedule(self.object, t);
    }

    /// Schedules this object `delay` from now, returning the computed time.
    pub fn schedule_delay(&mut self, delay: Duration) -> Instant {
        self.controller.schedule_delay(self.object, delay)
    }

    pub fn schedule_milliseconds(&mut self, millis: u64) -> Instant {
        self.controller.schedule_milliseconds(self.object, millis)
    }

    pub fn schedule_seconds(&mut self, secs: u64) -> Instant {
        self.controller.schedule_seconds(self.object, secs)
    }

    pub fn schedule_minutes(&mut self, minutes: u64) -> Instant {
        self.controller.schedule_minutes(self.object, minutes)
    }

    pub fn unschedule(&mut self) {
        self.controller.unschedule(self.object);
    }

    /// Enqueues this object into its priority's ready queue (idempotent).
    pub fn signal(&mut self) {
        self.controller.signal(self.object);
    }

    /// Moves this object to the tail of the lowest-priority ready queue,
    /// yielding to any other pending work before it runs again.
    pub fn resignal(&mut self) {
        self.controller.resignal(self.object);
    }

    /// Returns `true` if `t` is absent or has passed; otherwise schedules
    /// this object for `t` and returns `false`.
    pub fn reached(&mut self, t: Option<Instant>) -> bool {
        self.controller.reached(self.object, t)
    }

    /// Drops this object from the time index and the ready queues, keeping
    /// its identity registration; it stays idle until signaled again.
    pub fn deactivate(&mut self) {
        self.controller.deactivate(self.object);
    }

    /// Closes this object. Terminal; the body is dropped once the current
    /// hook returns.
    pub fn close(&mut self) {
        self.controller.close(self.object);
    }
}

/// Builder returned by [`Controller::build_object`].
///
/// An object is indexed by identity only when *both* a kind and an id are
/// supplied. Freshly spawned objects are implicitly signaled.
pub struct ObjectBuilder<'a> {
    controller: &'a mut Controller,
    kind: Option<Kind>,
    id: Option<u64>,
    priority: usize,
}

// === impl ObjectBuilder ===

impl<'a> ObjectBuilder<'a> {
    pub(crate) fn new(controller: &'a mut Controller) -> Self {
        Self {
            controller,
            kind: None,
            id: None,
            priority: 0,
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The object's priority, fixed for its lifetime. Lower is served first.
    ///
    /// # Panics
    ///
    /// `spawn` panics if the priority is not below the controller's priority
    /// count.
    #[must_use]
    pub fn priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Registers `body` with the controller and returns its handle.
    pub fn spawn(self, body: impl ActiveObject) -> ObjectRef {
        self.controller
            .spawn_object(self.kind, self.id, self.priority, Box::new(body))
    }
}
