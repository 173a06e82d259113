// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::HookError;
use crate::object::{ActiveObject, Context, Kind, ObjectBuilder, ObjectRef};
use crate::signal::{FlagListenerSlot, FlagSlot, ListenerSlot, PubSlot, SignalerSlot, SubSlot};
use crate::slab::Slab;
use crate::time::Instant;
use avltree::Tree;
use core::cmp::Ordering;
use core::fmt;
use core::time::Duration;
use linked_list::List;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicBool, Ordering as MemOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Ready-queue work processed between re-checks of the async inbox and the
/// time index. Keeps a flood of signals from starving newly expired deadlines
/// and vice versa.
const PROCESS_BATCH: usize = 10;

/// Per-object scheduling state embedded in the controller's object arena.
pub(crate) struct ObjectCore {
    pub(crate) t: Option<Instant>,
    pub(crate) kind: Option<Kind>,
    pub(crate) id: Option<u64>,
    pub(crate) priority: usize,
    /// Set while a close is pending on an object whose body is out being
    /// processed; the dispatcher finishes the teardown.
    pub(crate) closed: bool,
    pub(crate) by_t: avltree::Links,
    pub(crate) by_id: avltree::Links,
    pub(crate) ready: linked_list::Links<usize>,
}

pub(crate) struct ObjectSlot {
    pub(crate) core: ObjectCore,
    /// `None` while the body is out being processed (or cancelled).
    pub(crate) body: Option<Box<dyn ActiveObject>>,
}

struct ByTime;

impl avltree::Adapter for ByTime {
    type Store = Slab<ObjectSlot>;

    fn links(store: &Self::Store, node: u32) -> &avltree::Links {
        &store.raw(node).core.by_t
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut avltree::Links {
        &mut store.raw_mut(node).core.by_t
    }
}

struct ByIdentity;

impl avltree::Adapter for ByIdentity {
    type Store = Slab<ObjectSlot>;

    fn links(store: &Self::Store, node: u32) -> &avltree::Links {
        &store.raw(node).core.by_id
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut avltree::Links {
        &mut store.raw_mut(node).core.by_id
    }
}

struct ReadyQueue;

impl linked_list::Adapter for ReadyQueue {
    type Store = Slab<ObjectSlot>;
    type Tag = usize;

    fn links(store: &Self::Store, node: u32) -> &linked_list::Links<usize> {
        &store.raw(node).core.ready
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut linked_list::Links<usize> {
        &mut store.raw_mut(node).core.ready
    }
}

fn deadline_of(store: &Slab<ObjectSlot>, node: u32) -> Instant {
    store
        .raw(node)
        .core
        .t
        .expect("time-indexed object without a deadline")
}

fn cmp_time(store: &Slab<ObjectSlot>, a: u32, b: u32) -> Ordering {
    deadline_of(store, a).cmp(&deadline_of(store, b))
}

fn identity_of(store: &Slab<ObjectSlot>, node: u32) -> (Kind, u64) {
    let core = &store.raw(node).core;
    (
        core.kind.expect("identity-indexed object without a kind"),
        core.id.expect("identity-indexed object without an id"),
    )
}

fn cmp_identity(store: &Slab<ObjectSlot>, a: u32, b: u32) -> Ordering {
    identity_of(store, a).cmp(&identity_of(store, b))
}

/// A deferred call enqueued from a foreign thread, run on the loop thread at
/// the top of the next tick.
pub(crate) type AsyncCall = Box<dyn FnOnce(&mut Controller) -> anyhow::Result<()> + Send>;

/// State shared with [`Handle`]s: the async-call inbox and the wakeup event.
pub(crate) struct Shared {
    pub(crate) inbox: Mutex<Vec<AsyncCall>>,
    pub(crate) wakeup: Event,
}

/// A set/clear event in the shape of an async `Event`: `set` stores a flag
/// and notifies, so a set that happens while nobody is sleeping is observed
/// by the next waiter instead of being lost.
pub(crate) struct Event {
    set: AtomicBool,
    notify: Notify,
}

// === impl Event ===

impl Event {
    pub(crate) fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn set(&self) {
        self.set.store(true, MemOrdering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn clear(&self) {
        self.set.store(false, MemOrdering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.set.load(MemOrdering::Acquire)
    }

    pub(crate) async fn wait(&self) {
        loop {
            // register interest before checking the flag, so a concurrent
            // `set` cannot slip between the check and the await
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The thread-safe surface of a [`Controller`].
///
/// Exactly two operations may be invoked from foreign threads: [`Handle::wakeup`]
/// and [`Handle::async_call`]. Everything else on the controller is
/// loop-thread-only.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

assert_impl_all!(Handle: Send, Sync);

// === impl Handle ===

impl Handle {
    /// Wakes the drive loop if it is sleeping. Idempotent, callable from any
    /// thread.
    pub fn wakeup(&self) {
        self.shared.wakeup.set();
    }

    /// Enqueues `f` to run on the loop thread at the top of the next tick and
    /// wakes the loop.
    ///
    /// The inbox drains newest-first (LIFO); errors returned by `f` are
    /// logged and never abort the tick.
    pub fn async_call<F>(&self, f: F)
    where
        F: FnOnce(&mut Controller) -> anyhow::Result<()> + Send + 'static,
    {
        lock_inbox(&self.shared).push(Box::new(f));
        self.shared.wakeup.set();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pending_calls", &lock_inbox(&self.shared).len())
            .finish()
    }
}

/// A poisoned inbox only means some other thread panicked mid-push; the queue
/// itself is just a `Vec`, so keep going.
fn lock_inbox(shared: &Shared) -> MutexGuard<'_, Vec<AsyncCall>> {
    shared.inbox.lock().unwrap_or_else(|err| err.into_inner())
}

/// Callbacks and limits for one [`Controller::process_with`] tick.
#[derive(Default)]
pub struct ProcessOptions<'a> {
    /// Stop after this many objects have been handled, returning `now`.
    pub max_count: Option<usize>,
    /// Runs before each object's hook; returning `true` skips the object.
    pub on_before: Option<&'a mut dyn FnMut(&mut Controller, ObjectRef) -> bool>,
    /// Runs after each hook that returned cleanly.
    pub on_success: Option<&'a mut dyn FnMut(&mut Controller, ObjectRef)>,
    /// Absorbs hook errors; without it the first error aborts the tick.
    pub on_error: Option<&'a mut dyn FnMut(&mut Controller, ObjectRef, anyhow::Error)>,
}

/// The active-objects controller: time index, identity index, priority ready
/// queues, and the drive-loop plumbing around them.
///
/// All methods except those on [`Handle`] must be called from the loop
/// thread (the thread driving [`Controller::process`]).
pub struct Controller {
    pub(crate) objects: Slab<ObjectSlot>,
    by_t: Tree<ByTime>,
    by_id: Tree<ByIdentity>,
    ready: Vec<List<ReadyQueue>>,
    pub(crate) listeners: Slab<ListenerSlot>,
    pub(crate) signalers: Slab<SignalerSlot>,
    pub(crate) flags: Slab<FlagSlot>,
    pub(crate) flag_listeners: Slab<FlagListenerSlot>,
    pub(crate) pubs: Slab<PubSlot>,
    pub(crate) subs: Slab<SubSlot>,
    terminated: bool,
    emulated_time: Option<Instant>,
    shared: Arc<Shared>,
}

assert_impl_all!(Controller: Send);

// === impl Controller ===

impl Controller {
    /// Creates a controller with `priority_count` ready queues; priority 0 is
    /// served first.
    ///
    /// # Panics
    ///
    /// Panics if `priority_count` is zero.
    pub fn new(priority_count: usize) -> Self {
        assert!(priority_count > 0, "at least one priority level is required");
        Self {
            objects: Slab::new(),
            by_t: Tree::new(),
            by_id: Tree::new(),
            ready: (0..priority_count).map(List::new).collect(),
            listeners: Slab::new(),
            signalers: Slab::new(),
            flags: Slab::new(),
            flag_listeners: Slab::new(),
            pubs: Slab::new(),
            subs: Slab::new(),
            terminated: false,
            emulated_time: None,
            shared: Arc::new(Shared {
                inbox: Mutex::new(Vec::new()),
                wakeup: Event::new(),
            }),
        }
    }

    /// The thread-safe handle to this controller.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// The current time: the emulated instant when one is set, the wall clock
    /// otherwise.
    pub fn now(&self) -> Instant {
        self.emulated_time.unwrap_or_else(Instant::now)
    }

    pub fn emulated_time(&self) -> Option<Instant> {
        self.emulated_time
    }

    pub fn set_emulated_time(&mut self, t: Option<Instant>) {
        self.emulated_time = t;
    }

    pub fn priority_count(&self) -> usize {
        self.ready.len()
    }

    /// The number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Stops the controller: the current tick winds down and every drive
    /// loop exits.
    pub fn terminate(&mut self) {
        self.terminated = true;
        self.wakeup();
    }

    /// Wakes the drive loop; see [`Handle::wakeup`].
    pub fn wakeup(&self) {
        self.shared.wakeup.set();
    }

    pub(crate) fn prepare_drive(&mut self, emulated_time: Option<Instant>) {
        self.terminated = false;
        self.emulated_time = emulated_time;
    }

    /// Starts building a new active object.
    pub fn build_object(&mut self) -> ObjectBuilder<'_> {
        ObjectBuilder::new(self)
    }

    pub(crate) fn spawn_object(
        &mut self,
        kind: Option<Kind>,
        id: Option<u64>,
        priority: usize,
        body: Box<dyn ActiveObject>,
    ) -> ObjectRef {
        assert!(
            priority < self.ready.len(),
            "priority {priority} is out of range (priority count is {})",
            self.ready.len()
        );
        let core = ObjectCore {
            t: None,
            kind,
            id,
            priority,
            closed: false,
            by_t: avltree::Links::new(),
            by_id: avltree::Links::new(),
            ready: linked_list::Links::new(),
        };
        let (index, generation) = self.objects.insert(ObjectSlot {
            core,
            body: Some(body),
        });
        if kind.is_some() && id.is_some() {
            self.by_id.insert(&mut self.objects, index, cmp_identity);
        }
        let object = ObjectRef { index, generation };
        self.signal(object);
        tracing::trace!(object = ?object, "object spawned");
        object
    }

    // -- handle plumbing ------------------------------------------------------

    fn live_index(&self, object: ObjectRef) -> Option<u32> {
        self.objects
            .get(object.index, object.generation)
            .map(|_| object.index)
    }

    fn make_ref(&self, index: u32) -> ObjectRef {
        ObjectRef {
            index,
            generation: self.objects.generation_of(index),
        }
    }

    fn core(&self, object: ObjectRef) -> Option<&ObjectCore> {
        self.objects
            .get(object.index, object.generation)
            .map(|slot| &slot.core)
    }

    /// Returns `true` while `object` refers to a live (not yet closed) object.
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.core(object).is_some()
    }

    // -- per-object operations ------------------------------------------------

    /// Schedules `object` for `t`.
    ///
    /// Monotone toward sooner: if a pending wakeup earlier than `t` exists,
    /// the call is ignored, so repeated schedules can only pull a wakeup in.
    pub fn schedule(&mut self, object: ObjectRef, t: Instant) {
        if let Some(index) = self.live_index(object) {
            self.schedule_index(index, t);
        }
    }

    fn schedule_index(&mut self, index: u32, t: Instant) {
        let core = &self.objects.raw(index).core;
        if core.closed {
            return;
        }
        let sooner = if core.by_t.is_linked() {
            match core.t {
                Some(current) => t < current,
                None => true,
            }
        } else {
            true
        };
        if !sooner {
            return;
        }
        self.by_t.remove(&mut self.objects, index);
        self.objects.raw_mut(index).core.t = Some(t);
        self.by_t.insert(&mut self.objects, index, cmp_time);
    }

    /// Schedules `object` to run `delay` from now, returning the computed
    /// absolute time.
    pub fn schedule_delay(&mut self, object: ObjectRef, delay: Duration) -> Instant {
        let t = self.now() + delay;
        self.schedule(object, t);
        t
    }

    pub fn schedule_milliseconds(&mut self, object: ObjectRef, millis: u64) -> Instant {
        self.schedule_delay(object, Duration::from_millis(millis))
    }

    pub fn schedule_seconds(&mut self, object: ObjectRef, secs: u64) -> Instant {
        self.schedule_delay(object, Duration::from_secs(secs))
    }

    pub fn schedule_minutes(&mut self, object: ObjectRef, minutes: u64) -> Instant {
        self.schedule_delay(object, Duration::from_secs(minutes * 60))
    }

    /// Drops `object` from the time index and clears its deadline.
    pub fn unschedule(&mut self, object: ObjectRef) {
        if let Some(index) = self.live_index(object) {
            self.unschedule_index(index);
        }
    }

    fn unschedule_index(&mut self, index: u32) {
        self.by_t.remove(&mut self.objects, index);
        self.objects.raw_mut(index).core.t = None;
    }

    /// Appends `object` to its priority's ready queue. Idempotent: an object
    /// that is already signaled keeps its queue position.
    pub fn signal(&mut self, object: ObjectRef) {
        if let Some(index) = self.live_index(object) {
            self.signal_index(index);
        }
    }

    pub(crate) fn signal_index(&mut self, index: u32) {
        let core = &self.objects.raw(index).core;
        if core.closed || core.ready.is_linked() {
            return;
        }
        let priority = core.priority;
        self.ready[priority].push_back(&mut self.objects, index);
    }

    /// Moves `object` to the tail of the *lowest*-priority ready queue so
    /// every other pending object gets a chance to run first.
    pub fn resignal(&mut self, object: ObjectRef) {
        let Some(index) = self.live_index(object) else {
            return;
        };
        if self.objects.raw(index).core.closed {
            return;
        }
        self.remove_from_ready(index);
        let last = self.ready.len() - 1;
        self.ready[last].push_back(&mut self.objects, index);
    }

    fn remove_from_ready(&mut self, index: u32) {
        if let Some(queue) = self.objects.raw(index).core.ready.list() {
            self.ready[queue].remove(&mut self.objects, index);
        }
    }

    /// Returns `true` if `t` is absent or has passed. Otherwise schedules
    /// `object` for `t` and returns `false`, the idiomatic "sleep until"
    /// inside a process hook.
    pub fn reached(&mut self, object: ObjectRef, t: Option<Instant>) -> bool {
        let Some(t) = t else { return true };
        if t <= self.now() {
            return true;
        }
        self.schedule(object, t);
        false
    }

    /// Takes `object` out of the time index and the ready queues while
    /// keeping its identity registration; it stays idle until signaled.
    pub fn deactivate(&mut self, object: ObjectRef) {
        let Some(index) = self.live_index(object) else {
            return;
        };
        self.unschedule_index(index);
        self.remove_from_ready(index);
    }

    /// Closes `object`: removes it from every index and queue, runs its
    /// teardown and frees the slot. Terminal; the handle goes stale.
    pub fn close(&mut self, object: ObjectRef) {
        let Some(index) = self.live_index(object) else {
            return;
        };
        self.by_t.remove(&mut self.objects, index);
        self.by_id.remove(&mut self.objects, index);
        self.remove_from_ready(index);
        {
            let core = &mut self.objects.raw_mut(index).core;
            core.t = None;
            core.closed = true;
        }
        let body = self.objects.raw_mut(index).body.take();
        if let Some(mut body) = body {
            {
                let mut cx = Context {
                    controller: self,
                    object,
                };
                body.on_close(&mut cx);
            }
            drop(body);
            self.objects.remove(object.index, object.generation);
        }
        // with the body out being processed, the dispatcher finishes the
        // teardown when the hook returns
    }

    pub fn is_signaled(&self, object: ObjectRef) -> bool {
        self.core(object).is_some_and(|core| core.ready.is_linked())
    }

    pub fn is_scheduled(&self, object: ObjectRef) -> bool {
        self.core(object).is_some_and(|core| core.by_t.is_linked())
    }

    /// The pending wakeup time of `object`, if it is scheduled.
    pub fn get_t(&self, object: ObjectRef) -> Option<Instant> {
        self.core(object)?.t
    }

    pub fn priority(&self, object: ObjectRef) -> Option<usize> {
        self.core(object).map(|core| core.priority)
    }

    pub fn kind_of(&self, object: ObjectRef) -> Option<Kind> {
        self.core(object)?.kind
    }

    pub fn id_of(&self, object: ObjectRef) -> Option<u64> {
        self.core(object)?.id
    }

    /// Whether the object's most recent hook invocation left an outstanding
    /// error (see [`WithRetries`](crate::WithRetries)).
    pub fn was_error(&self, object: ObjectRef) -> bool {
        self.objects
            .get(object.index, object.generation)
            .and_then(|slot| slot.body.as_ref())
            .is_some_and(|body| body.was_error())
    }

    /// Runs `f` with the object's body taken out of its slot, so `f` can
    /// reach both the body and the controller. Finishes a self-close.
    pub(crate) fn with_body<R>(
        &mut self,
        object: ObjectRef,
        f: impl FnOnce(&mut dyn ActiveObject, &mut Context<'_>) -> R,
    ) -> Option<R> {
        let mut body = self
            .objects
            .get_mut(object.index, object.generation)?
            .body
            .take()?;
        let result = {
            let mut cx = Context {
                controller: self,
                object,
            };
            f(&mut *body, &mut cx)
        };
        let mut returned = Some(body);
        if let Some(slot) = self.objects.get_mut(object.index, object.generation) {
            if !slot.core.closed {
                slot.body = returned.take();
            }
        }
        if let Some(mut body) = returned {
            // the hook closed its own object; run teardown and free the slot
            if self.objects.get(object.index, object.generation).is_some() {
                let mut cx = Context {
                    controller: self,
                    object,
                };
                body.on_close(&mut cx);
                drop(body);
                self.objects.remove(object.index, object.generation);
            }
        }
        Some(result)
    }

    // -- identity index -------------------------------------------------------

    /// Looks up an object by its `(kind, id)` identity.
    pub fn find(&self, kind: Kind, id: u64) -> Option<ObjectRef> {
        let index = self.by_id.find(&self.objects, move |store, node| {
            (kind, id).cmp(&identity_of(store, node))
        })?;
        Some(self.make_ref(index))
    }

    /// The object with the earliest pending wakeup.
    pub fn get_nearest(&self) -> Option<ObjectRef> {
        let index = self.by_t.first(&self.objects)?;
        Some(self.make_ref(index))
    }

    /// Signals every object, or every object of `kind`.
    pub fn signal_all(&mut self, kind: Option<Kind>) {
        self.for_each_object(kind, |controller, object| controller.signal(object));
    }

    /// Visits every identity-indexed object (of `kind`, when given) in
    /// identity order. The callback may remove the current object; traversal
    /// keeps a one-step-ahead successor.
    pub fn for_each_object(
        &mut self,
        kind: Option<Kind>,
        mut f: impl FnMut(&mut Controller, ObjectRef),
    ) {
        let _ = self.for_each_object_with_break(kind, |controller, object| {
            f(controller, object);
            None::<()>
        });
    }

    /// Like [`Controller::for_each_object`], but stops at the first callback
    /// returning `Some`, which becomes the result.
    pub fn for_each_object_with_break<V>(
        &mut self,
        kind: Option<Kind>,
        mut f: impl FnMut(&mut Controller, ObjectRef) -> Option<V>,
    ) -> Option<V> {
        let first = match kind {
            None => self.by_id.first(&self.objects),
            Some(kind) => self.by_id.find_first_eq(&self.objects, move |store, node| {
                kind.cmp(&identity_of(store, node).0)
            }),
        };
        let mut cursor = first.map(|index| self.make_ref(index));

        while let Some(object) = cursor {
            if let Some(kind) = kind {
                if self.core(object).and_then(|core| core.kind) != Some(kind) {
                    break;
                }
            }
            let next = Tree::<ByIdentity>::successor(&self.objects, object.index)
                .map(|index| self.make_ref(index));
            let value = f(self, object);
            if value.is_some() {
                return value;
            }
            // a stale successor means the callback removed it; stop rather
            // than walk through a freed slot
            cursor = next.filter(|next| self.contains(*next));
        }
        None
    }

    /// The ids of every identity-indexed object (of `kind`, when given), in
    /// identity order.
    pub fn get_ids(&self, kind: Option<Kind>) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut cursor = match kind {
            None => self.by_id.first(&self.objects),
            Some(kind) => self.by_id.find_first_eq(&self.objects, move |store, node| {
                kind.cmp(&identity_of(store, node).0)
            }),
        };
        while let Some(index) = cursor {
            let core = &self.objects.raw(index).core;
            if kind.is_some() && core.kind != kind {
                break;
            }
            if let Some(id) = core.id {
                ids.push(id);
            }
            cursor = Tree::<ByIdentity>::successor(&self.objects, index);
        }
        ids
    }

    // -- the tick -------------------------------------------------------------

    /// One tick with default options; see [`Controller::process_with`].
    ///
    /// # Errors
    ///
    /// Returns the first hook failure; install an `on_error` callback via
    /// [`Controller::process_with`] to absorb failures instead.
    pub fn process(&mut self) -> Result<Option<Instant>, HookError> {
        self.process_with(ProcessOptions::default())
    }

    /// One tick: drain the async inbox (LIFO), promote every time-expired
    /// object into its ready queue, then run ready objects in priority order,
    /// re-checking inbox and time index every [`PROCESS_BATCH`] hooks.
    ///
    /// Returns the earliest outstanding deadline once the ready queues are
    /// empty (the instant the drive loop should sleep until), or `None` when
    /// nothing is scheduled.
    ///
    /// # Errors
    ///
    /// Without `on_error`, the first hook failure aborts the tick.
    pub fn process_with(
        &mut self,
        mut opts: ProcessOptions<'_>,
    ) -> Result<Option<Instant>, HookError> {
        let mut max_count = opts.max_count.filter(|&count| count > 0);

        while !self.terminated {
            self.drain_async_calls();

            // promote expired objects, capturing each successor before the
            // removal so the walk survives it
            let now = self.now();
            let mut next_time = None;
            let mut cursor = self.by_t.first(&self.objects);
            while let Some(index) = cursor {
                let t = deadline_of(&self.objects, index);
                if t > now {
                    next_time = Some(t);
                    break;
                }
                cursor = Tree::<ByTime>::successor(&self.objects, index);
                self.unschedule_index(index);
                self.signal_index(index);
            }

            let Some(first) = self.pop_next_signaled() else {
                return Ok(next_time);
            };

            let mut item = Some(first);
            let mut batch = PROCESS_BATCH;
            while let Some(index) = item {
                self.dispatch(index, &mut opts)?;
                if let Some(count) = max_count.as_mut() {
                    *count -= 1;
                    if *count == 0 {
                        return Ok(Some(self.now()));
                    }
                }
                batch -= 1;
                if batch == 0 || self.terminated {
                    break;
                }
                item = self.pop_next_signaled();
            }
        }
        Ok(None)
    }

    fn pop_next_signaled(&mut self) -> Option<u32> {
        for queue in &mut self.ready {
            if let Some(index) = queue.pop_front(&mut self.objects) {
                return Some(index);
            }
        }
        None
    }

    fn dispatch(&mut self, index: u32, opts: &mut ProcessOptions<'_>) -> Result<(), HookError> {
        let object = self.make_ref(index);
        self.unschedule_index(index);

        if let Some(on_before) = &mut opts.on_before {
            if on_before(self, object) {
                return Ok(());
            }
        }

        let Some(result) = self.with_body(object, |body, cx| body.process(cx)) else {
            return Ok(());
        };

        match result {
            Ok(()) => {
                if let Some(on_success) = &mut opts.on_success {
                    on_success(self, object);
                }
                Ok(())
            }
            Err(source) => match &mut opts.on_error {
                Some(on_error) => {
                    on_error(self, object, source);
                    Ok(())
                }
                None => Err(HookError { object, source }),
            },
        }
    }

    /// Drains the async inbox newest-first. Per-item failures are logged and
    /// never abort the tick.
    fn drain_async_calls(&mut self) {
        loop {
            let call = lock_inbox(&self.shared).pop();
            let Some(call) = call else { break };
            if let Err(err) = call(self) {
                tracing::error!("async call failed: {err:#}");
            }
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("objects", &self.objects.len())
            .field("scheduled", &self.by_t.len())
            .field("identities", &self.by_id.len())
            .field("priorities", &self.ready.len())
            .field("terminated", &self.terminated)
            .field("emulated_time", &self.emulated_time)
            .finish_non_exhaustive()
    }
}
