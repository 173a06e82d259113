// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signaling primitives: one-shot signalers with waiter queues, listeners
//! (plain and agent-bound), level-triggered flags with directional waiter
//! queues, and the edge/level pub-sub pair.
//!
//! All of these are arena-resident: the public types are `Copy` handles into
//! slabs owned by the [`Controller`], and every operation takes the
//! controller. A listener's queue membership lives in its links tag: a
//! listener is either free or parked in exactly one signaler queue, and a
//! flag listener in at most one of a flag's two directional queues.

use crate::controller::Controller;
use crate::object::ObjectRef;
use crate::slab::define_handle;
use linked_list::{Links, List};

define_handle! {
    /// A one-shot fan-out point: listeners park on it and are signaled (and
    /// unparked) when it fires.
    Signaler
}

define_handle! {
    /// A waiter that can park in one [`Signaler`] queue at a time.
    ///
    /// A listener constructed with [`Listener::bound`] additionally signals
    /// its owning object whenever it is signaled; that is how the signaling
    /// primitives plug into the scheduler.
    Listener
}

define_handle! {
    /// A level-triggered boolean with separate "waiters for up" and "waiters
    /// for down" queues.
    Flag
}

define_handle! {
    /// A directional waiter on a [`Flag`], bound to an owning object.
    FlagListener
}

define_handle! {
    /// A publisher fanning out to [`SignalSub`] subscribers.
    SignalPub
}

define_handle! {
    /// A subscriber with a level bit and an optional edge mode that
    /// suppresses repeated notifications while the level is set.
    SignalSub
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FlagSide {
    Up,
    Down,
}

pub(crate) struct ListenerSlot {
    pub(crate) link: Links<Signaler>,
    pub(crate) owner: Option<ObjectRef>,
}

pub(crate) struct SignalerSlot {
    pub(crate) queue: List<WaiterQueue>,
}

pub(crate) struct FlagSlot {
    pub(crate) up_waiters: List<FlagWaiters>,
    pub(crate) down_waiters: List<FlagWaiters>,
    pub(crate) is_up: bool,
}

pub(crate) struct FlagListenerSlot {
    pub(crate) link: Links<(Flag, FlagSide)>,
    pub(crate) owner: ObjectRef,
}

pub(crate) struct PubSlot {
    pub(crate) subscribers: List<SubscriberList>,
}

pub(crate) struct SubSlot {
    pub(crate) link: Links<SignalPub>,
    pub(crate) owner: ObjectRef,
    pub(crate) is_set: bool,
    pub(crate) edge: bool,
}

pub(crate) struct WaiterQueue;

impl linked_list::Adapter for WaiterQueue {
    type Store = crate::slab::Slab<ListenerSlot>;
    type Tag = Signaler;

    fn links(store: &Self::Store, node: u32) -> &Links<Signaler> {
        &store.raw(node).link
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut Links<Signaler> {
        &mut store.raw_mut(node).link
    }
}

pub(crate) struct FlagWaiters;

impl linked_list::Adapter for FlagWaiters {
    type Store = crate::slab::Slab<FlagListenerSlot>;
    type Tag = (Flag, FlagSide);

    fn links(store: &Self::Store, node: u32) -> &Links<(Flag, FlagSide)> {
        &store.raw(node).link
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut Links<(Flag, FlagSide)> {
        &mut store.raw_mut(node).link
    }
}

pub(crate) struct SubscriberList;

impl linked_list::Adapter for SubscriberList {
    type Store = crate::slab::Slab<SubSlot>;
    type Tag = SignalPub;

    fn links(store: &Self::Store, node: u32) -> &Links<SignalPub> {
        &store.raw(node).link
    }

    fn links_mut(store: &mut Self::Store, node: u32) -> &mut Links<SignalPub> {
        &mut store.raw_mut(node).link
    }
}

// === impl Controller (listener plumbing) ===

impl Controller {
    /// Removes `listener` from whatever signaler queue it is parked in.
    pub(crate) fn unpark_listener(&mut self, listener: Listener) {
        let Some(slot) = self.listeners.get(listener.index, listener.generation) else {
            return;
        };
        let parked = slot.link.list();
        if let Some(signaler) = parked {
            if let Some(owner) = self.signalers.get_mut(signaler.index, signaler.generation) {
                owner.queue.remove(&mut self.listeners, listener.index);
            }
        }
    }

    /// Pop-side notification: the queue has already unlinked the listener;
    /// signal its owning object if it has one.
    fn notify_listener(&mut self, index: u32) {
        let owner = self.listeners.raw(index).owner;
        if let Some(owner) = owner {
            self.signal(owner);
        }
    }
}

// === impl Signaler ===

impl Signaler {
    pub fn new(controller: &mut Controller) -> Self {
        // the queue tag is this signaler's own handle, which is not known
        // until the slot is allocated; retag the fresh (still empty) queue
        let placeholder = Signaler {
            index: 0,
            generation: 0,
        };
        let (index, generation) = controller.signalers.insert(SignalerSlot {
            queue: List::new(placeholder),
        });
        let this = Self { index, generation };
        controller.signalers.raw_mut(index).queue = List::new(this);
        this
    }

    fn is_live(self, controller: &Controller) -> bool {
        controller.signalers.get(self.index, self.generation).is_some()
    }

    /// Parks `listener` in this signaler's waiter queue; see
    /// [`Signaler::check`] for the variant that reports whether a new parking
    /// was performed.
    pub fn wait(self, controller: &mut Controller, listener: Listener) {
        let _ = self.check(controller, listener);
    }

    /// Parks `listener`, splicing it out of any queue it currently occupies.
    /// Returns `false` when it was already parked here (idempotent).
    pub fn check(self, controller: &mut Controller, listener: Listener) -> bool {
        if !self.is_live(controller) {
            return false;
        }
        let Some(slot) = controller.listeners.get(listener.index, listener.generation) else {
            return false;
        };
        if slot.link.list() == Some(self) {
            return false;
        }
        controller.unpark_listener(listener);
        controller
            .signalers
            .raw_mut(self.index)
            .queue
            .push_back(&mut controller.listeners, listener.index);
        true
    }

    /// Pops and signals the head listener. Returns whether the queue still
    /// has waiters afterwards.
    pub fn signal_next(self, controller: &mut Controller) -> bool {
        if !self.is_live(controller) {
            return false;
        }
        let popped = controller
            .signalers
            .raw_mut(self.index)
            .queue
            .pop_front(&mut controller.listeners);
        let Some(index) = popped else { return false };
        controller.notify_listener(index);
        !controller.signalers.raw(self.index).queue.is_empty()
    }

    /// Drains the waiter queue, signaling every parked listener.
    pub fn signal_all(self, controller: &mut Controller) {
        if !self.is_live(controller) {
            return;
        }
        loop {
            let popped = controller
                .signalers
                .raw_mut(self.index)
                .queue
                .pop_front(&mut controller.listeners);
            let Some(index) = popped else { break };
            controller.notify_listener(index);
        }
    }

    pub fn is_queued(self, controller: &Controller, listener: Listener) -> bool {
        controller
            .listeners
            .get(listener.index, listener.generation)
            .is_some_and(|slot| slot.link.list() == Some(self))
    }

    pub fn has_listeners(self, controller: &Controller) -> bool {
        controller
            .signalers
            .get(self.index, self.generation)
            .is_some_and(|slot| !slot.queue.is_empty())
    }

    /// Splices every waiter of `other` onto the back of this queue, keeping
    /// their order.
    pub fn copy_from(self, controller: &mut Controller, other: Signaler) {
        if self == other || !self.is_live(controller) || !other.is_live(controller) {
            return;
        }
        loop {
            let popped = controller
                .signalers
                .raw_mut(other.index)
                .queue
                .pop_front(&mut controller.listeners);
            let Some(index) = popped else { break };
            controller
                .signalers
                .raw_mut(self.index)
                .queue
                .push_back(&mut controller.listeners, index);
        }
    }

    /// Signals all remaining waiters and frees the signaler.
    pub fn close(self, controller: &mut Controller) {
        if !self.is_live(controller) {
            return;
        }
        self.signal_all(controller);
        controller.signalers.remove(self.index, self.generation);
    }
}

// === impl Listener ===

impl Listener {
    /// A free-standing listener; being signaled just unparks it.
    pub fn new(controller: &mut Controller) -> Self {
        let (index, generation) = controller.listeners.insert(ListenerSlot {
            link: Links::new(),
            owner: None,
        });
        Self { index, generation }
    }

    /// A listener bound to `owner`: being signaled additionally signals the
    /// owning object.
    pub fn bound(controller: &mut Controller, owner: ObjectRef) -> Self {
        let (index, generation) = controller.listeners.insert(ListenerSlot {
            link: Links::new(),
            owner: Some(owner),
        });
        Self { index, generation }
    }

    pub fn wait(self, controller: &mut Controller, signaler: Signaler) {
        signaler.wait(controller, self);
    }

    pub fn check(self, controller: &mut Controller, signaler: Signaler) -> bool {
        signaler.check(controller, self)
    }

    /// Signals this listener directly: unparks it and signals its owner, if
    /// bound.
    pub fn signal(self, controller: &mut Controller) {
        let Some(slot) = controller.listeners.get(self.index, self.generation) else {
            return;
        };
        let owner = slot.owner;
        controller.unpark_listener(self);
        if let Some(owner) = owner {
            controller.signal(owner);
        }
    }

    /// A listener is "signaled" while it is not parked anywhere.
    pub fn is_signaled(self, controller: &Controller) -> bool {
        controller
            .listeners
            .get(self.index, self.generation)
            .is_none_or(|slot| !slot.link.is_linked())
    }

    /// Unparks without signaling the owner.
    pub fn remove(self, controller: &mut Controller) {
        controller.unpark_listener(self);
    }

    /// Unparks and frees the listener.
    pub fn close(self, controller: &mut Controller) {
        controller.unpark_listener(self);
        controller.listeners.remove(self.index, self.generation);
    }
}

// === impl Flag ===

impl Flag {
    /// A new flag, initially down.
    pub fn new(controller: &mut Controller) -> Self {
        // both queue tags carry the flag's own handle; retag the fresh
        // (still empty) queues once the slot is allocated
        let placeholder = Flag {
            index: 0,
            generation: 0,
        };
        let (index, generation) = controller.flags.insert(FlagSlot {
            up_waiters: List::new((placeholder, FlagSide::Up)),
            down_waiters: List::new((placeholder, FlagSide::Down)),
            is_up: false,
        });
        let this = Self { index, generation };
        let slot = controller.flags.raw_mut(index);
        slot.up_waiters = List::new((this, FlagSide::Up));
        slot.down_waiters = List::new((this, FlagSide::Down));
        this
    }

    pub fn is_up(self, controller: &Controller) -> bool {
        controller
            .flags
            .get(self.index, self.generation)
            .is_some_and(|slot| slot.is_up)
    }

    /// Raises the flag, notifying all up-waiters when the level actually
    /// changed. Returns whether it changed.
    pub fn up(self, controller: &mut Controller) -> bool {
        self.transition(controller, true, true)
    }

    /// Raises the flag without notifying; pair with [`Flag::notify`] to wake
    /// waiters one at a time.
    pub fn up_quiet(self, controller: &mut Controller) -> bool {
        self.transition(controller, true, false)
    }

    /// Lowers the flag, notifying all down-waiters when the level actually
    /// changed. Returns whether it changed.
    pub fn down(self, controller: &mut Controller) -> bool {
        self.transition(controller, false, true)
    }

    pub fn down_quiet(self, controller: &mut Controller) -> bool {
        self.transition(controller, false, false)
    }

    fn transition(self, controller: &mut Controller, up: bool, notify: bool) -> bool {
        let Some(slot) = controller.flags.get_mut(self.index, self.generation) else {
            return false;
        };
        if slot.is_up == up {
            return false;
        }
        slot.is_up = up;
        if notify {
            self.notify_all(controller);
        }
        true
    }

    fn pop_matching_waiter(self, controller: &mut Controller) -> Option<u32> {
        let slot = controller.flags.raw_mut(self.index);
        let queue = if slot.is_up {
            &mut slot.up_waiters
        } else {
            &mut slot.down_waiters
        };
        queue.pop_front(&mut controller.flag_listeners)
    }

    /// Wakes every waiter on the side matching the current level.
    pub fn notify_all(self, controller: &mut Controller) {
        if controller.flags.get(self.index, self.generation).is_none() {
            return;
        }
        while let Some(index) = self.pop_matching_waiter(controller) {
            let owner = controller.flag_listeners.raw(index).owner;
            controller.signal(owner);
        }
    }

    /// Wakes one waiter on the side matching the current level; returns
    /// whether more remain.
    pub fn notify(self, controller: &mut Controller) -> bool {
        if controller.flags.get(self.index, self.generation).is_none() {
            return false;
        }
        let Some(index) = self.pop_matching_waiter(controller) else {
            return false;
        };
        let owner = controller.flag_listeners.raw(index).owner;
        controller.signal(owner);
        let slot = controller.flags.raw(self.index);
        let queue = if slot.is_up {
            &slot.up_waiters
        } else {
            &slot.down_waiters
        };
        !queue.is_empty()
    }

    /// Unparks both waiter queues without signaling and frees the flag.
    pub fn close(self, controller: &mut Controller) {
        if controller.flags.get(self.index, self.generation).is_none() {
            return;
        }
        loop {
            let popped = controller
                .flags
                .raw_mut(self.index)
                .up_waiters
                .pop_front(&mut controller.flag_listeners);
            if popped.is_none() {
                break;
            }
        }
        loop {
            let popped = controller
                .flags
                .raw_mut(self.index)
                .down_waiters
                .pop_front(&mut controller.flag_listeners);
            if popped.is_none() {
                break;
            }
        }
        controller.flags.remove(self.index, self.generation);
    }
}

// === impl FlagListener ===

impl FlagListener {
    pub fn new(controller: &mut Controller, owner: ObjectRef) -> Self {
        let (index, generation) = controller.flag_listeners.insert(FlagListenerSlot {
            link: Links::new(),
            owner,
        });
        Self { index, generation }
    }

    /// Returns the flag's current level. When the flag is down, parks this
    /// listener in the up-waiter queue (splicing it out of wherever it was),
    /// so the owner is signaled once the flag goes up.
    pub fn is_up(self, controller: &mut Controller, flag: Flag) -> bool {
        let level = flag.is_up(controller);
        let Some(slot) = controller.flag_listeners.get(self.index, self.generation) else {
            return level;
        };
        let parked = slot.link.list();
        if level {
            if parked == Some((flag, FlagSide::Up)) {
                controller
                    .flags
                    .raw_mut(flag.index)
                    .up_waiters
                    .remove(&mut controller.flag_listeners, self.index);
            }
            true
        } else {
            if controller.flags.get(flag.index, flag.generation).is_none() {
                return false;
            }
            if parked != Some((flag, FlagSide::Up)) {
                self.unpark(controller);
                controller
                    .flags
                    .raw_mut(flag.index)
                    .up_waiters
                    .push_back(&mut controller.flag_listeners, self.index);
            }
            false
        }
    }

    /// The mirror of [`FlagListener::is_up`]: returns whether the flag is
    /// down, parking in the down-waiter queue while it is up.
    pub fn is_down(self, controller: &mut Controller, flag: Flag) -> bool {
        let level = flag.is_up(controller);
        let Some(slot) = controller.flag_listeners.get(self.index, self.generation) else {
            return !level;
        };
        let parked = slot.link.list();
        if !level {
            if parked == Some((flag, FlagSide::Down)) {
                controller
                    .flags
                    .raw_mut(flag.index)
                    .down_waiters
                    .remove(&mut controller.flag_listeners, self.index);
            }
            true
        } else {
            if controller.flags.get(flag.index, flag.generation).is_none() {
                return false;
            }
            if parked != Some((flag, FlagSide::Down)) {
                self.unpark(controller);
                controller
                    .flags
                    .raw_mut(flag.index)
                    .down_waiters
                    .push_back(&mut controller.flag_listeners, self.index);
            }
            false
        }
    }

    fn unpark(self, controller: &mut Controller) {
        let Some(slot) = controller.flag_listeners.get(self.index, self.generation) else {
            return;
        };
        let parked = slot.link.list();
        if let Some((flag, side)) = parked {
            if let Some(flag_slot) = controller.flags.get_mut(flag.index, flag.generation) {
                let queue = match side {
                    FlagSide::Up => &mut flag_slot.up_waiters,
                    FlagSide::Down => &mut flag_slot.down_waiters,
                };
                queue.remove(&mut controller.flag_listeners, self.index);
            }
        }
    }

    /// Unparks and frees the listener.
    pub fn close(self, controller: &mut Controller) {
        self.unpark(controller);
        controller.flag_listeners.remove(self.index, self.generation);
    }
}

// === impl SignalPub ===

impl SignalPub {
    pub fn new(controller: &mut Controller) -> Self {
        // the subscriber-list tag is this publisher's own handle; retag the
        // fresh (still empty) list once the slot is allocated
        let placeholder = SignalPub {
            index: 0,
            generation: 0,
        };
        let (index, generation) = controller.pubs.insert(PubSlot {
            subscribers: List::new(placeholder),
        });
        let this = Self { index, generation };
        controller.pubs.raw_mut(index).subscribers = List::new(this);
        this
    }

    /// Notifies subscribers: edge subscribers whose level is already set are
    /// skipped, everyone else has its level set and its owner signaled.
    /// Subscribers stay subscribed.
    pub fn signal(self, controller: &mut Controller) {
        if controller.pubs.get(self.index, self.generation).is_none() {
            return;
        }
        let mut cursor = controller.pubs.raw(self.index).subscribers.first();
        while let Some(index) = cursor {
            cursor = controller
                .pubs
                .raw(self.index)
                .subscribers
                .next_of(&controller.subs, index);
            notify_subscriber(controller, index);
        }
    }

    /// One final signal-all round, unsubscribing everyone, then frees the
    /// publisher.
    pub fn close(self, controller: &mut Controller) {
        if controller.pubs.get(self.index, self.generation).is_none() {
            return;
        }
        loop {
            let popped = controller
                .pubs
                .raw_mut(self.index)
                .subscribers
                .pop_front(&mut controller.subs);
            let Some(index) = popped else { break };
            notify_subscriber(controller, index);
        }
        controller.pubs.remove(self.index, self.generation);
    }
}

fn notify_subscriber(controller: &mut Controller, index: u32) {
    let (notify, owner) = {
        let sub = controller.subs.raw_mut(index);
        if !sub.edge || !sub.is_set {
            sub.is_set = true;
            (true, sub.owner)
        } else {
            (false, sub.owner)
        }
    };
    if notify {
        controller.signal(owner);
    }
}

// === impl SignalSub ===

impl SignalSub {
    /// A subscriber owned by `owner`; `edge` suppresses repeated
    /// notifications while the level bit stays set.
    pub fn new(controller: &mut Controller, owner: ObjectRef, edge: bool) -> Self {
        let (index, generation) = controller.subs.insert(SubSlot {
            link: Links::new(),
            owner,
            is_set: false,
            edge,
        });
        Self { index, generation }
    }

    pub fn subscribe(self, controller: &mut Controller, publisher: SignalPub) {
        if controller.subs.get(self.index, self.generation).is_none()
            || controller.pubs.get(publisher.index, publisher.generation).is_none()
        {
            return;
        }
        self.unsubscribe(controller);
        controller
            .pubs
            .raw_mut(publisher.index)
            .subscribers
            .push_back(&mut controller.subs, self.index);
    }

    pub fn unsubscribe(self, controller: &mut Controller) {
        let Some(slot) = controller.subs.get(self.index, self.generation) else {
            return;
        };
        let parked = slot.link.list();
        if let Some(publisher) = parked {
            if let Some(pub_slot) = controller.pubs.get_mut(publisher.index, publisher.generation) {
                pub_slot.subscribers.remove(&mut controller.subs, self.index);
            }
        }
    }

    pub fn is_subscribed(self, controller: &Controller) -> bool {
        controller
            .subs
            .get(self.index, self.generation)
            .is_some_and(|slot| slot.link.is_linked())
    }

    /// Active means "has something to report": the level bit is set, or the
    /// subscription is gone (a closed publisher counts as activity).
    pub fn is_active(self, controller: &Controller) -> bool {
        controller
            .subs
            .get(self.index, self.generation)
            .is_some_and(|slot| slot.is_set || !slot.link.is_linked())
    }

    /// The level-to-edge conversion primitive: returns the prior activity
    /// state and clears the level bit.
    pub fn reset(self, controller: &mut Controller) -> bool {
        let active = self.is_active(controller);
        if let Some(slot) = controller.subs.get_mut(self.index, self.generation) {
            slot.is_set = false;
        }
        active
    }

    pub fn close(self, controller: &mut Controller) {
        self.unsubscribe(controller);
        controller.subs.remove(self.index, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Context;
    use crate::test_util::{Log, log, push};

    fn noop(controller: &mut Controller) -> ObjectRef {
        controller.build_object().spawn(|_: &mut Context<'_>| Ok(()))
    }

    fn drained(controller: &mut Controller) {
        controller.process().unwrap();
    }

    #[test]
    fn parking_is_idempotent_per_signaler() {
        let mut controller = Controller::new(1);
        let signaler = Signaler::new(&mut controller);
        let listener = Listener::new(&mut controller);

        assert!(signaler.check(&mut controller, listener));
        assert!(!signaler.check(&mut controller, listener));
        assert!(signaler.is_queued(&controller, listener));
        assert!(!listener.is_signaled(&controller));
        assert!(signaler.has_listeners(&controller));
    }

    #[test]
    fn waiting_on_another_signaler_splices() {
        let mut controller = Controller::new(1);
        let first = Signaler::new(&mut controller);
        let second = Signaler::new(&mut controller);
        let listener = Listener::new(&mut controller);

        listener.wait(&mut controller, first);
        listener.wait(&mut controller, second);

        assert!(!first.has_listeners(&controller));
        assert!(second.is_queued(&controller, listener));
    }

    #[test]
    fn signal_next_pops_in_arrival_order() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        let b = noop(&mut controller);
        drained(&mut controller);
        let signaler = Signaler::new(&mut controller);
        let la = Listener::bound(&mut controller, a);
        let lb = Listener::bound(&mut controller, b);
        signaler.wait(&mut controller, la);
        signaler.wait(&mut controller, lb);

        assert!(signaler.signal_next(&mut controller));
        assert!(controller.is_signaled(a));
        assert!(!controller.is_signaled(b));
        assert!(la.is_signaled(&controller));

        assert!(!signaler.signal_next(&mut controller));
        assert!(controller.is_signaled(b));
        assert!(!signaler.signal_next(&mut controller));
    }

    #[test]
    fn signal_all_drains_and_unparks() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let signaler = Signaler::new(&mut controller);
        let bound = Listener::bound(&mut controller, a);
        let plain = Listener::new(&mut controller);
        signaler.wait(&mut controller, bound);
        signaler.wait(&mut controller, plain);

        signaler.signal_all(&mut controller);

        assert!(!signaler.has_listeners(&controller));
        assert!(bound.is_signaled(&controller));
        assert!(plain.is_signaled(&controller));
        assert!(controller.is_signaled(a));
    }

    #[test]
    fn copy_from_preserves_order() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        let b = noop(&mut controller);
        let c = noop(&mut controller);
        drained(&mut controller);
        let target = Signaler::new(&mut controller);
        let source = Signaler::new(&mut controller);
        let la = Listener::bound(&mut controller, a);
        let lb = Listener::bound(&mut controller, b);
        let lc = Listener::bound(&mut controller, c);
        target.wait(&mut controller, la);
        source.wait(&mut controller, lb);
        source.wait(&mut controller, lc);

        target.copy_from(&mut controller, source);

        assert!(!source.has_listeners(&controller));
        // pops come out a, b, c
        target.signal_all(&mut controller);
        assert!(controller.is_signaled(a));
        assert!(controller.is_signaled(b));
        assert!(controller.is_signaled(c));
    }

    #[test]
    fn closing_a_signaler_signals_the_rest() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let signaler = Signaler::new(&mut controller);
        let listener = Listener::bound(&mut controller, a);
        signaler.wait(&mut controller, listener);

        signaler.close(&mut controller);

        assert!(controller.is_signaled(a));
        // the handle is stale now
        assert!(!signaler.has_listeners(&controller));
        assert!(!signaler.check(&mut controller, listener));
    }

    struct FlagWaiter {
        flag: Flag,
        listener: Option<FlagListener>,
        log: Log,
    }

    impl crate::ActiveObject for FlagWaiter {
        fn process(&mut self, cx: &mut Context<'_>) -> anyhow::Result<()> {
            let me = cx.me();
            if self.listener.is_none() {
                self.listener = Some(FlagListener::new(cx.controller(), me));
            }
            let listener = self.listener.expect("just initialized");
            if listener.is_up(cx.controller(), self.flag) {
                push(&self.log, 1);
            } else {
                push(&self.log, 0);
            }
            Ok(())
        }
    }

    #[test]
    fn flag_handshake_wakes_the_waiter() {
        let log = log();
        let mut controller = Controller::new(1);
        let flag = Flag::new(&mut controller);
        controller.build_object().spawn(FlagWaiter {
            flag,
            listener: None,
            log: log.clone(),
        });

        // first run: flag is down, the waiter parks
        controller.process().unwrap();
        assert_eq!(*log.lock().unwrap(), [0]);

        // raising the level signals the parked waiter
        assert!(flag.up(&mut controller));
        controller.process().unwrap();
        assert_eq!(*log.lock().unwrap(), [0, 1]);

        // the second run consumed the parking; nothing further is queued
        assert!(!flag.up(&mut controller));
        controller.process().unwrap();
        assert_eq!(*log.lock().unwrap(), [0, 1]);
    }

    #[test]
    fn flag_levels_are_idempotent() {
        let mut controller = Controller::new(1);
        let flag = Flag::new(&mut controller);

        assert!(!flag.is_up(&controller));
        assert!(flag.up(&mut controller));
        assert!(!flag.up(&mut controller));
        assert!(flag.is_up(&controller));
        assert!(flag.down(&mut controller));
        assert!(!flag.down(&mut controller));
    }

    #[test]
    fn flag_listener_parks_on_one_side_only() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let flag = Flag::new(&mut controller);
        let listener = FlagListener::new(&mut controller, a);

        // flag is down: waiting for up parks in the up queue
        assert!(!listener.is_up(&mut controller, flag));
        // switching to waiting for down moves it to the other queue
        flag.up_quiet(&mut controller);
        assert!(!listener.is_down(&mut controller, flag));

        // only the down side holds it now
        flag.down_quiet(&mut controller);
        flag.notify(&mut controller);
        assert!(controller.is_signaled(a));
    }

    #[test]
    fn quiet_transition_plus_notify_wakes_one_at_a_time() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        let b = noop(&mut controller);
        drained(&mut controller);
        let flag = Flag::new(&mut controller);
        let la = FlagListener::new(&mut controller, a);
        let lb = FlagListener::new(&mut controller, b);
        assert!(!la.is_up(&mut controller, flag));
        assert!(!lb.is_up(&mut controller, flag));

        flag.up_quiet(&mut controller);
        assert!(flag.notify(&mut controller));
        assert!(controller.is_signaled(a));
        assert!(!controller.is_signaled(b));
        assert!(!flag.notify(&mut controller));
        assert!(controller.is_signaled(b));
    }

    #[test]
    fn edge_subscribers_suppress_repeats() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let publisher = SignalPub::new(&mut controller);
        let sub = SignalSub::new(&mut controller, a, true);
        sub.subscribe(&mut controller, publisher);

        publisher.signal(&mut controller);
        assert!(controller.is_signaled(a));
        drained(&mut controller);

        // still set: the edge suppresses the second notification
        publisher.signal(&mut controller);
        assert!(!controller.is_signaled(a));

        // reset reports the pending activity and rearms the edge
        assert!(sub.reset(&mut controller));
        assert!(!sub.reset(&mut controller));
        publisher.signal(&mut controller);
        assert!(controller.is_signaled(a));
    }

    #[test]
    fn level_subscribers_always_fire() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let publisher = SignalPub::new(&mut controller);
        let sub = SignalSub::new(&mut controller, a, false);
        sub.subscribe(&mut controller, publisher);

        publisher.signal(&mut controller);
        drained(&mut controller);
        publisher.signal(&mut controller);

        assert!(controller.is_signaled(a));
        assert!(sub.is_active(&controller));
    }

    #[test]
    fn closing_a_publisher_runs_a_final_round() {
        let mut controller = Controller::new(1);
        let a = noop(&mut controller);
        drained(&mut controller);
        let publisher = SignalPub::new(&mut controller);
        let sub = SignalSub::new(&mut controller, a, true);
        sub.subscribe(&mut controller, publisher);

        publisher.close(&mut controller);

        assert!(controller.is_signaled(a));
        assert!(!sub.is_subscribed(&controller));
        // unsubscribed counts as active
        assert!(sub.is_active(&controller));
    }
}
