//! Payload-free synchronous publish/subscribe.
//!
//! Messages carry only a kind, the publishing component and a specifier
//! saying which instance published (left or right wheel, ...). Subscribers
//! pull the actual state through accessors afterwards. The bus holds weak
//! registrations only and never owns a subscriber.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::rc::Weak;

/// Registrations allowed per message kind. The set of subscribers in the
/// system is closed, so running out is a wiring bug.
pub const MAX_SUBSCRIBERS: usize = 4;

const_assert!(MAX_SUBSCRIBERS > 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    WheelHalt,
    WheelPower,
    TargetSpeed,
    SpeedControl,
    RoverPose,
    GoalState,
}

impl MessageKind {
    pub const COUNT: usize = 6;

    pub const ALL: [MessageKind; Self::COUNT] = [
        MessageKind::WheelHalt,
        MessageKind::WheelPower,
        MessageKind::TargetSpeed,
        MessageKind::SpeedControl,
        MessageKind::RoverPose,
        MessageKind::GoalState,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Specifier {
    LeftWheel,
    RightWheel,
    Rover,
    Behavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Publisher {
    DriveWheel,
    Rover,
    GotoGoal,
}

pub trait Subscriber {
    /// Invoked synchronously from inside `publish`. Must not block and must
    /// not reach back into the publisher; record what happened and act on
    /// it from the poll loop.
    fn on_message(&self, publisher: Publisher, kind: MessageKind, specifier: Specifier);
}

type Slots = Vec<Weak<dyn Subscriber>, MAX_SUBSCRIBERS>;

pub struct MessageBus {
    slots: [Slots; MessageKind::COUNT],
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Vec::new()),
        }
    }

    /// Register `subscriber` for `kind`. Subscribing twice is a no-op.
    ///
    /// # Panics
    ///
    /// When more than [`MAX_SUBSCRIBERS`] live registrations exist for `kind`.
    pub fn subscribe(&mut self, kind: MessageKind, subscriber: Weak<dyn Subscriber>) {
        let slots = &mut self.slots[kind.index()];

        // Drop registrations whose subscriber has gone away
        slots.retain(|slot| slot.strong_count() > 0);

        if slots.iter().any(|slot| Weak::ptr_eq(slot, &subscriber)) {
            return;
        }

        if slots.push(subscriber).is_err() {
            panic!(
                "subscriber table for {:?} exceeds capacity {}",
                kind, MAX_SUBSCRIBERS
            );
        }
    }

    /// Remove `subscriber` from `kind`, keeping the remaining order.
    /// Removing an absent subscriber is a no-op.
    pub fn unsubscribe(&mut self, kind: MessageKind, subscriber: &Weak<dyn Subscriber>) {
        let slots = &mut self.slots[kind.index()];
        if let Some(position) = slots.iter().position(|slot| Weak::ptr_eq(slot, subscriber)) {
            slots.remove(position);
        }
    }

    pub fn is_subscribed(&self, kind: MessageKind, subscriber: &Weak<dyn Subscriber>) -> bool {
        self.slots[kind.index()]
            .iter()
            .any(|slot| Weak::ptr_eq(slot, subscriber))
    }

    /// Deliver to every live subscriber of `kind` in subscription order.
    pub fn publish(&self, publisher: Publisher, kind: MessageKind, specifier: Specifier) {
        for slot in self.slots[kind.index()].iter() {
            if let Some(subscriber) = slot.upgrade() {
                subscriber.on_message(publisher, kind, specifier);
            }
        }
    }

    pub fn subscriber_count(&self, kind: MessageKind) -> usize {
        self.slots[kind.index()].len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_map();
        for kind in MessageKind::ALL {
            list.entry(&kind, &self.subscriber_count(kind));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Counter {
        hits: Cell<u32>,
        last: Cell<Option<Specifier>>,
    }

    impl Subscriber for Counter {
        fn on_message(&self, _publisher: Publisher, _kind: MessageKind, specifier: Specifier) {
            self.hits.set(self.hits.get() + 1);
            self.last.set(Some(specifier));
        }
    }

    fn weak(counter: &Rc<Counter>) -> Weak<dyn Subscriber> {
        Rc::downgrade(counter) as Weak<dyn Subscriber>
    }

    #[test]
    fn test_dead_registrations_are_skipped_and_pruned() {
        let mut bus = MessageBus::new();
        let survivor = Rc::new(Counter::default());
        {
            let transient = Rc::new(Counter::default());
            bus.subscribe(MessageKind::RoverPose, weak(&transient));
        }
        bus.publish(Publisher::Rover, MessageKind::RoverPose, Specifier::Rover);

        bus.subscribe(MessageKind::RoverPose, weak(&survivor));
        assert_eq!(bus.subscriber_count(MessageKind::RoverPose), 1);
    }

    #[test]
    fn test_specifier_is_delivered() {
        let mut bus = MessageBus::new();
        let counter = Rc::new(Counter::default());
        bus.subscribe(MessageKind::WheelPower, weak(&counter));

        bus.publish(Publisher::DriveWheel, MessageKind::WheelPower, Specifier::RightWheel);
        assert_eq!(counter.last.get(), Some(Specifier::RightWheel));
    }

    #[test]
    #[should_panic(expected = "exceeds capacity")]
    fn test_overflow_is_fatal() {
        let mut bus = MessageBus::new();
        let counters: std::vec::Vec<Rc<Counter>> =
            (0..=MAX_SUBSCRIBERS).map(|_| Rc::new(Counter::default())).collect();
        for counter in &counters {
            bus.subscribe(MessageKind::GoalState, weak(counter));
        }
    }
}
