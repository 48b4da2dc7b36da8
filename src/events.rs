//! Typed publish/subscribe.
//!
//! An event type is a closed sum type whose variants map onto a fieldless
//! channel enum. Listeners subscribe to a channel and receive every event
//! published on it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::rc::Rc;

/// An event that can be routed through an [`EventAggregator`].
pub trait Event: 'static {
    /// The key listeners subscribe to.
    type Channel: Copy + Eq + Hash + Debug + 'static;

    fn channel(&self) -> Self::Channel;
}

/// A listener callback. Identity is the pointer identity of the `Rc`.
pub type Listener<E> = Rc<dyn Fn(&E)>;

type Channels<E> = HashMap<<E as Event>::Channel, Vec<Listener<E>>>;

/// A registry of channel listeners.
///
/// Cloning yields another handle to the same registry.
pub struct EventAggregator<E: Event> {
    channels: Rc<RefCell<Channels<E>>>,
}

impl<E: Event> EventAggregator<E> {
    pub fn new() -> Self {
        Self {
            channels: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Calls every listener of the event's channel, in subscription order.
    ///
    /// Listeners run on a snapshot, so they may subscribe or unsubscribe
    /// while the event is being published.
    pub fn publish(&self, event: &E) {
        let listeners = match self.channels.borrow().get(&event.channel()) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in listeners {
            listener(event);
        }
    }

    pub fn has_listeners(&self, channel: E::Channel) -> bool {
        self.channels.borrow().contains_key(&channel)
    }

    /// Registers a listener. Subscribing the same listener twice on one
    /// channel keeps a single registration.
    pub fn subscribe(&self, channel: E::Channel, listener: Listener<E>) -> Subscription {
        {
            let mut channels = self.channels.borrow_mut();
            let listeners = channels.entry(channel).or_default();
            if !listeners.iter().any(|l| same_listener(l, &listener)) {
                listeners.push(listener.clone());
            }
        }

        let channels = Rc::downgrade(&self.channels);
        Subscription::new(move || {
            let Some(channels) = channels.upgrade() else {
                return;
            };

            let mut channels = channels.borrow_mut();
            if let Some(listeners) = channels.get_mut(&channel) {
                listeners.retain(|l| !same_listener(l, &listener));
                if listeners.is_empty() {
                    channels.remove(&channel);
                }
            }
        })
    }
}

impl<E: Event> Clone for EventAggregator<E> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
        }
    }
}

impl<E: Event> Default for EventAggregator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> PartialEq for EventAggregator<E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.channels, &other.channels)
    }
}

fn same_listener<E>(a: &Listener<E>, b: &Listener<E>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Removes a listener when disposed.
pub struct Subscription {
    cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: RefCell::new(Some(Box::new(cancel))),
        }
    }

    /// Unsubscribes. Idempotent.
    pub fn dispose(&self) {
        let cancel = self.cancel.borrow_mut().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.borrow().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug)]
    enum Ping {
        Foo(u32),
        Bar,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PingChannel {
        Foo,
        Bar,
    }

    impl Event for Ping {
        type Channel = PingChannel;

        fn channel(&self) -> PingChannel {
            match self {
                Ping::Foo(_) => PingChannel::Foo,
                Ping::Bar => PingChannel::Bar,
            }
        }
    }

    fn counting() -> (Rc<Cell<u32>>, Listener<Ping>) {
        let count = Rc::new(Cell::new(0));
        let listener: Listener<Ping> = Rc::new({
            let count = count.clone();
            move |ping: &Ping| {
                if let Ping::Foo(n) = ping {
                    count.set(count.get() + n);
                }
            }
        });
        (count, listener)
    }

    #[test]
    fn test_publish_without_listeners() {
        let events = EventAggregator::<Ping>::new();
        events.publish(&Ping::Bar);
        assert!(!events.has_listeners(PingChannel::Bar));
    }

    #[test]
    fn test_publish_routes_by_channel() {
        let events = EventAggregator::<Ping>::new();
        let (count, listener) = counting();

        let _sub = events.subscribe(PingChannel::Foo, listener);
        events.publish(&Ping::Foo(2));
        events.publish(&Ping::Bar);
        events.publish(&Ping::Foo(3));

        assert_eq!(count.get(), 5);
    }

    #[test]
    fn test_double_subscribe_is_idempotent() {
        let events = EventAggregator::<Ping>::new();
        let (count, listener) = counting();

        let first = events.subscribe(PingChannel::Foo, listener.clone());
        let _second = events.subscribe(PingChannel::Foo, listener);
        events.publish(&Ping::Foo(1));
        assert_eq!(count.get(), 1);

        first.dispose();
        assert!(!events.has_listeners(PingChannel::Foo));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let events = EventAggregator::<Ping>::new();
        let (count, a) = counting();
        let (_, b) = counting();

        let sub_a = events.subscribe(PingChannel::Foo, a);
        let _sub_b = events.subscribe(PingChannel::Foo, b);

        sub_a.dispose();
        sub_a.dispose();
        assert!(sub_a.is_disposed());
        assert!(events.has_listeners(PingChannel::Foo));

        events.publish(&Ping::Foo(1));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_unsubscribe_during_publish() {
        let events = EventAggregator::<Ping>::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::default();
        let calls = Rc::new(Cell::new(0));

        let sub = events.subscribe(
            PingChannel::Bar,
            Rc::new({
                let slot = slot.clone();
                let calls = calls.clone();
                move |_: &Ping| {
                    calls.set(calls.get() + 1);
                    if let Some(sub) = slot.borrow_mut().take() {
                        sub.dispose();
                    }
                }
            }),
        );
        *slot.borrow_mut() = Some(sub);

        events.publish(&Ping::Bar);
        events.publish(&Ping::Bar);
        assert_eq!(calls.get(), 1);
    }
}
