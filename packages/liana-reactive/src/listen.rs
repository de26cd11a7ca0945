//! Push subscriptions over reactive cells.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::node::{self, ListenerKey, NodeId};
use crate::root::Root;
use crate::{Derived, State};

/// A cancellable, pausable push subscription over a reactive cell.
///
/// Created with [`State::listen`] or [`Derived::listen`]. The subscription
/// delivers the cell's current value to the `on_data` callback every time
/// the cell notifies, unless paused or cancelled. Handles are `Clone` and
/// share the same underlying subscription.
pub struct Subscription {
    producer: NodeId,
    root: &'static Root,
    shared: Rc<SubscriptionShared>,
}

struct SubscriptionShared {
    paused: Cell<bool>,
    cancelled: Cell<bool>,
    listener: Cell<ListenerKey>,
    on_done: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl SubscriptionShared {
    /// Deliver `on_done` at most once, across cancel and producer disposal.
    fn finish(&self) {
        if let Some(done) = self.on_done.borrow_mut().take() {
            done();
        }
    }
}

impl Subscription {
    /// Stop delivering values until [`Subscription::resume`] is called.
    /// Notifications that happen while paused are dropped, not buffered.
    pub fn pause(&self) {
        self.shared.paused.set(true);
    }

    /// Resume delivering values after a [`Subscription::pause`].
    pub fn resume(&self) {
        self.shared.paused.set(false);
    }

    /// Whether the subscription is currently paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.get()
    }

    /// Cancel the subscription: the listener is removed and `on_done` is
    /// delivered. Idempotent.
    pub fn cancel(&self) {
        if self.shared.cancelled.replace(true) {
            return;
        }
        node::remove_listener(self.root, self.producer, self.shared.listener.get());
        self.shared.finish();
    }

    /// Whether the subscription has been cancelled, either explicitly or by
    /// disposal of the producer.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.get()
    }
}

impl Clone for Subscription {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer,
            root: self.root,
            shared: self.shared.clone(),
        }
    }
}

pub(crate) fn listen_to<T: 'static>(
    root: &'static Root,
    id: NodeId,
    read: impl Fn() -> T + 'static,
    mut on_data: impl FnMut(T) + 'static,
    on_done: impl FnOnce() + 'static,
) -> Subscription {
    let shared = Rc::new(SubscriptionShared {
        paused: Cell::new(false),
        cancelled: Cell::new(false),
        listener: Cell::new(ListenerKey(0)),
        on_done: RefCell::new(Some(Box::new(on_done))),
    });

    // Listening to an already disposed cell completes immediately.
    if node::is_disposed(root, id) {
        shared.cancelled.set(true);
        shared.finish();
        return Subscription {
            producer: id,
            root,
            shared,
        };
    }

    let key = node::add_listener(root, id, {
        let shared = shared.clone();
        move || {
            if shared.paused.get() || shared.cancelled.get() {
                return;
            }
            on_data(read());
        }
    });
    shared.listener.set(key);

    // Producer disposal delivers `on_done` once and detaches; the listener
    // list is cleared wholesale by the disposal itself.
    root.nodes.borrow_mut()[id].on_dispose.push({
        let shared = shared.clone();
        Box::new(move || {
            if shared.cancelled.replace(true) {
                return;
            }
            shared.finish();
        })
    });

    Subscription {
        producer: id,
        root,
        shared,
    }
}

impl<T: Clone + 'static> State<T> {
    /// Subscribe to this cell: `on_data` receives the current value on every
    /// notification; `on_done` runs once when the subscription is cancelled
    /// or the cell is disposed.
    ///
    /// # Example
    /// ```
    /// # use liana_reactive::*;
    /// # use std::cell::RefCell;
    /// # use std::rc::Rc;
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let state = create_state(0);
    /// let sub = state.listen(
    ///     {
    ///         let seen = seen.clone();
    ///         move |n| seen.borrow_mut().push(n)
    ///     },
    ///     || {},
    /// );
    /// state.set(1);
    /// state.set(2);
    /// sub.cancel();
    /// state.set(3);
    /// assert_eq!(*seen.borrow(), vec![1, 2]);
    /// ```
    pub fn listen(
        self,
        on_data: impl FnMut(T) + 'static,
        on_done: impl FnOnce() + 'static,
    ) -> Subscription {
        listen_to(
            self.root,
            self.id,
            move || self.get_clone_untracked(),
            on_data,
            on_done,
        )
    }
}

impl<T: Clone + 'static> Derived<T> {
    /// Subscribe to this cell. The cell is computed first so its dependency
    /// set is established and invalidations reach the subscription; after
    /// that, `on_data` receives the freshly pulled value on every
    /// notification.
    pub fn listen(
        self,
        on_data: impl FnMut(T) + 'static,
        on_done: impl FnOnce() + 'static,
    ) -> Subscription {
        if !self.is_disposed() {
            self.with_untracked(|_| ());
        }
        listen_to(
            self.root,
            self.id,
            move || self.get_clone_untracked(),
            on_data,
            on_done,
        )
    }
}
