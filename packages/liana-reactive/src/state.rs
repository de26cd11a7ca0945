//! State cells.

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;

use crate::node::{self, ListenerKey, NodeId, ReactiveNode};
use crate::root::Root;
use crate::{create_derived, Derived};

/// A mutable leaf in the reactive value graph.
///
/// A `State` is a `Copy` handle to a value owned by the reactive root.
/// Reading it inside a derived cell's compute automatically registers a
/// dependency; writing it notifies listeners and marks dependents dirty.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// let state = create_state(1);
/// assert_eq!(state.get(), 1);
/// state.set(2);
/// assert_eq!(state.get(), 2);
/// ```
///
/// See [`create_state`] for more information.
pub struct State<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    pub(crate) _phantom: PhantomData<T>,
}

/// Create a new [`State`] cell using the type's `==` as the write filter.
///
/// Writing a value equal to the stored one is silently dropped: the value is
/// not replaced and nothing is notified.
///
/// # Reactivity
/// Reading a state cell inside a [`create_derived`] compute makes the
/// derived cell depend on it:
///
/// ```rust
/// # use liana_reactive::*;
/// let state = create_state(1);
/// let double = create_derived(move || state.get() * 2);
/// assert_eq!(double.get(), 2);
/// state.set(2);
/// assert_eq!(double.get(), 4);
/// ```
///
/// # Ownership
/// The value lives in the reactive root; what is returned here is a cheap
/// `Copy` handle, so it can be moved into any number of closures without
/// cloning.
pub fn create_state<T: PartialEq + 'static>(value: T) -> State<T> {
    create_state_with(value, |a: &T, b: &T| a == b)
}

/// Create a new [`State`] cell with a custom write filter.
///
/// `eq` is called on (stored, incoming) for every write; when it returns
/// `true` the write is silently dropped, value update included. A
/// comparator that constantly returns `false` makes every write notify; one
/// that constantly returns `true` makes the cell effectively read-only.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// // Only notify when the rounded value changes.
/// let state = create_state_with(1.0_f64, |a: &f64, b: &f64| a.round() == b.round());
/// state.set(1.2);
/// assert_eq!(state.get(), 1.0); // dropped
/// state.set(1.8);
/// assert_eq!(state.get(), 1.8);
/// ```
pub fn create_state_with<T: 'static>(value: T, eq: impl Fn(&T, &T) -> bool + 'static) -> State<T> {
    let root = Root::global();
    let equals = Box::new(move |a: &dyn Any, b: &dyn Any| {
        let a = a.downcast_ref::<T>().expect("wrong cell type");
        let b = b.downcast_ref::<T>().expect("wrong cell type");
        eq(a, b)
    });
    let id = root
        .nodes
        .borrow_mut()
        .insert(ReactiveNode::new_state(Box::new(value), equals));
    State {
        id,
        root,
        _phantom: PhantomData,
    }
}

impl<T> State<T> {
    /// Get the value of the cell. The type must implement [`Copy`]; if it
    /// does not, use [`State::get_clone`] or [`State::with`] instead.
    ///
    /// When called inside a derived cell's compute, the cell is
    /// automatically tracked.
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.track();
        self.get_untracked()
    }

    /// Get the value of the cell without tracking it.
    pub fn get_untracked(self) -> T
    where
        T: Copy,
    {
        self.with_untracked(|value| *value)
    }

    /// Get the value of the cell. The value is [`Clone`]-ed automatically.
    pub fn get_clone(self) -> T
    where
        T: Clone,
    {
        self.track();
        self.get_clone_untracked()
    }

    /// Get the value of the cell without tracking it. The value is
    /// [`Clone`]-ed automatically.
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get a value from the cell.
    ///
    /// When called inside a derived cell's compute, the cell is
    /// automatically tracked.
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.track();
        self.with_untracked(f)
    }

    /// Get a value from the cell without tracking it.
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        let nodes = self.root.nodes.borrow();
        let value = nodes[self.id].value.as_ref().expect("value updating");
        f(value.downcast_ref().expect("wrong cell type"))
    }

    /// Track the cell in the currently running compute. This is done
    /// automatically when calling [`State::get`] and other read methods.
    pub fn track(self) {
        crate::edge::track(self.root, self.id);
    }

    /// Set a new value for the cell and notify dependents.
    ///
    /// The write is silently dropped when the cell is disposed or when the
    /// cell's write filter considers the new value equal to the stored one.
    /// Inside a [`batch`](crate::batch), the notification is deferred to the
    /// outermost batch exit.
    pub fn set(self, new: T) {
        let root = self.root;
        let (old, equals) = {
            let mut nodes = root.nodes.borrow_mut();
            let cell = &mut nodes[self.id];
            if cell.disposed {
                return;
            }
            (
                cell.value.take().expect("value updating"),
                cell.equals.take(),
            )
        };
        // The comparator is user code; run it with no borrow held.
        let suppressed = equals
            .as_ref()
            .map_or(false, |eq| eq(old.as_ref(), &new as &dyn Any));

        let enrolled = {
            let mut nodes = root.nodes.borrow_mut();
            let cell = &mut nodes[self.id];
            cell.equals = equals;
            cell.value = Some(if suppressed { old } else { Box::new(new) });
            if suppressed {
                return;
            }
            if root.batch_depth.get() > 0 {
                if !cell.in_batch {
                    cell.in_batch = true;
                    true
                } else {
                    return;
                }
            } else {
                false
            }
        };
        if enrolled {
            root.batch_buffer.borrow_mut().push(self.id);
            return;
        }
        node::notify(root, self.id);
    }

    /// Update the value of the cell from the previous value, going through
    /// the same write filter as [`State::set`].
    ///
    /// # Example
    /// ```
    /// # use liana_reactive::*;
    /// let state = create_state(1);
    /// state.update(|n| n + 1);
    /// assert_eq!(state.get(), 2);
    /// ```
    pub fn update(self, f: impl FnOnce(&T) -> T) {
        let value = {
            self.root.nodes.borrow_mut()[self.id]
                .value
                .take()
                .expect("value updating")
        };
        let new = f(value.downcast_ref().expect("wrong cell type"));
        self.root.nodes.borrow_mut()[self.id].value = Some(value);
        self.set(new);
    }

    /// Create a derived cell computing a function of this cell's value.
    ///
    /// # Example
    /// ```
    /// # use liana_reactive::*;
    /// let state = create_state(1);
    /// let double = state.map(|&n| n * 2);
    /// assert_eq!(double.get(), 2);
    /// ```
    pub fn map<U: 'static>(self, mut f: impl FnMut(&T) -> U + 'static) -> Derived<U> {
        create_derived(move || self.with(&mut f))
    }

    /// Register a listener invoked whenever the cell notifies. Returns a
    /// token for [`State::remove_listener`]. A no-op on disposed cells.
    pub fn add_listener(self, cb: impl FnMut() + 'static) -> ListenerKey {
        node::add_listener(self.root, self.id, cb)
    }

    /// Remove a listener previously registered with [`State::add_listener`].
    /// Listeners registered twice must be removed twice.
    pub fn remove_listener(self, key: ListenerKey) {
        node::remove_listener(self.root, self.id, key);
    }

    /// Dispose the cell. Further writes are dropped, reads keep returning
    /// the last value, dependents are detached. Idempotent.
    pub fn dispose(self) {
        node::dispose(self.root, self.id);
    }

    /// Whether [`State::dispose`] has been called on this cell.
    pub fn is_disposed(self) -> bool {
        node::is_disposed(self.root, self.id)
    }
}

/// We manually implement `Clone` + `Copy` for `State` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for State<T> {}

impl<T: Default + PartialEq> Default for State<T> {
    fn default() -> Self {
        create_state(Default::default())
    }
}

// Forward `PartialEq` and formatting to the inner value.
impl<T: PartialEq> PartialEq for State<T> {
    fn eq(&self, other: &Self) -> bool {
        self.with(|value| other.with(|other| value == other))
    }
}
impl<T: Eq> Eq for State<T> {}

impl<T: fmt::Debug> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for State<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn state() {
        let state = create_state(0);
        assert_eq!(state.get(), 0);

        state.set(1);
        assert_eq!(state.get(), 1);

        state.update(|n| n + 1);
        assert_eq!(state.get(), 2);
    }

    #[test]
    fn state_with_non_copy_value() {
        let greeting = create_state("Hello".to_string());
        assert_eq!(greeting.get_clone(), "Hello");
        assert_eq!(greeting.with(|s| s.len()), 5);

        greeting.set("Goodbye".to_string());
        assert_eq!(greeting.get_clone(), "Goodbye");
    }

    #[test]
    fn equal_write_is_dropped_and_fires_nothing() {
        let state = create_state(vec![1, 2, 3]);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        state.set(vec![1, 2, 3]);
        assert_eq!(count.get(), 0);

        state.set(vec![1, 2, 4]);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn always_equal_filter_drops_every_write() {
        let state = create_state_with(1, |_: &i32, _: &i32| true);
        state.set(2);
        assert_eq!(state.get(), 1);

        state.update(|n| n + 10);
        assert_eq!(state.get(), 1);
    }

    #[test]
    fn never_equal_filter_notifies_every_write() {
        let state = create_state_with(0, |_: &i32, _: &i32| false);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        state.set(0);
        state.set(0);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn update_goes_through_the_write_filter() {
        let state = create_state(1);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        state.update(|n| *n);
        assert_eq!(count.get(), 0);

        state.update(|n| n + 1);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn listeners_fire_newest_first() {
        let state = create_state(0);
        let order = create_state(Vec::new());
        state.add_listener(move || order.update(|v| {
            let mut v = v.clone();
            v.push("first registered");
            v
        }));
        state.add_listener(move || order.update(|v| {
            let mut v = v.clone();
            v.push("second registered");
            v
        }));

        state.set(1);
        assert_eq!(
            order.get_clone(),
            vec!["second registered", "first registered"]
        );
    }

    #[test]
    fn duplicate_listener_registration_needs_matching_removals() {
        let state = create_state(0);
        let count = create_state(0);
        let bump = move || count.set(count.get_untracked() + 1);
        let first = state.add_listener(bump);
        let second = state.add_listener(bump);

        state.set(1);
        assert_eq!(count.get(), 2);

        state.remove_listener(first);
        state.set(2);
        assert_eq!(count.get(), 3);

        state.remove_listener(second);
        state.set(3);
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn panicking_listener_does_not_stop_iteration() {
        let state = create_state(0);
        let count = create_state(0);
        // Registered first, so it fires last; the panicking listener fires
        // before it and must not break the walk.
        state.add_listener(move || count.set(count.get_untracked() + 1));
        state.add_listener(|| panic!("listener failure"));

        state.set(1);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn writes_to_disposed_cell_are_dropped() {
        let state = create_state(7);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        state.dispose();
        assert!(state.is_disposed());

        state.set(8);
        assert_eq!(state.get(), 7);
        assert_eq!(count.get(), 0);

        // Listener add after dispose is a no-op.
        state.add_listener(move || count.set(count.get_untracked() + 100));
        state.set(9);
        assert_eq!(count.get(), 0);

        // Dispose is idempotent.
        state.dispose();
    }

    #[test]
    fn map_state() {
        let state = create_state(0);
        let double = state.map(|&n| n * 2);

        assert_eq!(double.get(), 0);
        state.set(1);
        assert_eq!(double.get(), 2);
    }

    #[test]
    fn state_display_and_debug() {
        let state = create_state(0);
        assert_eq!(format!("{state}"), "0");
        assert_eq!(format!("{state:?}"), "0");
    }
}
