//! Derived cells (lazy, dependency-tracked computations).

use std::any::Any;
use std::fmt;
use std::fmt::Formatter;
use std::marker::PhantomData;

use slotmap::Key;

use crate::node::{self, ListenerKey, NodeId, ReactiveNode};
use crate::root::Root;

/// A function node in the reactive value graph.
///
/// A `Derived` caches the result of its compute closure and lazily
/// recomputes it on read once a dependency has changed. Dependencies are
/// discovered automatically: every cell read during the compute is
/// registered, and only those cells can dirty the result.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// let state = create_state(1);
/// let double = create_derived(move || state.get() * 2);
/// assert_eq!(double.get(), 2);
/// state.set(2);
/// assert_eq!(double.get(), 4);
/// ```
///
/// See [`create_derived`] for more information.
pub struct Derived<T: 'static> {
    pub(crate) id: NodeId,
    pub(crate) root: &'static Root,
    pub(crate) _phantom: PhantomData<T>,
}

/// Create a new [`Derived`] cell.
///
/// The compute closure runs on the first read and again on any read after a
/// dependency changed; in between, reads return the cached value. Every
/// recompute re-discovers the dependency set from scratch, so conditional
/// reads subscribe to exactly the cells the last run touched.
///
/// A plain `create_derived` cell propagates every recompute to its
/// dependents. Use [`create_selector`] or [`create_derived_with`] to
/// suppress propagation when the new value is equal to the old one.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// let cond = create_state(true);
/// let a = create_state(10);
/// let b = create_state(20);
/// let pick = create_derived(move || if cond.get() { a.get() } else { b.get() });
/// assert_eq!(pick.get(), 10);
/// cond.set(false);
/// assert_eq!(pick.get(), 20);
/// ```
pub fn create_derived<T: 'static>(f: impl FnMut() -> T + 'static) -> Derived<T> {
    create_derived_with(f, |_, _| false)
}

/// Create a new [`Derived`] cell that only notifies dependents when the
/// recomputed value differs per the type's `==`.
///
/// # Example
/// ```
/// # use liana_reactive::*;
/// let state = create_state(1);
/// let squared = create_selector(move || state.get() * state.get());
/// assert_eq!(squared.get(), 1);
/// state.set(-1); // same square; dependents are not notified
/// assert_eq!(squared.get(), 1);
/// ```
pub fn create_selector<T: PartialEq + 'static>(f: impl FnMut() -> T + 'static) -> Derived<T> {
    create_derived_with(f, PartialEq::eq)
}

/// Create a new [`Derived`] cell with a custom comparison deciding whether a
/// recomputation propagates.
///
/// `eq` is called on (old, new) after every recompute that had a previous
/// value; when it returns `true` the old value is retained and dependents
/// are not notified. The first computed value always propagates.
pub fn create_derived_with<T: 'static>(
    mut f: impl FnMut() -> T + 'static,
    mut eq: impl FnMut(&T, &T) -> bool + 'static,
) -> Derived<T> {
    let root = Root::global();
    let compute = Box::new(move |slot: &mut Option<Box<dyn Any>>| -> bool {
        let new = f();
        match slot {
            Some(old) => {
                let old = old.downcast_mut::<T>().expect("wrong cell type");
                if eq(old, &new) {
                    false
                } else {
                    *old = new;
                    true
                }
            }
            // First resolution: a write from "no value" to the computed
            // value, never suppressed.
            None => {
                *slot = Some(Box::new(new));
                true
            }
        }
    });
    let id = root
        .nodes
        .borrow_mut()
        .insert(ReactiveNode::new_derived(compute));
    Derived {
        id,
        root,
        _phantom: PhantomData,
    }
}

/// Run a derived cell's compute, re-establishing its dependency set.
///
/// The prepare walk points each fan-in producer's `tracking_edge` at its
/// existing edge and deactivates it; reads during the compute reactivate
/// edges (or create new ones); the cleanup walk restores the producers'
/// tracking state and releases edges the compute did not touch. The cleanup
/// runs through a drop guard so a panicking compute leaves the graph
/// consistent and the cell dirty.
#[cfg_attr(feature = "trace", tracing::instrument(skip(root)))]
pub(crate) fn recompute(root: &'static Root, id: NodeId) {
    let disposed = {
        let mut nodes = root.nodes.borrow_mut();
        let cell = &mut nodes[id];
        cell.running = true;
        cell.disposed
    };
    if !disposed {
        crate::edge::prepare_fanin(root, id);
    }
    // Take the compute and value out: we cannot hold a borrow of the arena
    // while running user code.
    let (compute, value) = {
        let mut nodes = root.nodes.borrow_mut();
        let cell = &mut nodes[id];
        (
            cell.compute.take().expect("compute missing"),
            cell.value.take(),
        )
    };
    // A disposed cell evaluates untracked.
    let prev = root
        .current_consumer
        .replace(if disposed { NodeId::null() } else { id });
    let mut guard = scopeguard::guard((compute, value), move |(compute, value)| {
        root.current_consumer.set(prev);
        {
            let mut nodes = root.nodes.borrow_mut();
            let cell = &mut nodes[id];
            cell.compute = Some(compute);
            cell.value = value;
            cell.running = false;
        }
        if !disposed {
            crate::edge::cleanup_fanin(root, id, false);
        }
    });
    let (compute, value) = &mut *guard;
    let changed = compute(value);
    drop(guard);

    root.nodes.borrow_mut()[id].dirty = false;
    if changed && !disposed {
        node::notify(root, id);
    }
}

impl<T> Derived<T> {
    fn read<U>(self, register: bool, f: impl FnOnce(&T) -> U) -> U {
        let root = self.root;
        let (running, dirty) = {
            let nodes = root.nodes.borrow();
            let cell = &nodes[self.id];
            (cell.running, cell.dirty)
        };
        if running {
            panic!("cyclic dependency in derived cell");
        }
        if dirty {
            recompute(root, self.id);
        }
        if register {
            self.track();
        }
        let nodes = root.nodes.borrow();
        let value = nodes[self.id].value.as_ref().expect("value updating");
        f(value.downcast_ref().expect("wrong cell type"))
    }

    /// Get the value of the cell, recomputing it first if a dependency has
    /// changed. The type must implement [`Copy`]; if it does not, use
    /// [`Derived::get_clone`] or [`Derived::with`] instead.
    ///
    /// When called inside another derived cell's compute, this cell is
    /// automatically tracked.
    ///
    /// # Panics
    /// Panics when the cell's compute transitively reads the cell itself.
    pub fn get(self) -> T
    where
        T: Copy,
    {
        self.with(|value| *value)
    }

    /// Get the value of the cell without registering it as a dependency of
    /// the surrounding compute. Still recomputes when dirty.
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
        self.with(Clone::clone)
    }

    /// Get the value of the cell without tracking it. The value is
    /// [`Clone`]-ed automatically.
    pub fn get_clone_untracked(self) -> T
    where
        T: Clone,
    {
        self.with_untracked(Clone::clone)
    }

    /// Get a value from the cell, recomputing it first if a dependency has
    /// changed.
    pub fn with<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.read(true, f)
    }

    /// Get a value from the cell without tracking it.
    pub fn with_untracked<U>(self, f: impl FnOnce(&T) -> U) -> U {
        self.read(false, f)
    }

    /// Register this cell as a dependency of the currently running compute.
    /// This is done automatically when calling [`Derived::get`] and other
    /// read methods.
    pub fn track(self) {
        let consumer = self.root.current_consumer.get();
        if !consumer.is_null() && consumer != self.id {
            crate::edge::track(self.root, self.id);
        }
    }

    /// Register a listener invoked when the cell is invalidated by a
    /// dependency change (and after recomputes that change the value).
    /// Returns a token for [`Derived::remove_listener`]. A no-op on disposed
    /// cells.
    pub fn add_listener(self, cb: impl FnMut() + 'static) -> ListenerKey {
        node::add_listener(self.root, self.id, cb)
    }

    /// Remove a listener previously registered with
    /// [`Derived::add_listener`].
    pub fn remove_listener(self, key: ListenerKey) {
        node::remove_listener(self.root, self.id, key);
    }

    /// Dispose the cell: unsubscribe from every producer and release the
    /// dependency edges. Reads keep returning a value (recomputed untracked
    /// when dirty). Idempotent.
    pub fn dispose(self) {
        node::dispose(self.root, self.id);
    }

    /// Whether [`Derived::dispose`] has been called on this cell.
    pub fn is_disposed(self) -> bool {
        node::is_disposed(self.root, self.id)
    }
}

/// We manually implement `Clone` + `Copy` for `Derived` so that we don't get
/// extra bounds on `T`.
impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Derived<T> {}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}
impl<T: fmt::Display> fmt::Display for Derived<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|value| value.fmt(f))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::rc::Rc;

    use crate::*;

    #[test]
    fn derived() {
        let state = create_state(0);
        let double = create_derived(move || state.get() * 2);

        assert_eq!(double.get(), 0);
        state.set(1);
        assert_eq!(double.get(), 2);
        state.set(2);
        assert_eq!(double.get(), 4);
    }

    #[test]
    fn derived_is_lazy_and_cached() {
        let state = create_state(0);
        let computes = create_state(0);
        let double = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            state.get() * 2
        });

        // Not computed until first read.
        assert_eq!(computes.get(), 0);
        assert_eq!(double.get(), 0);
        assert_eq!(computes.get(), 1);

        // Cached while clean.
        assert_eq!(double.get(), 0);
        assert_eq!(computes.get(), 1);

        // One write and one read cost exactly one compute.
        state.set(2);
        assert_eq!(computes.get(), 1);
        assert_eq!(double.get(), 4);
        assert_eq!(computes.get(), 2);
    }

    #[test]
    fn diamond_recomputes_once() {
        let s = create_state(1);
        let l = create_derived(move || s.get() + 1);
        let r = create_derived(move || s.get() + 2);
        let computes = create_state(0);
        let b = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            l.get() + r.get()
        });

        assert_eq!(b.get(), 5);
        assert_eq!(computes.get(), 1);

        s.set(10);
        assert_eq!(b.get(), 23);
        assert_eq!(computes.get(), 2);
    }

    #[test]
    fn conditional_dependencies_are_recreated_each_compute() {
        let cond = create_state(true);
        let a = create_state(10);
        let b = create_state(20);
        let computes = create_state(0);
        let d = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            if cond.get() {
                a.get()
            } else {
                b.get()
            }
        });

        assert_eq!(d.get(), 10);
        assert_eq!(computes.get(), 1);

        b.set(25);
        assert_eq!(d.get(), 10);
        assert_eq!(computes.get(), 1); // b is not a dependency yet

        cond.set(false);
        assert_eq!(d.get(), 25);
        assert_eq!(computes.get(), 2);

        a.set(100);
        assert_eq!(d.get(), 25);
        assert_eq!(computes.get(), 2); // a is no longer a dependency

        b.set(30);
        assert_eq!(d.get(), 30);
        assert_eq!(computes.get(), 3);
    }

    #[test]
    fn duplicate_reads_create_one_edge() {
        let state = create_state(1);
        let computes = create_state(0);
        let d = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            state.get() + state.get()
        });

        assert_eq!(d.get(), 2);
        state.set(2);
        assert_eq!(d.get(), 4);
        // One notification per write, not one per registered read.
        assert_eq!(computes.get(), 2);
    }

    #[test]
    fn dependency_on_derived() {
        let state = create_state(0);
        let double = create_derived(move || state.get() * 2);
        let quadruple = create_derived(move || double.get() * 2);

        assert_eq!(quadruple.get(), 0);
        state.set(1);
        assert_eq!(quadruple.get(), 4);
    }

    #[test]
    fn selector_suppresses_equal_recompute_notification() {
        let state = create_state(1);
        let squared = create_selector(move || state.get() * state.get());
        let plain = create_derived(move || state.get() * state.get());
        let squared_fires = create_state(0);
        let plain_fires = create_state(0);
        assert_eq!(squared.get(), 1);
        assert_eq!(plain.get(), 1);
        squared.add_listener(move || squared_fires.set(squared_fires.get_untracked() + 1));
        plain.add_listener(move || plain_fires.set(plain_fires.get_untracked() + 1));

        state.set(-1);
        // Both cells push once when invalidated.
        assert_eq!(squared_fires.get(), 1);
        assert_eq!(plain_fires.get(), 1);

        // Recomputing to an equal value is not propagated by the selector,
        // while the plain cell notifies again.
        assert_eq!(squared.get(), 1);
        assert_eq!(plain.get(), 1);
        assert_eq!(squared_fires.get(), 1);
        assert_eq!(plain_fires.get(), 2);
    }

    #[test]
    fn first_resolution_always_propagates() {
        // Even a comparator that always reports equal cannot suppress the
        // transition from "no value" to the first computed value.
        let state = create_state(5);
        let frozen = create_derived_with(move || state.get(), |_, _| true);
        assert_eq!(frozen.get(), 5);

        state.set(6);
        // Later recomputes are suppressed: the old value is retained.
        assert_eq!(frozen.get(), 5);
    }

    #[test]
    fn cycle_panics_and_cell_recovers() {
        let broken = create_state(true);
        let handle: Rc<Cell<Option<Derived<i32>>>> = Rc::new(Cell::new(None));
        let inner = handle.clone();
        let d = create_derived(move || {
            if broken.get() {
                inner.get().unwrap().get()
            } else {
                42
            }
        });
        handle.set(Some(d));

        let result = catch_unwind(AssertUnwindSafe(|| d.get()));
        assert!(result.is_err());

        // The failed compute left the cell dirty; a corrected compute works.
        broken.set(false);
        assert_eq!(d.get(), 42);
    }

    #[test]
    fn panicking_compute_keeps_cell_dirty_and_graph_consistent() {
        let fail = create_state(true);
        let state = create_state(1);
        let d = create_derived(move || {
            if fail.get() {
                panic!("compute failure");
            }
            state.get() * 2
        });

        assert!(catch_unwind(AssertUnwindSafe(|| d.get())).is_err());

        fail.set(false);
        assert_eq!(d.get(), 2);

        // The recovered dependency set works normally.
        state.set(3);
        assert_eq!(d.get(), 6);
    }

    #[test]
    fn disposed_derived_recomputes_untracked() {
        let state = create_state(1);
        let d = create_derived(move || state.get() * 2);
        assert_eq!(d.get(), 2);

        d.dispose();
        assert!(d.is_disposed());
        // Reads still return the cached value.
        assert_eq!(d.get(), 2);

        // Invalidations no longer reach the disposed cell.
        state.set(5);
        assert_eq!(d.get(), 2);

        // A disposed cell that is still dirty evaluates on read, without
        // registering dependencies.
        let late = create_derived(move || state.get() * 2);
        late.dispose();
        assert_eq!(late.get(), 10);
        state.set(6);
        assert_eq!(late.get(), 10);
    }

    #[test]
    fn dispose_detaches_from_producers() {
        let state = create_state(0);
        let computes = create_state(0);
        let d = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            state.get()
        });
        assert_eq!(d.get(), 0);
        assert_eq!(computes.get(), 1);

        d.dispose();
        state.set(1);
        state.set(2);
        // No invalidation reaches the disposed cell; nothing recomputes.
        assert_eq!(computes.get(), 1);
    }

    #[test]
    fn edges_are_pooled_and_bounded() {
        let cond = create_state(true);
        let a = create_state(0);
        let b = create_state(0);
        let d = create_derived(move || if cond.get() { a.get() } else { b.get() });

        assert_eq!(d.get(), 0);
        let baseline = crate::root::Root::global().edges.borrow().len();

        // Flip the condition back and forth; the edge arena must not grow.
        for i in 0..100 {
            cond.set(i % 2 == 0);
            let _ = d.get();
            assert_eq!(crate::root::Root::global().edges.borrow().len(), baseline);
        }
    }

    #[test]
    fn at_most_one_edge_per_producer_consumer_pair() {
        let state = create_state(1);
        let d = create_derived(move || state.get() + state.get() + state.get());
        assert_eq!(d.get(), 3);

        let root = crate::root::Root::global();
        let edges = root.edges.borrow();
        let count = edges
            .iter()
            .filter(|(_, edge)| edge.producer == state.id && edge.consumer == d.id)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn nested_derived_restores_outer_tracking() {
        let shared = create_state(1);
        let inner = create_derived(move || shared.get() * 10);
        let outer_computes = create_state(0);
        // The outer compute reads `shared` both directly and through the
        // nested cell, with the nested compute running in between.
        let outer = create_derived(move || {
            outer_computes.set(outer_computes.get_untracked() + 1);
            shared.get() + inner.get() + shared.get()
        });

        assert_eq!(outer.get(), 12);
        assert_eq!(outer_computes.get(), 1);

        shared.set(2);
        assert_eq!(outer.get(), 24);
        assert_eq!(outer_computes.get(), 2);
    }

    #[test]
    fn writing_a_dependency_inside_compute_does_not_loop() {
        let state = create_state(0);
        let d = create_derived(move || {
            state.track();
            state.set(0);
            state.get_untracked()
        });
        assert_eq!(d.get(), 0);
        state.set(1);
        // The compute resets its own dependency; this must terminate.
        assert_eq!(d.get(), 0);
        assert_eq!(state.get(), 0);
    }
}
