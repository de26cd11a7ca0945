//! The reactive root.

use std::cell::{Cell, RefCell};

use slotmap::{Key, SlotMap};

use crate::edge::{DependencyEdge, EdgeId};
use crate::node::{self, NodeId, ReactiveNode};

/// The struct managing the state of the reactive system.
///
/// The value graph is single-threaded cooperative: each thread lazily
/// creates one `Root` on first use and keeps it for the life of the thread
/// (the allocation is leaked, so handles can carry a `&'static Root` the way
/// they carry a `Copy` id).
pub(crate) struct Root {
    /// All reactive nodes (state and derived cells).
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    /// All live dependency edges. Slot recycling doubles as the edge pool.
    pub edges: RefCell<SlotMap<EdgeId, DependencyEdge>>,
    /// The consumer whose compute is presently running, or the null key.
    pub current_consumer: Cell<NodeId>,
    /// Batch nesting depth. While positive, state-cell writes enroll in
    /// `batch_buffer` instead of notifying.
    pub batch_depth: Cell<u32>,
    /// State cells that changed during the current batch, in enrolment
    /// order.
    pub batch_buffer: RefCell<Vec<NodeId>>,
    /// Source of listener tokens.
    pub next_listener: Cell<u64>,
}

thread_local! {
    /// The current thread's reactive root.
    static GLOBAL_ROOT: Cell<Option<&'static Root>> = const { Cell::new(None) };
}

impl Root {
    fn new() -> Self {
        Self {
            nodes: RefCell::new(SlotMap::with_key()),
            edges: RefCell::new(SlotMap::with_key()),
            current_consumer: Cell::new(NodeId::null()),
            batch_depth: Cell::new(0),
            batch_buffer: RefCell::new(Vec::with_capacity(16)),
            next_listener: Cell::new(0),
        }
    }

    /// Get the current thread's reactive root, creating it on first use.
    pub fn global() -> &'static Root {
        GLOBAL_ROOT.with(|root| match root.get() {
            Some(root) => root,
            None => {
                let leaked: &'static Root = Box::leak(Box::new(Root::new()));
                root.set(Some(leaked));
                leaked
            }
        })
    }

    /// Notify every cell enrolled during the batch, in enrolment order.
    /// Disposed cells are skipped; derived cells are not recomputed here,
    /// only marked dirty through the notification.
    pub fn flush(&'static self) {
        let pending = self.batch_buffer.take();
        for id in pending {
            let disposed = {
                let mut nodes = self.nodes.borrow_mut();
                let cell = &mut nodes[id];
                cell.in_batch = false;
                cell.disposed
            };
            if !disposed {
                node::notify(self, id);
            }
        }
    }
}

/// Batch state-cell writes together and defer their notifications to the end
/// of the outermost batch.
///
/// Reads inside the batch observe already-written state values but stale
/// derived values: derived cells are only marked dirty when the batch
/// flushes. Nested batches do not flush; only the outermost exit does. A
/// batch that panics still flushes before the panic escapes.
///
/// # Example
///
/// ```
/// # use liana_reactive::*;
/// let state = create_state(1);
/// let double = create_derived(move || state.get() * 2);
/// assert_eq!(double.get(), 2);
/// batch(move || {
///     state.set(2);
///     assert_eq!(state.get(), 2);
///     assert_eq!(double.get(), 2); // still the pre-batch value
/// });
/// assert_eq!(double.get(), 4);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    root.batch_depth.set(root.batch_depth.get() + 1);
    let _flush = scopeguard::guard(root, |root| {
        let depth = root.batch_depth.get() - 1;
        root.batch_depth.set(depth);
        if depth == 0 {
            root.flush();
        }
    });
    f()
}

/// Run the passed closure with dependency tracking suspended.
///
/// Reads inside the closure return current values (derived cells still
/// recompute when dirty) but register no dependency on the surrounding
/// consumer.
///
/// # Example
///
/// ```
/// # use liana_reactive::*;
/// let state = create_state(1);
/// let double = create_derived(move || untrack(|| state.get() * 2));
/// assert_eq!(double.get(), 2);
///
/// state.set(2);
/// // Still the old value: `state` was read untracked.
/// assert_eq!(double.get(), 2);
/// ```
pub fn untrack<T>(f: impl FnOnce() -> T) -> T {
    let root = Root::global();
    let prev = root.current_consumer.replace(NodeId::null());
    let _restore = scopeguard::guard(root, move |root| root.current_consumer.set(prev));
    f()
}

#[cfg(test)]
mod tests {
    use crate::*;

    #[test]
    fn batch_defers_notification() {
        let state = create_state(1);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        batch(move || {
            state.set(2);
            assert_eq!(count.get(), 0);
            state.set(3);
            assert_eq!(count.get(), 0);
        });
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn batch_enrols_each_cell_once() {
        let a = create_state(0);
        let b = create_state(0);
        let count = create_state(0);
        a.add_listener(move || count.set(count.get_untracked() + 1));
        b.add_listener(move || count.set(count.get_untracked() + 1));

        batch(move || {
            a.set(1);
            a.set(2);
            b.set(1);
            a.set(3);
        });
        // One notification per enrolled cell, not per write.
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn batch_reads_see_written_state_but_stale_derived() {
        let x = create_state(0);
        let y = create_derived(move || x.get() * 10);
        assert_eq!(y.get(), 0);

        batch(move || {
            x.set(1);
            x.set(2);
            x.set(3);
            assert_eq!(x.get(), 3);
            assert_eq!(y.get(), 0);
        });
        assert_eq!(y.get(), 30);
    }

    #[test]
    fn batch_counts_one_recompute() {
        let x = create_state(0);
        let computes = create_state(0);
        let y = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            x.get() * 10
        });
        assert_eq!(y.get(), 0);
        assert_eq!(computes.get(), 1);

        batch(move || {
            x.set(1);
            x.set(2);
            x.set(3);
        });
        assert_eq!(y.get(), 30);
        assert_eq!(computes.get(), 2);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let state = create_state(0);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        batch(move || {
            state.set(1);
            batch(move || {
                state.set(2);
            });
            // Inner exit must not flush.
            assert_eq!(count.get(), 0);
        });
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn panicking_batch_still_flushes() {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let state = create_state(0);
        let count = create_state(0);
        state.add_listener(move || count.set(count.get_untracked() + 1));

        let result = catch_unwind(AssertUnwindSafe(|| {
            batch(move || {
                state.set(1);
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert_eq!(count.get(), 1);
        assert_eq!(state.get(), 1);
    }

    #[test]
    fn batch_returns_body_value() {
        let state = create_state(1);
        let ret = batch(move || {
            state.set(2);
            "done"
        });
        assert_eq!(ret, "done");
    }

    #[test]
    fn untracked_reads_do_not_register() {
        let tracked = create_state(0);
        let untracked = create_state(0);
        let computes = create_state(0);
        let d = create_derived(move || {
            computes.set(computes.get_untracked() + 1);
            tracked.get() + untrack(|| untracked.get())
        });

        assert_eq!(d.get(), 0);
        assert_eq!(computes.get(), 1);

        untracked.set(5);
        assert_eq!(d.get(), 0);
        assert_eq!(computes.get(), 1);

        tracked.set(1);
        assert_eq!(d.get(), 6);
        assert_eq!(computes.get(), 2);
    }
}
