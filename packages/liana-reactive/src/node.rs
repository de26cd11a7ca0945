//! Reactive nodes.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use slotmap::{new_key_type, Key};
use smallvec::SmallVec;

use crate::edge::{self, EdgeId};
use crate::root::Root;

new_key_type! {
    /// Id of a reactive node in the [`Root`] arena.
    pub(crate) struct NodeId;
}

/// Token identifying a registered listener callback.
///
/// Closures have no usable identity of their own, so listeners are removed
/// by token rather than by value. Registering the same closure twice yields
/// two distinct keys and requires two removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(pub(crate) u64);

pub(crate) type ListenerFn = Rc<RefCell<dyn FnMut()>>;

/// A node in the reactive value graph.
///
/// One struct serves both cell kinds: every node is a producer (listener
/// list + fan-out edges); nodes created with a compute callback are
/// additionally consumers (fan-in edges + dirty tracking).
pub(crate) struct ReactiveNode {
    /// Value of the node. `None` only transiently while the value is taken
    /// out during an update or compute.
    pub value: Option<Box<dyn Any>>,
    /// Recompute callback for derived cells. Feeds the previous value slot
    /// and reports whether the value changed; the comparator lives inside
    /// the closure.
    pub compute: Option<Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>>,
    /// Equality used by state-cell writes to suppress no-op updates.
    pub equals: Option<Box<dyn Fn(&dyn Any, &dyn Any) -> bool>>,
    /// Listener callbacks in registration order; notification walks newest
    /// first.
    pub listeners: Vec<(ListenerKey, ListenerFn)>,
    /// Hooks run once when the node is disposed (subscription teardown).
    pub on_dispose: Vec<Box<dyn FnOnce()>>,
    /// Head of the fan-out edge list: consumers depending on this node.
    pub fanout_head: EdgeId,
    /// The edge most recently touched from this producer during the current
    /// consumer's compute. Re-registration fast path.
    pub tracking_edge: EdgeId,
    /// Head of the fan-in edge list: producers this node reads, in
    /// registration order.
    pub fanin_head: EdgeId,
    /// Tail of the fan-in list; new registrations append here.
    pub fanin_tail: EdgeId,
    /// Whether this node has the consumer capability, even while its compute
    /// callback is temporarily taken out.
    pub derived: bool,
    pub disposed: bool,
    pub notifying: bool,
    pub dirty: bool,
    pub running: bool,
    /// Set while the node is enrolled in the batch buffer.
    pub in_batch: bool,
}

impl ReactiveNode {
    fn empty() -> Self {
        Self {
            value: None,
            compute: None,
            equals: None,
            listeners: Vec::new(),
            on_dispose: Vec::new(),
            fanout_head: EdgeId::null(),
            tracking_edge: EdgeId::null(),
            fanin_head: EdgeId::null(),
            fanin_tail: EdgeId::null(),
            derived: false,
            disposed: false,
            notifying: false,
            dirty: false,
            running: false,
            in_batch: false,
        }
    }

    pub fn new_state(
        value: Box<dyn Any>,
        equals: Box<dyn Fn(&dyn Any, &dyn Any) -> bool>,
    ) -> Self {
        Self {
            value: Some(value),
            equals: Some(equals),
            ..Self::empty()
        }
    }

    /// Derived nodes start dirty; the first read computes them.
    pub fn new_derived(compute: Box<dyn FnMut(&mut Option<Box<dyn Any>>) -> bool>) -> Self {
        Self {
            compute: Some(compute),
            derived: true,
            dirty: true,
            ..Self::empty()
        }
    }
}

/// Notify a producer: invoke its listeners newest-first, then mark every
/// consumer on its fan-out list dirty.
///
/// Squashed while the node is disposed or already notifying, which bounds
/// recursion when a listener writes back into the graph.
#[cfg_attr(feature = "trace", tracing::instrument(skip(root)))]
pub(crate) fn notify(root: &'static Root, id: NodeId) {
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        if node.disposed || node.notifying {
            return;
        }
        node.notifying = true;
    }

    // Snapshot the callbacks so listeners may add or remove listeners (and
    // dispose *other* producers) while we iterate.
    let listeners: SmallVec<[ListenerFn; 2]> = root.nodes.borrow()[id]
        .listeners
        .iter()
        .map(|(_, cb)| cb.clone())
        .collect();
    for cb in listeners.iter().rev() {
        // A listener already running further up the stack is skipped rather
        // than re-entered.
        let Ok(mut cb) = cb.try_borrow_mut() else {
            continue;
        };
        if catch_unwind(AssertUnwindSafe(|| (&mut *cb)())).is_err() {
            #[cfg(feature = "trace")]
            tracing::error!("listener panicked during notification; continuing");
        }
    }

    let consumers: SmallVec<[NodeId; 4]> = {
        let nodes = root.nodes.borrow();
        let edges = root.edges.borrow();
        let mut list = SmallVec::new();
        let mut e = nodes[id].fanout_head;
        while !e.is_null() {
            let edge = &edges[e];
            list.push(edge.consumer);
            e = edge.next_out;
        }
        list
    };
    for consumer in consumers {
        mark_dirty(root, consumer);
    }

    root.nodes.borrow_mut()[id].notifying = false;
}

/// Mark a derived cell dirty and cascade the invalidation through its own
/// listeners and fan-out.
///
/// An already-dirty cell is skipped: a consumer only attaches by reading,
/// and reading recomputes, so a dirty cell's transitive consumers are
/// already dirty. The skip both bounds propagation and keeps one write from
/// notifying the same cell twice.
pub(crate) fn mark_dirty(root: &'static Root, id: NodeId) {
    {
        let mut nodes = root.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else {
            return;
        };
        if !node.derived || node.disposed || node.dirty {
            return;
        }
        node.dirty = true;
    }
    notify(root, id);
}

pub(crate) fn add_listener(
    root: &'static Root,
    id: NodeId,
    cb: impl FnMut() + 'static,
) -> ListenerKey {
    let key = ListenerKey(root.next_listener.get());
    root.next_listener.set(key.0 + 1);
    let mut nodes = root.nodes.borrow_mut();
    let node = &mut nodes[id];
    // Listener add on a disposed cell is a no-op; the key is simply dead.
    if !node.disposed {
        node.listeners.push((key, Rc::new(RefCell::new(cb))));
    }
    key
}

/// Remove at most one listener registered under `key`. O(n) in listener
/// count.
pub(crate) fn remove_listener(root: &'static Root, id: NodeId, key: ListenerKey) {
    let mut nodes = root.nodes.borrow_mut();
    if let Some(node) = nodes.get_mut(id) {
        if let Some(pos) = node.listeners.iter().position(|(k, _)| *k == key) {
            node.listeners.remove(pos);
        }
    }
}

/// Dispose a node: release all edges in both directions, drop the listener
/// list and run the on-dispose hooks. Idempotent.
///
/// The node itself stays in the arena holding its last value: reads after
/// dispose return that value and writes are silently dropped.
pub(crate) fn dispose(root: &'static Root, id: NodeId) {
    {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        if node.disposed {
            return;
        }
        node.disposed = true;
    }
    edge::release_fanout(root, id);
    edge::cleanup_fanin(root, id, true);
    let hooks = {
        let mut nodes = root.nodes.borrow_mut();
        let node = &mut nodes[id];
        node.listeners.clear();
        std::mem::take(&mut node.on_dispose)
    };
    for hook in hooks {
        hook();
    }
}

pub(crate) fn is_disposed(root: &Root, id: NodeId) -> bool {
    root.nodes.borrow()[id].disposed
}
