//! Pooled dependency edges.
//!
//! Every live (producer, consumer) pair is represented by exactly one
//! [`DependencyEdge`] in a slotmap arena. The slotmap's slot recycling is the
//! pool: a released edge's slot carries no references and is reused by the
//! next registration. Producers and consumers hold list-head handles into
//! the arena instead of owning their edges, which is what lets the cyclic
//! producer/edge/consumer shape exist without ownership cycles.

use slotmap::{new_key_type, Key, SlotMap};

use crate::node::{NodeId, ReactiveNode};
use crate::root::Root;

new_key_type! {
    /// Id of a dependency edge in the [`Root`] arena.
    pub(crate) struct EdgeId;
}

type Nodes = SlotMap<NodeId, ReactiveNode>;
type Edges = SlotMap<EdgeId, DependencyEdge>;

/// One live producer→consumer link.
///
/// Doubly linked into the producer's fan-out list (`prev_out`/`next_out`)
/// and the consumer's fan-in list (`prev_in`/`next_in`, registration
/// ordered). `rollback` saves the producer's previous `tracking_edge` so
/// nested recomputations can restore it.
pub(crate) struct DependencyEdge {
    pub producer: NodeId,
    pub consumer: NodeId,
    /// Cleared during the prepare walk; set again when the compute actually
    /// reads the producer. Edges still inactive at cleanup are released.
    pub active: bool,
    pub rollback: EdgeId,
    pub prev_out: EdgeId,
    pub next_out: EdgeId,
    pub prev_in: EdgeId,
    pub next_in: EdgeId,
}

/// Register a read of `producer` by the currently running consumer, if any.
///
/// Fast path: the producer's `tracking_edge` already links it to this
/// consumer (established by the prepare walk or by an earlier read), so the
/// edge is reactivated and moved to the tail of the consumer's fan-in list.
/// Slow path: a fresh edge is acquired from the pool and linked into both
/// lists.
pub(crate) fn track(root: &Root, producer: NodeId) {
    let consumer = root.current_consumer.get();
    if consumer.is_null() {
        return;
    }
    let mut nodes = root.nodes.borrow_mut();
    let mut edges = root.edges.borrow_mut();
    if nodes[producer].disposed {
        return;
    }

    let tracking = nodes[producer].tracking_edge;
    if let Some(edge) = edges.get(tracking) {
        if edge.consumer == consumer {
            if edge.active {
                return;
            }
            edges[tracking].active = true;
            unlink_fanin(&mut nodes, &mut edges, tracking);
            push_fanin_tail(&mut nodes, &mut edges, consumer, tracking);
            return;
        }
    }

    let rollback = if edges.contains_key(tracking) {
        tracking
    } else {
        EdgeId::null()
    };
    let edge = edges.insert(DependencyEdge {
        producer,
        consumer,
        active: true,
        rollback,
        prev_out: EdgeId::null(),
        next_out: EdgeId::null(),
        prev_in: EdgeId::null(),
        next_in: EdgeId::null(),
    });
    push_fanin_tail(&mut nodes, &mut edges, consumer, edge);
    push_fanout_head(&mut nodes, &mut edges, producer, edge);
    nodes[producer].tracking_edge = edge;
}

/// Prepare walk run before a consumer's compute: point every fan-in
/// producer's `tracking_edge` at its edge to this consumer (saving the prior
/// value in `rollback`) and deactivate the edge so untouched dependencies
/// can be recognized afterwards.
pub(crate) fn prepare_fanin(root: &Root, id: NodeId) {
    let mut nodes = root.nodes.borrow_mut();
    let mut edges = root.edges.borrow_mut();
    let mut e = nodes[id].fanin_head;
    let mut tail = EdgeId::null();
    while !e.is_null() {
        let producer = edges[e].producer;
        edges[e].rollback = nodes[producer].tracking_edge;
        nodes[producer].tracking_edge = e;
        edges[e].active = false;
        tail = e;
        e = edges[e].next_in;
    }
    nodes[id].fanin_tail = tail;
}

/// Cleanup walk run after a consumer's compute (successful or not): walk the
/// fan-in list backwards, restore every producer's `tracking_edge` from the
/// saved rollback, and release edges the compute did not touch. With
/// `force`, release everything (disposal).
pub(crate) fn cleanup_fanin(root: &Root, id: NodeId, force: bool) {
    let mut nodes = root.nodes.borrow_mut();
    let mut edges = root.edges.borrow_mut();
    let mut e = nodes[id].fanin_tail;
    while !e.is_null() {
        let prev = edges[e].prev_in;
        let producer = edges[e].producer;
        let rollback = edges[e].rollback;
        if edges.contains_key(rollback) || rollback.is_null() {
            nodes[producer].tracking_edge = rollback;
        } else {
            nodes[producer].tracking_edge = EdgeId::null();
        }
        edges[e].rollback = EdgeId::null();
        if force || !edges[e].active {
            unlink_fanout(&mut nodes, &mut edges, e);
            unlink_fanin(&mut nodes, &mut edges, e);
            edges.remove(e);
        }
        e = prev;
    }
}

/// Release every fan-out edge of a producer (disposal path), unlinking each
/// from its consumer's fan-in list as well.
pub(crate) fn release_fanout(root: &Root, id: NodeId) {
    let mut nodes = root.nodes.borrow_mut();
    let mut edges = root.edges.borrow_mut();
    let mut e = nodes[id].fanout_head;
    while !e.is_null() {
        let next = edges[e].next_out;
        unlink_fanout(&mut nodes, &mut edges, e);
        unlink_fanin(&mut nodes, &mut edges, e);
        let edge = edges.remove(e).expect("edge already released");
        if nodes[edge.producer].tracking_edge == e {
            nodes[edge.producer].tracking_edge = edge.rollback;
        }
        e = next;
    }
}

fn push_fanout_head(nodes: &mut Nodes, edges: &mut Edges, producer: NodeId, e: EdgeId) {
    let head = nodes[producer].fanout_head;
    edges[e].prev_out = EdgeId::null();
    edges[e].next_out = head;
    if !head.is_null() {
        edges[head].prev_out = e;
    }
    nodes[producer].fanout_head = e;
}

fn unlink_fanout(nodes: &mut Nodes, edges: &mut Edges, e: EdgeId) {
    let (producer, prev, next) = {
        let edge = &edges[e];
        (edge.producer, edge.prev_out, edge.next_out)
    };
    if prev.is_null() {
        nodes[producer].fanout_head = next;
    } else {
        edges[prev].next_out = next;
    }
    if !next.is_null() {
        edges[next].prev_out = prev;
    }
    edges[e].prev_out = EdgeId::null();
    edges[e].next_out = EdgeId::null();
}

fn push_fanin_tail(nodes: &mut Nodes, edges: &mut Edges, consumer: NodeId, e: EdgeId) {
    let tail = nodes[consumer].fanin_tail;
    edges[e].prev_in = tail;
    edges[e].next_in = EdgeId::null();
    if tail.is_null() {
        nodes[consumer].fanin_head = e;
    } else {
        edges[tail].next_in = e;
    }
    nodes[consumer].fanin_tail = e;
}

fn unlink_fanin(nodes: &mut Nodes, edges: &mut Edges, e: EdgeId) {
    let (consumer, prev, next) = {
        let edge = &edges[e];
        (edge.consumer, edge.prev_in, edge.next_in)
    };
    if prev.is_null() {
        nodes[consumer].fanin_head = next;
    } else {
        edges[prev].next_in = next;
    }
    if next.is_null() {
        nodes[consumer].fanin_tail = prev;
    } else {
        edges[next].prev_in = prev;
    }
    edges[e].prev_in = EdgeId::null();
    edges[e].next_in = EdgeId::null();
}
