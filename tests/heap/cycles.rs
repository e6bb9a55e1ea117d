//! Cycle reclamation and the null-during-destruction rule.

use std::cell::Cell;
use std::rc::Rc;

use deferred_heap::{CellPtr, DeferredHeap};

use crate::counter;

/// A node that records, at destruction time, whether its outgoing edge had
/// already been nulled by the collector.
struct Node {
    other: CellPtr<Node>,
    hits: Rc<Cell<usize>>,
    dropped_with_null_edge: Rc<Cell<bool>>,
}

impl Node {
    fn new(hits: &Rc<Cell<usize>>) -> (Self, Rc<Cell<bool>>) {
        let flag = Rc::new(Cell::new(false));
        (
            Self {
                other: CellPtr::new(),
                hits: hits.clone(),
                dropped_with_null_edge: flag.clone(),
            },
            flag,
        )
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.hits.set(self.hits.get() + 1);
        self.dropped_with_null_edge.set(self.other.is_null());
    }
}

#[test]
fn two_node_cycle_is_reclaimed() {
    let heap = DeferredHeap::new();
    let hits = counter();
    let (node_a, a_saw_null) = Node::new(&hits);
    let (node_b, b_saw_null) = Node::new(&hits);

    let a = heap.make(node_a);
    let b = heap.make(node_b);
    a.other.set(&b);
    b.other.set(&a);
    drop(a);
    drop(b);

    heap.collect();
    assert_eq!(hits.get(), 2);
    // Each destructor observed its edge already nulled: no destructor can
    // reach into the other collected object.
    assert!(a_saw_null.get());
    assert!(b_saw_null.get());
    assert_eq!(heap.stats().allocations, 0);
    assert_eq!(heap.stats().tracked_cells, 0);
}

#[test]
fn rooted_cycle_survives() {
    let heap = DeferredHeap::new();
    let hits = counter();
    let (node_a, _) = Node::new(&hits);
    let (node_b, _) = Node::new(&hits);

    let a = heap.make(node_a);
    let b = heap.make(node_b);
    a.other.set(&b);
    b.other.set(&a);
    drop(b);

    // One root into the cycle keeps the whole cycle alive.
    heap.collect();
    assert_eq!(hits.get(), 0);
    assert_eq!(heap.stats().allocations, 2);

    drop(a);
    heap.collect();
    assert_eq!(hits.get(), 2);
}

#[test]
fn self_referencing_object_is_reclaimed() {
    let heap = DeferredHeap::new();
    let hits = counter();
    let (node, saw_null) = Node::new(&hits);

    let p = heap.make(node);
    p.other.set(&p);
    drop(p);

    heap.collect();
    assert_eq!(hits.get(), 1);
    assert!(saw_null.get());
}

#[test]
fn ring_of_three_is_reclaimed() {
    let heap = DeferredHeap::new();
    let hits = counter();

    let nodes: Vec<_> = (0..3)
        .map(|_| heap.make(Node::new(&hits).0))
        .collect();
    for i in 0..3 {
        nodes[i].other.set(&nodes[(i + 1) % 3]);
    }
    drop(nodes);

    heap.collect();
    assert_eq!(hits.get(), 3);
    assert_eq!(heap.stats().allocations, 0);
}

#[test]
fn chain_is_traced_through_interior_edges() {
    let heap = DeferredHeap::new();
    let hits = counter();

    // head -> middle -> tail, rooted only at head.
    let tail = heap.make(Node::new(&hits).0);
    let middle = heap.make(Node::new(&hits).0);
    middle.other.set(&tail);
    let head = heap.make(Node::new(&hits).0);
    head.other.set(&middle);
    drop(middle);
    drop(tail);

    heap.collect();
    assert_eq!(hits.get(), 0);
    assert_eq!(heap.stats().allocations, 3);

    // Severing the first edge strands the rest of the chain.
    head.other.clear();
    heap.collect();
    assert_eq!(hits.get(), 2);
    assert_eq!(heap.stats().allocations, 1);
}

#[test]
fn cell_edges_can_be_reloaded_as_roots() {
    let heap = DeferredHeap::new();
    let hits = counter();

    let tail = heap.make(Node::new(&hits).0);
    let head = heap.make(Node::new(&hits).0);
    head.other.set(&tail);
    drop(tail);

    // Re-root the edge, then drop the original root: the tail must stay
    // alive through the reloaded handle alone.
    let reloaded = head.other.load(&heap);
    drop(head);
    heap.collect();
    assert_eq!(hits.get(), 1); // head was reclaimed
    assert!(!reloaded.is_null());

    drop(reloaded);
    heap.collect();
    assert_eq!(hits.get(), 2);
}
