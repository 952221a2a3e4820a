//! Intrusive doubly-linked lists over an index arena.
//!
//! Every queueing need in the kernel (delay lists, event waiter lists,
//! pending-ready staging, timer lists) uses the same circular list shape:
//! a sentinel node acts as both head and tail, each member node carries an
//! ordering key and a back-reference to the entity embedding it. Nodes and
//! sentinels live in one arena and link by index, so list surgery stays
//! O(1) without aliased pointers.

use crate::task::TaskId;
use crate::timer::TimerId;
use crate::Tick;

/// Index-stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef(usize);

/// Index-stable handle to a list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListRef(usize);

/// Back-reference from a node to the entity that embeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeOwner {
    Sentinel,
    Task(TaskId),
    Timer(TimerId),
}

struct Node {
    next: Option<NodeRef>,
    prev: Option<NodeRef>,
    list: Option<ListRef>,
    value: Tick,
    owner: NodeOwner,
}

struct ListHead {
    sentinel: NodeRef,
    len: usize,
}

/// Arena holding every node and list head in one kernel instance.
///
/// Invariants: a detached node has `next == prev == None` and
/// `list == None`; a sentinel always links to itself when its list is
/// empty; a node belongs to at most one list.
pub(crate) struct ListArena {
    nodes: Vec<Node>,
    lists: Vec<ListHead>,
}

impl ListArena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            lists: Vec::new(),
        }
    }

    pub(crate) fn create_list(&mut self) -> ListRef {
        let sentinel = NodeRef(self.nodes.len());
        let list = ListRef(self.lists.len());
        self.nodes.push(Node {
            next: Some(sentinel),
            prev: Some(sentinel),
            list: Some(list),
            value: 0,
            owner: NodeOwner::Sentinel,
        });
        self.lists.push(ListHead { sentinel, len: 0 });
        list
    }

    pub(crate) fn create_node(&mut self, owner: NodeOwner) -> NodeRef {
        let node = NodeRef(self.nodes.len());
        self.nodes.push(Node {
            next: None,
            prev: None,
            list: None,
            value: 0,
            owner,
        });
        node
    }

    pub(crate) fn sentinel(&self, list: ListRef) -> NodeRef {
        self.lists[list.0].sentinel
    }

    pub(crate) fn len(&self, list: ListRef) -> usize {
        self.lists[list.0].len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self, list: ListRef) -> bool {
        self.lists[list.0].len == 0
    }

    /// First real node of the list, if any.
    pub(crate) fn head(&self, list: ListRef) -> Option<NodeRef> {
        let sentinel = self.sentinel(list);
        let first = self.next(sentinel);
        (first != sentinel).then_some(first)
    }

    /// Successor link. Defined for sentinels and listed nodes; walking off
    /// the tail yields the sentinel.
    pub(crate) fn next(&self, node: NodeRef) -> NodeRef {
        match self.nodes[node.0].next {
            Some(next) => next,
            None => panic!("successor of a detached node"),
        }
    }

    pub(crate) fn prev(&self, node: NodeRef) -> NodeRef {
        match self.nodes[node.0].prev {
            Some(prev) => prev,
            None => panic!("predecessor of a detached node"),
        }
    }

    pub(crate) fn value(&self, node: NodeRef) -> Tick {
        self.nodes[node.0].value
    }

    pub(crate) fn set_value(&mut self, node: NodeRef, value: Tick) {
        self.nodes[node.0].value = value;
    }

    pub(crate) fn owner(&self, node: NodeRef) -> NodeOwner {
        self.nodes[node.0].owner
    }

    pub(crate) fn list_of(&self, node: NodeRef) -> Option<ListRef> {
        self.nodes[node.0].list
    }

    pub(crate) fn is_listed(&self, node: NodeRef) -> bool {
        self.nodes[node.0].list.is_some()
    }

    /// Splices `node` in directly after `after` (which may be the
    /// sentinel, yielding a head insertion). The node must be detached.
    pub(crate) fn insert_after(&mut self, list: ListRef, after: NodeRef, node: NodeRef) {
        assert!(
            !self.is_listed(node),
            "node is already a member of a list"
        );
        let follower = self.next(after);
        self.nodes[node.0].prev = Some(after);
        self.nodes[node.0].next = Some(follower);
        self.nodes[node.0].list = Some(list);
        self.nodes[after.0].next = Some(node);
        self.nodes[follower.0].prev = Some(node);
        self.lists[list.0].len += 1;
    }

    /// Appends `node` at the tail of `list`.
    pub(crate) fn append(&mut self, list: ListRef, node: NodeRef) {
        let tail = self.prev(self.sentinel(list));
        self.insert_after(list, tail, node);
    }

    /// Inserts `node` keyed by `value`, ascending; equal keys go after the
    /// existing ones, giving FIFO fairness among same-key entries.
    pub(crate) fn insert_ordered(&mut self, list: ListRef, node: NodeRef, value: Tick) {
        self.set_value(node, value);
        let sentinel = self.sentinel(list);
        let mut after = sentinel;
        let mut walk = self.next(sentinel);
        while walk != sentinel && self.value(walk) <= value {
            after = walk;
            walk = self.next(walk);
        }
        self.insert_after(list, after, node);
    }

    /// Unlinks `node` from its list. Removing a detached node is a
    /// contract violation.
    pub(crate) fn remove(&mut self, node: NodeRef) {
        let list = match self.nodes[node.0].list {
            Some(list) => list,
            None => panic!("removing a node that is not in any list"),
        };
        let prev = self.prev(node);
        let next = self.next(node);
        self.nodes[prev.0].next = Some(next);
        self.nodes[next.0].prev = Some(prev);
        self.nodes[node.0].next = None;
        self.nodes[node.0].prev = None;
        self.nodes[node.0].list = None;
        self.lists[list.0].len -= 1;
    }
}
