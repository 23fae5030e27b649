//! Red-black tree nodes shared across transactions.
//!
//! A tree is a DAG over intentions: edges whose target lives in an earlier
//! intention carry the `(csn, offset)` of the serialized node, while edges
//! inside the current transaction point at heap nodes directly. Nodes from
//! the snapshot are immutable for every builder; a builder may only mutate
//! nodes stamped with its own transaction id.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

/// Child selector for the mirrored rebalance paths. The insert and delete
/// balance routines are written once over a `Side` and dispatched with
/// `Left` or `Right` depending on which mirror applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A parent-to-child edge.
///
/// For a target inside the current intention the authoritative pointer is
/// `target`; `csn` and `offset` are scratch until serialization rewrites
/// them. For a foreign target `(csn, offset)` are authoritative and
/// `target` caches the resolved node.
#[derive(Clone)]
pub struct NodePtr {
    target: NodeRef,
    csn: u64,
    offset: u64,
}

impl NodePtr {
    /// Edge to the terminal: no target, zeroed address.
    pub fn terminal() -> Self {
        Self {
            target: NodeRef::Nil,
            csn: 0,
            offset: 0,
        }
    }

    pub fn target(&self) -> &NodeRef {
        &self.target
    }

    pub fn csn(&self) -> u64 {
        self.csn
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// One key/value entry in the ordered map, plus the metadata that ties it
/// to its transaction: the owning `rid`, value-shadowing state, and the
/// dense index it is assigned when its intention is serialized.
pub struct Node {
    key: Bytes,
    val: Bytes,
    red: bool,
    left: NodePtr,
    right: NodePtr,
    rid: u64,
    field_index: Option<u64>,
    altered: bool,
    depends: bool,
    ssv: Option<Bytes>,
    subtree_ro_dependent: bool,
}

impl Node {
    /// A brand-new red leaf created by an insert. It has no source, so no
    /// shadow value is recorded.
    pub(crate) fn leaf(key: &[u8], val: &[u8], rid: u64) -> NodeRef {
        NodeRef::from_node(Node {
            key: Bytes::copy_from_slice(key),
            val: Bytes::copy_from_slice(val),
            red: true,
            left: NodePtr::terminal(),
            right: NodePtr::terminal(),
            rid,
            field_index: None,
            altered: true,
            depends: false,
            ssv: None,
            subtree_ro_dependent: false,
        })
    }

    /// An own copy of a foreign node: payload, color, and both edges come
    /// across verbatim (including each edge's `(csn, offset)`), the copy
    /// floats unindexed, and the source's shadow value is captured at the
    /// moment of divergence.
    pub(crate) fn copy(src: &NodeRef, rid: u64) -> NodeRef {
        let inner = src.inner().borrow();
        NodeRef::from_node(Node {
            key: inner.key.clone(),
            val: inner.val.clone(),
            red: inner.red,
            left: inner.left.clone(),
            right: inner.right.clone(),
            rid,
            field_index: None,
            altered: false,
            depends: true,
            ssv: Some(inner.nsv()),
            subtree_ro_dependent: false,
        })
    }

    /// The value visible to snapshot-isolation reads. While the subtree is
    /// read-only dependent, the recorded source value shadows the payload;
    /// a node created inside its transaction has no source value and reads
    /// as its own payload.
    fn nsv(&self) -> Bytes {
        if self.subtree_ro_dependent {
            self.ssv.clone().unwrap_or_else(|| self.val.clone())
        } else {
            self.val.clone()
        }
    }

    fn child(&self, side: Side) -> &NodePtr {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn child_mut(&mut self, side: Side) -> &mut NodePtr {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

/// Shared handle to a node. `Nil` is the process-wide terminal: always
/// black, payload-free, and structurally immutable.
#[derive(Clone)]
pub enum NodeRef {
    Nil,
    Node(Rc<RefCell<Node>>),
}

impl NodeRef {
    fn from_node(node: Node) -> Self {
        NodeRef::Node(Rc::new(RefCell::new(node)))
    }

    fn inner(&self) -> &Rc<RefCell<Node>> {
        match self {
            NodeRef::Nil => panic!("nil terminal carries no node"),
            NodeRef::Node(rc) => rc,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, NodeRef::Nil)
    }

    /// Identity comparison; the terminal compares equal to itself.
    pub fn same(&self, other: &NodeRef) -> bool {
        match (self, other) {
            (NodeRef::Nil, NodeRef::Nil) => true,
            (NodeRef::Node(a), NodeRef::Node(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Owning transaction id; the terminal belongs to no transaction.
    pub fn rid(&self) -> u64 {
        match self {
            NodeRef::Nil => 0,
            NodeRef::Node(rc) => rc.borrow().rid,
        }
    }

    pub fn is_red(&self) -> bool {
        match self {
            NodeRef::Nil => false,
            NodeRef::Node(rc) => rc.borrow().red,
        }
    }

    pub fn key(&self) -> Bytes {
        self.inner().borrow().key.clone()
    }

    pub fn val(&self) -> Bytes {
        self.inner().borrow().val.clone()
    }

    pub fn altered(&self) -> bool {
        self.inner().borrow().altered
    }

    pub fn depends(&self) -> bool {
        self.inner().borrow().depends
    }

    pub fn ssv(&self) -> Option<Bytes> {
        self.inner().borrow().ssv.clone()
    }

    pub fn nsv(&self) -> Bytes {
        self.inner().borrow().nsv()
    }

    pub fn field_index(&self) -> Option<u64> {
        self.inner().borrow().field_index
    }

    pub fn subtree_ro_dependent(&self) -> bool {
        self.inner().borrow().subtree_ro_dependent
    }

    pub fn child(&self, side: Side) -> NodePtr {
        self.inner().borrow().child(side).clone()
    }

    pub fn child_ref(&self, side: Side) -> NodeRef {
        self.inner().borrow().child(side).target.clone()
    }

    pub(crate) fn set_child(&self, side: Side, edge: NodePtr) {
        *self.inner().borrow_mut().child_mut(side) = edge;
    }

    /// Rewrites only the in-memory target of an edge, leaving its
    /// `(csn, offset)` stale; serialization rewrites both.
    pub(crate) fn set_child_ref(&self, side: Side, target: NodeRef) {
        self.inner().borrow_mut().child_mut(side).target = target;
    }

    pub(crate) fn set_child_csn(&self, side: Side, csn: u64) {
        self.inner().borrow_mut().child_mut(side).csn = csn;
    }

    pub(crate) fn set_child_offset(&self, side: Side, offset: u64) {
        self.inner().borrow_mut().child_mut(side).offset = offset;
    }

    pub(crate) fn set_red(&self, red: bool) {
        self.inner().borrow_mut().red = red;
    }

    /// Colors the node black; a no-op on the terminal, which is already
    /// (and permanently) black.
    pub(crate) fn blacken(&self) {
        if let NodeRef::Node(rc) = self {
            rc.borrow_mut().red = false;
        }
    }

    pub(crate) fn swap_color(&self, other: &NodeRef) {
        debug_assert!(!self.same(other));
        let mut a = self.inner().borrow_mut();
        let mut b = other.inner().borrow_mut();
        std::mem::swap(&mut a.red, &mut b.red);
    }

    /// Overwrites the payload value and marks the node altered.
    pub(crate) fn set_val(&self, val: Bytes) {
        let mut node = self.inner().borrow_mut();
        node.val = val;
        node.altered = true;
    }

    /// Moves key and value out of `victim` into this node, leaving the
    /// victim payload-empty. Used when an internal node is replaced by its
    /// in-order successor during delete.
    pub(crate) fn steal_payload(&self, victim: &NodeRef) {
        debug_assert!(!self.same(victim));
        let mut dst = self.inner().borrow_mut();
        let mut src = victim.inner().borrow_mut();
        dst.key = std::mem::take(&mut src.key);
        dst.val = std::mem::take(&mut src.val);
    }

    pub(crate) fn set_field_index(&self, index: u64) {
        self.inner().borrow_mut().field_index = Some(index);
    }

    pub(crate) fn set_subtree_ro_dependent(&self, value: bool) {
        self.inner().borrow_mut().subtree_ro_dependent = value;
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Nil => write!(f, "Nil"),
            NodeRef::Node(rc) => {
                let node = rc.borrow();
                f.debug_struct("Node")
                    .field("key", &render_key(&node.key))
                    .field("red", &node.red)
                    .field("rid", &node.rid)
                    .finish_non_exhaustive()
            }
        }
    }
}

/// Renders a byte-string key for descriptions and log events: UTF-8 when
/// printable, hex otherwise.
pub(crate) fn render_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) if s.chars().all(|c| !c.is_control()) => s.to_string(),
        _ => format!("0x{}", hex::encode(key)),
    }
}
