//! Intention construction: one transaction's copy-on-write view of the
//! ordered map.
//!
//! A builder is bound to a snapshot and a transaction id. Each `put` or
//! `delete` descends from the current effective root, copying every node it
//! touches into the transaction, and rebalances along the copied path.
//! Nothing reachable from the snapshot is ever written through; sibling
//! builders and readers can share it freely. At commit the builder
//! serializes its own nodes into a position-independent blob, and once the
//! log assigns a position the intra-intention edges are stamped with it.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Result, TreeLogError};
use crate::logging;
use crate::node::{render_key, Node, NodeRef, Side};
use crate::snapshot::Snapshot;
use crate::wire::{IntentionRecord, NodeRecord, PtrRecord};

/// Tuning knobs for intention construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentionOptions {
    /// When set, an own node none of whose children are own clears the
    /// read-only dependence of its subtree. Off by default: only altered
    /// payloads break dependence, propagated post-order.
    pub frontier_breaks_ro_dependence: bool,
}

/// Builder for one transaction's intention. Not reusable: after
/// [`serialize`](Intention::serialize) the tree is frozen, and after
/// [`set_csn`](Intention::set_csn) it can only become the next snapshot.
pub struct Intention {
    snapshot: Snapshot,
    rid: u64,
    root: Option<NodeRef>,
    description: Vec<String>,
    options: IntentionOptions,
    serialized: bool,
    csn: Option<u64>,
    span: tracing::Span,
}

impl Intention {
    pub fn new(snapshot: Snapshot, rid: u64) -> Self {
        Self::with_options(snapshot, rid, IntentionOptions::default())
    }

    pub fn with_options(snapshot: Snapshot, rid: u64, options: IntentionOptions) -> Self {
        let span = logging::intention_span(rid, snapshot.csn());
        Self {
            snapshot,
            rid,
            root: None,
            description: Vec::new(),
            options,
            serialized: false,
            csn: None,
            span,
        }
    }

    /// True until the first structural operation lands. Note that deleting
    /// every key leaves a non-empty builder whose effective root is the
    /// terminal.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// One line per accepted operation, in submission order.
    pub fn descriptions(&self) -> &[String] {
        &self.description
    }

    /// The current effective root, once any operation has produced one.
    pub fn root(&self) -> Option<&NodeRef> {
        self.root.as_ref()
    }

    pub fn csn(&self) -> Option<u64> {
        self.csn
    }

    /// Inserts `key`, or rewrites its value in place when it is already
    /// present.
    pub fn put(&mut self, key: &[u8], val: &[u8]) {
        assert!(!self.serialized, "mutation after serialization");
        let span = self.span.clone();
        let _guard = span.enter();

        let mut path = VecDeque::new();
        let base = self.base_root();
        let mut update = false;
        let mut root = self.insert_recursive(&mut path, key, val, &base, &mut update);

        if update {
            // The shape did not change, only a path was copied; no
            // rebalance is needed.
            trace!(key = %render_key(key), "update");
            self.description.push(format!("update: {}", render_key(key)));
            assert!(!root.is_red());
            self.root = Some(root);
            return;
        }

        trace!(key = %render_key(key), "put");
        self.description.push(format!("put: {}", render_key(key)));

        path.push_back(NodeRef::Nil);
        assert!(path.len() >= 2);

        let mut node = Self::pop_front(&mut path);
        let mut parent = Self::pop_front(&mut path);

        while parent.is_red() {
            assert!(!path.is_empty());
            let grand_parent = Self::front(&path);
            if grand_parent.child_ref(Side::Left).same(&parent) {
                self.insert_balance(&mut parent, &mut node, &mut path, Side::Left, &mut root);
            } else {
                self.insert_balance(&mut parent, &mut node, &mut path, Side::Right, &mut root);
            }
        }

        root.set_red(false);
        self.root = Some(root);
    }

    /// Removes `key` if present. The operation log grows either way.
    pub fn delete(&mut self, key: &[u8]) {
        assert!(!self.serialized, "mutation after serialization");
        let span = self.span.clone();
        let _guard = span.enter();

        // Recorded before the lookup: a delete of an absent key still
        // leaves its trace in the operation log.
        trace!(key = %render_key(key), "del");
        self.description.push(format!("del: {}", render_key(key)));

        let mut path = VecDeque::new();
        let base = self.base_root();
        let Some(mut root) = self.delete_recursive(&mut path, key, &base) else {
            return;
        };

        path.push_back(NodeRef::Nil);
        assert!(path.len() >= 2);

        let mut removed = Self::front(&path);
        debug_assert_eq!(&removed.key()[..], key);

        let mut transplanted = removed.child_ref(Side::Right);

        if removed.child_ref(Side::Left).is_nil() {
            path.pop_front();
            Self::transplant(&Self::front(&path), &removed, &transplanted, &mut root);
        } else if removed.child_ref(Side::Right).is_nil() {
            path.pop_front();
            transplanted = removed.child_ref(Side::Left);
            Self::transplant(&Self::front(&path), &removed, &transplanted, &mut root);
        } else {
            let replaced = removed.clone();
            self.own_child(&removed, Side::Right);
            removed = self.build_min_path(removed.child_ref(Side::Right), &mut path);
            transplanted = removed.child_ref(Side::Right);

            // The successor's payload moves into the node keeping its
            // position; the successor itself is excised below.
            replaced.steal_payload(&removed);

            Self::transplant(&Self::front(&path), &removed, &transplanted, &mut root);
        }

        if !removed.is_red() {
            self.balance_delete(transplanted, &mut path, &mut root);
        }

        self.root = Some(root);
    }

    /// Emits the intention blob, assigning every own node its dense
    /// position. Freezes the builder.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        let span = self.span.clone();
        let _guard = span.enter();
        if self.serialized {
            return Err(TreeLogError::Lifecycle("intention already serialized"));
        }
        let root = self
            .root
            .clone()
            .ok_or(TreeLogError::Lifecycle("serialize on an empty intention"))?;
        debug_assert!(root.is_nil() || root.rid() == self.rid);

        let mut record = IntentionRecord {
            snapshot: self.snapshot.csn(),
            tree: Vec::new(),
            description: self.description.clone(),
        };
        let mut next_index = 0u64;
        self.serialize_subtree(&root, &mut record.tree, &mut next_index);

        debug!(
            nodes = record.tree.len(),
            snapshot = record.snapshot,
            "serialized intention"
        );
        self.serialized = true;
        record.encode()
    }

    /// Stamps the log position onto every intra-intention edge, making the
    /// tree addressable by later transactions. Requires a prior
    /// [`serialize`](Intention::serialize); callable once.
    pub fn set_csn(&mut self, pos: u64) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        if !self.serialized {
            return Err(TreeLogError::Lifecycle(
                "log position assigned before serialization",
            ));
        }
        if self.csn.is_some() {
            return Err(TreeLogError::Lifecycle("log position assigned twice"));
        }
        let root = self.root.clone().expect("serialized intention has a root");
        self.stamp_self_csn(&root, pos);
        debug!(pos, "stamped intention log position");
        self.csn = Some(pos);
        Ok(())
    }

    /// Consumes the committed intention and yields the snapshot subsequent
    /// transactions build against.
    pub fn into_snapshot(self) -> Result<Snapshot> {
        let pos = self
            .csn
            .ok_or(TreeLogError::Lifecycle("intention has no log position yet"))?;
        let root = self.root.expect("serialized intention has a root");
        Ok(Snapshot::new(root, pos))
    }

    fn base_root(&self) -> NodeRef {
        self.root
            .clone()
            .unwrap_or_else(|| self.snapshot.root().clone())
    }

    fn front(path: &VecDeque<NodeRef>) -> NodeRef {
        path.front().expect("ancestor path exhausted").clone()
    }

    fn pop_front(path: &mut VecDeque<NodeRef>) -> NodeRef {
        path.pop_front().expect("ancestor path exhausted")
    }

    fn owns(&self, node: &NodeRef) -> bool {
        !node.is_nil() && node.rid() == self.rid
    }

    /// Copy-on-touch: `node` itself when it is already owned by this
    /// transaction (or the terminal), otherwise an own copy. The caller
    /// splices the copy into its parent edge.
    fn own_ref(&self, node: &NodeRef) -> NodeRef {
        if node.is_nil() || node.rid() == self.rid {
            node.clone()
        } else {
            Node::copy(node, self.rid)
        }
    }

    /// Copy-on-touch through an edge: replaces a foreign target with an
    /// own copy in place and returns the (possibly new) child.
    fn own_child(&self, parent: &NodeRef, side: Side) -> NodeRef {
        let child = parent.child_ref(side);
        if child.is_nil() || child.rid() == self.rid {
            return child;
        }
        let copy = Node::copy(&child, self.rid);
        parent.set_child_ref(side, copy.clone());
        copy
    }

    fn insert_recursive(
        &self,
        path: &mut VecDeque<NodeRef>,
        key: &[u8],
        val: &[u8],
        node: &NodeRef,
        update: &mut bool,
    ) -> NodeRef {
        if node.is_nil() {
            let leaf = Node::leaf(key, val, self.rid);
            path.push_back(leaf.clone());
            *update = false;
            return leaf;
        }

        let node_key = node.key();
        if key == &node_key[..] {
            // Existing entry: the copy carries the source's shadow value
            // so isolation checks can see what the value diverged from.
            let copy = self.own_ref(node);
            copy.set_val(Bytes::copy_from_slice(val));
            *update = true;
            return copy;
        }

        let side = if key < &node_key[..] {
            Side::Left
        } else {
            Side::Right
        };
        let child = self.insert_recursive(path, key, val, &node.child_ref(side), update);

        // The copy keeps the stale (csn, offset) on the touched edge;
        // both are rewritten when the intention is serialized.
        let copy = self.own_ref(node);
        copy.set_child_ref(side, child);
        path.push_back(copy.clone());
        copy
    }

    fn insert_balance(
        &self,
        parent: &mut NodeRef,
        node: &mut NodeRef,
        path: &mut VecDeque<NodeRef>,
        a: Side,
        root: &mut NodeRef,
    ) {
        let b = a.opposite();
        let grand_parent = Self::front(path);
        assert!(!grand_parent.is_nil());

        if grand_parent.child_ref(b).is_red() {
            let uncle = self.own_child(&grand_parent, b);
            parent.set_red(false);
            uncle.set_red(false);
            grand_parent.set_red(true);
            *node = Self::pop_front(path);
            *parent = Self::pop_front(path);
        } else {
            if parent.child_ref(b).same(node) {
                std::mem::swap(node, parent);
                self.rotate(&Self::front(path), node, a, root);
            }
            let grand_parent = Self::pop_front(path);
            grand_parent.swap_color(parent);
            self.rotate(&Self::front(path), &grand_parent, b, root);
        }
    }

    /// Rotates about `child`, lifting its `b`-side child into its place.
    /// `child` always lives in this intention; the lifted node's edges may
    /// reach outside it, so edge rewrites move the full `(csn, offset)`
    /// wherever an existing edge is relocated.
    fn rotate(&self, parent: &NodeRef, child: &NodeRef, a: Side, root: &mut NodeRef) -> NodeRef {
        let b = a.opposite();
        let pivot_edge = child.child(b);
        let pivot = pivot_edge.target().clone();

        child.set_child(b, pivot.child(a));

        if root.same(child) {
            *root = pivot.clone();
        } else if parent.child_ref(a).same(child) {
            parent.set_child(a, pivot_edge);
        } else {
            parent.set_child(b, pivot_edge);
        }

        // The stale (csn, offset) left on this edge is rewritten during
        // serialization.
        assert_eq!(child.rid(), self.rid);
        pivot.set_child_ref(a, child.clone());

        pivot
    }

    fn delete_recursive(
        &self,
        path: &mut VecDeque<NodeRef>,
        key: &[u8],
        node: &NodeRef,
    ) -> Option<NodeRef> {
        if node.is_nil() {
            return None;
        }

        let node_key = node.key();
        if key == &node_key[..] {
            let copy = self.own_ref(node);
            path.push_back(copy.clone());
            return Some(copy);
        }

        let side = if key < &node_key[..] {
            Side::Left
        } else {
            Side::Right
        };
        let child = self.delete_recursive(path, key, &node.child_ref(side))?;

        let copy = self.own_ref(node);
        copy.set_child_ref(side, child);
        path.push_back(copy.clone());
        Some(copy)
    }

    fn transplant(parent: &NodeRef, removed: &NodeRef, transplanted: &NodeRef, root: &mut NodeRef) {
        if parent.is_nil() {
            *root = transplanted.clone();
        } else if parent.child_ref(Side::Left).same(removed) {
            parent.set_child_ref(Side::Left, transplanted.clone());
        } else {
            parent.set_child_ref(Side::Right, transplanted.clone());
        }
    }

    /// Descends to the in-order successor along left edges, copying every
    /// crossed node into the transaction and stacking it for the
    /// rebalance.
    fn build_min_path(&self, node: NodeRef, path: &mut VecDeque<NodeRef>) -> NodeRef {
        let mut node = node;
        while !node.child_ref(Side::Left).is_nil() {
            self.own_child(&node, Side::Left);
            path.push_front(node.clone());
            node = node.child_ref(Side::Left);
        }
        node
    }

    fn balance_delete(
        &self,
        extra_black: NodeRef,
        path: &mut VecDeque<NodeRef>,
        root: &mut NodeRef,
    ) {
        let mut extra_black = extra_black;
        let mut parent = Self::pop_front(path);

        while !extra_black.same(root) && !extra_black.is_red() {
            if parent.child_ref(Side::Left).same(&extra_black) {
                self.remove_balance(&mut extra_black, &mut parent, path, Side::Left, root);
            } else {
                self.remove_balance(&mut extra_black, &mut parent, path, Side::Right, root);
            }
        }

        // The doubly-black node may still be foreign (or the terminal,
        // which is already black and stays untouched).
        let settled = self.own_ref(&extra_black);
        Self::transplant(&parent, &extra_black, &settled, root);
        settled.blacken();
    }

    fn remove_balance(
        &self,
        extra_black: &mut NodeRef,
        parent: &mut NodeRef,
        path: &mut VecDeque<NodeRef>,
        a: Side,
        root: &mut NodeRef,
    ) {
        let b = a.opposite();
        let mut brother = parent.child_ref(b);

        if brother.is_red() {
            brother = self.own_child(parent, b);
            brother.swap_color(parent);
            self.rotate(&Self::front(path), parent, a, root);
            path.push_front(brother.clone());
            brother = parent.child_ref(b);
        }

        assert!(!brother.is_nil());

        if !brother.child_ref(Side::Left).is_red() && !brother.child_ref(Side::Right).is_red() {
            let brother = self.own_child(parent, b);
            brother.set_red(true);
            *extra_black = parent.clone();
            *parent = Self::pop_front(path);
        } else {
            if !brother.child_ref(b).is_red() {
                let near = self.own_child(parent, b);
                let near_child = self.own_child(&near, a);
                near.swap_color(&near_child);
                self.rotate(parent, &near, b, root);
            }
            let brother = self.own_child(parent, b);
            let far_child = self.own_child(&brother, b);
            brother.set_red(parent.is_red());
            parent.set_red(false);
            far_child.set_red(false);
            self.rotate(&Self::front(path), parent, a, root);

            *extra_black = root.clone();
            *parent = NodeRef::Nil;
        }
    }

    /// Emits the own subtree under `node` in post-order, assigning each
    /// node its dense position. Returns whether this subtree leaves the
    /// parent's read-only dependence intact.
    fn serialize_subtree(
        &self,
        node: &NodeRef,
        tree: &mut Vec<NodeRecord>,
        next_index: &mut u64,
    ) -> bool {
        if !self.owns(node) {
            return true;
        }

        let mut ro_dependent = true;
        ro_dependent &= self.serialize_subtree(&node.child_ref(Side::Left), tree, next_index);
        ro_dependent &= self.serialize_subtree(&node.child_ref(Side::Right), tree, next_index);

        if self.options.frontier_breaks_ro_dependence
            && !self.owns(&node.child_ref(Side::Left))
            && !self.owns(&node.child_ref(Side::Right))
        {
            ro_dependent = false;
        }

        assert!(node.field_index().is_none(), "node indexed twice");
        node.set_field_index(*next_index);
        node.set_subtree_ro_dependent(ro_dependent);

        tree.push(NodeRecord {
            red: node.is_red(),
            key: node.key(),
            val: node.val(),
            altered: node.altered(),
            depends: node.depends(),
            subtree_ro_dependent: ro_dependent,
            ssv: node.ssv(),
            left: self.serialize_edge(node, Side::Left),
            right: self.serialize_edge(node, Side::Right),
        });
        *next_index += 1;

        !node.altered() && ro_dependent
    }

    fn serialize_edge(&self, node: &NodeRef, side: Side) -> PtrRecord {
        let child = node.child_ref(side);
        if child.is_nil() {
            PtrRecord::terminal()
        } else if child.rid() == self.rid {
            let off = child
                .field_index()
                .expect("children are indexed before their parent");
            node.set_child_offset(side, off);
            PtrRecord::own(off)
        } else {
            let edge = node.child(side);
            PtrRecord::foreign(edge.csn(), edge.offset())
        }
    }

    fn stamp_self_csn(&self, node: &NodeRef, pos: u64) {
        if !self.owns(node) {
            return;
        }
        if self.owns(&node.child_ref(Side::Right)) {
            node.set_child_csn(Side::Right, pos);
        }
        if self.owns(&node.child_ref(Side::Left)) {
            node.set_child_csn(Side::Left, pos);
        }
        self.stamp_self_csn(&node.child_ref(Side::Right), pos);
        self.stamp_self_csn(&node.child_ref(Side::Left), pos);
    }
}
