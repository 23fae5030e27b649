//! Structural integrity checks for in-memory trees.
//!
//! Used by tests after every mutation, and available to embedders that
//! want to audit a tree before committing it.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Result, TreeLogError};
use crate::node::{NodeRef, Side};

/// Integrity summary for one tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeReport {
    pub nodes: u64,
    pub black_height: u32,
    pub depth: u32,
}

/// Validates red-black shape and strict key ordering under `root`.
pub fn check_tree(root: &NodeRef) -> Result<TreeReport> {
    if root.is_red() {
        return Err(TreeLogError::Corruption("root is red".into()));
    }
    let (black_height, nodes, depth) = check_subtree(root, None, None)?;
    Ok(TreeReport {
        nodes,
        black_height,
        depth,
    })
}

fn check_subtree(
    node: &NodeRef,
    lower: Option<&Bytes>,
    upper: Option<&Bytes>,
) -> Result<(u32, u64, u32)> {
    if node.is_nil() {
        return Ok((1, 0, 0));
    }

    let key = node.key();
    if let Some(bound) = lower {
        if key <= *bound {
            return Err(TreeLogError::Corruption(
                "key not above its subtree lower bound".into(),
            ));
        }
    }
    if let Some(bound) = upper {
        if key >= *bound {
            return Err(TreeLogError::Corruption(
                "key not below its subtree upper bound".into(),
            ));
        }
    }

    if node.is_red()
        && (node.child_ref(Side::Left).is_red() || node.child_ref(Side::Right).is_red())
    {
        return Err(TreeLogError::Corruption("red node has a red child".into()));
    }

    let (left_height, left_nodes, left_depth) =
        check_subtree(&node.child_ref(Side::Left), lower, Some(&key))?;
    let (right_height, right_nodes, right_depth) =
        check_subtree(&node.child_ref(Side::Right), Some(&key), upper)?;

    if left_height != right_height {
        return Err(TreeLogError::Corruption(format!(
            "black height mismatch: {left_height} vs {right_height}"
        )));
    }

    let black = u32::from(!node.is_red());
    Ok((
        left_height + black,
        left_nodes + right_nodes + 1,
        left_depth.max(right_depth) + 1,
    ))
}

/// After serialization, every own node's index must be unique, dense in
/// `[0, N)`, and larger than the indices of its own children. Returns the
/// own-node count.
pub fn check_field_indices(root: &NodeRef, rid: u64) -> Result<u64> {
    let mut seen = Vec::new();
    walk_indices(root, rid, &mut seen)?;
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    for (rank, index) in sorted.iter().enumerate() {
        if *index != rank as u64 {
            return Err(TreeLogError::Corruption(format!(
                "field indices not dense: saw {index} at rank {rank}"
            )));
        }
    }
    Ok(seen.len() as u64)
}

fn walk_indices(node: &NodeRef, rid: u64, seen: &mut Vec<u64>) -> Result<Option<u64>> {
    if node.is_nil() || node.rid() != rid {
        return Ok(None);
    }
    let index = node
        .field_index()
        .ok_or_else(|| TreeLogError::Corruption("own node has no field index".into()))?;
    for side in [Side::Left, Side::Right] {
        if let Some(child_index) = walk_indices(&node.child_ref(side), rid, seen)? {
            if child_index >= index {
                return Err(TreeLogError::Corruption(format!(
                    "child index {child_index} not below parent {index}"
                )));
            }
        }
    }
    seen.push(index);
    Ok(Some(index))
}

/// The ordered key/value mapping under `root`, snapshot and own nodes
/// alike.
pub fn collect_inorder(root: &NodeRef) -> Vec<(Bytes, Bytes)> {
    let mut out = Vec::new();
    walk_inorder(root, &mut out);
    out
}

fn walk_inorder(node: &NodeRef, out: &mut Vec<(Bytes, Bytes)>) {
    if node.is_nil() {
        return;
    }
    walk_inorder(&node.child_ref(Side::Left), out);
    out.push((node.key(), node.val()));
    walk_inorder(&node.child_ref(Side::Right), out);
}
