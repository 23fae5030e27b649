//! Binary intention records.
//!
//! An intention blob is self-contained and position-independent: edges
//! between nodes of the same intention use local indices, edges into older
//! intentions use the absolute `(csn, offset)` of the target. The framing
//! is little-endian with u32 length prefixes and a crc32 trailer over the
//! whole body.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Result, TreeLogError};

pub const INTENTION_MAGIC: u32 = 0x544e_5449; // "ITNT"
pub const INTENTION_VERSION: u8 = 1;

const CRC_LEN: usize = 4;

mod node_flags {
    pub const RED: u8 = 0x01;
    pub const ALTERED: u8 = 0x02;
    pub const DEPENDS: u8 = 0x04;
    pub const SUBTREE_RO_DEP: u8 = 0x08;
    pub const HAS_SSV: u8 = 0x10;
    pub const KNOWN: u8 = RED | ALTERED | DEPENDS | SUBTREE_RO_DEP | HAS_SSV;
}

mod ptr_flags {
    pub const NIL: u8 = 0x01;
    pub const SELF: u8 = 0x02;
    pub const KNOWN: u8 = NIL | SELF;
}

/// Serialized form of one child edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrRecord {
    /// Terminal edge; `csn` and `off` are zero.
    pub nil: bool,
    /// Intra-intention edge; `off` indexes this intention's `tree`.
    pub self_ref: bool,
    /// Log position of the target's intention (foreign edges only).
    pub csn: u64,
    /// Target's index within its intention.
    pub off: u64,
}

impl PtrRecord {
    pub fn terminal() -> Self {
        Self {
            nil: true,
            self_ref: false,
            csn: 0,
            off: 0,
        }
    }

    pub fn own(off: u64) -> Self {
        Self {
            nil: false,
            self_ref: true,
            csn: 0,
            off,
        }
    }

    pub fn foreign(csn: u64, off: u64) -> Self {
        Self {
            nil: false,
            self_ref: false,
            csn,
            off,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.nil {
            flags |= ptr_flags::NIL;
        }
        if self.self_ref {
            flags |= ptr_flags::SELF;
        }
        out.push(flags);
        out.extend_from_slice(&self.csn.to_le_bytes());
        out.extend_from_slice(&self.off.to_le_bytes());
    }

    fn decode_from(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let flags = read_u8(buf, pos)?;
        if flags & !ptr_flags::KNOWN != 0 {
            return Err(TreeLogError::Corruption(format!(
                "unknown edge flags: 0x{flags:02X}"
            )));
        }
        let nil = flags & ptr_flags::NIL != 0;
        let self_ref = flags & ptr_flags::SELF != 0;
        if nil && self_ref {
            return Err(TreeLogError::Corruption(
                "edge is both terminal and intra-intention".into(),
            ));
        }
        let csn = read_u64(buf, pos)?;
        let off = read_u64(buf, pos)?;
        if nil && (csn != 0 || off != 0) {
            return Err(TreeLogError::Corruption(
                "terminal edge carries a target".into(),
            ));
        }
        if self_ref && csn != 0 {
            return Err(TreeLogError::Corruption(
                "intra-intention edge carries a log position".into(),
            ));
        }
        Ok(Self {
            nil,
            self_ref,
            csn,
            off,
        })
    }
}

/// Serialized form of one tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub red: bool,
    pub key: Bytes,
    pub val: Bytes,
    pub altered: bool,
    pub depends: bool,
    pub subtree_ro_dependent: bool,
    pub ssv: Option<Bytes>,
    pub left: PtrRecord,
    pub right: PtrRecord,
}

impl NodeRecord {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut flags = 0u8;
        if self.red {
            flags |= node_flags::RED;
        }
        if self.altered {
            flags |= node_flags::ALTERED;
        }
        if self.depends {
            flags |= node_flags::DEPENDS;
        }
        if self.subtree_ro_dependent {
            flags |= node_flags::SUBTREE_RO_DEP;
        }
        if self.ssv.is_some() {
            flags |= node_flags::HAS_SSV;
        }
        out.push(flags);
        put_bytes(out, &self.key)?;
        put_bytes(out, &self.val)?;
        if let Some(ssv) = &self.ssv {
            put_bytes(out, ssv)?;
        }
        self.left.encode_into(out);
        self.right.encode_into(out);
        Ok(())
    }

    fn decode_from(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let flags = read_u8(buf, pos)?;
        if flags & !node_flags::KNOWN != 0 {
            return Err(TreeLogError::Corruption(format!(
                "unknown node flags: 0x{flags:02X}"
            )));
        }
        let key = read_bytes(buf, pos)?;
        let val = read_bytes(buf, pos)?;
        let ssv = if flags & node_flags::HAS_SSV != 0 {
            Some(read_bytes(buf, pos)?)
        } else {
            None
        };
        let left = PtrRecord::decode_from(buf, pos)?;
        let right = PtrRecord::decode_from(buf, pos)?;
        Ok(Self {
            red: flags & node_flags::RED != 0,
            key,
            val,
            altered: flags & node_flags::ALTERED != 0,
            depends: flags & node_flags::DEPENDS != 0,
            subtree_ro_dependent: flags & node_flags::SUBTREE_RO_DEP != 0,
            ssv,
            left,
            right,
        })
    }
}

/// One transaction's serialized effect on the map: its own nodes in
/// post-order, the CSN of the snapshot it was computed against, and the
/// human-readable operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentionRecord {
    pub snapshot: u64,
    /// Post-order: children precede parents, the effective root is last,
    /// and index `i` equals the node's `field_index`.
    pub tree: Vec<NodeRecord>,
    pub description: Vec<String>,
}

impl IntentionRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&INTENTION_MAGIC.to_le_bytes());
        out.push(INTENTION_VERSION);
        out.extend_from_slice(&self.snapshot.to_le_bytes());

        let count = u32::try_from(self.tree.len()).map_err(|_| {
            TreeLogError::Serialization("too many nodes in one intention".into())
        })?;
        out.extend_from_slice(&count.to_le_bytes());
        for node in &self.tree {
            node.encode_into(&mut out)?;
        }

        let descriptions = u32::try_from(self.description.len()).map_err(|_| {
            TreeLogError::Serialization("too many descriptions in one intention".into())
        })?;
        out.extend_from_slice(&descriptions.to_le_bytes());
        for line in &self.description {
            put_slice(&mut out, line.as_bytes())?;
        }

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        if blob.len() < CRC_LEN {
            return Err(TreeLogError::Corruption("intention blob truncated".into()));
        }
        let (body, crc_bytes) = blob.split_at(blob.len() - CRC_LEN);
        let expected = u32::from_le_bytes(crc_bytes.try_into().expect("split leaves 4 bytes"));
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(TreeLogError::Corruption(format!(
                "intention checksum mismatch: stored {expected:#010x}, computed {actual:#010x}"
            )));
        }

        let mut pos = 0usize;
        let magic = read_u32(body, &mut pos)?;
        if magic != INTENTION_MAGIC {
            return Err(TreeLogError::Corruption(format!(
                "bad intention magic: {magic:#010x}"
            )));
        }
        let version = read_u8(body, &mut pos)?;
        if version != INTENTION_VERSION {
            return Err(TreeLogError::Corruption(format!(
                "unsupported intention version: {version}"
            )));
        }
        let snapshot = read_u64(body, &mut pos)?;

        let count = read_u32(body, &mut pos)? as usize;
        if count > body.len() - pos {
            return Err(TreeLogError::Corruption(
                "node count exceeds blob size".into(),
            ));
        }
        let mut tree = Vec::with_capacity(count);
        for index in 0..count {
            let node = NodeRecord::decode_from(body, &mut pos)?;
            for edge in [&node.left, &node.right] {
                if edge.self_ref && edge.off >= index as u64 {
                    return Err(TreeLogError::Corruption(format!(
                        "intra-intention edge at node {index} points forward to {}",
                        edge.off
                    )));
                }
            }
            tree.push(node);
        }

        let descriptions = read_u32(body, &mut pos)? as usize;
        if descriptions > body.len() - pos {
            return Err(TreeLogError::Corruption(
                "description count exceeds blob size".into(),
            ));
        }
        let mut description = Vec::with_capacity(descriptions);
        for _ in 0..descriptions {
            description.push(read_string(body, &mut pos)?);
        }

        if pos != body.len() {
            return Err(TreeLogError::Corruption(
                "trailing bytes after intention".into(),
            ));
        }

        Ok(Self {
            snapshot,
            tree,
            description,
        })
    }

    /// Index of the effective root: post-order emission puts it last.
    /// `None` for an intention that emptied the map.
    pub fn root_off(&self) -> Option<u64> {
        if self.tree.is_empty() {
            None
        } else {
            Some(self.tree.len() as u64 - 1)
        }
    }

    pub fn node(&self, off: u64) -> Result<&NodeRecord> {
        self.tree.get(off as usize).ok_or_else(|| {
            TreeLogError::Corruption(format!("node offset {off} out of bounds"))
        })
    }
}

/// Read-side access to committed intentions, keyed by log position. The
/// real system backs this with the log and a node cache; tests back it
/// with a map.
pub trait IntentionSource {
    fn intention(&self, csn: u64) -> Result<&IntentionRecord>;
}

impl IntentionSource for HashMap<u64, IntentionRecord> {
    fn intention(&self, csn: u64) -> Result<&IntentionRecord> {
        self.get(&csn).ok_or_else(|| {
            TreeLogError::Corruption(format!("no intention at log position {csn}"))
        })
    }
}

/// Collects the ordered key/value mapping rooted at the intention stored
/// at `csn`, resolving intra-intention edges locally and foreign edges
/// through `source`.
pub fn collect_inorder<S: IntentionSource>(source: &S, csn: u64) -> Result<Vec<(Bytes, Bytes)>> {
    let record = source.intention(csn)?;
    let mut out = Vec::new();
    if let Some(root) = record.root_off() {
        walk_inorder(source, csn, root, &mut out)?;
    }
    Ok(out)
}

fn walk_inorder<S: IntentionSource>(
    source: &S,
    csn: u64,
    off: u64,
    out: &mut Vec<(Bytes, Bytes)>,
) -> Result<()> {
    let node = source.intention(csn)?.node(off)?;
    if let Some((child_csn, child_off)) = edge_target(csn, &node.left) {
        walk_inorder(source, child_csn, child_off, out)?;
    }
    out.push((node.key.clone(), node.val.clone()));
    if let Some((child_csn, child_off)) = edge_target(csn, &node.right) {
        walk_inorder(source, child_csn, child_off, out)?;
    }
    Ok(())
}

fn edge_target(csn: u64, edge: &PtrRecord) -> Option<(u64, u64)> {
    if edge.nil {
        None
    } else if edge.self_ref {
        Some((csn, edge.off))
    } else {
        Some((edge.csn, edge.off))
    }
}

fn put_slice(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| TreeLogError::Serialization("field length exceeds u32::MAX".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, data: &Bytes) -> Result<()> {
    put_slice(out, data)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *buf
        .get(*pos)
        .ok_or_else(|| TreeLogError::Corruption("intention blob truncated".into()))?;
    *pos += 1;
    Ok(byte)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| TreeLogError::Corruption("intention blob truncated".into()))?;
    *pos = end;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| TreeLogError::Corruption("intention blob truncated".into()))?;
    *pos = end;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

fn read_bytes(buf: &[u8], pos: &mut usize) -> Result<Bytes> {
    let len = read_u32(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .ok_or_else(|| TreeLogError::Corruption("field length overflows".into()))?;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| TreeLogError::Corruption("intention blob truncated".into()))?;
    *pos = end;
    Ok(Bytes::copy_from_slice(slice))
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let bytes = read_bytes(buf, pos)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TreeLogError::Corruption("description is not valid UTF-8".into()))
}
