//! # Treelog - Log-Structured Ordered Map Write Path
//!
//! Treelog is the write-side core of a log-structured, multi-version
//! key/value store. Each transaction materializes its effect on the
//! ordered map as a copy-on-write red-black tree and serializes it into a
//! self-contained binary *intention*: unchanged nodes are referenced by
//! their position in earlier intentions, changed or new nodes are embedded
//! inline.
//!
//! ## Quick Start
//!
//! ```rust
//! use treelog::{Intention, Snapshot};
//!
//! // Build a transaction against the empty map.
//! let mut txn = Intention::new(Snapshot::empty(), 1);
//! txn.put(b"k", b"v1");
//! txn.put(b"j", b"v2");
//!
//! // Freeze the transaction, then stamp the log position it was given.
//! let blob = txn.serialize()?;
//! txn.set_csn(1)?;
//!
//! let record = treelog::IntentionRecord::decode(&blob)?;
//! assert_eq!(record.tree.len(), 2);
//!
//! // The committed tree is the base for the next transaction.
//! let snapshot = txn.into_snapshot()?;
//! let mut next = Intention::new(snapshot, 2);
//! next.delete(b"j");
//! # Ok::<(), treelog::TreeLogError>(())
//! ```
//!
//! ## Sharing model
//!
//! Everything reachable from a snapshot is immutable: a builder copies
//! each node it touches into its own transaction before writing, so any
//! number of readers and sibling builders can hold the same snapshot. One
//! builder serves exactly one transaction and is single-threaded.

pub mod error;
pub mod intention;
pub mod logging;
pub mod node;
pub mod snapshot;
pub mod verify;
pub mod wire;

pub use crate::error::{Result, TreeLogError};
pub use crate::intention::{Intention, IntentionOptions};
pub use crate::node::{NodePtr, NodeRef, Side};
pub use crate::snapshot::Snapshot;
pub use crate::wire::{IntentionRecord, IntentionSource, NodeRecord, PtrRecord};
