// Copyright 2022 Oxide Computer Company

//! flowcls: a priority/wildcard flow classifier.
//!
//! This is the matching engine behind an OpenFlow-style forwarding table.
//! Rules pin arbitrary bits of a fixed header layout under per-rule masks;
//! a lookup returns the highest-priority rule matching a flow and reports,
//! as a wildcard mask, exactly which header bits the decision depended on.
//! That report is what lets a datapath cache install one broad megaflow
//! entry for a whole equivalence class of packets instead of one entry per
//! connection, so lookups are arranged to examine as few bits as they can
//! get away with.
//!
//! ## Structure
//!
//! Rules sharing a mask shape share a *subtable*, where matching reduces
//! to exact hash lookup on the masked value. Subtables are walked in
//! descending order of their best rule, and three mechanisms cut the walk
//! short:
//!
//! - the walk stops once no remaining subtable can beat the rule in hand;
//! - *partitions* map each exactly-pinned metadata value to the set of
//!   subtables that could match it, as a 64-bit tag Bloom filter;
//! - *prefix tries* over address fields bound the longest prefix any rule
//!   holds for this flow, skipping subtables that demand longer ones;
//! - within a subtable the hash probe is *staged* over segments of the
//!   mask, aborting at the first segment no rule value shares.
//!
//! Each shortcut charges the wildcard mask for the bits it examined, so
//! pruning the walk also tightens the cached megaflow.
//!
//! ## Concurrency
//!
//! One writer, any number of readers. Writers serialize on an internal
//! lock; readers pin an epoch (crossbeam) and traverse atomically
//! published structures that writers replace wholesale and retire, so a
//! reader never blocks, never locks, and never observes a half-applied
//! update.

pub mod classifier;
mod cmap;
pub mod error;
pub mod field;
pub mod flow;
pub mod mmatch;
mod partition;
mod pvector;
pub mod rule;
mod subtable;
mod trie;

pub use classifier::{Classifier, ClassifierStats, Cursor, TrieStats};
pub use error::Error;
pub use field::{FieldCategory, FieldDef, FieldId};
pub use flow::{Flow, FlowMask, FLOW_SIZE, FLOW_U64S};
pub use mmatch::MiniMatch;
pub use partition::TAG_ALL;
pub use rule::Rule;

/// Segment boundaries a subtable may stage its hash lookup over.
pub const CLS_MAX_INDICES: usize = 3;

/// Prefix tries a classifier may be configured with.
pub const CLS_MAX_TRIES: usize = 3;

/// Flows per batch lookup.
pub const CLASSIFIER_MAX_BATCH: usize = 256;
