//! Persist the location of keys in an append-only store.
//!
//! [Index] maintains a durable map from opaque byte-string keys to the physical location
//! (file, offset, record count, sequence) of entries written to external append-only data
//! files. The map is partitioned into shards, one per cache segment, each persisted as a
//! B+tree inside a single [commonware_runtime::Blob] with an explicit free-slot catalog.
//! Mutations to a shard are applied by a single task draining a queue, while concurrent
//! readers traverse an immutable snapshot of the tree. On graceful shutdown the full state
//! (trees, per-segment counters, and compactor statistics) is persisted so a restart can
//! resume without replaying data files; any other shutdown is detected at load and the
//! caller is expected to rebuild by replay.
//!
//! # Format
//!
//! Each shard is stored in a blob named `index.<shard>`. The blob starts with a 34-byte
//! big-endian header followed by tree nodes packed at arbitrary offsets, with the free-slot
//! catalog serialized at the tail on graceful shutdown:
//!
//! ```text
//! +--------+----------------+-------------+----------+--------------------+---------------+
//! | 0..4   | 4..8           | 8..16       | 16..18   | 18..26             | 26..34        |
//! +--------+----------------+-------------+----------+--------------------+---------------+
//! | Magic  | Segment Count  | Root Offset | Root Len | Free Blocks Offset | Element Count |
//! +--------+----------------+-------------+----------+--------------------+---------------+
//!
//! Magic = GRACEFULLY(0x512ACEF2) after a clean stop, DIRTY(0xD112770C) while running
//! ```
//!
//! A node is a tagged record (`0` = leaf, `1` = inner). Leaves hold sorted
//! `(key, file, offset, records, seq)` tuples; inner nodes hold sorted key separators and
//! `count + 1` child slots. A slot is an `(offset: u64, length: u16)` pair. When a node is
//! rewritten, the replacement goes to a fresh slot and the old slot is returned to the
//! free-slot catalog (slots at the blob tail shrink the blob instead). A free slot is only
//! reused for a node at most 25% smaller than the slot, to bound fragmentation.
//!
//! Two sidecar blobs are written in the same partition at shutdown and consumed (then
//! deleted) at load: `index-count` (varint segment count followed by varint per-segment
//! live-entry counters) and `index.stats` (repeating 20-byte records
//! `file: i32 | total: i32 | free: i32 | next_expiration: i64` describing data-file free
//! space for the compactor). A missing or mismatched sidecar means the previous shutdown
//! was not graceful and [Index::load] returns false without touching the shards.
//!
//! # Concurrency
//!
//! Writes to a shard are serialized: every mutation is enqueued as a request and applied
//! by that shard's single applier task, which alone touches the shard's free catalog, blob
//! size, and root pointer. Readers briefly take the shard's root lock to pin the current
//! root, then descend lock-free over immutable nodes. Requests against a single shard are
//! applied in enqueue order; there is no ordering across shards. Completions are delivered
//! over oneshot channels so continuations never run on (or stall) the applier.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use commonware_locator::{mocks, pool::BlobPool, Config, Index, Location};
//! use std::sync::Arc;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let data = Arc::new(BlobPool::new(context.clone(), "data".into(), "data.".into(), 16));
//!     let compactor = Arc::new(mocks::Compactor::default());
//!     let staging = Arc::new(mocks::Staging::new(2));
//!     let cfg = Config {
//!         partition: "index".into(),
//!         cache_segments: 2,
//!         min_node_size: 64,
//!         max_node_size: 1024,
//!         max_open_blobs: 16,
//!         mailbox_size: 16,
//!     };
//!     let mut index = Index::init(context, cfg, data, compactor, staging).unwrap();
//!     index.start();
//!     if !index.load().await.unwrap() {
//!         index.reset().await.unwrap();
//!         // replay data files here
//!     }
//!
//!     // Record a write, then look it up
//!     let receipt = index
//!         .update(0, b"key".as_ref().into(), Location { file: 10, offset: 0 }, 1, 1)
//!         .await
//!         .unwrap();
//!     assert!(!receipt.await.unwrap());
//!     let position = index.get_position(0, b"key".as_ref().into()).await.unwrap();
//!     assert_eq!(position, Some(Location { file: 10, offset: 0 }));
//!
//!     index.stop().await.unwrap();
//! });
//! ```

pub mod entry;
pub mod free;
pub mod index;
pub mod mocks;
pub mod node;
pub mod pool;
mod request;
mod shard;

pub use entry::{Entry, EntryRecord, Location};
pub use index::Index;
pub use node::IndexSpace;
pub use request::Receipt;

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur when interacting with the [Index].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("codec error: {0}")]
    Codec(#[from] commonware_codec::Error),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("node larger than maximum: {0} > {1}")]
    NodeOverflow(usize, u16),
    #[error("index stopping")]
    Stopped,
    #[error("unknown segment: {0}")]
    UnknownSegment(u32),
}

/// Configuration for [Index].
#[derive(Clone)]
pub struct Config {
    /// The [commonware_runtime::Storage] partition used for shard blobs and the
    /// `index-count` / `index.stats` sidecars.
    pub partition: String,

    /// The number of cache segments (one shard per segment).
    pub cache_segments: u32,

    /// Nodes smaller than this are merged with a sibling (the root is exempt).
    pub min_node_size: u16,

    /// Nodes larger than this are split. Must be at most 32767 so a node fits
    /// the slot-length field.
    pub max_node_size: u16,

    /// The maximum number of cached open blobs per pool.
    pub max_open_blobs: usize,

    /// The capacity of each shard's request queue.
    pub mailbox_size: usize,
}

/// Free-space statistics for one data file, exchanged with the [Compactor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStats {
    /// Total bytes in the file (-1 if not yet known).
    pub total: i32,
    /// Bytes no longer referenced by any live entry.
    pub free: i32,
    /// Earliest expiration of any record in the file (epoch ms, -1 if none).
    pub next_expiration: i64,
}

/// The compaction driver for the data files.
///
/// The index feeds it per-file statistics recovered at load and drains them at
/// graceful stop so they survive restarts.
pub trait Compactor: Send + Sync + 'static {
    /// Register free-space statistics for a data file. Returns false if the file
    /// cannot be registered (the persisted statistics are then considered stale
    /// and the index declares itself dirty).
    fn add_free_file(
        &self,
        file: i32,
        total: i32,
        free: i32,
        next_expiration: i64,
        immediate: bool,
    ) -> bool;

    /// Discard statistics for a deleted data file.
    fn release_stats(&self, file: i32);

    /// Snapshot of per-file statistics, drained at graceful stop.
    fn file_stats(&self) -> BTreeMap<i32, FileStats>;
}

/// The in-memory table of recent writes that have not yet been indexed.
///
/// After a request is applied, its staging entry is dropped iff it still refers
/// to the location the request installed, so a concurrent later write is never
/// shadowed.
pub trait Staging: Send + Sync + 'static {
    /// The cache-segment count the staging table was built for. Persisted shard
    /// headers must match it to be loadable.
    fn segment_max(&self) -> u32;

    /// Remove the staging entry for `key` iff it still maps to `(file, offset)`.
    fn remove_conditionally(&self, segment: u32, key: &[u8], file: i32, offset: i64);
}
