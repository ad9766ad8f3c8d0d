//! One shard: a single blob, a single applier, one published root.
//!
//! The applier task drains the shard's queue and is the only code that touches the free
//! catalog, the blob size, or the root pointer (readers share the root behind a brief
//! read-lock). When the queue closes, the applier persists the root node, the free
//! catalog, and the header, then flips the magic from `DIRTY` back to `GRACEFULLY`.

use crate::{
    entry::Location,
    free::{Catalog, Freed},
    node::{self, Apply, Applied, Change, IndexSpace, Root},
    pool::{BlobPool, Handle},
    request::Request,
    Error, Staging,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Write};
use commonware_runtime::Storage;
use commonware_utils::hex;
use futures::{channel::mpsc, StreamExt};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tracing::{debug, trace, warn};

/// Magic marking a cleanly closed shard blob.
pub(crate) const GRACEFULLY: u32 = 0x512ACEF2;

/// Magic stamped while a shard is live (or was never closed cleanly).
pub(crate) const DIRTY: u32 = 0xD112770C;

/// Size of the shard blob header.
pub(crate) const HEADER_SIZE: u64 = 34;

/// Per-cache-segment live-entry counters.
///
/// Accumulators are signed: preserved source behavior lets a counter drift negative
/// under pathological request mixes, and size queries saturate instead of panicking.
pub(crate) struct Sizes(Vec<AtomicI64>);

impl Sizes {
    pub(crate) fn new(segments: u32) -> Self {
        Self((0..segments).map(|_| AtomicI64::new(0)).collect())
    }

    pub(crate) fn get(&self, segment: u32) -> i64 {
        self.0[segment as usize].load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, segment: u32, value: i64) {
        self.0[segment as usize].store(value, Ordering::Release)
    }

    pub(crate) fn add(&self, segment: u32, delta: i64) {
        self.0[segment as usize].fetch_add(delta, Ordering::AcqRel);
    }

    pub(crate) fn zero(&self) {
        for counter in &self.0 {
            counter.store(0, Ordering::Release);
        }
    }

    pub(crate) fn len(&self) -> u32 {
        self.0.len() as u32
    }
}

/// The read-side of a shard, shared with the facade.
pub(crate) struct Shared {
    pub id: u32,
    pub root: RwLock<Root>,
}

impl Shared {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            root: RwLock::new(Root::empty()),
        }
    }
}

/// The applier-owned state of one shard.
pub(crate) struct Shard<E: Storage, T: Staging> {
    id: u32,
    segments: u32,
    min: u16,
    max: u16,
    pool: Arc<BlobPool<E>>,
    shared: Arc<Shared>,
    sizes: Arc<Sizes>,
    staging: Arc<T>,
    free: Catalog,
    file_size: u64,
}

impl<E: Storage, T: Staging> Shard<E, T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u32,
        segments: u32,
        min: u16,
        max: u16,
        pool: Arc<BlobPool<E>>,
        shared: Arc<Shared>,
        sizes: Arc<Sizes>,
        staging: Arc<T>,
    ) -> Self {
        Self {
            id,
            segments,
            min,
            max,
            pool,
            shared,
            sizes,
            staging,
            free: Catalog::new(),
            file_size: HEADER_SIZE,
        }
    }

    /// Drain the queue, then persist gracefully when it closes.
    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Request>) -> Result<(), Error> {
        while let Some(request) = requests.next().await {
            trace!(shard = self.id, kind = request.kind(), "indexing request");
            match request {
                Request::Clear { tx } => {
                    let _ = tx.send(self.clear().await);
                }
                Request::Sync { tx } => {
                    let _ = tx.send(Ok(()));
                }
                Request::Load { tx } => {
                    let _ = tx.send(self.load().await);
                }
                Request::Reset { tx } => {
                    let _ = tx.send(self.reset().await);
                }
                Request::Update {
                    key,
                    location,
                    records,
                    seq,
                    tx,
                } => {
                    let apply = Apply {
                        key: key.clone(),
                        location,
                        records,
                        seq,
                        change: Change::Increase,
                        guard: None,
                    };
                    match self.apply(&apply).await {
                        Ok(applied) => {
                            let prev = applied.prev.unwrap_or(Location {
                                file: -1,
                                offset: -1,
                            });
                            if location.offset >= 0 && prev.offset < 0 {
                                self.sizes.add(self.id, 1);
                            } else if location.offset < 0 && prev.offset >= 0 {
                                self.sizes.add(self.id, -1);
                            }
                            let _ = tx.send(Ok(applied.overwritten));
                            self.staging.remove_conditionally(
                                self.id,
                                &key,
                                location.file,
                                location.offset,
                            );
                        }
                        Err(err) => self.fail(tx, &key, err),
                    }
                }
                Request::Moved {
                    key,
                    location,
                    seq,
                    prev,
                    tx,
                } => {
                    let apply = Apply {
                        key: key.clone(),
                        location,
                        records: 0,
                        seq,
                        change: Change::Move,
                        guard: Some(prev),
                    };
                    match self.apply(&apply).await {
                        Ok(applied) => {
                            if applied.overwritten && location.offset < 0 && prev.offset >= 0 {
                                self.sizes.add(self.id, -1);
                            }
                            self.staging.remove_conditionally(
                                self.id,
                                &key,
                                location.file,
                                location.offset,
                            );
                            let _ = tx.send(Ok(()));
                        }
                        Err(err) => self.fail(tx, &key, err),
                    }
                }
                Request::Dropped { key, prev, seq, tx } => {
                    let apply = Apply {
                        key: key.clone(),
                        location: Location {
                            file: -1,
                            offset: -1,
                        },
                        records: 1,
                        seq,
                        change: Change::Decrease,
                        guard: None,
                    };
                    match self.apply(&apply).await {
                        Ok(applied) => {
                            if applied.prev == Some(prev) {
                                self.sizes.add(self.id, -1);
                            }
                            self.staging.remove_conditionally(self.id, &key, -1, -1);
                            let _ = tx.send(Ok(()));
                        }
                        Err(err) => self.fail(tx, &key, err),
                    }
                }
                Request::FoundOld {
                    key,
                    location,
                    records,
                    seq,
                    tx,
                } => {
                    let apply = Apply {
                        key: key.clone(),
                        location,
                        records,
                        seq,
                        change: Change::IncreaseForOld,
                        guard: None,
                    };
                    match self.apply(&apply).await {
                        Ok(_) => {
                            self.staging.remove_conditionally(
                                self.id,
                                &key,
                                location.file,
                                location.offset,
                            );
                            let _ = tx.send(Ok(()));
                        }
                        Err(err) => self.fail(tx, &key, err),
                    }
                }
            }
        }
        self.persist().await
    }

    fn fail<V>(&self, tx: crate::request::Responder<V>, key: &Bytes, err: Error) {
        warn!(shard = self.id, key = hex(key), ?err, "request failed");
        let _ = tx.send(Err(err));
    }

    fn root(&self) -> Root {
        let published = self.shared.root.read();
        Root {
            node: published.node.clone(),
            space: published.space,
        }
    }

    /// Mutate the tree, publish the new root, then recycle replaced slots.
    async fn apply(&mut self, apply: &Apply) -> Result<Applied, Error> {
        let handle = self.pool.get(self.id as u64).await?;
        let root = self.root();
        let update = node::set_position(
            &handle,
            &root,
            &mut self.free,
            &mut self.file_size,
            self.min,
            self.max,
            apply,
        )
        .await?;
        if update.applied.applied {
            {
                let mut published = self.shared.root.write();
                *published = Root {
                    node: update.root,
                    space: update.root_space,
                };
            }
            for space in update.freed {
                if let Freed::Tail(size) = self.free.free(space, &mut self.file_size)? {
                    handle.resize(size).await?;
                }
            }
        }
        Ok(update.applied)
    }

    /// Reset to an empty tree, truncating the blob to just the header.
    async fn clear(&mut self) -> Result<(), Error> {
        let handle = self.pool.get(self.id as u64).await?;
        {
            let mut published = self.shared.root.write();
            *published = Root::empty();
        }
        handle.resize(HEADER_SIZE).await?;
        self.file_size = HEADER_SIZE;
        self.free.clear();
        self.sizes.set(self.id, 0);
        debug!(shard = self.id, "cleared shard");
        Ok(())
    }

    /// Restore persisted state, then stamp the blob dirty. Returns whether the
    /// previous shutdown was graceful.
    async fn load(&mut self) -> Result<bool, Error> {
        let handle = self.pool.get(self.id as u64).await?;
        let loaded = match self.try_load(&handle).await {
            Ok(loaded) => loaded,
            Err(err) => {
                debug!(shard = self.id, ?err, "cannot load shard, assuming dirty");
                false
            }
        };
        if !loaded {
            handle.resize(0).await?;
            {
                let mut published = self.shared.root.write();
                *published = Root::empty();
            }
            self.free.clear();
            self.file_size = HEADER_SIZE;
        }
        handle.write_at(DIRTY.to_be_bytes().to_vec(), 0).await?;
        Ok(loaded)
    }

    async fn try_load(&mut self, handle: &Handle<E::Blob>) -> Result<bool, Error> {
        if handle.size() < HEADER_SIZE {
            return Ok(false);
        }
        let header = handle.read_at(vec![0u8; HEADER_SIZE as usize], 0).await?;
        let mut header = header.as_ref();
        let magic = header.get_u32();
        let segments = header.get_u32();
        let root_offset = header.get_u64();
        let root_length = header.get_u16();
        let free_offset = header.get_u64();
        let _elements = header.get_u64();
        if magic != GRACEFULLY {
            debug!(shard = self.id, magic, "shard not closed gracefully");
            return Ok(false);
        }
        if segments != self.staging.segment_max() {
            debug!(
                shard = self.id,
                segments,
                expected = self.staging.segment_max(),
                "shard persisted for a different segment count"
            );
            return Ok(false);
        }
        let size = handle.size();
        if free_offset > size {
            return Err(Error::IllegalState(format!(
                "free catalog offset {free_offset} past blob end {size}"
            )));
        }
        let space = IndexSpace::new(root_offset, root_length);
        let root = node::read_node(handle, space).await?;
        let tail = handle
            .read_at(vec![0u8; (size - free_offset) as usize], free_offset)
            .await?;
        self.free = Catalog::restore(tail.as_ref())?;
        self.file_size = free_offset;
        {
            let mut published = self.shared.root.write();
            *published = Root {
                node: Arc::new(root),
                space: Some(space),
            };
        }
        debug!(shard = self.id, size = free_offset, "loaded shard");
        Ok(true)
    }

    /// Truncate and stamp dirty, ahead of a replay from data files.
    async fn reset(&mut self) -> Result<(), Error> {
        let handle = self.pool.get(self.id as u64).await?;
        handle.resize(0).await?;
        {
            let mut published = self.shared.root.write();
            *published = Root::empty();
        }
        self.free.clear();
        self.file_size = HEADER_SIZE;
        handle.write_at(DIRTY.to_be_bytes().to_vec(), 0).await?;
        Ok(())
    }

    /// Persist the tree and catalog, then flip the magic back to graceful.
    async fn persist(&mut self) -> Result<(), Error> {
        let handle = self.pool.get(self.id as u64).await?;
        let root = self.root();
        let length = root.node.encode_size();
        if length > self.max as usize {
            return Err(Error::NodeOverflow(length, self.max));
        }
        // A root restored at load still owns its old slot; recycle it
        if let Some(space) = root.space {
            if let Freed::Tail(size) = self.free.free(space, &mut self.file_size)? {
                handle.resize(size).await?;
            }
        }
        let space = self.free.allocate(length as u16, &mut self.file_size);
        let mut buf = Vec::with_capacity(length);
        root.node.write(&mut buf);
        handle.write_at(buf, space.offset).await?;

        let free_offset = self.file_size;
        handle.write_at(self.free.persist(), free_offset).await?;

        let mut header = Vec::with_capacity(HEADER_SIZE as usize - 4);
        header.put_u32(self.segments);
        header.put_u64(space.offset);
        header.put_u16(space.length);
        header.put_u64(free_offset);
        header.put_u64(self.sizes.get(self.id).max(0) as u64);
        handle.write_at(header, 4).await?;
        handle.sync().await?;

        handle.write_at(GRACEFULLY.to_be_bytes().to_vec(), 0).await?;
        handle.sync().await?;
        debug!(shard = self.id, size = free_offset, "shard stopped gracefully");
        Ok(())
    }
}
