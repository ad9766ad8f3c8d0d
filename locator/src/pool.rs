//! A bounded pool of open blobs over numbered files.
//!
//! [BlobPool] opens blobs named `<prefix><id>` in a single partition and keeps at most
//! `max_open` of them cached, evicting the least recently used. Eviction only drops the
//! cached clone: handles already held by callers remain usable. Reads fill the whole
//! buffer or fail with [commonware_runtime::Error::BlobInsufficientLength], which load
//! code uses to detect truncation; writes complete fully before returning. The pool makes
//! no ordering guarantees across files.

use commonware_runtime::{Blob, Error, Storage};
use commonware_utils::StableBuf;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, trace};

/// A cached open blob plus its tracked size.
#[derive(Clone)]
pub struct Handle<B: Blob> {
    id: u64,
    blob: B,
    size: Arc<AtomicU64>,
}

impl<B: Blob> Handle<B> {
    /// The numbered file this handle refers to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub async fn read_at(
        &self,
        buf: impl Into<StableBuf> + Send,
        offset: u64,
    ) -> Result<StableBuf, Error> {
        self.blob.read_at(buf, offset).await
    }

    /// Write the whole buffer at `offset`.
    pub async fn write_at(&self, buf: impl Into<StableBuf> + Send, offset: u64) -> Result<(), Error> {
        let buf: StableBuf = buf.into();
        let end = offset + buf.as_ref().len() as u64;
        self.blob.write_at(buf, offset).await?;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Truncate (or extend) the file to `len` bytes.
    pub async fn resize(&self, len: u64) -> Result<(), Error> {
        self.blob.resize(len).await?;
        self.size.store(len, Ordering::Release);
        Ok(())
    }

    /// Force pending writes to storage.
    pub async fn sync(&self) -> Result<(), Error> {
        self.blob.sync().await
    }

    /// The file size as tracked through this pool.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

struct Cache<B: Blob> {
    open: HashMap<u64, Handle<B>>,
    order: VecDeque<u64>,
}

/// A pool of open blobs over numbered files in one partition.
pub struct BlobPool<E: Storage> {
    context: E,
    partition: String,
    prefix: String,
    max_open: usize,
    cache: Mutex<Cache<E::Blob>>,
}

impl<E: Storage> BlobPool<E> {
    /// Create a pool over `<prefix><id>` blobs in `partition`, caching at most
    /// `max_open` open blobs.
    pub fn new(context: E, partition: String, prefix: String, max_open: usize) -> Self {
        Self {
            context,
            partition,
            prefix,
            max_open: max_open.max(1),
            cache: Mutex::new(Cache {
                open: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    fn name(&self, id: u64) -> Vec<u8> {
        format!("{}{}", self.prefix, id).into_bytes()
    }

    /// Open (or create) the blob for `id`, reusing a cached handle when present.
    pub async fn get(&self, id: u64) -> Result<Handle<E::Blob>, Error> {
        if let Some(handle) = self.get_if_open(id) {
            return Ok(handle);
        }
        let name = self.name(id);
        let (blob, size) = self.context.open(&self.partition, &name).await?;
        debug!(partition = self.partition, id, size, "opened blob");
        let handle = Handle {
            id,
            blob,
            size: Arc::new(AtomicU64::new(size)),
        };
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.open.get(&id) {
            // Lost a racing open; keep the first
            return Ok(existing.clone());
        }
        cache.open.insert(id, handle.clone());
        cache.order.push_back(id);
        while cache.open.len() > self.max_open {
            let Some(evict) = cache.order.pop_front() else {
                break;
            };
            if evict == id {
                cache.order.push_back(evict);
                continue;
            }
            cache.open.remove(&evict);
            trace!(partition = self.partition, id = evict, "evicted blob");
        }
        Ok(handle)
    }

    /// The handle for `id` iff it is currently cached.
    pub fn get_if_open(&self, id: u64) -> Option<Handle<E::Blob>> {
        let mut cache = self.cache.lock();
        let handle = cache.open.get(&id).cloned()?;
        cache.order.retain(|cached| *cached != id);
        cache.order.push_back(id);
        Some(handle)
    }

    /// Delete the blob for `id`, dropping any cached handle.
    pub async fn remove(&self, id: u64) -> Result<(), Error> {
        {
            let mut cache = self.cache.lock();
            cache.open.remove(&id);
            cache.order.retain(|cached| *cached != id);
        }
        let name = self.name(id);
        self.context.remove(&self.partition, Some(&name)).await?;
        debug!(partition = self.partition, id, "removed blob");
        Ok(())
    }

    /// The size of the blob for `id` (opening it if needed).
    pub async fn size(&self, id: u64) -> Result<u64, Error> {
        Ok(self.get(id).await?.size())
    }
}
