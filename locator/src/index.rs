//! The facade over all shards.
//!
//! [Index] dispatches requests to one shard per cache segment, aggregates the
//! per-segment live-entry counters, and drives the graceful-shutdown / load protocol
//! (including the `index-count` and `index.stats` sidecars the compactor is rebuilt
//! from). The shard table sits behind a reader-writer lock: every per-key operation
//! pins it briefly in read mode, while start/add/remove/clear/stop take it in write
//! mode to swap slots.

use crate::{
    entry::{self, Entry, EntryRecord, Location},
    node,
    pool::BlobPool,
    request::{self, Receipt, Request},
    shard::{Shard, Shared, Sizes},
    Compactor, Config, Error, Staging,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{varint::UInt, ReadExt, Write};
use commonware_runtime::{Blob, Clock, Error as RError, Handle, Metrics, Spawner, Storage};
use parking_lot::RwLock;
use futures::{channel::mpsc, stream, SinkExt, Stream, StreamExt};
use prometheus_client::metrics::counter::Counter;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Sidecar blob holding the per-segment live-entry counters.
const COUNT_BLOB: &[u8] = b"index-count";

/// Sidecar blob holding the compactor's per-file statistics.
const STATS_BLOB: &[u8] = b"index.stats";

/// Bytes per `index.stats` record.
const STATS_RECORD_SIZE: u64 = 20;

/// One cache segment's slot in the shard table.
enum Slot {
    Live {
        shared: Arc<Shared>,
        mailbox: mpsc::Sender<Request>,
        applier: Handle<Result<(), Error>>,
    },
    /// The segment moved away; requests complete as no-ops.
    Retired,
}

struct Counters {
    updates: Counter,
    moved: Counter,
    dropped: Counter,
    found_old: Counter,
    clears: Counter,
    reads: Counter,
}

/// A persistent, segmented index from keys to entry locations.
pub struct Index<E: Storage + Clock + Spawner + Metrics, C: Compactor, T: Staging> {
    context: E,
    cfg: Config,
    pool: Arc<BlobPool<E>>,
    data: Arc<BlobPool<E>>,
    compactor: Arc<C>,
    staging: Arc<T>,
    sizes: Arc<Sizes>,
    slots: Arc<RwLock<Vec<Slot>>>,
    counters: Counters,
    stopped: bool,
}

impl<E: Storage + Clock + Spawner + Metrics, C: Compactor, T: Staging> Index<E, C, T> {
    /// Create an index over `cfg.cache_segments` shards. Shards are installed by
    /// [Self::start]; persisted state is restored by [Self::load].
    pub fn init(
        context: E,
        cfg: Config,
        data: Arc<BlobPool<E>>,
        compactor: Arc<C>,
        staging: Arc<T>,
    ) -> Result<Self, Error> {
        if cfg.cache_segments == 0 {
            return Err(Error::IllegalState("no cache segments configured".into()));
        }
        if cfg.max_node_size > i16::MAX as u16 {
            return Err(Error::IllegalState(format!(
                "max node size too large: {}",
                cfg.max_node_size
            )));
        }
        if cfg.min_node_size >= cfg.max_node_size {
            return Err(Error::IllegalState(format!(
                "node size bounds inverted: {} >= {}",
                cfg.min_node_size, cfg.max_node_size
            )));
        }
        let pool = Arc::new(BlobPool::new(
            context.clone(),
            cfg.partition.clone(),
            "index.".into(),
            cfg.max_open_blobs,
        ));
        let sizes = Arc::new(Sizes::new(cfg.cache_segments));
        let slots = (0..cfg.cache_segments)
            .map(|_| Slot::Retired)
            .collect::<Vec<_>>();

        let counters = Counters {
            updates: Counter::default(),
            moved: Counter::default(),
            dropped: Counter::default(),
            found_old: Counter::default(),
            clears: Counter::default(),
            reads: Counter::default(),
        };
        context.register(
            "updates",
            "Number of update requests",
            counters.updates.clone(),
        );
        context.register("moved", "Number of move requests", counters.moved.clone());
        context.register(
            "dropped",
            "Number of drop requests",
            counters.dropped.clone(),
        );
        context.register(
            "found_old",
            "Number of replay requests",
            counters.found_old.clone(),
        );
        context.register("clears", "Number of clears", counters.clears.clone());
        context.register("reads", "Number of key lookups", counters.reads.clone());

        Ok(Self {
            context,
            cfg,
            pool,
            data,
            compactor,
            staging,
            sizes,
            slots: Arc::new(RwLock::new(slots)),
            counters,
            stopped: false,
        })
    }

    /// Install every configured shard.
    pub fn start(&self) {
        self.add_segments(0..self.cfg.cache_segments)
            .expect("configured segments are in range");
    }

    /// Install fresh shards for `segments`; segments already live are untouched.
    pub fn add_segments(&self, segments: impl IntoIterator<Item = u32>) -> Result<(), Error> {
        let mut slots = self.slots.write();
        for segment in segments {
            let slot = slots
                .get_mut(segment as usize)
                .ok_or(Error::UnknownSegment(segment))?;
            if matches!(slot, Slot::Live { .. }) {
                continue;
            }
            let (mailbox, requests) = mpsc::channel(self.cfg.mailbox_size);
            let shared = Arc::new(Shared::new(segment));
            let shard = Shard::new(
                segment,
                self.cfg.cache_segments,
                self.cfg.min_node_size,
                self.cfg.max_node_size,
                self.pool.clone(),
                shared.clone(),
                self.sizes.clone(),
                self.staging.clone(),
            );
            let applier = self
                .context
                .with_label("applier")
                .spawn(move |_| shard.run(requests));
            *slot = Slot::Live {
                shared,
                mailbox,
                applier,
            };
            debug!(segment, "added shard");
        }
        Ok(())
    }

    /// Retire `segments`: swap in the no-op sentinel, drain the appliers, then
    /// delete the backing blobs.
    pub async fn remove_segments(&self, segments: impl IntoIterator<Item = u32>) -> Result<(), Error> {
        let mut removed = Vec::new();
        {
            let mut slots = self.slots.write();
            for segment in segments {
                let slot = slots
                    .get_mut(segment as usize)
                    .ok_or(Error::UnknownSegment(segment))?;
                if matches!(slot, Slot::Live { .. }) {
                    let Slot::Live {
                        mailbox, applier, ..
                    } = std::mem::replace(slot, Slot::Retired)
                    else {
                        unreachable!();
                    };
                    removed.push((segment, mailbox, applier));
                }
            }
        }
        for (segment, mailbox, applier) in removed {
            drop(mailbox);
            match applier.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(segment, ?err, "applier failed while retiring"),
                Err(err) => error!(segment, ?err, "applier halted while retiring"),
            }
            if let Err(err) = self.pool.remove(segment as u64).await {
                warn!(segment, ?err, "failed to delete shard blob");
            }
            debug!(segment, "removed shard");
        }
        Ok(())
    }

    async fn enqueue(&self, segment: u32, request: Request) -> Result<(), Error> {
        if self.stopped {
            return Err(Error::Stopped);
        }
        let mailbox = {
            let slots = self.slots.read();
            match slots
                .get(segment as usize)
                .ok_or(Error::UnknownSegment(segment))?
            {
                Slot::Live { mailbox, .. } => Some(mailbox.clone()),
                Slot::Retired => None,
            }
        };
        match mailbox {
            Some(mut mailbox) => mailbox.send(request).await.map_err(|_| Error::Stopped),
            None => {
                trace!(segment, "request against retired shard");
                request.complete_noop();
                Ok(())
            }
        }
    }

    /// Record a new write of `key` at `location`.
    ///
    /// The receipt resolves to whether a prior entry existed, once the write is
    /// visible to readers.
    pub async fn update(
        &self,
        segment: u32,
        key: Bytes,
        location: Location,
        records: u32,
        seq: u64,
    ) -> Result<Receipt<bool>, Error> {
        self.counters.updates.inc();
        let (tx, receipt) = request::channel();
        self.enqueue(
            segment,
            Request::Update {
                key,
                location,
                records,
                seq,
                tx,
            },
        )
        .await?;
        Ok(receipt)
    }

    /// Record that the compactor relocated `key` from `prev` to `location`. The
    /// move is a no-op unless the stored location still equals `prev`.
    pub async fn moved(
        &self,
        segment: u32,
        key: Bytes,
        location: Location,
        seq: u64,
        prev: Location,
    ) -> Result<Receipt<()>, Error> {
        self.counters.moved.inc();
        let (tx, receipt) = request::channel();
        self.enqueue(
            segment,
            Request::Moved {
                key,
                location,
                seq,
                prev,
                tx,
            },
        )
        .await?;
        Ok(receipt)
    }

    /// Record that `key` was deleted; its entry becomes a tombstone until
    /// compaction reclaims the dropped record.
    pub async fn dropped(
        &self,
        segment: u32,
        key: Bytes,
        prev: Location,
        seq: u64,
    ) -> Result<Receipt<()>, Error> {
        self.counters.dropped.inc();
        let (tx, receipt) = request::channel();
        self.enqueue(segment, Request::Dropped { key, prev, seq, tx })
            .await?;
        Ok(receipt)
    }

    /// Record a key observed while replaying old data files (bookkeeping only).
    pub async fn found_old(
        &self,
        segment: u32,
        key: Bytes,
        location: Location,
        records: u32,
        seq: u64,
    ) -> Result<Receipt<()>, Error> {
        self.counters.found_old.inc();
        let (tx, receipt) = request::channel();
        self.enqueue(
            segment,
            Request::FoundOld {
                key,
                location,
                records,
                seq,
                tx,
            },
        )
        .await?;
        Ok(receipt)
    }

    fn reader(&self, segment: u32) -> Result<Option<Arc<Shared>>, Error> {
        let slots = self.slots.read();
        match slots
            .get(segment as usize)
            .ok_or(Error::UnknownSegment(segment))?
        {
            Slot::Live { shared, .. } => Ok(Some(shared.clone())),
            Slot::Retired => Ok(None),
        }
    }

    async fn find(&self, segment: u32, key: &[u8]) -> Result<Option<Entry>, Error> {
        self.counters.reads.inc();
        let Some(shared) = self.reader(segment)? else {
            return Ok(None);
        };
        let root = shared.root.read().node.clone();
        let handle = self.pool.get(shared.id as u64).await?;
        node::find_entry(&handle, &root, key).await
    }

    /// The stored location of `key`, or None if absent or dropped.
    pub async fn get_position(&self, segment: u32, key: Bytes) -> Result<Option<Location>, Error> {
        let entry = self.find(segment, &key).await?;
        Ok(entry
            .filter(|entry| !entry.location.is_tombstone())
            .map(|entry| entry.location))
    }

    /// The record stored for `key`, or None if absent, dropped, or expired.
    pub async fn get_record(&self, segment: u32, key: Bytes) -> Result<Option<EntryRecord>, Error> {
        let Some(entry) = self.find(segment, &key).await? else {
            return Ok(None);
        };
        if entry.location.is_tombstone() {
            return Ok(None);
        }
        let record = entry::read_record(&self.data, &key, &entry, true).await?;
        let now = entry::epoch_millis(self.context.current());
        if entry::expired(record.expiry, now) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// The record last stored for `key`, even if expired or dropped (the dropped
    /// record stays readable until compaction reclaims it).
    pub async fn get_record_even_if_expired(
        &self,
        segment: u32,
        key: Bytes,
    ) -> Result<Option<EntryRecord>, Error> {
        let Some(entry) = self.find(segment, &key).await? else {
            return Ok(None);
        };
        if entry.location.resolved().file < 0 {
            return Ok(None);
        }
        let record = entry::read_record(&self.data, &key, &entry, true).await?;
        Ok(Some(record))
    }

    /// The raw entry for `key` (tombstones included), as the compactor sees it.
    pub async fn get_info(&self, segment: u32, key: Bytes) -> Result<Option<Entry>, Error> {
        self.find(segment, &key).await
    }

    /// Reset every shard to an empty tree and zero all counters.
    pub async fn clear(&self) -> Result<(), Error> {
        self.counters.clears.inc();
        debug!("clearing index");
        let mut sends = Vec::new();
        let mut receipts = Vec::new();
        {
            let slots = self.slots.write();
            for slot in slots.iter() {
                if let Slot::Live { mailbox, .. } = slot {
                    let (tx, receipt) = request::channel();
                    sends.push((mailbox.clone(), Request::Clear { tx }));
                    receipts.push(receipt);
                }
            }
            self.sizes.zero();
        }
        for (mut mailbox, request) in sends {
            mailbox.send(request).await.map_err(|_| Error::Stopped)?;
        }
        for receipt in receipts {
            receipt.await?;
        }
        Ok(())
    }

    /// The number of live entries across `segments`, saturating at `u64::MAX` if
    /// the accumulator ever observes a negative sum.
    pub fn approximate_size(&self, segments: &[u32]) -> Result<u64, Error> {
        let mut total: i64 = 0;
        for segment in segments {
            if *segment >= self.sizes.len() {
                return Err(Error::UnknownSegment(*segment));
            }
            total = total.wrapping_add(self.sizes.get(*segment));
            if total < 0 {
                return Ok(u64::MAX);
            }
        }
        Ok(total as u64)
    }

    /// The largest write sequence stored anywhere in the index; used to re-seed
    /// the write sequence at startup.
    pub async fn max_seq_id(&self) -> Result<u64, Error> {
        let shareds = {
            let slots = self.slots.read();
            slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Live { shared, .. } => Some(shared.clone()),
                    Slot::Retired => None,
                })
                .collect::<Vec<_>>()
        };
        let mut best = 0;
        for shared in shareds {
            let root = shared.root.read().node.clone();
            let handle = self.pool.get(shared.id as u64).await?;
            best = node::max_seq(&handle, &root).await?.max(best);
        }
        Ok(best)
    }

    /// A barrier across every shard: the returned future resolves once the last
    /// shard has processed everything enqueued before it.
    pub async fn ensure_run_on_last(&self) -> Result<impl std::future::Future<Output = ()> + Send, Error> {
        let mut sends = Vec::new();
        let mut receipts = Vec::new();
        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                if let Slot::Live { mailbox, .. } = slot {
                    let (tx, receipt) = request::channel();
                    sends.push((mailbox.clone(), Request::Sync { tx }));
                    receipts.push(receipt);
                }
            }
        }
        for (mut mailbox, request) in sends {
            mailbox.send(request).await.map_err(|_| Error::Stopped)?;
        }
        Ok(async move {
            for receipt in receipts {
                let _ = receipt.await;
            }
        })
    }

    /// Delete a data file once every shard has drained the requests that could
    /// still reference it, then release its compaction statistics.
    pub async fn delete_file_async(&self, file: i32) -> Result<(), Error> {
        if file < 0 {
            return Err(Error::IllegalState(format!("delete of data file {file}")));
        }
        let barrier = self.ensure_run_on_last().await?;
        let data = self.data.clone();
        let compactor = self.compactor.clone();
        self.context
            .with_label("deleter")
            .spawn(move |_| async move {
                barrier.await;
                if let Err(err) = data.remove(file as u64).await {
                    warn!(file, ?err, "failed to delete data file");
                }
                compactor.release_stats(file);
                debug!(file, "deleted data file");
            });
        Ok(())
    }

    /// Every live entry in `segments`, optionally with values loaded from the
    /// data files.
    pub async fn publish(
        &self,
        segments: impl IntoIterator<Item = u32>,
        load_values: bool,
    ) -> Result<impl Stream<Item = Result<EntryRecord, Error>> + Send, Error> {
        let mut streams = Vec::new();
        {
            let slots = self.slots.read();
            for segment in segments {
                match slots
                    .get(segment as usize)
                    .ok_or(Error::UnknownSegment(segment))?
                {
                    Slot::Live { shared, .. } => {
                        let root = shared.root.read().node.clone();
                        streams.push(node::publish(
                            self.pool.clone(),
                            self.data.clone(),
                            segment,
                            root,
                            load_values,
                        ));
                    }
                    Slot::Retired => {}
                }
            }
        }
        Ok(stream::iter(streams).flatten())
    }

    /// Stop every shard gracefully, then persist the sidecars that let the next
    /// start skip the rebuild.
    pub async fn stop(&mut self) -> Result<(), Error> {
        self.stopped = true;
        let mut draining = Vec::new();
        {
            let mut slots = self.slots.write();
            for (segment, slot) in slots.iter_mut().enumerate() {
                if matches!(slot, Slot::Live { .. }) {
                    let Slot::Live {
                        mailbox, applier, ..
                    } = std::mem::replace(slot, Slot::Retired)
                    else {
                        unreachable!();
                    };
                    draining.push((segment as u32, mailbox, applier));
                }
            }
        }
        // Close every queue first so the appliers drain concurrently
        let mut appliers = Vec::new();
        for (segment, mailbox, applier) in draining {
            drop(mailbox);
            appliers.push((segment, applier));
        }
        for (segment, applier) in appliers {
            match applier.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(segment, ?err, "applier failed during stop"),
                Err(err) => error!(segment, ?err, "applier halted during stop"),
            }
        }
        self.write_counts().await?;
        self.write_stats().await?;
        debug!("index stopped");
        Ok(())
    }

    async fn write_counts(&self) -> Result<(), Error> {
        let mut buf = Vec::new();
        UInt(self.sizes.len() as u64).write(&mut buf);
        for segment in 0..self.sizes.len() {
            UInt(self.sizes.get(segment) as u64).write(&mut buf);
        }
        let (blob, _) = self.context.open(&self.cfg.partition, COUNT_BLOB).await?;
        blob.resize(0).await?;
        blob.write_at(buf, 0).await?;
        blob.sync().await?;
        Ok(())
    }

    async fn write_stats(&self) -> Result<(), Error> {
        let stats = self.compactor.file_stats();
        let mut buf = Vec::new();
        for (file, stat) in stats {
            let total = if stat.total == -1 && file >= 0 {
                self.data.size(file as u64).await? as i32
            } else {
                stat.total
            };
            trace!(
                file,
                total,
                free = stat.free,
                "persisting file statistics"
            );
            buf.put_i32(file);
            buf.put_i32(total);
            buf.put_i32(stat.free);
            buf.put_i64(stat.next_expiration);
        }
        let (blob, _) = self.context.open(&self.cfg.partition, STATS_BLOB).await?;
        blob.resize(0).await?;
        blob.write_at(buf, 0).await?;
        blob.sync().await?;
        Ok(())
    }

    /// Restore state persisted by [Self::stop].
    ///
    /// Returns true only if both sidecars are present and consistent with the
    /// current configuration and every shard blob was closed gracefully. On false
    /// the caller is expected to [Self::reset] and replay the data files; shards
    /// are not touched before the sidecars validate.
    pub async fn load(&mut self) -> Result<bool, Error> {
        let names = match self.context.scan(&self.cfg.partition).await {
            Ok(names) => names,
            Err(RError::PartitionMissing(_)) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if !self.read_counts(&names).await? {
            return Ok(false);
        }
        if !self.read_stats(&names).await? {
            return Ok(false);
        }
        let mailboxes = {
            let slots = self.slots.read();
            slots
                .iter()
                .map(|slot| match slot {
                    Slot::Live { mailbox, .. } => Some(mailbox.clone()),
                    Slot::Retired => None,
                })
                .collect::<Vec<_>>()
        };
        for (segment, mailbox) in mailboxes.into_iter().enumerate() {
            let Some(mut mailbox) = mailbox else {
                continue;
            };
            let (tx, receipt) = request::channel();
            mailbox
                .send(Request::Load { tx })
                .await
                .map_err(|_| Error::Stopped)?;
            if !receipt.await? {
                debug!(segment, "shard dirty, index must be rebuilt");
                return Ok(false);
            }
        }
        debug!("index loaded from graceful shutdown");
        Ok(true)
    }

    async fn read_counts(&self, names: &[Vec<u8>]) -> Result<bool, Error> {
        if !names.iter().any(|name| name == COUNT_BLOB) {
            debug!("no index-count sidecar, assuming dirty");
            return Ok(false);
        }
        let (blob, size) = self.context.open(&self.cfg.partition, COUNT_BLOB).await?;
        let buf = blob.read_at(vec![0u8; size as usize], 0).await?;
        let valid = self.parse_counts(buf.as_ref());
        // Delete up front so an unclean shutdown reads absence next start
        self.context
            .remove(&self.cfg.partition, Some(COUNT_BLOB))
            .await?;
        Ok(valid)
    }

    fn parse_counts(&self, mut buf: &[u8]) -> bool {
        let Ok(count) = UInt::<u64>::read(&mut buf) else {
            return false;
        };
        let count: u64 = count.into();
        if count != self.sizes.len() as u64 {
            debug!(
                persisted = count,
                configured = self.sizes.len(),
                "persisted cache segments do not match configuration"
            );
            return false;
        }
        for segment in 0..self.sizes.len() {
            let Ok(value) = UInt::<u64>::read(&mut buf) else {
                return false;
            };
            let value: u64 = value.into();
            if value > i64::MAX as u64 {
                debug!(segment, "invalid segment size, assuming a different format");
                return false;
            }
            self.sizes.set(segment, value as i64);
        }
        if !buf.is_empty() {
            debug!("index-count has trailing bytes, assuming a different format");
            return false;
        }
        true
    }

    async fn read_stats(&self, names: &[Vec<u8>]) -> Result<bool, Error> {
        if !names.iter().any(|name| name == STATS_BLOB) {
            debug!("no index.stats sidecar, assuming dirty");
            return Ok(false);
        }
        let (blob, size) = self.context.open(&self.cfg.partition, STATS_BLOB).await?;
        let records = size / STATS_RECORD_SIZE;
        for record in 0..records {
            let buf = blob
                .read_at(
                    vec![0u8; STATS_RECORD_SIZE as usize],
                    record * STATS_RECORD_SIZE,
                )
                .await?;
            let mut slice = buf.as_ref();
            let file = slice.get_i32();
            let total = slice.get_i32();
            let free = slice.get_i32();
            let next_expiration = slice.get_i64();
            if !self
                .compactor
                .add_free_file(file, total, free, next_expiration, false)
            {
                trace!(file, "unable to add free file");
                return Ok(false);
            }
            trace!(file, total, free, "loaded file statistics");
        }
        self.context
            .remove(&self.cfg.partition, Some(STATS_BLOB))
            .await?;
        Ok(true)
    }

    /// Truncate every shard and stamp it dirty, ahead of a replay of the data
    /// files.
    pub async fn reset(&self) -> Result<(), Error> {
        let mut sends = Vec::new();
        let mut receipts = Vec::new();
        {
            let slots = self.slots.read();
            for slot in slots.iter() {
                if let Slot::Live { mailbox, .. } = slot {
                    let (tx, receipt) = request::channel();
                    sends.push((mailbox.clone(), Request::Reset { tx }));
                    receipts.push(receipt);
                }
            }
        }
        for (mut mailbox, request) in sends {
            mailbox.send(request).await.map_err(|_| Error::Stopped)?;
        }
        for receipt in receipts {
            receipt.await?;
        }
        Ok(())
    }

    /// Kill every applier without draining (simulates an unclean shutdown).
    #[cfg(test)]
    pub(crate) fn abort(&mut self) {
        let mut slots = self.slots.write();
        for slot in slots.iter_mut() {
            if matches!(slot, Slot::Live { .. }) {
                let Slot::Live { applier, .. } = std::mem::replace(slot, Slot::Retired) else {
                    unreachable!();
                };
                applier.abort();
            }
        }
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entry::RecordHeader,
        free::Catalog,
        mocks,
        shard::{DIRTY, GRACEFULLY, HEADER_SIZE},
        FileStats,
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use futures::pin_mut;
    use rand::RngCore;
    use std::collections::HashMap;

    const PARTITION: &str = "index";
    const DATA_PARTITION: &str = "data";

    fn test_cfg(cache_segments: u32) -> Config {
        Config {
            partition: PARTITION.into(),
            cache_segments,
            min_node_size: 64,
            max_node_size: 1024,
            max_open_blobs: 8,
            mailbox_size: 16,
        }
    }

    type TestIndex = Index<deterministic::Context, mocks::Compactor, mocks::Staging>;

    fn setup(
        context: deterministic::Context,
        cache_segments: u32,
    ) -> (
        TestIndex,
        Arc<BlobPool<deterministic::Context>>,
        Arc<mocks::Compactor>,
        Arc<mocks::Staging>,
    ) {
        let data = Arc::new(BlobPool::new(
            context.clone(),
            DATA_PARTITION.into(),
            "data.".into(),
            8,
        ));
        let compactor = Arc::new(mocks::Compactor::default());
        let staging = Arc::new(mocks::Staging::new(cache_segments));
        let index = Index::init(
            context,
            test_cfg(cache_segments),
            data.clone(),
            compactor.clone(),
            staging.clone(),
        )
        .unwrap();
        (index, data, compactor, staging)
    }

    async fn fresh(index: &mut TestIndex) {
        index.start();
        assert!(!index.load().await.unwrap());
        index.reset().await.unwrap();
    }

    /// Write a record into a data file so read paths can materialize it.
    async fn write_record(
        data: &BlobPool<deterministic::Context>,
        file: i32,
        offset: i64,
        key: &[u8],
        value: Option<&[u8]>,
        seq: u64,
        expiry: i64,
    ) {
        let header = RecordHeader {
            key_len: key.len() as u16,
            value_len: value.map(|value| value.len() as i32).unwrap_or(-1),
            seq,
            expiry,
        };
        let mut buf = Vec::new();
        header.put(&mut buf);
        buf.extend_from_slice(key);
        if let Some(value) = value {
            buf.extend_from_slice(value);
        }
        let handle = data.get(file as u64).await.unwrap();
        handle.write_at(buf, offset as u64).await.unwrap();
    }

    fn loc(file: i32, offset: i64) -> Location {
        Location { file, offset }
    }

    #[test_traced]
    fn test_update_then_get() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context.clone(), 2);
            fresh(&mut index).await;

            let receipt = index
                .update(0, Bytes::from_static(&[0x01]), loc(10, 0), 1, 1)
                .await
                .unwrap();
            assert!(!receipt.await.unwrap());
            assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 1);
            assert_eq!(
                index
                    .get_position(0, Bytes::from_static(&[0x01]))
                    .await
                    .unwrap(),
                Some(loc(10, 0))
            );

            // Check metrics
            let buffer = context.encode();
            assert!(buffer.contains("updates_total 1"), "{}", buffer);

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_moved_guard() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context, 2);
            fresh(&mut index).await;

            let key = Bytes::from_static(&[0x01]);
            index
                .update(0, key.clone(), loc(10, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            let receipt = index
                .update(0, key.clone(), loc(10, 200), 1, 2)
                .await
                .unwrap();
            assert!(receipt.await.unwrap());

            // The move lost the race: its prev no longer matches
            index
                .moved(0, key.clone(), loc(11, 0), 3, loc(10, 0))
                .await
                .unwrap()
                .await
                .unwrap();
            assert_eq!(
                index.get_position(0, key.clone()).await.unwrap(),
                Some(loc(10, 200))
            );
            assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 1);

            // With the stored prev it lands
            index
                .moved(0, key.clone(), loc(11, 0), 4, loc(10, 200))
                .await
                .unwrap()
                .await
                .unwrap();
            assert_eq!(
                index.get_position(0, key).await.unwrap(),
                Some(loc(11, 0))
            );
            assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 1);

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_dropped_tombstone() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, _, _) = setup(context, 2);
            fresh(&mut index).await;

            let key = Bytes::from_static(&[0x01]);
            write_record(&data, 10, 0, &key, Some(b"first"), 1, -1).await;
            write_record(&data, 10, 200, &key, Some(b"second"), 2, -1).await;

            index
                .update(0, key.clone(), loc(10, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            index
                .update(0, key.clone(), loc(10, 200), 1, 2)
                .await
                .unwrap()
                .await
                .unwrap();
            index
                .dropped(0, key.clone(), loc(10, 200), 3)
                .await
                .unwrap()
                .await
                .unwrap();

            assert_eq!(index.get_position(0, key.clone()).await.unwrap(), None);
            assert_eq!(index.get_record(0, key.clone()).await.unwrap(), None);
            assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 0);

            // The dropped record stays readable until compaction reclaims it
            let record = index
                .get_record_even_if_expired(0, key.clone())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.location, loc(10, 200));
            assert_eq!(record.value, Some(Bytes::from_static(b"second")));

            // Compaction reclaims the dropped record: the entry disappears
            let info = index.get_info(0, key.clone()).await.unwrap().unwrap();
            assert!(info.location.is_tombstone());
            index
                .moved(0, key.clone(), loc(-1, -1), 4, info.location)
                .await
                .unwrap()
                .await
                .unwrap();
            assert_eq!(index.get_info(0, key.clone()).await.unwrap(), None);
            assert_eq!(
                index.get_record_even_if_expired(0, key).await.unwrap(),
                None
            );

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_expiration() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, _, _) = setup(context, 2);
            fresh(&mut index).await;

            let expired_key = Bytes::from_static(b"expired");
            let live_key = Bytes::from_static(b"live");
            write_record(&data, 1, 0, &expired_key, Some(b"old"), 1, 0).await;
            write_record(&data, 1, 100, &live_key, Some(b"new"), 2, -1).await;

            index
                .update(0, expired_key.clone(), loc(1, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            index
                .update(0, live_key.clone(), loc(1, 100), 1, 2)
                .await
                .unwrap()
                .await
                .unwrap();

            // An expired record is hidden from the default read but still
            // position-addressable and visible to the expired-aware read
            assert_eq!(index.get_record(0, expired_key.clone()).await.unwrap(), None);
            assert_eq!(
                index.get_position(0, expired_key.clone()).await.unwrap(),
                Some(loc(1, 0))
            );
            let record = index
                .get_record_even_if_expired(0, expired_key)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.value, Some(Bytes::from_static(b"old")));

            let record = index.get_record(0, live_key).await.unwrap().unwrap();
            assert_eq!(record.value, Some(Bytes::from_static(b"new")));

            index.stop().await.unwrap();
        });
    }

    fn record_for(key: &[u8], segments: u32) -> u32 {
        key[0] as u32 % segments
    }

    #[test_traced]
    fn test_graceful_restart() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let segments = 8u32;
            let (mut index, data, compactor, staging) = setup(context.clone(), segments);
            fresh(&mut index).await;

            // Insert many distinct random keys
            let mut inserted: HashMap<Bytes, (u32, Location)> = HashMap::new();
            let mut seq = 0u64;
            while inserted.len() < 10_000 {
                let mut key = [0u8; 16];
                context.fill_bytes(&mut key);
                let key = Bytes::copy_from_slice(&key);
                if inserted.contains_key(&key) {
                    continue;
                }
                seq += 1;
                let segment = record_for(&key, segments);
                let location = loc(1, seq as i64);
                index
                    .update(segment, key.clone(), location, 1, seq)
                    .await
                    .unwrap()
                    .await
                    .unwrap();
                inserted.insert(key, (segment, location));
            }
            let mut per_segment = vec![0u64; segments as usize];
            for (segment, _) in inserted.values() {
                per_segment[*segment as usize] += 1;
            }

            index.stop().await.unwrap();

            // Reopen: everything must come back exactly
            let mut index = Index::init(
                context.clone(),
                test_cfg(segments),
                data.clone(),
                compactor,
                staging,
            )
            .unwrap();
            index.start();
            assert!(index.load().await.unwrap());
            for (segment, count) in per_segment.iter().enumerate() {
                assert_eq!(
                    index.approximate_size(&[segment as u32]).unwrap(),
                    *count
                );
            }
            for (key, (segment, location)) in &inserted {
                assert_eq!(
                    index.get_position(*segment, key.clone()).await.unwrap(),
                    Some(*location)
                );
            }
            assert_eq!(index.max_seq_id().await.unwrap(), seq);
            index.stop().await.unwrap();

            // Space accounting holds for every stopped shard
            for segment in 0..segments {
                verify_accounting(&context, segment).await;
            }
        });
    }

    /// Parse a stopped shard blob and check that the header, the reachable
    /// nodes, and the free catalog account for every byte up to the catalog.
    async fn verify_accounting(context: &deterministic::Context, segment: u32) {
        let pool = BlobPool::new(context.clone(), PARTITION.into(), "index.".into(), 2);
        let handle = pool.get(segment as u64).await.unwrap();
        let header = handle
            .read_at(vec![0u8; HEADER_SIZE as usize], 0)
            .await
            .unwrap();
        let mut header = header.as_ref();
        assert_eq!(header.get_u32(), GRACEFULLY);
        let _segments = header.get_u32();
        let root_offset = header.get_u64();
        let root_length = header.get_u16();
        let free_offset = header.get_u64();

        let root_space = node::IndexSpace::new(root_offset, root_length);
        let root = Arc::new(node::read_node(&handle, root_space).await.unwrap());
        let mut live: u64 = root_length as u64;
        for space in node::live_spaces(&handle, &root).await.unwrap() {
            live += space.length as u64;
        }

        let tail = handle
            .read_at(
                vec![0u8; (handle.size() - free_offset) as usize],
                free_offset,
            )
            .await
            .unwrap();
        let free = Catalog::restore(tail.as_ref()).unwrap().free_bytes();

        assert_eq!(HEADER_SIZE + live + free, free_offset);
    }

    #[test_traced]
    fn test_dirty_restart() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let segments = 4u32;
            let (mut index, data, compactor, staging) = setup(context.clone(), segments);
            fresh(&mut index).await;

            for at in 0..100u64 {
                let key = Bytes::from(format!("key{at:03}"));
                let segment = record_for(&key, segments);
                index
                    .update(segment, key, loc(1, at as i64), 1, at + 1)
                    .await
                    .unwrap()
                    .await
                    .unwrap();
            }

            // Kill the appliers without stopping
            index.abort();

            let mut index = Index::init(
                context.clone(),
                test_cfg(segments),
                data,
                compactor,
                staging,
            )
            .unwrap();
            index.start();
            assert!(!index.load().await.unwrap());

            // Every shard blob still carries the dirty stamp
            for segment in 0..segments {
                let name = format!("index.{segment}").into_bytes();
                let (blob, _) = context.open(PARTITION, &name).await.unwrap();
                let magic = blob.read_at(vec![0u8; 4], 0).await.unwrap();
                assert_eq!(magic.as_ref(), DIRTY.to_be_bytes().as_slice());
            }
        });
    }

    #[test_traced]
    fn test_clear() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context.clone(), 2);
            fresh(&mut index).await;

            for at in 0..1_000u64 {
                let key = Bytes::from(format!("key{at:04}"));
                index
                    .update(0, key, loc(1, at as i64), 1, at + 1)
                    .await
                    .unwrap()
                    .await
                    .unwrap();
            }
            assert_eq!(index.approximate_size(&[0]).unwrap(), 1_000);

            index.clear().await.unwrap();
            assert_eq!(index.approximate_size(&[0, 1]).unwrap(), 0);
            assert_eq!(
                index
                    .get_position(0, Bytes::from_static(b"key0000"))
                    .await
                    .unwrap(),
                None
            );

            // The blob holds nothing but the header now
            let (_, size) = context.open(PARTITION, b"index.0").await.unwrap();
            assert_eq!(size, HEADER_SIZE);

            // The shard keeps working
            index
                .update(0, Bytes::from_static(b"after"), loc(2, 0), 1, 2_000)
                .await
                .unwrap()
                .await
                .unwrap();
            assert_eq!(
                index
                    .get_position(0, Bytes::from_static(b"after"))
                    .await
                    .unwrap(),
                Some(loc(2, 0))
            );
            assert_eq!(index.approximate_size(&[0]).unwrap(), 1);

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_missing_sidecar_means_dirty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, compactor, staging) = setup(context.clone(), 2);
            fresh(&mut index).await;
            index
                .update(0, Bytes::from_static(b"key"), loc(1, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            index.stop().await.unwrap();

            // Remove the count sidecar: the next load refuses
            context.remove(PARTITION, Some(COUNT_BLOB)).await.unwrap();
            let mut index = Index::init(
                context.clone(),
                test_cfg(2),
                data,
                compactor,
                staging,
            )
            .unwrap();
            index.start();
            assert!(!index.load().await.unwrap());
        });
    }

    #[test_traced]
    fn test_segment_count_mismatch_means_dirty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, compactor, _) = setup(context.clone(), 2);
            fresh(&mut index).await;
            index
                .update(0, Bytes::from_static(b"key"), loc(1, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            index.stop().await.unwrap();

            // Reopen with a different segment count
            let staging = Arc::new(mocks::Staging::new(4));
            let mut index = Index::init(
                context,
                test_cfg(4),
                data,
                compactor,
                staging,
            )
            .unwrap();
            index.start();
            assert!(!index.load().await.unwrap());
        });
    }

    #[test_traced]
    fn test_rejected_stats_mean_dirty() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, compactor, staging) = setup(context.clone(), 2);
            fresh(&mut index).await;
            compactor.set_stats(
                3,
                FileStats {
                    total: 100,
                    free: 10,
                    next_expiration: -1,
                },
            );
            index.stop().await.unwrap();

            let compactor = Arc::new(mocks::Compactor::default());
            compactor.reject(true);
            let mut index = Index::init(
                context,
                test_cfg(2),
                data,
                compactor,
                staging,
            )
            .unwrap();
            index.start();
            assert!(!index.load().await.unwrap());
        });
    }

    #[test_traced]
    fn test_stats_round_trip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, compactor, staging) = setup(context.clone(), 2);
            fresh(&mut index).await;

            // An unknown total is replaced by the file size at stop
            let handle = data.get(3).await.unwrap();
            handle.write_at(vec![0u8; 555], 0).await.unwrap();
            compactor.set_stats(
                3,
                FileStats {
                    total: -1,
                    free: 10,
                    next_expiration: 99,
                },
            );
            index.stop().await.unwrap();

            let compactor = Arc::new(mocks::Compactor::default());
            let mut index = Index::init(
                context,
                test_cfg(2),
                data,
                compactor.clone(),
                staging,
            )
            .unwrap();
            index.start();
            assert!(index.load().await.unwrap());
            assert_eq!(
                compactor.stats().get(&3),
                Some(&FileStats {
                    total: 555,
                    free: 10,
                    next_expiration: 99,
                })
            );
            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_add_remove_segments() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let segments = 4u32;
            let (mut index, _, _, _) = setup(context.clone(), segments);
            fresh(&mut index).await;

            let key = Bytes::from_static(b"key");
            index
                .update(1, key.clone(), loc(1, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();

            index.remove_segments([1]).await.unwrap();

            // The backing blob is gone
            let names = context.scan(PARTITION).await.unwrap();
            assert!(!names.iter().any(|name| name == b"index.1"));

            // Requests against the retired slot complete as no-ops
            let receipt = index
                .update(1, key.clone(), loc(1, 100), 1, 2)
                .await
                .unwrap();
            assert!(!receipt.await.unwrap());
            assert_eq!(index.get_position(1, key.clone()).await.unwrap(), None);

            // Reinstalling the segment brings a fresh shard
            index.add_segments([1]).unwrap();
            let receipt = index
                .update(1, key.clone(), loc(1, 200), 1, 3)
                .await
                .unwrap();
            assert!(!receipt.await.unwrap());
            assert_eq!(
                index.get_position(1, key).await.unwrap(),
                Some(loc(1, 200))
            );

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_delete_file_async() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, compactor, _) = setup(context.clone(), 2);
            fresh(&mut index).await;
            compactor.set_stats(
                7,
                FileStats {
                    total: 64,
                    free: 64,
                    next_expiration: -1,
                },
            );

            let handle = data.get(7).await.unwrap();
            handle.write_at(vec![0u8; 64], 0).await.unwrap();

            index.delete_file_async(7).await.unwrap();

            // The deletion lands once every shard has drained its barrier
            while !compactor.released().contains(&7) {
                context.sleep(std::time::Duration::from_millis(10)).await;
            }
            let names = context.scan(DATA_PARTITION).await.unwrap();
            assert!(!names.iter().any(|name| name == b"data.7"));

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_found_old_replay() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context.clone(), 2);
            fresh(&mut index).await;

            let key = Bytes::from_static(b"key");
            index
                .found_old(0, key.clone(), loc(1, 0), 1, 1)
                .await
                .unwrap()
                .await
                .unwrap();
            let info = index.get_info(0, key.clone()).await.unwrap().unwrap();
            assert_eq!(info.location, loc(1, 0));
            assert_eq!(info.records, 1);

            // Replaying an older record only bumps the count
            index
                .found_old(0, key.clone(), loc(0, 50), 1, 0)
                .await
                .unwrap()
                .await
                .unwrap();
            let info = index.get_info(0, key).await.unwrap().unwrap();
            assert_eq!(info.location, loc(1, 0));
            assert_eq!(info.records, 2);

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_publish() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, data, _, _) = setup(context.clone(), 2);
            fresh(&mut index).await;

            let mut offset = 0i64;
            for at in 0..20u64 {
                let key = format!("key{at:02}");
                write_record(
                    &data,
                    1,
                    offset,
                    key.as_bytes(),
                    Some(key.to_uppercase().as_bytes()),
                    at + 1,
                    -1,
                )
                .await;
                let segment = record_for(key.as_bytes(), 2);
                index
                    .update(segment, Bytes::from(key), loc(1, offset), 1, at + 1)
                    .await
                    .unwrap()
                    .await
                    .unwrap();
                offset += 100;
            }

            // Drop one key: it must not be published
            let segment = record_for(b"key02", 2);
            index
                .dropped(segment, Bytes::from_static(b"key02"), loc(1, 200), 100)
                .await
                .unwrap()
                .await
                .unwrap();

            let stream = index.publish(0..2, true).await.unwrap();
            pin_mut!(stream);
            let mut seen = Vec::new();
            while let Some(record) = stream.next().await {
                let record = record.unwrap();
                let key = String::from_utf8(record.key.to_vec()).unwrap();
                assert_eq!(
                    record.value,
                    Some(Bytes::from(key.to_uppercase().into_bytes()))
                );
                seen.push(key);
            }
            assert_eq!(seen.len(), 19);
            assert!(!seen.contains(&"key02".to_string()));

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_requests_apply_in_order() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context.clone(), 1);
            fresh(&mut index).await;

            // Enqueue a burst without awaiting any receipts
            let key = Bytes::from_static(b"key");
            let mut receipts = Vec::new();
            for at in 0..100u64 {
                receipts.push(
                    index
                        .update(0, key.clone(), loc(1, at as i64), 1, at + 1)
                        .await
                        .unwrap(),
                );
            }

            // The barrier completes after everything enqueued before it
            let barrier = index.ensure_run_on_last().await.unwrap();
            barrier.await;
            assert_eq!(
                index.get_position(0, key.clone()).await.unwrap(),
                Some(loc(1, 99))
            );

            // First receipt saw no prior entry, the rest overwrote
            let mut overwritten = Vec::new();
            for receipt in receipts {
                overwritten.push(receipt.await.unwrap());
            }
            assert!(!overwritten[0]);
            assert!(overwritten[1..].iter().all(|seen| *seen));
            assert_eq!(index.approximate_size(&[0]).unwrap(), 1);

            index.stop().await.unwrap();
        });
    }

    #[test_traced]
    fn test_stopped_rejects_requests() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut index, _, _, _) = setup(context.clone(), 2);
            fresh(&mut index).await;
            index.stop().await.unwrap();
            let result = index
                .update(0, Bytes::from_static(b"key"), loc(1, 0), 1, 1)
                .await;
            assert!(matches!(result, Err(Error::Stopped)));
        });
    }
}
