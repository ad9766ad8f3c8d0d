//! Immutable B+tree nodes for a shard blob.
//!
//! A node is either a leaf of sorted `(key, entry)` tuples or an inner node of sorted key
//! separators with `count + 1` child slots. A separator is an upper bound: children left
//! of it hold strictly smaller keys. Nodes are never modified in place: a mutation
//! rewrites the leaf and every inner node on the path to it into fresh slots, then swaps
//! the root, then returns the replaced slots to the free catalog. Readers that pinned the
//! previous root keep traversing the previous (still intact) nodes.
//!
//! The root node is kept in memory and only written to its slot at graceful shutdown;
//! every other node is written before it becomes reachable.
//!
//! # Format
//!
//! ```text
//! +---------+------------+----------------------------------------------------+
//! | Tag(u8) | Count(u16) | Body                                               |
//! +---------+------------+----------------------------------------------------+
//!
//! Tag = 0 (leaf):  Count x (KeyLen(u16) | Key | File(i32) | Offset(i64)
//!                           | Records(u32) | Seq(u64))
//! Tag = 1 (inner): Count x (KeyLen(u16) | Key), then
//!                  (Count + 1) x (Offset(u64) | Len(u16))
//! ```

use crate::{
    entry::{Entry, EntryRecord, Location},
    free::Catalog,
    pool::{BlobPool, Handle},
    Error,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_runtime::{Blob, Storage};
use futures::{stream, Stream};
use std::{collections::VecDeque, sync::Arc};

/// A slot inside a shard blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexSpace {
    /// Byte offset of the slot.
    pub offset: u64,
    /// Length of the slot.
    pub length: u16,
}

impl IndexSpace {
    pub fn new(offset: u64, length: u16) -> Self {
        Self { offset, length }
    }
}

impl Write for IndexSpace {
    fn write(&self, buf: &mut impl BufMut) {
        self.offset.write(buf);
        self.length.write(buf);
    }
}

impl Read for IndexSpace {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let offset = u64::read(buf)?;
        let length = u16::read(buf)?;
        Ok(Self { offset, length })
    }
}

impl FixedSize for IndexSpace {
    const SIZE: usize = u64::SIZE + u16::SIZE;
}

const LEAF_TAG: u8 = 0;
const INNER_TAG: u8 = 1;

/// Bytes shared by every node encoding (tag + count).
const NODE_HEADER_SIZE: usize = 3;

/// A keyed entry inside a leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub key: Bytes,
    pub entry: Entry,
}

impl LeafEntry {
    fn encoded_len(&self) -> usize {
        2 + self.key.len() + Entry::SIZE
    }
}

/// One immutable tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Inner {
        prefixes: Vec<Bytes>,
        children: Vec<IndexSpace>,
    },
}

impl Node {
    /// The root of an empty tree.
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf(Vec::new())
    }
}

fn read_key(buf: &mut impl Buf) -> Result<Bytes, CodecError> {
    let len = u16::read(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::EndOfBuffer);
    }
    Ok(buf.copy_to_bytes(len))
}

impl Write for Node {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Node::Leaf(entries) => {
                buf.put_u8(LEAF_TAG);
                buf.put_u16(entries.len() as u16);
                for entry in entries {
                    buf.put_u16(entry.key.len() as u16);
                    buf.put_slice(&entry.key);
                    entry.entry.write(buf);
                }
            }
            Node::Inner { prefixes, children } => {
                buf.put_u8(INNER_TAG);
                buf.put_u16(prefixes.len() as u16);
                for prefix in prefixes {
                    buf.put_u16(prefix.len() as u16);
                    buf.put_slice(prefix);
                }
                for child in children {
                    child.write(buf);
                }
            }
        }
    }
}

impl EncodeSize for Node {
    fn encode_size(&self) -> usize {
        match self {
            Node::Leaf(entries) => {
                NODE_HEADER_SIZE + entries.iter().map(LeafEntry::encoded_len).sum::<usize>()
            }
            Node::Inner { prefixes, children } => {
                NODE_HEADER_SIZE
                    + prefixes.iter().map(|p| 2 + p.len()).sum::<usize>()
                    + children.len() * IndexSpace::SIZE
            }
        }
    }
}

impl Read for Node {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let tag = u8::read(buf)?;
        let count = u16::read(buf)? as usize;
        match tag {
            LEAF_TAG => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = read_key(buf)?;
                    let entry = Entry::read(buf)?;
                    entries.push(LeafEntry { key, entry });
                }
                Ok(Node::Leaf(entries))
            }
            INNER_TAG => {
                let mut prefixes = Vec::with_capacity(count);
                for _ in 0..count {
                    prefixes.push(read_key(buf)?);
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..count + 1 {
                    children.push(IndexSpace::read(buf)?);
                }
                Ok(Node::Inner { prefixes, children })
            }
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

/// The published root of a shard's tree.
#[derive(Clone, Debug)]
pub(crate) struct Root {
    /// The root node (held in memory, persisted only at shutdown).
    pub node: Arc<Node>,
    /// The slot the root was last persisted to, if any.
    pub space: Option<IndexSpace>,
}

impl Root {
    pub(crate) fn empty() -> Self {
        Self {
            node: Arc::new(Node::empty_leaf()),
            space: None,
        }
    }
}

/// The child covering `key`: the number of separators at most `key`.
fn child_index(prefixes: &[Bytes], key: &[u8]) -> usize {
    prefixes.partition_point(|prefix| prefix.as_ref() <= key)
}

/// Materialize the node stored at `space`.
pub(crate) async fn read_node<B: Blob>(
    handle: &Handle<B>,
    space: IndexSpace,
) -> Result<Node, Error> {
    let buf = handle
        .read_at(vec![0u8; space.length as usize], space.offset)
        .await?;
    let mut slice = buf.as_ref();
    // Slots may be larger than the encoding; trailing bytes are ignored
    Ok(Node::read_cfg(&mut slice, &())?)
}

async fn write_node<B: Blob>(
    handle: &Handle<B>,
    free: &mut Catalog,
    file_size: &mut u64,
    max: u16,
    node: &Node,
) -> Result<IndexSpace, Error> {
    let len = node.encode_size();
    if len > max as usize {
        return Err(Error::NodeOverflow(len, max));
    }
    let space = free.allocate(len as u16, file_size);
    let mut buf = Vec::with_capacity(len);
    node.write(&mut buf);
    handle.write_at(buf, space.offset).await?;
    Ok(space)
}

/// Descend from the pinned `root` to the leaf covering `key` and return its entry.
pub(crate) async fn find_entry<B: Blob>(
    handle: &Handle<B>,
    root: &Arc<Node>,
    key: &[u8],
) -> Result<Option<Entry>, Error> {
    let mut loaded: Option<Node> = None;
    loop {
        let space = {
            let node = loaded.as_ref().unwrap_or_else(|| root.as_ref());
            match node {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|probe| probe.key.as_ref().cmp(key))
                        .ok()
                        .map(|at| entries[at].entry));
                }
                Node::Inner { prefixes, children } => children[child_index(prefixes, key)],
            }
        };
        loaded = Some(read_node(handle, space).await?);
    }
}

/// How a mutation adjusts a leaf entry's record count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Increase,
    IncreaseForOld,
    Decrease,
    Move,
}

/// A distilled mutation against one key.
#[derive(Clone, Debug)]
pub(crate) struct Apply {
    pub key: Bytes,
    pub location: Location,
    pub records: u32,
    pub seq: u64,
    pub change: Change,
    /// Apply only if the stored location still matches (the compactor guard).
    pub guard: Option<Location>,
}

/// What a mutation observed and did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Applied {
    /// Whether the tree was changed at all.
    pub applied: bool,
    /// Whether an entry for the key existed beforehand.
    pub overwritten: bool,
    /// The previously stored location, when an entry was overwritten.
    pub prev: Option<Location>,
}

impl Applied {
    fn skipped() -> Self {
        Self {
            applied: false,
            overwritten: false,
            prev: None,
        }
    }
}

/// Apply a mutation to a decoded set of leaf entries.
///
/// A `Decrease` turns the stored entry into a tombstone of itself, preserving the
/// dropped record's location behind the offset complement. An entry only leaves
/// the leaf once a mutation lands with nowhere left to point (both file and
/// offset negative), i.e. compaction reclaimed the last record for the key.
pub(crate) fn apply_to_entries(entries: &mut Vec<LeafEntry>, apply: &Apply) -> Applied {
    match entries.binary_search_by(|probe| probe.key.as_ref().cmp(apply.key.as_ref())) {
        Ok(at) => {
            let stored = entries[at].entry;
            if let Some(guard) = apply.guard {
                if stored.location != guard {
                    return Applied::skipped();
                }
            }
            let records = match apply.change {
                Change::Increase | Change::IncreaseForOld => {
                    stored.records.saturating_add(apply.records)
                }
                Change::Decrease => stored.records.saturating_sub(apply.records),
                Change::Move => stored.records,
            };
            let (location, seq) = match apply.change {
                // A bookkeeping-only insertion never displaces the newer position
                Change::IncreaseForOld => (stored.location, stored.seq),
                Change::Decrease => {
                    let location = if stored.location.is_tombstone() {
                        stored.location
                    } else {
                        stored.location.tombstone()
                    };
                    (location, apply.seq)
                }
                _ => (apply.location, apply.seq),
            };
            if location.file < 0 && location.offset < 0 {
                entries.remove(at);
            } else {
                entries[at].entry = Entry {
                    location,
                    records,
                    seq,
                };
            }
            Applied {
                applied: true,
                overwritten: true,
                prev: Some(stored.location),
            }
        }
        Err(insert_at) => {
            match apply.change {
                // Nothing to relocate or drop
                Change::Move | Change::Decrease => return Applied::skipped(),
                Change::Increase | Change::IncreaseForOld => {}
            }
            entries.insert(
                insert_at,
                LeafEntry {
                    key: apply.key.clone(),
                    entry: Entry {
                        location: apply.location,
                        records: apply.records.max(1),
                        seq: apply.seq,
                    },
                },
            );
            Applied {
                applied: true,
                overwritten: false,
                prev: None,
            }
        }
    }
}

/// Split `node` into two halves around the byte median, clamped so the left half
/// fits `max`. Returns `(left, separator, right)`.
fn split_node(node: Node, max: u16) -> Result<(Node, Bytes, Node), Error> {
    match node {
        Node::Leaf(entries) => {
            if entries.len() < 2 {
                let size =
                    NODE_HEADER_SIZE + entries.iter().map(LeafEntry::encoded_len).sum::<usize>();
                return Err(Error::NodeOverflow(size, max));
            }
            let total: usize = entries.iter().map(LeafEntry::encoded_len).sum();
            let mut at = 1;
            let mut left_bytes = entries[0].encoded_len();
            while at < entries.len() - 1 && left_bytes < total / 2 {
                left_bytes += entries[at].encoded_len();
                at += 1;
            }
            while at > 1 && NODE_HEADER_SIZE + left_bytes > max as usize {
                at -= 1;
                left_bytes -= entries[at].encoded_len();
            }
            let mut left = entries;
            let right = left.split_off(at);
            let separator = right[0].key.clone();
            let (left, right) = (Node::Leaf(left), Node::Leaf(right));
            if left.encode_size() > max as usize || right.encode_size() > max as usize {
                return Err(Error::NodeOverflow(
                    left.encode_size().max(right.encode_size()),
                    max,
                ));
            }
            Ok((left, separator, right))
        }
        Node::Inner { prefixes, children } => {
            if prefixes.len() < 2 {
                let size = NODE_HEADER_SIZE
                    + prefixes.iter().map(|p| 2 + p.len()).sum::<usize>()
                    + children.len() * IndexSpace::SIZE;
                return Err(Error::NodeOverflow(size, max));
            }
            // Promote the separator at the pair median
            let at = prefixes.len() / 2;
            let mut left_prefixes = prefixes;
            let mut right_prefixes = left_prefixes.split_off(at);
            let separator = right_prefixes.remove(0);
            let mut left_children = children;
            let right_children = left_children.split_off(at + 1);
            let left = Node::Inner {
                prefixes: left_prefixes,
                children: left_children,
            };
            let right = Node::Inner {
                prefixes: right_prefixes,
                children: right_children,
            };
            if left.encode_size() > max as usize || right.encode_size() > max as usize {
                return Err(Error::NodeOverflow(
                    left.encode_size().max(right.encode_size()),
                    max,
                ));
            }
            Ok((left, separator, right))
        }
    }
}

/// Concatenate two sibling nodes with the parent separator between them.
fn merge_nodes(left: Node, separator: Bytes, right: Node) -> Result<Node, Error> {
    match (left, right) {
        (Node::Leaf(mut left), Node::Leaf(right)) => {
            left.extend(right);
            Ok(Node::Leaf(left))
        }
        (
            Node::Inner {
                prefixes: mut left_prefixes,
                children: mut left_children,
            },
            Node::Inner {
                prefixes: right_prefixes,
                children: right_children,
            },
        ) => {
            left_prefixes.push(separator);
            left_prefixes.extend(right_prefixes);
            left_children.extend(right_children);
            Ok(Node::Inner {
                prefixes: left_prefixes,
                children: left_children,
            })
        }
        _ => Err(Error::IllegalState(
            "sibling nodes at different depths".into(),
        )),
    }
}

/// Result of rewriting a child, consumed by its parent level.
enum Outcome {
    One(IndexSpace),
    Split {
        left: IndexSpace,
        separator: Bytes,
        right: IndexSpace,
    },
    /// Fell below the minimum size; not yet written.
    Under(Node),
}

/// Write a non-root node, classifying it for the parent.
async fn finish_child<B: Blob>(
    handle: &Handle<B>,
    free: &mut Catalog,
    file_size: &mut u64,
    min: u16,
    max: u16,
    node: Node,
) -> Result<Outcome, Error> {
    let size = node.encode_size();
    if size > max as usize {
        let (left, separator, right) = split_node(node, max)?;
        let left = write_node(handle, free, file_size, max, &left).await?;
        let right = write_node(handle, free, file_size, max, &right).await?;
        return Ok(Outcome::Split {
            left,
            separator,
            right,
        });
    }
    if size < min as usize {
        return Ok(Outcome::Under(node));
    }
    let space = write_node(handle, free, file_size, max, &node).await?;
    Ok(Outcome::One(space))
}

/// Rebuild an inner level around its rewritten child.
#[allow(clippy::too_many_arguments)]
async fn integrate<B: Blob>(
    handle: &Handle<B>,
    free: &mut Catalog,
    file_size: &mut u64,
    max: u16,
    mut prefixes: Vec<Bytes>,
    mut children: Vec<IndexSpace>,
    at: usize,
    outcome: Outcome,
    freed: &mut Vec<IndexSpace>,
) -> Result<Node, Error> {
    match outcome {
        Outcome::One(space) => children[at] = space,
        Outcome::Split {
            left,
            separator,
            right,
        } => {
            children[at] = left;
            prefixes.insert(at, separator);
            children.insert(at + 1, right);
        }
        Outcome::Under(node) => {
            if children.len() == 1 {
                // No sibling to merge with
                children[at] = write_node(handle, free, file_size, max, &node).await?;
            } else {
                // Prefer the left sibling
                let (left_at, right_at) = if at > 0 { (at - 1, at) } else { (at, at + 1) };
                let sibling_at = if at > 0 { left_at } else { right_at };
                let sibling_space = children[sibling_at];
                let sibling = read_node(handle, sibling_space).await?;
                freed.push(sibling_space);
                let separator = prefixes[left_at].clone();
                let (left, right) = if at > 0 {
                    (sibling, node)
                } else {
                    (node, sibling)
                };
                let merged = merge_nodes(left, separator, right)?;
                if merged.encode_size() <= max as usize {
                    children[left_at] = write_node(handle, free, file_size, max, &merged).await?;
                    children.remove(right_at);
                    prefixes.remove(left_at);
                } else {
                    // Redistribute across the boundary instead
                    let (left, separator, right) = split_node(merged, max)?;
                    children[left_at] = write_node(handle, free, file_size, max, &left).await?;
                    children[right_at] = write_node(handle, free, file_size, max, &right).await?;
                    prefixes[left_at] = separator;
                }
            }
        }
    }
    Ok(Node::Inner { prefixes, children })
}

/// Finish the root level: the root node stays in memory, but an oversized root is
/// split and replaced by a fresh inner root above the written halves.
async fn finish_root<B: Blob>(
    handle: &Handle<B>,
    free: &mut Catalog,
    file_size: &mut u64,
    max: u16,
    node: Node,
) -> Result<Node, Error> {
    if node.encode_size() <= max as usize {
        return Ok(node);
    }
    let (left, separator, right) = split_node(node, max)?;
    let left = write_node(handle, free, file_size, max, &left).await?;
    let right = write_node(handle, free, file_size, max, &right).await?;
    Ok(Node::Inner {
        prefixes: vec![separator],
        children: vec![left, right],
    })
}

/// Outcome of a [set_position] call.
pub(crate) struct Update {
    /// The root to publish.
    pub root: Arc<Node>,
    /// The slot the published root occupies on disk, if any.
    pub root_space: Option<IndexSpace>,
    /// Slots to free once the new root is published.
    pub freed: Vec<IndexSpace>,
    /// What the mutation observed.
    pub applied: Applied,
}

struct InnerLevel {
    prefixes: Vec<Bytes>,
    children: Vec<IndexSpace>,
    at: usize,
    space: Option<IndexSpace>,
}

/// Apply one mutation to the tree rooted at `root`. New nodes are written before
/// the returned root is published; replaced slots are reported for freeing after
/// publication.
pub(crate) async fn set_position<B: Blob>(
    handle: &Handle<B>,
    root: &Root,
    free: &mut Catalog,
    file_size: &mut u64,
    min: u16,
    max: u16,
    apply: &Apply,
) -> Result<Update, Error> {
    // Descend to the covering leaf, keeping the rewritten path
    let mut path: Vec<InnerLevel> = Vec::new();
    let mut current_space = root.space;
    let mut loaded: Option<Node> = None;
    let (mut entries, leaf_space) = loop {
        let next = {
            let node = loaded.as_ref().unwrap_or_else(|| root.node.as_ref());
            match node {
                Node::Leaf(leaf) => break (leaf.clone(), current_space),
                Node::Inner { prefixes, children } => {
                    let at = child_index(prefixes, &apply.key);
                    path.push(InnerLevel {
                        prefixes: prefixes.clone(),
                        children: children.clone(),
                        at,
                        space: current_space,
                    });
                    children[at]
                }
            }
        };
        current_space = Some(next);
        loaded = Some(read_node(handle, next).await?);
    };

    // Mutate the leaf
    let applied = apply_to_entries(&mut entries, apply);
    if !applied.applied {
        return Ok(Update {
            root: root.node.clone(),
            root_space: root.space,
            freed: Vec::new(),
            applied,
        });
    }

    // Every node on the path is being replaced
    let mut freed: Vec<IndexSpace> = Vec::new();
    if let Some(space) = leaf_space {
        freed.push(space);
    }
    for level in &path {
        if let Some(space) = level.space {
            freed.push(space);
        }
    }

    // Root is the leaf
    if path.is_empty() {
        let node = finish_root(handle, free, file_size, max, Node::Leaf(entries)).await?;
        return Ok(Update {
            root: Arc::new(node),
            root_space: None,
            freed,
            applied,
        });
    }

    // Rewrite upward through the non-root inner levels
    let mut outcome = finish_child(handle, free, file_size, min, max, Node::Leaf(entries)).await?;
    while path.len() > 1 {
        let level = path.pop().expect("non-empty path");
        let node = integrate(
            handle,
            free,
            file_size,
            max,
            level.prefixes,
            level.children,
            level.at,
            outcome,
            &mut freed,
        )
        .await?;
        outcome = finish_child(handle, free, file_size, min, max, node).await?;
    }

    // Rebuild the root level
    let level = path.pop().expect("root level");
    let mut node = integrate(
        handle,
        free,
        file_size,
        max,
        level.prefixes,
        level.children,
        level.at,
        outcome,
        &mut freed,
    )
    .await?;
    // A root left with a single child collapses into it
    loop {
        let space = match &node {
            Node::Inner { children, .. } if children.len() == 1 => children[0],
            _ => break,
        };
        node = read_node(handle, space).await?;
        freed.push(space);
    }
    let node = finish_root(handle, free, file_size, max, node).await?;
    Ok(Update {
        root: Arc::new(node),
        root_space: None,
        freed,
        applied,
    })
}

/// Largest sequence stored anywhere under `root`.
pub(crate) async fn max_seq<B: Blob>(handle: &Handle<B>, root: &Arc<Node>) -> Result<u64, Error> {
    let mut best = 0u64;
    let mut stack: Vec<IndexSpace> = Vec::new();
    match root.as_ref() {
        Node::Leaf(entries) => {
            for entry in entries {
                best = best.max(entry.entry.seq);
            }
        }
        Node::Inner { children, .. } => stack.extend(children.iter().copied()),
    }
    while let Some(space) = stack.pop() {
        match read_node(handle, space).await? {
            Node::Leaf(entries) => {
                for entry in &entries {
                    best = best.max(entry.entry.seq);
                }
            }
            Node::Inner { children, .. } => stack.extend(children.iter().copied()),
        }
    }
    Ok(best)
}

/// All slots reachable from `root` (excluding the in-memory root itself).
#[cfg(test)]
pub(crate) async fn live_spaces<B: Blob>(
    handle: &Handle<B>,
    root: &Arc<Node>,
) -> Result<Vec<IndexSpace>, Error> {
    let mut spaces = Vec::new();
    let mut stack: Vec<IndexSpace> = Vec::new();
    if let Node::Inner { children, .. } = root.as_ref() {
        stack.extend(children.iter().copied());
    }
    while let Some(space) = stack.pop() {
        spaces.push(space);
        if let Node::Inner { children, .. } = read_node(handle, space).await? {
            stack.extend(children.iter().copied());
        }
    }
    Ok(spaces)
}

struct PublishState<E: Storage> {
    pool: Arc<BlobPool<E>>,
    data: Arc<BlobPool<E>>,
    id: u32,
    load_values: bool,
    stack: Vec<IndexSpace>,
    pending: VecDeque<LeafEntry>,
}

/// Every live entry under `root`, in key order, as a lazy stream. Tombstones are
/// skipped; expired records are included (callers filter).
pub(crate) fn publish<E: Storage>(
    pool: Arc<BlobPool<E>>,
    data: Arc<BlobPool<E>>,
    id: u32,
    root: Arc<Node>,
    load_values: bool,
) -> impl Stream<Item = Result<EntryRecord, Error>> + Send {
    let mut state = PublishState {
        pool,
        data,
        id,
        load_values,
        stack: Vec::new(),
        pending: VecDeque::new(),
    };
    match root.as_ref() {
        Node::Leaf(entries) => state.pending.extend(entries.iter().cloned()),
        Node::Inner { children, .. } => state.stack.extend(children.iter().rev().copied()),
    }
    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(next) = state.pending.pop_front() {
                if next.entry.location.is_tombstone() {
                    continue;
                }
                let record = crate::entry::read_record(
                    &state.data,
                    &next.key,
                    &next.entry,
                    state.load_values,
                )
                .await?;
                return Ok(Some((record, state)));
            }
            let Some(space) = state.stack.pop() else {
                return Ok(None);
            };
            let handle = state.pool.get(state.id as u64).await?;
            match read_node(&handle, space).await? {
                Node::Leaf(entries) => state.pending.extend(entries),
                Node::Inner { children, .. } => state.stack.extend(children.iter().rev().copied()),
            }
        }
    })
}
