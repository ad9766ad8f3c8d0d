//! Leaf payloads and data-file records.
//!
//! A leaf maps a key to an [Entry]: the [Location] of the latest record for the key, the
//! number of records still present in data files for it, and the sequence of the write
//! that produced it. A negative offset marks a tombstone: the key was dropped but its
//! delete marker still occupies a data file until compaction reclaims it. The marker's
//! physical offset is recoverable as the bitwise complement of the stored offset.

use crate::{pool::BlobPool, Error};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_runtime::Storage;
use std::time::{SystemTime, UNIX_EPOCH};

/// The physical position of a record in the data files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    /// Data file id. Negative is the tombstone sentinel.
    pub file: i32,
    /// Byte offset within the file. Negative mirrors the tombstone state; the
    /// marker's real offset is `!offset`.
    pub offset: i64,
}

impl Location {
    /// Whether this location marks a dropped key.
    pub fn is_tombstone(&self) -> bool {
        self.offset < 0
    }

    /// The tombstone encoding of a delete marker written at `self`.
    pub fn tombstone(&self) -> Self {
        Self {
            file: self.file,
            offset: !self.offset,
        }
    }

    /// The physical location, decoding the tombstone complement if set.
    pub fn resolved(&self) -> Self {
        if self.offset < 0 {
            Self {
                file: self.file,
                offset: !self.offset,
            }
        } else {
            *self
        }
    }
}

impl Write for Location {
    fn write(&self, buf: &mut impl BufMut) {
        self.file.write(buf);
        self.offset.write(buf);
    }
}

impl Read for Location {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let file = i32::read(buf)?;
        let offset = i64::read(buf)?;
        Ok(Self { file, offset })
    }
}

impl FixedSize for Location {
    const SIZE: usize = i32::SIZE + i64::SIZE;
}

/// A leaf entry: the latest location of a key plus compaction bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Location of the latest record (tombstone-encoded for dropped keys).
    pub location: Location,
    /// How many records for this key still live in data files.
    pub records: u32,
    /// Sequence of the write that installed this entry.
    pub seq: u64,
}

impl Write for Entry {
    fn write(&self, buf: &mut impl BufMut) {
        self.location.write(buf);
        self.records.write(buf);
        self.seq.write(buf);
    }
}

impl Read for Entry {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let location = Location::read(buf)?;
        let records = u32::read(buf)?;
        let seq = u64::read(buf)?;
        Ok(Self {
            location,
            records,
            seq,
        })
    }
}

impl FixedSize for Entry {
    const SIZE: usize = Location::SIZE + u32::SIZE + u64::SIZE;
}

/// A record materialized from a data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRecord {
    /// The key, as stored in the leaf.
    pub key: Bytes,
    /// The value, if requested and present (delete markers have none).
    pub value: Option<Bytes>,
    /// The physical location the record was read from.
    pub location: Location,
    /// Sequence of the write that produced the record.
    pub seq: u64,
    /// Expiration (epoch ms, -1 if the record never expires).
    pub expiry: i64,
}

/// Size of the on-disk record header in data files.
pub const RECORD_HEADER_SIZE: usize = 22;

/// Header of a record in a data file: `key_len: u16 | value_len: i32 | seq: u64 |
/// expiry: i64`, big-endian. A negative `value_len` marks a delete marker.
///
/// The index never writes data files; the header is exposed so the store's write
/// path and the index agree on the layout.
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    pub key_len: u16,
    pub value_len: i32,
    pub seq: u64,
    pub expiry: i64,
}

impl RecordHeader {
    pub fn parse(mut buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(CodecError::EndOfBuffer.into());
        }
        Ok(Self {
            key_len: buf.get_u16(),
            value_len: buf.get_i32(),
            seq: buf.get_u64(),
            expiry: buf.get_i64(),
        })
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.key_len);
        buf.put_i32(self.value_len);
        buf.put_u64(self.seq);
        buf.put_i64(self.expiry);
    }
}

/// Whether a record with the given expiration is expired at `now` (epoch ms).
pub(crate) fn expired(expiry: i64, now: i64) -> bool {
    expiry >= 0 && expiry <= now
}

/// The current time as epoch milliseconds.
pub(crate) fn epoch_millis(now: SystemTime) -> i64 {
    now.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Read the record referenced by `entry` from the data files, optionally loading
/// its value.
pub(crate) async fn read_record<E: Storage>(
    data: &BlobPool<E>,
    key: &Bytes,
    entry: &Entry,
    load_value: bool,
) -> Result<EntryRecord, Error> {
    let location = entry.location.resolved();
    if location.file < 0 {
        return Err(Error::IllegalState(format!(
            "record location without a file: {}",
            location.file
        )));
    }
    let handle = data.get(location.file as u64).await?;
    let header = handle
        .read_at(vec![0u8; RECORD_HEADER_SIZE], location.offset as u64)
        .await?;
    let header = RecordHeader::parse(header.as_ref())?;
    let value = if load_value && header.value_len >= 0 {
        let at = location.offset as u64 + RECORD_HEADER_SIZE as u64 + header.key_len as u64;
        let value = handle
            .read_at(vec![0u8; header.value_len as usize], at)
            .await?;
        Some(Bytes::from(value.as_ref().to_vec()))
    } else {
        None
    };
    Ok(EntryRecord {
        key: key.clone(),
        value,
        location,
        seq: header.seq,
        expiry: header.expiry,
    })
}
