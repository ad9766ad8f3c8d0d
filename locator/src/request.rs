//! Requests applied by a shard's applier task.
//!
//! Every mutation carries a oneshot responder. The applier completes it after the new
//! root is published, so awaiting a [Receipt] observes the mutation; continuations run on
//! the receiver's task, never on the applier.

use crate::{entry::Location, Error};
use bytes::Bytes;
use futures::channel::oneshot;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

pub(crate) type Responder<T> = oneshot::Sender<Result<T, Error>>;

/// Completion of an enqueued request.
pub struct Receipt<T>(oneshot::Receiver<Result<T, Error>>);

impl<T> Future for Receipt<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Stopped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn channel<T>() -> (Responder<T>, Receipt<T>) {
    let (tx, rx) = oneshot::channel();
    (tx, Receipt(rx))
}

/// A message on a shard's queue.
pub(crate) enum Request {
    /// A new write: install `location`, bumping the record count.
    Update {
        key: Bytes,
        location: Location,
        records: u32,
        seq: u64,
        tx: Responder<bool>,
    },
    /// The compactor relocated a record; applied only if the stored location
    /// still equals `prev`.
    Moved {
        key: Bytes,
        location: Location,
        seq: u64,
        prev: Location,
        tx: Responder<()>,
    },
    /// The key was deleted; the stored entry becomes a tombstone.
    Dropped {
        key: Bytes,
        prev: Location,
        seq: u64,
        tx: Responder<()>,
    },
    /// A record observed while replaying data files; bookkeeping only.
    FoundOld {
        key: Bytes,
        location: Location,
        records: u32,
        seq: u64,
        tx: Responder<()>,
    },
    /// Reset the shard to an empty tree.
    Clear { tx: Responder<()> },
    /// Barrier: completes once every earlier request was applied.
    Sync { tx: Responder<()> },
    /// Restore persisted state (startup only).
    Load { tx: Responder<bool> },
    /// Truncate and mark dirty (startup only, before replay).
    Reset { tx: Responder<()> },
}

impl Request {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Request::Update { .. } => "update",
            Request::Moved { .. } => "moved",
            Request::Dropped { .. } => "dropped",
            Request::FoundOld { .. } => "found_old",
            Request::Clear { .. } => "clear",
            Request::Sync { .. } => "sync",
            Request::Load { .. } => "load",
            Request::Reset { .. } => "reset",
        }
    }

    /// Complete without applying anything (the retired-shard sentinel).
    pub(crate) fn complete_noop(self) {
        match self {
            Request::Update { tx, .. } => {
                let _ = tx.send(Ok(false));
            }
            Request::Moved { tx, .. }
            | Request::Dropped { tx, .. }
            | Request::FoundOld { tx, .. }
            | Request::Clear { tx }
            | Request::Sync { tx }
            | Request::Reset { tx } => {
                let _ = tx.send(Ok(()));
            }
            Request::Load { tx } => {
                let _ = tx.send(Ok(true));
            }
        }
    }
}
