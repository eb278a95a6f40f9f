//! The opaque storage item.
//!
//! An `Item` is what the storage engine hands back to the front end on a
//! successful `get`. It is never mutated by the front end: the connection
//! only ever borrows byte ranges out of it while a reply is in flight, and
//! releases its `Arc` once the reply has been fully written (see
//! `net::segment`).

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored value together with the framing the wire protocol needs to
/// reply with it.
///
/// `suffix` is the pre-formatted `" <flags> <len>\r\n"` text that
/// immediately precedes `value` in a `VALUE` reply, so a hit can be
/// written as two scatter/gather segments (suffix, value) without
/// re-formatting on every read. `len` here is the client-visible value
/// length (no trailing `\r\n`); the terminating `\r\n` after the value
/// bytes is framed separately by the writer, not stored in `suffix`.
#[derive(Debug)]
pub struct Item {
    pub key: Bytes,
    pub suffix: Bytes,
    pub value: Bytes,
    pub flag: u32,
    pub ver: u32,
}

impl Item {
    pub fn new(key: Bytes, value: Bytes, flag: u32, ver: u32) -> Arc<Self> {
        let suffix = format!(" {} {}\r\n", flag, value.len());
        Arc::new(Self {
            key,
            suffix: Bytes::from(suffix),
            value,
            flag,
            ver,
        })
    }

    /// Length of the key in bytes.
    pub fn nkey(&self) -> usize {
        self.key.len()
    }

    /// Length of the suffix in bytes.
    pub fn nsuffix(&self) -> usize {
        self.suffix.len()
    }

    /// Value length including the trailing `\r\n`.
    pub fn nbytes(&self) -> usize {
        self.value.len() + 2
    }
}

/// Process-wide monotonic version/CAS token generator.
///
/// Every successful mutation gets the next token. This is a write version,
/// not an expiration clock — there is no TTL anywhere in this store.
#[derive(Debug, Default)]
pub struct VersionClock(AtomicU64);

impl VersionClock {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) as u32
    }
}
