//! LIFO freelist of reusable connection resources.
//!
//! The socket itself is never pooled — every accept gets a fresh `fd` — but
//! the read buffer and writer scratch space are expensive to rebuild per
//! connection, so `conn_close` returns them to this freelist instead of
//! dropping them. The list grows by doubling when an insertion would
//! overflow.

use crate::net::buffer::ReadBuffer;
use crate::net::segment::Writer;

/// The reusable, socket-independent half of a connection record.
pub struct ConnResources {
    pub read_buf: ReadBuffer,
    pub writer: Writer,
}

impl ConnResources {
    pub fn fresh(initial_read_buf_size: usize, first_msg_cap: usize) -> Self {
        Self {
            read_buf: ReadBuffer::new(initial_read_buf_size),
            writer: Writer::new(first_msg_cap),
        }
    }
}

pub struct ConnectionPool {
    free: Vec<ConnResources>,
    cap: usize,
}

impl ConnectionPool {
    pub fn new(initial_cap: usize) -> Self {
        Self {
            free: Vec::with_capacity(initial_cap),
            cap: initial_cap.max(1),
        }
    }

    /// Takes a resource record from the freelist, if one is available.
    pub fn take(&mut self) -> Option<ConnResources> {
        self.free.pop()
    }

    /// Returns a resource record to the freelist, unless the list is
    /// already at capacity, in which case it is simply dropped. Growth is
    /// by doubling, so a burst of returns past the current cap is
    /// accommodated rather than immediately discarded.
    pub fn give_back(&mut self, resources: ConnResources) {
        if self.free.len() >= self.cap {
            self.cap *= 2;
        }
        if self.free.len() < self.cap {
            self.free.push(resources);
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy() -> ConnResources {
        ConnResources::fresh(16, 1024)
    }

    #[test]
    fn take_on_empty_pool_returns_none() {
        let mut pool = ConnectionPool::new(2);
        assert!(pool.take().is_none());
    }

    #[test]
    fn give_back_then_take_round_trips() {
        let mut pool = ConnectionPool::new(2);
        pool.give_back(dummy());
        assert_eq!(pool.len(), 1);
        assert!(pool.take().is_some());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn pool_grows_by_doubling_past_cap() {
        let mut pool = ConnectionPool::new(1);
        pool.give_back(dummy());
        pool.give_back(dummy());
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn freelist_bound_caps_growth_until_doubled() {
        let mut pool = ConnectionPool::new(2);
        pool.give_back(dummy());
        pool.give_back(dummy());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
        pool.give_back(dummy());
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.len(), 3);
    }
}
