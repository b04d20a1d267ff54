//! Connection object pool: a slab of pre-allocated [`Connection`] slots
//! with a LIFO free list, growing on exhaustion.
//!
//! Grounded in the teacher's `slab.rs` (`ConnectionSlab`'s free-list-in-fd
//! trick: a free slot's `fd` field doubles as the "next free" pointer) and
//! `examples/original_source/src/connection_pool.h` (the `acquire`/
//! `release` contract and the "grow on exhaustion instead of blocking"
//! policy spec.md §4.1 asks for).
//!
//! Unlike the teacher's fixed-capacity slab (`Option<usize>` from
//! `allocate`, dropped connections on exhaustion), spec.md §4.1 requires
//! the pool to append a new slot when the free stack is empty rather than
//! reject the connection — this implementation's `acquire` never returns
//! `None`.

use crate::connection::{Connection, NO_POOL_INDEX};

/// Default per-worker slot count. The original source (`connection_pool.h`)
/// defaults to 100,000 for a single-process server; since this
/// implementation spawns one pool per worker thread (typically one per
/// hardware thread), 4,096 is sized for a worker's share of a similarly
/// provisioned host rather than the whole machine's connection budget.
/// Growth-on-exhaustion (below) makes this non-limiting either way.
pub const DEFAULT_POOL_SIZE: usize = 4096;

/// Sentinel stored in a free slot's `next` pointer to mark the end of the
/// free list, mirroring the teacher's `-1`-terminated free chain.
const FREE_LIST_END: i64 = -1;

pub struct ConnectionPool<'cache> {
    slots: Vec<Connection<'cache>>,
    /// Parallel free-list-as-linked-list over `slots`: `free_next[i]` is
    /// the index of the next free slot after `i`, or [`FREE_LIST_END`].
    /// Kept separate from `Connection` itself (unlike the teacher, which
    /// reuses the `fd` field) since this connection's `fd` is a real file
    /// descriptor even while sitting in the free list between reuses would
    /// otherwise be ambiguous with `-1`.
    free_next: Vec<i64>,
    free_head: i64,
    in_use: usize,
}

impl<'cache> ConnectionPool<'cache> {
    pub fn new(initial_size: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(initial_size),
            free_next: Vec::with_capacity(initial_size),
            free_head: FREE_LIST_END,
            in_use: 0,
        };
        for _ in 0..initial_size {
            pool.push_free_slot();
        }
        pool
    }

    fn push_free_slot(&mut self) {
        let idx = self.slots.len();
        self.slots.push(Connection::empty());
        self.free_next.push(self.free_head);
        self.free_head = idx as i64;
    }

    /// Pops a slot from the free stack (appending a new one if empty) and
    /// resets it for `fd`. Returns the slot's index.
    pub fn acquire(&mut self, fd: std::os::unix::io::RawFd) -> usize {
        if self.free_head == FREE_LIST_END {
            self.push_free_slot();
        }
        let idx = self.free_head as usize;
        self.free_head = self.free_next[idx];
        self.slots[idx].reset(fd);
        self.slots[idx].pool_index = NO_POOL_INDEX;
        self.in_use += 1;
        idx
    }

    /// Resets the slot and returns it to the free stack.
    pub fn release(&mut self, idx: usize) {
        self.slots[idx].reset(-1);
        self.free_next[idx] = self.free_head;
        self.free_head = idx as i64;
        self.in_use -= 1;
    }

    pub fn get(&self, idx: usize) -> &Connection<'cache> {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Connection<'cache> {
        &mut self.slots[idx]
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn free_count(&self) -> usize {
        self.slots.len() - self.in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_invariant_free_plus_in_use_equals_total() {
        let mut pool: ConnectionPool<'static> = ConnectionPool::new(4);
        assert_eq!(pool.free_count() + pool.in_use(), pool.total());

        let a = pool.acquire(10);
        let b = pool.acquire(11);
        assert_eq!(pool.free_count() + pool.in_use(), pool.total());

        pool.release(a);
        assert_eq!(pool.free_count() + pool.in_use(), pool.total());

        let _c = pool.acquire(12);
        let _d = pool.acquire(13);
        assert_eq!(pool.free_count() + pool.in_use(), pool.total());
        drop(b);
    }

    #[test]
    fn grows_on_exhaustion_instead_of_failing() {
        let mut pool: ConnectionPool<'static> = ConnectionPool::new(1);
        let initial_total = pool.total();
        let _a = pool.acquire(1);
        let _b = pool.acquire(2); // must grow: free list was exhausted
        assert!(pool.total() > initial_total);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn lifo_reuse_prefers_most_recently_freed_slot() {
        let mut pool: ConnectionPool<'static> = ConnectionPool::new(4);
        let a = pool.acquire(1);
        let _b = pool.acquire(2);
        pool.release(a);
        let c = pool.acquire(3);
        assert_eq!(c, a, "LIFO free list should hand back the just-freed slot");
    }

    #[test]
    fn reset_on_acquire_clears_prior_connection_state() {
        let mut pool: ConnectionPool<'static> = ConnectionPool::new(2);
        let a = pool.acquire(1);
        pool.get_mut(a).set_keep_alive(true);
        pool.get_mut(a).append_read(b"stale");
        pool.release(a);

        let b = pool.acquire(2);
        assert_eq!(b, a);
        assert!(!pool.get(b).keep_alive());
        assert_eq!(pool.get(b).read_buffer_len(), 0);
        assert_eq!(pool.get(b).fd(), 2);
    }
}
