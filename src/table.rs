//! The Multiplexer's two pipe maps and the scoped-lookup locking discipline.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `PipeTable` is the top of the lock order (§5): `pipeStateTableMutex`
//! first, then at most one `PipeState.stateMutex`, then (leaf)
//! `packetPoolMutex`. The table itself never calls into the pool. A lookup
//! holds the table lock only long enough to clone an `Arc` out of one of
//! the two maps — by the time a caller touches `PipeHandle::state`, the
//! table lock has already been dropped. That is the "scoped lookup"
//! primitive from §4.2/§9: in the original design it was a guard object
//! that released the outer lock on return, which here is just what cloning
//! an `Arc` and returning it naturally does.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::dupe::Dupe;
use crate::pipe::PipeShared;
use crate::thread_id::ThreadId;

/// A cheaply-cloned reference to one pipe's shared state. Call
/// [`PipeShared::state`]`.lock()` to get at the data once you hold this.
pub type PipeHandle = std::sync::Arc<PipeShared>;

struct Tables {
    /// Thread-id tuple -> PipeState, before a cluster-wide id exists.
    pending: HashMap<ThreadId, PipeHandle>,
    /// pipeId -> PipeState, once named.
    live: HashMap<u32, PipeHandle>,
    /// Next candidate pipe id the master will assign. Skips `0` and any
    /// value with the sign bit set (reserved by the wire format for the
    /// `node_index` direction tag, see `wire::SLAVE_BIT`).
    next_pipe_id: u32,
}

/// Owns every pipe in the process, pending and live.
pub struct PipeTable {
    inner: Mutex<Tables>,
    num_slaves: usize,
}

impl PipeTable {
    /// A table for a cluster of `num_slaves` slaves (not counting the
    /// master).
    #[must_use]
    pub fn new(num_slaves: usize) -> Self {
        Self {
            inner: Mutex::new(Tables {
                pending: HashMap::new(),
                live: HashMap::new(),
                next_pipe_id: 1,
            }),
            num_slaves,
        }
    }

    /// Find (or create) the pending entry for `thread_id`. Used by the
    /// opener on both master and slave, and by the master's dispatch loop
    /// when the first `CREATEPIPE1` for a never-before-seen thread id
    /// arrives from some slave.
    pub fn get_or_create_pending(&self, thread_id: ThreadId) -> PipeHandle {
        let mut tables = self.inner.lock();
        if let Some(existing) = tables.pending.get(&thread_id) {
            return existing.dupe();
        }
        let handle = PipeShared::new(self.num_slaves);
        handle.state.lock().thread_id = Some(thread_id.clone());
        tables.pending.insert(thread_id, handle.dupe());
        handle
    }

    /// Look up a pending entry without creating one.
    #[must_use]
    pub fn lookup_pending(&self, thread_id: &ThreadId) -> Option<PipeHandle> {
        self.inner.lock().pending.get(thread_id).map(Dupe::dupe)
    }

    /// Look up a live pipe by its cluster-wide id.
    #[must_use]
    pub fn lookup_live(&self, pipe_id: u32) -> Option<PipeHandle> {
        self.inner.lock().live.get(&pipe_id).map(Dupe::dupe)
    }

    /// Master side of promotion (§4.3 CREATEPIPE1 row): allocate the next
    /// unused non-zero, sign-bit-clear pipe id, move the pending entry for
    /// `thread_id` into the live table under that id, and return both the
    /// handle and the id. Returns `None` if `thread_id` has no pending
    /// entry (should not happen if the caller always calls
    /// `get_or_create_pending` first).
    pub fn promote_assigning_id(&self, thread_id: &ThreadId) -> Option<(PipeHandle, u32)> {
        let mut tables = self.inner.lock();
        let handle = tables.pending.remove(thread_id)?;
        let pipe_id = loop {
            let candidate = tables.next_pipe_id;
            tables.next_pipe_id = tables.next_pipe_id.wrapping_add(1);
            if candidate != 0 && candidate & crate::wire::SLAVE_BIT == 0 {
                break candidate;
            }
        };
        handle.state.lock().pipe_id = pipe_id;
        tables.live.insert(pipe_id, handle.dupe());
        Some((handle, pipe_id))
    }

    /// Slave side of promotion: the master already assigned `pipe_id`; move
    /// the slave's own pending entry for `thread_id` into the live table
    /// under that id.
    pub fn promote_with_id(&self, thread_id: &ThreadId, pipe_id: u32) -> Option<PipeHandle> {
        let mut tables = self.inner.lock();
        let handle = tables.pending.remove(thread_id)?;
        handle.state.lock().pipe_id = pipe_id;
        tables.live.insert(pipe_id, handle.dupe());
        Some(handle)
    }

    /// §4.7 close-pipe: remove a live pipe from the table. The caller is
    /// responsible for draining its packets back to the pool; the table
    /// itself never touches the pool (leaf lock order).
    pub fn remove_live(&self, pipe_id: u32) -> Option<PipeHandle> {
        self.inner.lock().live.remove(&pipe_id)
    }

    /// Number of currently-live pipes. Exposed for tests.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }
}
