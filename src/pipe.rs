//! Per-pipe state: send/receive windows, retransmission bookkeeping, and
//! barrier/gather counters.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `PipeState` is plain, synchronous data plus the mutations §4.5/§4.8/§4.9/
//! §4.10 describe; it never awaits anything. The two `Notify`s that replace
//! `receiveCond`/`barrierCond` live one level up, in [`PipeShared`], so that
//! signaling never requires holding the state mutex (`Notify::notify_one`/
//! `notify_waiters` are lock-free). `master.rs`/`slave.rs` lock
//! `PipeShared::state`, mutate, drop the guard, then notify — never the
//! other way around.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::gather::GatherOp;
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::thread_id::ThreadId;
use crate::wire;
use crate::wrapping;

/// Outcome of folding one participant's progress into the pipe's collective
/// state (§4.3 BARRIER/GATHER rows, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveStep {
    /// `barrier_id` already covers the requested round; the caller should
    /// resend the completion message (the requester missed it) using the
    /// stashed `value`/`is_gather` from when that round actually completed.
    AlreadyComplete {
        barrier_id: u32,
        value: u32,
        is_gather: bool,
    },
    /// Recorded; the round has not completed yet (either not every slave
    /// has reported in, or the master hasn't made its own local call yet).
    Recorded,
    /// The round just completed: every slave reported in *and* the master
    /// made its local call. `value` is the (possibly reduced) gather value;
    /// meaningless when `is_gather` is `false`.
    Completed {
        barrier_id: u32,
        value: u32,
        is_gather: bool,
    },
}

/// The per-pipe record described in spec §3. Fields not meaningful to the
/// current node's role (e.g. `head_stream_pos` on a slave) are simply
/// unused; keeping one type for both roles is what lets `table.rs` and the
/// wire dispatch loops stay role-agnostic.
#[derive(Debug)]
pub struct PipeState {
    /// `0` until stage 1 of creation completes.
    pub pipe_id: u32,
    /// Master: next byte position to assign. Slave: next byte position
    /// expected on receive.
    pub stream_pos: u32,
    /// Master only: oldest unacknowledged position still retained.
    pub head_stream_pos: u32,
    /// Master: retransmission window. Slave: delivery queue.
    pub packet_list: VecDeque<Packet>,
    /// Master only: per-slave offset of the latest acknowledged position
    /// from `head_stream_pos`.
    pub slave_stream_pos_offsets: Vec<u32>,
    /// Master only: count of slaves whose offset is still zero.
    pub num_head_slaves: u32,
    /// Slave only: suppresses duplicate loss reports until the gap fills.
    pub packet_loss_mode: bool,
    /// Monotonically increasing; counts completed collectives on this pipe.
    pub barrier_id: u32,
    /// Master only: highest collective number each slave has confirmed.
    pub slave_barrier_ids: Vec<u32>,
    /// Master only: `min(slave_barrier_ids)`, cached for convenience.
    pub min_slave_barrier_id: u32,
    /// Staging for the current gather: each slave's contributed value.
    pub slave_gather_values: Vec<u32>,
    /// Staging for the current gather: the master's own contributed value.
    pub master_gather_value: u32,
    /// Opener's identity, retained after promotion from the pending table
    /// for diagnostics; not required once the pipe is live.
    pub thread_id: Option<ThreadId>,
    /// Master only: which slaves have sent `CREATEPIPE1` for this pipe.
    pub stage1_acks: Vec<bool>,
    /// Master only: which slaves have sent `CREATEPIPE2` for this pipe.
    pub stage2_acks: Vec<bool>,
    /// Round-robin counter for the slave's "every Nth packet" ack policy.
    pub ack_counter: u32,
    /// Master only: the round number the master's own application thread
    /// has called `barrier`/`gather` for. A round only completes once this
    /// reaches `barrier_id + 1` *and* every slave has too — the master's
    /// own participation is a local call, never a wire message.
    pub local_armed_next: u32,
    /// Master only: reduction to apply once the current gather round
    /// completes, set by the local `gather()` call. `None` for a plain
    /// barrier (no reduction needed) or if no node has called `gather` yet
    /// for this round.
    pub pending_gather_op: Option<GatherOp>,
    /// Master only: whether the most recently completed round was a
    /// `gather` (vs. a plain `barrier`) — determines which wire message a
    /// replayed completion (`CollectiveStep::AlreadyComplete`) should use.
    pub last_round_was_gather: bool,
}

impl PipeState {
    /// A freshly allocated, unnamed `PipeState` (`pipe_id == 0`), as created
    /// by the first node to call open-pipe for a thread identity.
    #[must_use]
    pub fn new(num_slaves: usize) -> Self {
        Self {
            pipe_id: 0,
            stream_pos: 0,
            head_stream_pos: 0,
            packet_list: VecDeque::new(),
            slave_stream_pos_offsets: vec![0; num_slaves],
            num_head_slaves: num_slaves as u32,
            packet_loss_mode: false,
            barrier_id: 0,
            slave_barrier_ids: vec![0; num_slaves],
            min_slave_barrier_id: 0,
            slave_gather_values: vec![0; num_slaves],
            master_gather_value: 0,
            thread_id: None,
            stage1_acks: vec![false; num_slaves],
            stage2_acks: vec![false; num_slaves],
            ack_counter: 0,
            local_armed_next: 0,
            pending_gather_op: None,
            last_round_was_gather: false,
        }
    }

    /// Invariant 4: `send` blocks while this holds.
    #[must_use]
    pub fn send_window_full(&self, send_buffer_size: usize) -> bool {
        self.packet_list.len() >= send_buffer_size
    }

    /// §4.9 steps 2: stamp a fresh packet with `pipe_id`/`stream_pos`,
    /// append it to the retransmission window, and return the encoded wire
    /// datagram for the caller to `send_to` *after* releasing the state
    /// lock (step 3). The caller must already hold the state mutex and
    /// must already have checked [`PipeState::send_window_full`].
    pub fn stamp_and_enqueue(&mut self, payload: &[u8], pool: &PacketPool) -> Vec<u8> {
        let stream_pos = self.stream_pos;
        let mut packet = pool.acquire();
        packet.fill(self.pipe_id, stream_pos, payload);
        let wire = wire::encode_stream(self.pipe_id, stream_pos, packet.payload());
        self.stream_pos = self.stream_pos.wrapping_add(payload.len() as u32);
        self.packet_list.push_back(packet);
        wire
    }

    /// §4.10: accept an in-order stream packet on a slave: append it to the
    /// delivery queue and advance `stream_pos` past it. `packet` must
    /// already be stamped with `stream_pos == self.stream_pos` (the caller
    /// checked this via [`PipeState::is_future_packet`] returning `false`
    /// and the position not being stale). Returns `true` if the queue
    /// transitioned from empty (caller should notify `receive_cond`).
    #[must_use]
    pub fn accept_in_order(&mut self, packet: Packet) -> bool {
        debug_assert_eq!(packet.stream_pos(), self.stream_pos);
        let was_empty = self.packet_list.is_empty();
        self.packet_loss_mode = false;
        self.stream_pos = self.stream_pos.wrapping_add(packet.len() as u32);
        self.packet_list.push_back(packet);
        was_empty
    }

    /// Pop the oldest delivered packet for the application to consume.
    /// `None` while the delivery queue is empty (caller should wait on
    /// `receive_cond`).
    pub fn pop_delivered(&mut self) -> Option<Packet> {
        self.packet_list.pop_front()
    }

    /// §4.10: whether this in-order delivery is the Nth one that should
    /// trigger an aggregated `ACKNOWLEDGMENT`.
    pub fn should_ack(&mut self, every: u32) -> bool {
        self.ack_counter = self.ack_counter.wrapping_add(1);
        every > 0 && self.ack_counter % every == 0
    }

    /// Phase this slave's ack counter by its node index, so that the N
    /// slaves of a pipe ack on staggered packets (`N`, `2N`, … offset by
    /// each slave's index) instead of all acking the same ones. Called
    /// once, when the pipe is promoted to live on the slave side.
    pub fn seed_ack_counter(&mut self, node_index: u32) {
        self.ack_counter = node_index.wrapping_sub(1);
    }

    /// §4.10: whether an arriving packet is ahead of what's expected
    /// (signals loss) rather than a stale duplicate.
    #[must_use]
    pub fn is_future_packet(&self, arrived_stream_pos: u32) -> bool {
        wrapping::is_ahead(arrived_stream_pos, self.stream_pos)
    }

    /// §4.5: apply a positive ack (or the ack-equivalent prefix of a
    /// `PACKETLOSS` report) from `slave`. Returns `true` if the send window
    /// advanced (caller should notify `receive_cond`), discarding packets
    /// back to `pool` in one bulk push.
    pub fn apply_ack(&mut self, slave: usize, pos: u32, pool: &PacketPool) -> bool {
        let offset = wrapping::distance(self.head_stream_pos, pos);
        if offset == 0 {
            return false;
        }
        if self.slave_stream_pos_offsets[slave] == 0 {
            self.num_head_slaves -= 1;
        }
        self.slave_stream_pos_offsets[slave] = offset;
        if self.num_head_slaves != 0 {
            return false;
        }
        let advance = self.slave_stream_pos_offsets.iter().copied().min().unwrap_or(0);
        if advance == 0 {
            return false;
        }
        let mut discarded_bytes = 0u32;
        let mut discarded = Vec::new();
        while let Some(front) = self.packet_list.front() {
            let front_len = front.len() as u32;
            if discarded_bytes + front_len > advance {
                break;
            }
            discarded_bytes += front_len;
            discarded.push(self.packet_list.pop_front().unwrap());
        }
        pool.release_all(discarded);
        self.head_stream_pos = self.head_stream_pos.wrapping_add(discarded_bytes);
        for offset in &mut self.slave_stream_pos_offsets {
            *offset -= discarded_bytes;
            if *offset == 0 {
                self.num_head_slaves += 1;
            }
        }
        true
    }

    /// §4.3 `PACKETLOSS` row: `true` if `requested` names a position the
    /// master has already discarded — the fatal condition from §7.
    #[must_use]
    pub fn is_fatal_loss_request(&self, requested: u32) -> bool {
        wrapping::is_ahead(self.head_stream_pos, requested)
    }

    /// Packets in the retransmission window at or after `from`, in order,
    /// for resending on a `PACKETLOSS` report.
    pub fn resend_from(&self, from: u32) -> impl Iterator<Item = &Packet> {
        self.packet_list
            .iter()
            .filter(move |p| !wrapping::is_ahead(from, p.stream_pos()))
    }

    /// §4.3 BARRIER/GATHER rows: record slave `slave`'s request to reach
    /// round `next`, and `value` (its gather contribution, `0` and ignored
    /// for a plain barrier).
    fn record_slave_progress(&mut self, slave: usize, next: u32, value: u32) {
        if next > self.slave_barrier_ids[slave] {
            self.slave_barrier_ids[slave] = next;
        }
        self.slave_gather_values[slave] = value;
        self.min_slave_barrier_id = self.slave_barrier_ids.iter().copied().min().unwrap_or(0);
    }

    /// The master's own application thread arming the pipe for round
    /// `next` via its local `barrier`/`gather` call. Must be called before
    /// [`PipeState::try_complete`] can consider the round done.
    pub fn arm_local(&mut self, next: u32, value: u32, op: Option<GatherOp>) {
        self.local_armed_next = next;
        self.master_gather_value = value;
        self.pending_gather_op = op;
    }

    /// If every slave has reached `barrier_id + 1` *and* the master has
    /// locally armed for that same round, advance `barrier_id`, compute the
    /// gather reduction (if any), reset flow control (§4.8), and return the
    /// round's value. Otherwise leaves everything unchanged and returns
    /// `None`.
    pub fn try_complete(&mut self, pool: &PacketPool) -> Option<(u32, bool)> {
        let next = self.barrier_id + 1;
        if self.min_slave_barrier_id < next || self.local_armed_next < next {
            return None;
        }
        self.barrier_id = next;
        let is_gather = self.pending_gather_op.is_some();
        let reduced = match self.pending_gather_op.take() {
            Some(op) => op.reduce(
                std::iter::once(self.master_gather_value)
                    .chain(self.slave_gather_values.iter().copied()),
            ),
            None => self.master_gather_value,
        };
        self.master_gather_value = reduced;
        self.last_round_was_gather = is_gather;
        self.reset_flow_control(pool);
        Some((reduced, is_gather))
    }

    /// Fold one slave's BARRIER/GATHER message into this pipe's collective
    /// state and report what the caller should do next.
    pub fn collective_step(
        &mut self,
        slave: usize,
        requested: u32,
        value: u32,
        pool: &PacketPool,
    ) -> CollectiveStep {
        if self.barrier_id >= requested {
            return CollectiveStep::AlreadyComplete {
                barrier_id: self.barrier_id,
                value: self.master_gather_value,
                is_gather: self.last_round_was_gather,
            };
        }
        self.record_slave_progress(slave, requested, value);
        match self.try_complete(pool) {
            Some((value, is_gather)) => CollectiveStep::Completed {
                barrier_id: self.barrier_id,
                value,
                is_gather,
            },
            None => CollectiveStep::Recorded,
        }
    }

    /// §4.8 master side: "a barrier therefore doubles as an implicit
    /// checkpoint for flow control" — reset the send window entirely,
    /// returning every retained packet to `pool`.
    fn reset_flow_control(&mut self, pool: &PacketPool) {
        pool.release_all(self.packet_list.drain(..));
        self.head_stream_pos = self.stream_pos;
        let n = self.slave_stream_pos_offsets.len();
        self.slave_stream_pos_offsets = vec![0; n];
        self.num_head_slaves = n as u32;
    }

    /// §4.7 close-pipe: drain the retransmission/delivery queue back to the
    /// pool.
    pub fn drain_to_pool(&mut self, pool: &PacketPool) {
        pool.release_all(self.packet_list.drain(..));
    }
}

/// A `PipeState` plus the two condition-variable-equivalent
/// [`tokio::sync::Notify`]s from spec §3/§5. Always held behind an `Arc` so
/// table lookups can hand out cheap clones instead of holding the table
/// lock across the pipe operation (§4.2's scoped-lookup discipline).
pub struct PipeShared {
    /// The mutex-guarded state itself (`stateMutex` in spec §3).
    pub state: Mutex<PipeState>,
    /// Signaled when `packet_list` transitions from empty (slave) or from
    /// full (master); replaces `receiveCond`.
    pub receive_cond: Notify,
    /// Signaled when `barrier_id` advances; replaces `barrierCond`.
    pub barrier_cond: Notify,
    /// Signaled once the initial handshake completes; only the `[1, N]`
    /// pseudo-pipe (pipe id 0 is never live) and `Multiplexer` itself use
    /// this, but it is convenient to park it next to the other two.
    pub connection_cond: Notify,
    /// Fixed slave count this pipe was created under.
    pub num_slaves: usize,
}

impl PipeShared {
    /// Wrap a freshly allocated [`PipeState`].
    #[must_use]
    pub fn new(num_slaves: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState::new(num_slaves)),
            receive_cond: Notify::new(),
            barrier_cond: Notify::new(),
            connection_cond: Notify::new(),
            num_slaves,
        })
    }
}

impl std::fmt::Debug for PipeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeShared")
            .field("num_slaves", &self.num_slaves)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_path_advances_stream_pos_and_retains_packet() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.pipe_id = 7;
        let wire = state.stamp_and_enqueue(b"hello", &pool);
        assert_eq!(state.stream_pos, 5);
        assert_eq!(state.packet_list.len(), 1);
        match wire::decode(&wire).unwrap() {
            wire::Datagram::Stream {
                pipe_id,
                stream_pos,
                payload,
            } => {
                assert_eq!(pipe_id, 7);
                assert_eq!(stream_pos, 0);
                assert_eq!(payload, b"hello");
            }
            other => panic!("expected Stream, got {other:?}"),
        }
    }

    #[test]
    fn seeded_ack_counters_stagger_across_slaves() {
        // §4.10: round-robin across slaves, seeded from each slave's own
        // node_index so the N slaves of a pipe don't all ack the same
        // packets.
        let mut slave1 = PipeState::new(2);
        slave1.seed_ack_counter(1);
        let mut slave2 = PipeState::new(2);
        slave2.seed_ack_counter(2);

        let acks1: Vec<bool> = (0..6).map(|_| slave1.should_ack(3)).collect();
        let acks2: Vec<bool> = (0..6).map(|_| slave2.should_ack(3)).collect();

        assert_eq!(acks1, [false, false, true, false, false, true]);
        assert_eq!(acks2, [false, true, false, false, true, false]);
    }

    #[test]
    fn ack_does_not_advance_head_until_every_slave_passes_it() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(2);
        state.pipe_id = 1;
        state.stamp_and_enqueue(b"aaaaa", &pool); // stream_pos 0..5
        state.stamp_and_enqueue(b"bbbbb", &pool); // stream_pos 5..10

        assert!(!state.apply_ack(0, 10, &pool));
        assert_eq!(state.head_stream_pos, 0);
        assert_eq!(state.packet_list.len(), 2);

        assert!(state.apply_ack(1, 10, &pool));
        assert_eq!(state.head_stream_pos, 10);
        assert_eq!(state.packet_list.len(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn partial_ack_discards_only_whole_packets() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.pipe_id = 1;
        state.stamp_and_enqueue(b"aaaaa", &pool); // 0..5
        state.stamp_and_enqueue(b"bbbbb", &pool); // 5..10

        assert!(state.apply_ack(0, 5, &pool));
        assert_eq!(state.head_stream_pos, 5);
        assert_eq!(state.packet_list.len(), 1);
        assert_eq!(state.packet_list.front().unwrap().stream_pos(), 5);
    }

    #[test]
    fn fatal_loss_detected_below_head() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.pipe_id = 1;
        state.stamp_and_enqueue(b"aaaaa", &pool);
        state.stamp_and_enqueue(b"bbbbb", &pool);
        state.apply_ack(0, 10, &pool);
        assert_eq!(state.head_stream_pos, 10);
        assert!(state.is_fatal_loss_request(5));
        assert!(!state.is_fatal_loss_request(10));
    }

    #[test]
    fn barrier_completes_only_once_every_slave_reports_and_master_arms() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(2);
        state.arm_local(1, 0, None);
        assert_eq!(
            state.collective_step(0, 1, 0, &pool),
            CollectiveStep::Recorded
        );
        assert_eq!(state.barrier_id, 0);
        match state.collective_step(1, 1, 0, &pool) {
            CollectiveStep::Completed { barrier_id, .. } => assert_eq!(barrier_id, 1),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(state.barrier_id, 1);
    }

    #[test]
    fn barrier_does_not_complete_until_master_arms_locally() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(2);
        assert_eq!(
            state.collective_step(0, 1, 0, &pool),
            CollectiveStep::Recorded
        );
        assert_eq!(
            state.collective_step(1, 1, 0, &pool),
            CollectiveStep::Recorded
        );
        assert_eq!(state.barrier_id, 0);
        state.arm_local(1, 0, None);
        assert_eq!(state.try_complete(&pool), Some((0, false)));
        assert_eq!(state.barrier_id, 1);
    }

    #[test]
    fn barrier_resets_flow_control() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.pipe_id = 1;
        state.stamp_and_enqueue(b"aaaaa", &pool);
        state.arm_local(1, 0, None);
        state.collective_step(0, 1, 0, &pool);
        assert_eq!(state.head_stream_pos, state.stream_pos);
        assert_eq!(state.packet_list.len(), 0);
        assert_eq!(state.num_head_slaves, 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn already_complete_barrier_is_reported_for_resend() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.arm_local(1, 0, None);
        state.collective_step(0, 1, 0, &pool);
        assert_eq!(
            state.collective_step(0, 1, 0, &pool),
            CollectiveStep::AlreadyComplete {
                barrier_id: 1,
                value: 0,
                is_gather: false,
            }
        );
    }

    #[test]
    fn gather_reduces_master_and_slave_values() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(2);
        state.arm_local(1, 7, Some(GatherOp::Max));
        assert_eq!(
            state.collective_step(0, 1, 4, &pool),
            CollectiveStep::Recorded
        );
        match state.collective_step(1, 1, 11, &pool) {
            CollectiveStep::Completed { value, .. } => assert_eq!(value, 11),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn accept_in_order_enqueues_and_advances() {
        let pool = PacketPool::new();
        let mut state = PipeState::new(1);
        state.pipe_id = 1;
        let mut packet = pool.acquire();
        packet.fill(1, 0, b"hello");
        state.packet_loss_mode = true;
        assert!(state.accept_in_order(packet));
        assert!(!state.packet_loss_mode);
        assert_eq!(state.stream_pos, 5);
        assert_eq!(state.packet_list.len(), 1);
        let popped = state.pop_delivered().unwrap();
        assert_eq!(popped.payload(), b"hello");
        assert!(state.pop_delivered().is_none());
    }

    #[test]
    fn future_packet_signals_loss() {
        let state = PipeState::new(1);
        assert!(state.is_future_packet(100));
        assert!(!state.is_future_packet(0));
    }
}
