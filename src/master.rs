//! Master-role background task and public-API handlers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `run` is the master's "background packet-handling thread" (§2/§4.3)
//! realized as a single spawned `tokio` task. It never touches the socket
//! concurrently with anything else on the master side — `send_packet`'s
//! caller does its own `send_to`, which is safe because the OS, not a
//! user-space lock, serializes concurrent `sendto`s on one file descriptor
//! (§5 "Shared resources").

use std::net::SocketAddr;

use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::gather::GatherOp;
use crate::multiplexer::{FatalKind, Shared};
use crate::pipe::CollectiveStep;
use crate::socket::as_socket_addr;
use crate::thread_id::ThreadId;
use crate::wire::{self, ControlMessage, Datagram};

const RECV_BUF_SIZE: usize = 65536;

async fn send_to_group(shared: &Shared, bytes: &[u8]) {
    let dest: SocketAddr = as_socket_addr(shared.socket.slave_group_addr);
    if let Err(e) = shared.socket.socket.send_to(bytes, dest).await {
        warn!(error = %e, "send_to slave group failed");
    }
}

async fn send_burst(shared: &Shared, bytes: &[u8]) {
    for _ in 0..shared.config.master_message_burst_size.max(1) {
        send_to_group(shared, bytes).await;
    }
}

fn slave_index(node_index: u32, num_slaves: usize) -> Option<usize> {
    if node_index == 0 {
        return None;
    }
    let idx = (node_index - 1) as usize;
    (idx < num_slaves).then_some(idx)
}

/// The master's background task body: initial handshake, then the steady
/// state dispatch loop (§4.3).
pub(crate) async fn run(shared: std::sync::Arc<Shared>) {
    wait_for_all_connections(&shared).await;
    shared.mark_connected();
    debug!("all slaves connected");

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let (len, _src) = match shared.socket.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "master recv failed");
                continue;
            }
        };
        match wire::decode(&buf[..len]) {
            Ok(datagram) => dispatch(&shared, datagram).await,
            Err(e) => trace!(?e, "dropped malformed datagram"),
        }
    }
}

#[instrument(skip(shared), level = "debug")]
async fn wait_for_all_connections(shared: &Shared) {
    let mut seen = vec![false; shared.num_slaves];
    let mut remaining = shared.num_slaves;
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    while remaining > 0 {
        let (len, _src) = match shared.socket.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "recv failed during handshake");
                continue;
            }
        };
        if let Ok(Datagram::Control {
            node_index,
            from_slave: true,
            message: ControlMessage::Connection,
        }) = wire::decode(&buf[..len])
        {
            if let Some(idx) = slave_index(node_index, shared.num_slaves) {
                if !seen[idx] {
                    seen[idx] = true;
                    remaining -= 1;
                }
            }
        }
    }
    let bytes = wire::encode_control(0, false, &ControlMessage::Connection);
    send_burst(shared, &bytes).await;
}

async fn dispatch(shared: &Shared, datagram: Datagram<'_>) {
    let Datagram::Control {
        node_index,
        from_slave,
        message,
    } = datagram
    else {
        trace!("master received a stream packet; ignoring");
        return;
    };
    if !from_slave {
        // Our own broadcast, looped back by the multicast layer.
        return;
    }
    let Some(slave) = slave_index(node_index, shared.num_slaves) else {
        trace!(node_index, "control message from out-of-range node index");
        return;
    };
    match message {
        ControlMessage::Connection => {
            let bytes = wire::encode_control(0, false, &ControlMessage::Connection);
            send_burst(shared, &bytes).await;
        }
        ControlMessage::Ping => {
            let bytes = wire::encode_control(0, false, &ControlMessage::Ping);
            send_burst(shared, &bytes).await;
        }
        ControlMessage::CreatePipe1 { thread_id, .. } => {
            handle_create_pipe1(shared, slave, thread_id).await;
        }
        ControlMessage::CreatePipe2 { pipe_id } => {
            handle_create_pipe2(shared, slave, pipe_id);
        }
        ControlMessage::Acknowledgment {
            pipe_id, stream_pos, ..
        } => handle_ack(shared, slave, pipe_id, stream_pos),
        ControlMessage::PacketLoss {
            pipe_id, stream_pos, ..
        } => handle_packet_loss(shared, slave, pipe_id, stream_pos).await,
        ControlMessage::Barrier {
            pipe_id,
            barrier_id,
        } => handle_collective(shared, slave, pipe_id, barrier_id, 0).await,
        ControlMessage::Gather {
            pipe_id,
            barrier_id,
            value,
        } => handle_collective(shared, slave, pipe_id, barrier_id, value).await,
    }
}

async fn handle_create_pipe1(shared: &Shared, slave: usize, thread_id: ThreadId) {
    let handle = shared.table.get_or_create_pending(thread_id.clone());
    let already_assigned = {
        let state = handle.state.lock();
        (state.pipe_id != 0).then_some(state.pipe_id)
    };
    let pipe_id = if let Some(id) = already_assigned {
        id
    } else {
        let ready = {
            let mut state = handle.state.lock();
            state.stage1_acks[slave] = true;
            state.stage1_acks.iter().all(|&acked| acked)
        };
        if !ready {
            return;
        }
        let Some((promoted, id)) = shared.table.promote_assigning_id(&thread_id) else {
            return;
        };
        promoted.state.lock().barrier_id = 1;
        promoted.barrier_cond.notify_waiters();
        id
    };
    let msg = ControlMessage::CreatePipe1 { pipe_id, thread_id };
    let bytes = wire::encode_control(0, false, &msg);
    send_burst(shared, &bytes).await;
}

fn handle_create_pipe2(shared: &Shared, slave: usize, pipe_id: u32) {
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        return;
    };
    let completed = {
        let mut state = handle.state.lock();
        state.stage2_acks[slave] = true;
        if state.barrier_id < 2 && state.stage2_acks.iter().all(|&acked| acked) {
            state.barrier_id = 2;
            true
        } else {
            false
        }
    };
    if completed {
        handle.barrier_cond.notify_waiters();
    }
}

fn handle_ack(shared: &Shared, slave: usize, pipe_id: u32, stream_pos: u32) {
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        return;
    };
    let advanced = handle.state.lock().apply_ack(slave, stream_pos, &shared.pool);
    if advanced {
        handle.receive_cond.notify_waiters();
    }
}

async fn handle_packet_loss(shared: &Shared, slave: usize, pipe_id: u32, stream_pos: u32) {
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        return;
    };
    let fatal_head = {
        let state = handle.state.lock();
        state
            .is_fatal_loss_request(stream_pos)
            .then_some(state.head_stream_pos)
    };
    if let Some(head) = fatal_head {
        shared.report_fatal(FatalKind::FatalPacketLoss {
            pipe_id,
            requested: stream_pos,
            head,
        });
        return;
    }

    let advanced = handle.state.lock().apply_ack(slave, stream_pos, &shared.pool);
    if advanced {
        handle.receive_cond.notify_waiters();
    }

    let to_resend: Vec<Vec<u8>> = {
        let state = handle.state.lock();
        state
            .resend_from(stream_pos)
            .map(|p| wire::encode_stream(p.pipe_id(), p.stream_pos(), p.payload()))
            .collect()
    };
    for bytes in to_resend {
        send_to_group(shared, &bytes).await;
    }
}

async fn handle_collective(shared: &Shared, slave: usize, pipe_id: u32, requested: u32, value: u32) {
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        return;
    };
    let step = handle
        .state
        .lock()
        .collective_step(slave, requested, value, &shared.pool);
    match step {
        CollectiveStep::Recorded => {}
        CollectiveStep::AlreadyComplete {
            barrier_id,
            value,
            is_gather,
        } => {
            send_completion(shared, pipe_id, barrier_id, value, is_gather).await;
        }
        CollectiveStep::Completed {
            barrier_id,
            value,
            is_gather,
        } => {
            handle.barrier_cond.notify_waiters();
            handle.receive_cond.notify_waiters();
            send_completion(shared, pipe_id, barrier_id, value, is_gather).await;
        }
    }
}

async fn send_completion(shared: &Shared, pipe_id: u32, barrier_id: u32, value: u32, is_gather: bool) {
    let msg = if is_gather {
        ControlMessage::Gather {
            pipe_id,
            barrier_id,
            value,
        }
    } else {
        ControlMessage::Barrier {
            pipe_id,
            barrier_id,
        }
    };
    let bytes = wire::encode_control(0, false, &msg);
    send_to_group(shared, &bytes).await;
}

/// Master side of open-pipe (§4.6): the application thread waits for the
/// two-stage handshake the dispatch loop drives to completion.
pub(crate) async fn open_pipe(shared: &std::sync::Arc<Shared>, thread_id: ThreadId) -> Result<u32> {
    let handle = shared.table.get_or_create_pending(thread_id);
    loop {
        let notified = handle.barrier_cond.notified();
        {
            let state = handle.state.lock();
            if state.pipe_id != 0 && state.barrier_id >= 2 {
                return Ok(state.pipe_id);
            }
        }
        let _ = tokio::time::timeout(shared.config.barrier_wait_timeout, notified).await;
    }
}

/// §4.9 packet send path.
pub(crate) async fn send_packet(shared: &Shared, pipe_id: u32, payload: &[u8]) -> Result<()> {
    let handle = shared
        .table
        .lookup_live(pipe_id)
        .ok_or(Error::ClosedPipe(pipe_id))?;
    let wire_bytes = loop {
        let notified = handle.receive_cond.notified();
        {
            let mut state = handle.state.lock();
            if !state.send_window_full(shared.config.send_buffer_size) {
                break state.stamp_and_enqueue(payload, &shared.pool);
            }
        }
        notified.await;
    };
    send_to_group(shared, &wire_bytes).await;
    Ok(())
}

/// Master side of a barrier or gather (§4.8): arm the pipe's collective
/// state for the master's own local call, then wait for the round every
/// slave has already reported in for (or complete it immediately if they
/// already have). `op` is `None` for a plain barrier.
async fn local_collective(
    shared: &std::sync::Arc<Shared>,
    pipe_id: u32,
    value: u32,
    op: Option<GatherOp>,
) -> Result<u32> {
    let handle = shared
        .table
        .lookup_live(pipe_id)
        .ok_or(Error::ClosedPipe(pipe_id))?;
    let next = {
        let mut state = handle.state.lock();
        let next = state.barrier_id + 1;
        state.arm_local(next, value, op);
        next
    };
    // The arming above may have just satisfied a round every slave had
    // already reported for; check immediately before waiting.
    {
        let mut state = handle.state.lock();
        if let Some((reduced, is_gather)) = state.try_complete(&shared.pool) {
            drop(state);
            handle.barrier_cond.notify_waiters();
            handle.receive_cond.notify_waiters();
            send_completion(shared, pipe_id, next, reduced, is_gather).await;
            return Ok(reduced);
        }
    }
    loop {
        let notified = handle.barrier_cond.notified();
        {
            let state = handle.state.lock();
            if state.barrier_id >= next {
                return Ok(state.master_gather_value);
            }
        }
        notified.await;
    }
}

/// Master side of a plain barrier (§4.8).
pub(crate) async fn barrier(shared: &std::sync::Arc<Shared>, pipe_id: u32) -> Result<()> {
    local_collective(shared, pipe_id, 0, None).await.map(|_| ())
}

/// Master side of a gather (§4.8).
pub(crate) async fn gather(
    shared: &std::sync::Arc<Shared>,
    pipe_id: u32,
    value: u32,
    op: GatherOp,
) -> Result<u32> {
    local_collective(shared, pipe_id, value, Some(op)).await
}
