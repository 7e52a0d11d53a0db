//! Slave-role background task and public-API handlers.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `run` is the slave's "background packet-handling thread" (§2/§4.4),
//! mirroring `master.rs`'s shape: a single spawned `tokio` task that never
//! touches the socket concurrently with an application thread's own
//! `send_to` calls (`receive_packet`'s nudge, `open_pipe`'s bursts, and
//! `barrier`/`gather`'s retransmits all `send_to` directly, same as the
//! master's `send_packet`).

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::multiplexer::{FatalKind, Shared};
use crate::packet::Packet;
use crate::socket::as_socket_addr;
use crate::thread_id::ThreadId;
use crate::wire::{self, ControlMessage, Datagram};

const RECV_BUF_SIZE: usize = 65536;

async fn send_to_master(shared: &Shared, bytes: &[u8]) {
    let dest = as_socket_addr(shared.socket.master_addr);
    if let Err(e) = shared.socket.socket.send_to(bytes, dest).await {
        warn!(error = %e, "send_to master failed");
    }
}

async fn send_burst(shared: &Shared, bytes: &[u8]) {
    for _ in 0..shared.config.slave_message_burst_size.max(1) {
        send_to_master(shared, bytes).await;
    }
}

/// The slave's background task body: initial handshake, then the steady
/// state ping/receive loop (§4.4).
pub(crate) async fn run(shared: Arc<Shared>) {
    wait_for_connection(&shared).await;
    shared.mark_connected();
    debug!("connected to master");

    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let mut consecutive_timeouts = 0u32;
    loop {
        match tokio::time::timeout(
            shared.config.ping_timeout,
            shared.socket.socket.recv_from(&mut buf),
        )
        .await
        {
            Ok(Ok((len, _src))) => {
                consecutive_timeouts = 0;
                match wire::decode(&buf[..len]) {
                    Ok(datagram) => dispatch(&shared, datagram).await,
                    Err(e) => trace!(?e, "dropped malformed datagram"),
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "slave recv failed");
            }
            Err(_elapsed) => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= shared.config.max_ping_requests {
                    shared.report_fatal(FatalKind::Communication(consecutive_timeouts));
                    return;
                }
                let bytes = wire::encode_control(shared.node_index, true, &ControlMessage::Ping);
                send_burst(&shared, &bytes).await;
            }
        }
    }
}

/// §4.4 initial connection: send a CONNECTION burst, wait
/// `connectionWaitTimeout` for any decodable datagram from the master,
/// repeat indefinitely until one arrives.
async fn wait_for_connection(shared: &Shared) {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    loop {
        let bytes = wire::encode_control(shared.node_index, true, &ControlMessage::Connection);
        send_burst(shared, &bytes).await;
        let recv = tokio::time::timeout(
            shared.config.connection_wait_timeout,
            shared.socket.socket.recv_from(&mut buf),
        )
        .await;
        if let Ok(Ok((len, _src))) = recv {
            if let Ok(datagram) = wire::decode(&buf[..len]) {
                dispatch(shared, datagram).await;
                return;
            }
        }
    }
}

async fn dispatch(shared: &Shared, datagram: Datagram<'_>) {
    match datagram {
        Datagram::Stream {
            pipe_id,
            stream_pos,
            payload,
        } => handle_stream(shared, pipe_id, stream_pos, payload).await,
        Datagram::Control {
            from_slave: true, ..
        } => {
            // Slave->master traffic never reaches another slave; the
            // per-pipe unicast-to-master / multicast-from-master split
            // means this should not happen, but UDP may deliver anything.
        }
        Datagram::Control {
            from_slave: false,
            message,
            ..
        } => handle_control(shared, message).await,
    }
}

/// §4.10 stream packet handling.
async fn handle_stream(shared: &Shared, pipe_id: u32, stream_pos: u32, payload: &[u8]) {
    if pipe_id == 0 {
        return;
    }
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        trace!(pipe_id, "stream packet for unknown pipe");
        return;
    };

    let is_next = { handle.state.lock().stream_pos == stream_pos };
    if is_next {
        let mut packet = shared.pool.acquire();
        packet.fill(pipe_id, stream_pos, payload);
        let (became_nonempty, should_ack, new_stream_pos) = {
            let mut state = handle.state.lock();
            let became_nonempty = state.accept_in_order(packet);
            let should_ack = state.should_ack(shared.num_slaves.max(1) as u32);
            (became_nonempty, should_ack, state.stream_pos)
        };
        if became_nonempty {
            handle.receive_cond.notify_waiters();
        }
        if should_ack {
            let msg = ControlMessage::Acknowledgment {
                pipe_id,
                stream_pos: new_stream_pos,
                packet_pos: new_stream_pos,
            };
            let bytes = wire::encode_control(shared.node_index, true, &msg);
            send_to_master(shared, &bytes).await;
        }
        return;
    }

    let (is_future, already_loss_mode, expected) = {
        let state = handle.state.lock();
        (
            state.is_future_packet(stream_pos),
            state.packet_loss_mode,
            state.stream_pos,
        )
    };
    if !is_future {
        // Stale duplicate or replay of an already-delivered packet: the
        // master's resend will have raced our ack; simply discard.
        return;
    }
    if already_loss_mode {
        return;
    }
    handle.state.lock().packet_loss_mode = true;
    let msg = ControlMessage::PacketLoss {
        pipe_id,
        stream_pos: expected,
        packet_pos: stream_pos,
    };
    let bytes = wire::encode_control(shared.node_index, true, &msg);
    send_burst(shared, &bytes).await;
}

/// §4.4 control-message dispatch (`pipeId == 0`).
async fn handle_control(shared: &Shared, message: ControlMessage) {
    match message {
        ControlMessage::Connection => {
            shared.mark_connected();
        }
        ControlMessage::Ping => {}
        ControlMessage::CreatePipe1 { pipe_id, thread_id } => {
            if pipe_id != 0 && shared.table.lookup_live(pipe_id).is_none() {
                if let Some(handle) = shared.table.promote_with_id(&thread_id, pipe_id) {
                    let mut state = handle.state.lock();
                    state.barrier_id = 2;
                    state.seed_ack_counter(shared.node_index);
                    drop(state);
                    handle.barrier_cond.notify_waiters();
                }
            }
            if pipe_id != 0 {
                let msg = ControlMessage::CreatePipe2 { pipe_id };
                let bytes = wire::encode_control(shared.node_index, true, &msg);
                send_burst(shared, &bytes).await;
            }
        }
        ControlMessage::CreatePipe2 { .. }
        | ControlMessage::Acknowledgment { .. }
        | ControlMessage::PacketLoss { .. } => {
            // Slave->master-only message kinds; a conforming master never
            // sends these, but UDP may deliver garbage.
        }
        ControlMessage::Barrier {
            pipe_id,
            barrier_id,
        } => apply_collective_reply(shared, pipe_id, barrier_id, 0, false),
        ControlMessage::Gather {
            pipe_id,
            barrier_id,
            value,
        } => apply_collective_reply(shared, pipe_id, barrier_id, value, true),
    }
}

fn apply_collective_reply(
    shared: &Shared,
    pipe_id: u32,
    barrier_id: u32,
    value: u32,
    is_gather: bool,
) {
    let Some(handle) = shared.table.lookup_live(pipe_id) else {
        return;
    };
    let changed = {
        let mut state = handle.state.lock();
        if state.barrier_id < barrier_id {
            state.barrier_id = barrier_id;
            if is_gather {
                state.master_gather_value = value;
            }
            true
        } else {
            false
        }
    };
    if changed {
        handle.barrier_cond.notify_waiters();
    }
}

/// Slave side of open-pipe (§4.4/§4.6): loop sending `CREATEPIPE1` bursts
/// until the background task has promoted this thread id to a live pipe
/// with `barrier_id >= 2`.
pub(crate) async fn open_pipe(shared: &Arc<Shared>, thread_id: ThreadId) -> Result<u32> {
    let handle = shared.table.get_or_create_pending(thread_id.clone());
    loop {
        {
            let state = handle.state.lock();
            if state.pipe_id != 0 && state.barrier_id >= 2 {
                return Ok(state.pipe_id);
            }
        }
        let notified = handle.barrier_cond.notified();
        let msg = ControlMessage::CreatePipe1 {
            pipe_id: 0,
            thread_id: thread_id.clone(),
        };
        let bytes = wire::encode_control(shared.node_index, true, &msg);
        send_burst(shared, &bytes).await;
        let _ = tokio::time::timeout(shared.config.barrier_wait_timeout, notified).await;
    }
}

/// §4.10 packet receive path.
pub(crate) async fn receive_packet(shared: &Shared, pipe_id: u32) -> Result<Packet> {
    let handle = shared
        .table
        .lookup_live(pipe_id)
        .ok_or(Error::ClosedPipe(pipe_id))?;
    loop {
        let notified = handle.receive_cond.notified();
        if let Some(packet) = handle.state.lock().pop_delivered() {
            return Ok(packet);
        }
        if tokio::time::timeout(shared.config.receive_wait_timeout, notified)
            .await
            .is_err()
        {
            let stream_pos = handle.state.lock().stream_pos;
            let msg = ControlMessage::PacketLoss {
                pipe_id,
                stream_pos,
                packet_pos: stream_pos,
            };
            let bytes = wire::encode_control(shared.node_index, true, &msg);
            send_burst(shared, &bytes).await;
        }
    }
}

async fn collective(shared: &Shared, pipe_id: u32, value: u32, is_gather: bool) -> Result<u32> {
    let handle = shared
        .table
        .lookup_live(pipe_id)
        .ok_or(Error::ClosedPipe(pipe_id))?;
    let next = handle.state.lock().barrier_id + 1;
    loop {
        {
            let state = handle.state.lock();
            if state.barrier_id >= next {
                return Ok(state.master_gather_value);
            }
        }
        let notified = handle.barrier_cond.notified();
        let msg = if is_gather {
            ControlMessage::Gather {
                pipe_id,
                barrier_id: next,
                value,
            }
        } else {
            ControlMessage::Barrier {
                pipe_id,
                barrier_id: next,
            }
        };
        let bytes = wire::encode_control(shared.node_index, true, &msg);
        send_burst(shared, &bytes).await;
        let _ = tokio::time::timeout(shared.config.barrier_wait_timeout, notified).await;
    }
}

/// Slave side of a plain barrier (§4.8).
pub(crate) async fn barrier(shared: &Shared, pipe_id: u32) -> Result<()> {
    collective(shared, pipe_id, 0, false).await.map(|_| ())
}

/// Slave side of a gather (§4.8): contributes `value`, returns the
/// master-computed reduction.
pub(crate) async fn gather(shared: &Shared, pipe_id: u32, value: u32) -> Result<u32> {
    collective(shared, pipe_id, value, true).await
}
