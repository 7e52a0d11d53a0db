//! The top-level `Multiplexer` object and its public API.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::Config;
use crate::dupe::Dupe;
use crate::error::{Error, Result};
use crate::gather::GatherOp;
use crate::master;
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::slave;
use crate::socket::ClusterSocket;
use crate::table::PipeTable;
use crate::thread_id::ThreadId;

/// The single asynchronous fatal condition the core can raise against a
/// running `Multiplexer`, carried over a `watch` channel since `Error`
/// itself isn't `Clone` (it wraps `std::io::Error`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalKind {
    /// Slave: `max_ping_requests` consecutive silent intervals.
    Communication(u32),
    /// Master: a resend was requested for a position already discarded.
    FatalPacketLoss {
        /// Pipe on which the loss occurred.
        pipe_id: u32,
        /// Stream position the peer asked to have resent.
        requested: u32,
        /// Oldest retained stream position.
        head: u32,
    },
}

impl From<FatalKind> for Error {
    fn from(kind: FatalKind) -> Self {
        match kind {
            FatalKind::Communication(n) => Error::Communication(n),
            FatalKind::FatalPacketLoss {
                pipe_id,
                requested,
                head,
            } => Error::FatalPacketLoss {
                pipe_id,
                requested,
                head,
            },
        }
    }
}

/// Shared state reachable from both the background receive task and every
/// application-facing `Multiplexer` handle. Application threads never touch
/// the socket directly; all sends go through it, protected only by the OS
/// (§5: "`sendto` and `recv` are thread-safe at the OS level").
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) num_slaves: usize,
    pub(crate) node_index: u32,
    pub(crate) table: PipeTable,
    pub(crate) pool: PacketPool,
    pub(crate) socket: ClusterSocket,
    pub(crate) connected_flag: AtomicBool,
    pub(crate) connected: tokio::sync::Notify,
    pub(crate) fatal: watch::Sender<Option<FatalKind>>,
}

impl Shared {
    pub(crate) fn mark_connected(&self) {
        self.connected_flag.store(true, Ordering::Release);
        self.connected.notify_waiters();
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected_flag.load(Ordering::Acquire)
    }

    pub(crate) fn report_fatal(&self, kind: FatalKind) {
        let _ = self.fatal.send(Some(kind));
    }
}

/// The reliable multi-pipe multicast transport. One instance per process;
/// cheap to clone (an `Arc` bump) since every application thread needs its
/// own handle to call the public API concurrently.
#[derive(Clone)]
pub struct Multiplexer {
    pub(crate) shared: Arc<Shared>,
    task: Arc<JoinHandle<()>>,
    fatal_rx: watch::Receiver<Option<FatalKind>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("node_index", &self.shared.node_index)
            .field("num_slaves", &self.shared.num_slaves)
            .field("connected", &self.shared.is_connected())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Construct the multiplexer: resolve addresses, bind the socket,
    /// configure multicast/broadcast, and spawn the background
    /// packet-handling task. `node_index == 0` is the master; `[1,
    /// num_slaves]` are the slaves.
    #[instrument(skip(config), level = "debug")]
    pub async fn new(
        num_slaves: usize,
        node_index: u32,
        master_host: &str,
        master_port: u16,
        slave_group: &str,
        slave_port: u16,
        config: Config,
    ) -> Result<Self> {
        let config = config.clamped();
        let is_master = node_index == 0;
        let socket =
            ClusterSocket::new(master_host, master_port, slave_group, slave_port, is_master)
                .await?;

        let (fatal_tx, fatal_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            config,
            num_slaves,
            node_index,
            table: PipeTable::new(num_slaves),
            pool: PacketPool::new(),
            socket,
            connected_flag: AtomicBool::new(false),
            connected: tokio::sync::Notify::new(),
            fatal: fatal_tx,
        });

        let task_shared = shared.dupe();
        let task = if is_master {
            tokio::spawn(async move { master::run(task_shared).await })
        } else {
            tokio::spawn(async move { slave::run(task_shared).await })
        };

        Ok(Self {
            shared,
            task: Arc::new(task),
            fatal_rx,
        })
    }

    /// Block until the initial connection handshake completes (§4.3/§4.4).
    pub async fn wait_for_connection(&self) {
        loop {
            let notified = self.shared.connected.notified();
            if self.shared.is_connected() {
                return;
            }
            notified.await;
        }
    }

    /// Open a new pipe, or join one already opened under the same
    /// `thread_id` by another node. Returns the cluster-wide pipe id, the
    /// same on every node once all three stages complete.
    #[instrument(skip(self), level = "debug")]
    pub async fn open_pipe(&self, thread_id: ThreadId) -> Result<u32> {
        if self.shared.node_index == 0 {
            master::open_pipe(&self.shared, thread_id).await
        } else {
            slave::open_pipe(&self.shared, thread_id).await
        }
    }

    /// §4.7 close-pipe: barrier, then remove from the live table and
    /// return retained packets to the pool.
    pub async fn close_pipe(&self, pipe_id: u32) -> Result<()> {
        self.barrier(pipe_id).await?;
        let handle = self
            .shared
            .table
            .remove_live(pipe_id)
            .ok_or(Error::ClosedPipe(pipe_id))?;
        handle.state.lock().drain_to_pool(&self.shared.pool);
        Ok(())
    }

    /// Master only: send `payload` on `pipe_id`, blocking while the send
    /// window is full (§4.9).
    pub async fn send_packet(&self, pipe_id: u32, payload: &[u8]) -> Result<()> {
        master::send_packet(&self.shared, pipe_id, payload).await
    }

    /// Slave only: receive the next in-order packet on `pipe_id`, blocking
    /// while the delivery queue is empty (§4.10).
    pub async fn receive_packet(&self, pipe_id: u32) -> Result<Packet> {
        slave::receive_packet(&self.shared, pipe_id).await
    }

    /// Cluster-wide barrier on `pipe_id` (§4.8).
    pub async fn barrier(&self, pipe_id: u32) -> Result<()> {
        if self.shared.node_index == 0 {
            master::barrier(&self.shared, pipe_id).await
        } else {
            slave::barrier(&self.shared, pipe_id).await
        }
    }

    /// Cluster-wide gather on `pipe_id`: every node contributes `value`;
    /// every node receives `op` applied across the master's value and every
    /// slave's value (§4.8).
    pub async fn gather(&self, pipe_id: u32, value: u32, op: GatherOp) -> Result<u32> {
        if self.shared.node_index == 0 {
            master::gather(&self.shared, pipe_id, value, op).await
        } else {
            slave::gather(&self.shared, pipe_id, value).await
        }
    }

    /// Take a packet from the pool (or allocate fresh). Never blocks.
    #[must_use]
    pub fn allocate_packet(&self) -> Packet {
        self.shared.pool.acquire()
    }

    /// Return a packet to the pool. Never blocks.
    pub fn release_packet(&self, packet: Packet) {
        self.shared.pool.release(packet);
    }

    /// Resolves once the background task reports a fatal condition (§7's
    /// "only asynchronous fatal"): fatal packet loss on the master, or a
    /// communication timeout on the slave.
    pub async fn fatal_error(&self) -> Error {
        let mut rx = self.fatal_rx.dupe();
        loop {
            if let Some(kind) = rx.borrow().clone() {
                return kind.into();
            }
            if rx.changed().await.is_err() {
                return Error::ClosedPipe(0);
            }
        }
    }

    /// Abort the background task. Idempotent; does not block waiting for
    /// the task to finish since `JoinHandle::abort` only requests
    /// cancellation at the next await point.
    pub async fn shutdown(&self) {
        self.task.abort();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, ControlMessage};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::AtomicU16;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

    fn next_ports() -> (u16, u16) {
        let base = PORT_COUNTER.fetch_add(2, Ordering::Relaxed);
        (base, base + 1)
    }

    fn quick_config(send_buffer_size: usize) -> Config {
        Config {
            connection_wait_timeout: Duration::from_millis(30),
            ping_timeout: Duration::from_millis(500),
            max_ping_requests: 3,
            receive_wait_timeout: Duration::from_millis(30),
            barrier_wait_timeout: Duration::from_millis(30),
            send_buffer_size,
            master_message_burst_size: 2,
            slave_message_burst_size: 2,
        }
    }

    /// spec.md §8 scenario 6: a `PACKETLOSS` report naming a stream
    /// position already discarded from the master's retransmission window
    /// is the one synchronous-looking condition that is actually only
    /// reported asynchronously, via `fatal_error` (§7).
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_packet_loss_is_reported_asynchronously() {
        let (master_port, slave_port) = next_ports();
        let group = "239.255.20.6";
        let cfg = quick_config(2);

        let master = Multiplexer::new(1, 0, "127.0.0.1", master_port, group, slave_port, cfg.clone())
            .await
            .expect("master should start");
        let slave = Multiplexer::new(1, 1, "127.0.0.1", master_port, group, slave_port, cfg)
            .await
            .expect("slave should start");

        master.wait_for_connection().await;
        slave.wait_for_connection().await;

        let thread_id = ThreadId::new(vec![0xfa7a1]);
        let (pipe_id, slave_pipe_id) =
            tokio::join!(master.open_pipe(thread_id.clone()), slave.open_pipe(thread_id));
        let pipe_id = pipe_id.expect("master open_pipe");
        assert_eq!(pipe_id, slave_pipe_id.expect("slave open_pipe"));

        // Two sends exactly fill the two-packet window; the slave acks
        // each as it arrives (num_slaves == 1), discarding both and
        // advancing head_stream_pos past them.
        master.send_packet(pipe_id, b"one ").await.unwrap();
        master.send_packet(pipe_id, b"two ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // Impersonate the slave reporting loss at a stream position that
        // the master has already discarded from its window.
        let raw = tokio::net::UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("bind raw socket");
        let dest = crate::socket::as_socket_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, master_port));
        let bytes = wire::encode_control(
            1,
            true,
            &ControlMessage::PacketLoss {
                pipe_id,
                stream_pos: 0,
                packet_pos: 0,
            },
        );
        raw.send_to(&bytes, dest).await.expect("send synthetic report");

        let err = tokio::time::timeout(Duration::from_secs(1), master.fatal_error())
            .await
            .expect("fatal condition should be reported");
        match err {
            Error::FatalPacketLoss {
                pipe_id: reported_pipe,
                requested,
                head,
            } => {
                assert_eq!(reported_pipe, pipe_id);
                assert_eq!(requested, 0);
                assert!(head > 0, "head should have advanced past the two acked sends");
            }
            other => panic!("expected FatalPacketLoss, got {other:?}"),
        }

        master.shutdown().await;
        slave.shutdown().await;
    }
}
