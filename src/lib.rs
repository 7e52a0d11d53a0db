//! Reliable, ordered, multi-pipe transport over one shared UDP socket for a
//! master/slave rendering cluster.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! One process is the master (`node_index == 0`); the rest are slaves
//! (`node_index` in `[1, num_slaves]`). All of them share a single UDP
//! socket, multiplexed into independent "pipes" identified by a cluster-wide
//! `u32` id. Within a pipe, bytes the master sends arrive at every slave
//! exactly once and in order; loss is detected and resent, not merely
//! logged. Two collectives, `barrier` and `gather`, ride the same socket and
//! share the pipe's round counter.
//!
//! [`Multiplexer::new`] resolves addresses, binds and configures the
//! socket (multicast if the slave group address is one, broadcast
//! otherwise), and spawns a background task that owns the socket's receive
//! side for the lifetime of the process. Application code never touches the
//! socket directly: [`Multiplexer::open_pipe`], [`Multiplexer::send_packet`],
//! [`Multiplexer::receive_packet`], [`Multiplexer::barrier`] and
//! [`Multiplexer::gather`] are the entire public surface for pipe traffic.
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod config;
mod dupe;
mod error;
mod gather;
mod master;
mod multiplexer;
mod packet;
mod pipe;
mod pool;
mod slave;
mod socket;
mod table;
mod thread_id;
mod wrapping;

#[cfg(not(feature = "fuzzing"))]
mod wire;
/// Wire encode/decode, normally private. Exposed only under the
/// `fuzzing` feature so `fuzz/` can drive [`wire::decode`] directly; not
/// part of the supported public API.
#[cfg(feature = "fuzzing")]
#[doc(hidden)]
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use gather::GatherOp;
pub use multiplexer::Multiplexer;
pub use packet::Packet;
pub use thread_id::ThreadId;
