//! Error taxonomy for the cluster multiplexor.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
use thiserror::Error;

/// Errors surfaced to callers of the public API.
///
/// Malformed or duplicate wire messages are *not* part of this enum: they
/// are normal under UDP loss and are only ever logged, never propagated
/// (see the crate-level docs for the full propagation policy).
#[derive(Debug, Error)]
pub enum Error {
    /// Resolving, binding or configuring the cluster socket failed. Fatal
    /// at construction time.
    #[error("failed to resolve or bind cluster socket: {0}")]
    Config(#[from] std::io::Error),

    /// A slave gave up after too many consecutive silent ping intervals.
    #[error("lost contact with master after {0} ping timeouts")]
    Communication(u32),

    /// The master received a resend request for a stream position that has
    /// already been discarded from the retransmission window. The window is
    /// too small for the current loss/latency characteristics of the
    /// network and must not be silently ignored.
    #[error(
        "fatal packet loss on pipe {pipe_id}: requested resend of stream position \
         {requested} is behind the retained head {head}"
    )]
    FatalPacketLoss {
        /// Pipe on which the loss occurred.
        pipe_id: u32,
        /// Stream position the peer asked to have resent.
        requested: u32,
        /// Oldest stream position still retained in the send window.
        head: u32,
    },

    /// The caller referenced a pipe id that is not (or no longer) in the
    /// live pipe table. Recoverable: does not affect other pipes or the
    /// multiplexor as a whole.
    #[error("pipe {0} is not open")]
    ClosedPipe(u32),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
