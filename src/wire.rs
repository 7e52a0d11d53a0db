//! Wire encoding for stream packets and control messages.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Every datagram begins with a 32-bit `pipe_id`. If it is non-zero, the
//! rest of the datagram is a stream packet: a `stream_pos` word followed by
//! payload bytes. If it is zero, the datagram is a control message: a
//! `node_index` word (top bit set for slave→master, clear for master→slave,
//! low 31 bits the slave index or 0 for the master) followed by a
//! `message_id` word and then message-specific fields.
//!
//! Fields are 32-bit words in host byte order — the cluster is assumed
//! homogeneous, matching the original design (no network-byte-order
//! conversion is performed, deliberately).

use crate::pool::POOLED_PACKET_SIZE;
use crate::thread_id::ThreadId;

const WORD: usize = 4;

/// Bit distinguishing a slave→master message (set) from master→slave
/// (clear) in the `node_index` word.
pub const SLAVE_BIT: u32 = 1 << 31;

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + WORD)
        .map(|s| u32::from_ne_bytes(s.try_into().unwrap()))
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

/// A decoded incoming datagram: either a stream packet or a control
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// A stream packet payload, still borrowing the socket's receive
    /// buffer.
    Stream {
        /// Target pipe.
        pipe_id: u32,
        /// Offset of the first payload byte within the pipe's stream.
        stream_pos: u32,
        /// Payload bytes.
        payload: &'a [u8],
    },
    /// A control message.
    Control {
        /// Sender's node index, with the sign bit already stripped.
        node_index: u32,
        /// `true` if this message came from a slave.
        from_slave: bool,
        /// The decoded message body.
        message: ControlMessage,
    },
}

/// The seven control message kinds from the wire protocol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Slave announces it joined the multicast group, or master
    /// re-broadcasts its reply.
    Connection,
    /// Liveness probe / reply.
    Ping,
    /// Stage 1 of pipe creation: opener announces its thread id (master→
    /// slave direction carries the assigned `pipe_id` instead).
    CreatePipe1 {
        /// `0` until the master has assigned an id.
        pipe_id: u32,
        /// Opener's opaque identity.
        thread_id: ThreadId,
    },
    /// Stage 2 of pipe creation: slave confirms it learned the pipe id.
    CreatePipe2 {
        /// The pipe id being confirmed.
        pipe_id: u32,
    },
    /// Positive acknowledgment of stream progress.
    Acknowledgment {
        /// Pipe being acknowledged.
        pipe_id: u32,
        /// New acknowledged stream position.
        stream_pos: u32,
        /// Position at which the gap was observed (diagnostic only; carried
        /// for symmetry with `PacketLoss`).
        packet_pos: u32,
    },
    /// Report of a detected gap in the stream.
    PacketLoss {
        /// Pipe on which loss was detected.
        pipe_id: u32,
        /// Stream position the receiver still expects.
        stream_pos: u32,
        /// Stream position that actually arrived.
        packet_pos: u32,
    },
    /// Barrier progress/completion.
    Barrier {
        /// Pipe the barrier is on.
        pipe_id: u32,
        /// Barrier id being reached (slave→master) or completed
        /// (master→slave).
        barrier_id: u32,
    },
    /// Gather progress/completion.
    Gather {
        /// Pipe the gather is on.
        pipe_id: u32,
        /// Barrier id (gather shares the barrier counter).
        barrier_id: u32,
        /// Slave's contributed value, or the master's reduced result.
        value: u32,
    },
}

impl ControlMessage {
    fn message_id(&self) -> u32 {
        match self {
            ControlMessage::Connection => 0,
            ControlMessage::Ping => 1,
            ControlMessage::CreatePipe1 { .. } => 2,
            ControlMessage::CreatePipe2 { .. } => 3,
            ControlMessage::Acknowledgment { .. } => 4,
            ControlMessage::PacketLoss { .. } => 5,
            ControlMessage::Barrier { .. } => 6,
            ControlMessage::Gather { .. } => 7,
        }
    }
}

/// Encode a control message addressed as coming from `node_index`
/// (`from_slave` sets the sign bit).
#[must_use]
pub fn encode_control(node_index: u32, from_slave: bool, message: &ControlMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    push_u32(&mut buf, 0); // pipe_id == 0 marks a control message
    let tagged = if from_slave {
        node_index | SLAVE_BIT
    } else {
        node_index
    };
    push_u32(&mut buf, tagged);
    push_u32(&mut buf, message.message_id());
    match message {
        ControlMessage::Connection | ControlMessage::Ping => {}
        ControlMessage::CreatePipe1 { pipe_id, thread_id } => {
            push_u32(&mut buf, *pipe_id);
            push_u32(&mut buf, thread_id.parts().len() as u32);
            for part in thread_id.parts() {
                push_u32(&mut buf, *part);
            }
        }
        ControlMessage::CreatePipe2 { pipe_id } => push_u32(&mut buf, *pipe_id),
        ControlMessage::Acknowledgment {
            pipe_id,
            stream_pos,
            packet_pos,
        }
        | ControlMessage::PacketLoss {
            pipe_id,
            stream_pos,
            packet_pos,
        } => {
            push_u32(&mut buf, *pipe_id);
            push_u32(&mut buf, *stream_pos);
            push_u32(&mut buf, *packet_pos);
        }
        ControlMessage::Barrier {
            pipe_id,
            barrier_id,
        } => {
            push_u32(&mut buf, *pipe_id);
            push_u32(&mut buf, *barrier_id);
        }
        ControlMessage::Gather {
            pipe_id,
            barrier_id,
            value,
        } => {
            push_u32(&mut buf, *pipe_id);
            push_u32(&mut buf, *barrier_id);
            push_u32(&mut buf, *value);
        }
    }
    buf
}

/// Encode a stream packet.
#[must_use]
pub fn encode_stream(pipe_id: u32, stream_pos: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(WORD * 2 + payload.len());
    push_u32(&mut buf, pipe_id);
    push_u32(&mut buf, stream_pos);
    buf.extend_from_slice(payload);
    buf
}

/// Reasons a datagram failed to decode. These are never propagated as
/// [`crate::Error`] — they are logged and the datagram dropped, since UDP
/// may deliver arbitrary garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the minimum two-word header.
    TooShort,
    /// Declared an unknown `message_id`.
    UnknownMessageId(u32),
    /// Declared a size inconsistent with its `message_id`.
    WrongSize,
    /// Payload larger than a packet can hold.
    PayloadTooLarge,
}

/// Decode a raw datagram into a [`Datagram`].
pub fn decode(buf: &[u8]) -> Result<Datagram<'_>, DecodeError> {
    let pipe_id = read_u32(buf, 0).ok_or(DecodeError::TooShort)?;
    if pipe_id != 0 {
        let stream_pos = read_u32(buf, WORD).ok_or(DecodeError::TooShort)?;
        let payload = &buf[WORD * 2..];
        if payload.len() > POOLED_PACKET_SIZE {
            return Err(DecodeError::PayloadTooLarge);
        }
        return Ok(Datagram::Stream {
            pipe_id,
            stream_pos,
            payload,
        });
    }
    let tagged_node = read_u32(buf, WORD).ok_or(DecodeError::TooShort)?;
    let from_slave = tagged_node & SLAVE_BIT != 0;
    let node_index = tagged_node & !SLAVE_BIT;
    let message_id = read_u32(buf, WORD * 2).ok_or(DecodeError::TooShort)?;
    let rest = WORD * 3;
    let message = match message_id {
        0 => ControlMessage::Connection,
        1 => ControlMessage::Ping,
        2 => {
            let pipe_id = read_u32(buf, rest).ok_or(DecodeError::TooShort)?;
            let num_parts = read_u32(buf, rest + WORD).ok_or(DecodeError::TooShort)? as usize;
            let parts_start = rest + WORD * 2;
            // Validate the declared part count against the buffer we
            // actually received before trusting it as an allocation size;
            // `num_parts` is attacker-controlled (up to `u32::MAX`).
            let parts_bytes = num_parts.checked_mul(WORD).ok_or(DecodeError::WrongSize)?;
            let parts_end = parts_start
                .checked_add(parts_bytes)
                .ok_or(DecodeError::WrongSize)?;
            if parts_end > buf.len() {
                return Err(DecodeError::WrongSize);
            }
            let mut parts = Vec::with_capacity(num_parts);
            for i in 0..num_parts {
                parts.push(read_u32(buf, parts_start + i * WORD).ok_or(DecodeError::WrongSize)?);
            }
            ControlMessage::CreatePipe1 {
                pipe_id,
                thread_id: ThreadId::new(parts),
            }
        }
        3 => ControlMessage::CreatePipe2 {
            pipe_id: read_u32(buf, rest).ok_or(DecodeError::TooShort)?,
        },
        4 => ControlMessage::Acknowledgment {
            pipe_id: read_u32(buf, rest).ok_or(DecodeError::TooShort)?,
            stream_pos: read_u32(buf, rest + WORD).ok_or(DecodeError::TooShort)?,
            packet_pos: read_u32(buf, rest + WORD * 2).ok_or(DecodeError::TooShort)?,
        },
        5 => ControlMessage::PacketLoss {
            pipe_id: read_u32(buf, rest).ok_or(DecodeError::TooShort)?,
            stream_pos: read_u32(buf, rest + WORD).ok_or(DecodeError::TooShort)?,
            packet_pos: read_u32(buf, rest + WORD * 2).ok_or(DecodeError::TooShort)?,
        },
        6 => ControlMessage::Barrier {
            pipe_id: read_u32(buf, rest).ok_or(DecodeError::TooShort)?,
            barrier_id: read_u32(buf, rest + WORD).ok_or(DecodeError::TooShort)?,
        },
        7 => ControlMessage::Gather {
            pipe_id: read_u32(buf, rest).ok_or(DecodeError::TooShort)?,
            barrier_id: read_u32(buf, rest + WORD).ok_or(DecodeError::TooShort)?,
            value: read_u32(buf, rest + WORD * 2).ok_or(DecodeError::TooShort)?,
        },
        other => return Err(DecodeError::UnknownMessageId(other)),
    };
    Ok(Datagram::Control {
        node_index,
        from_slave,
        message,
    })
}
