use std::fmt::{Debug, Formatter};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::util::buf::max_varint_len;

/// The command a packet carries. The numeric values are part of the wire format.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Data = 0,
    /// terminal packet of a logical stream, sent by the dialing side
    Close = 1,
    /// terminal packet of a logical stream, sent by the listening side
    Closed = 2,
    Connect = 3,
    Connected = 4,
    Ping = 5,
    Pong = 6,
    RequestResend = 7,
    Ack = 8,
}
impl Command {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Command::Close | Command::Closed)
    }

    /// Sequenced commands occupy a slot in their stream's sequence space and pass through the
    ///  receiver's reorder queue
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Command::Data | Command::Close | Command::Closed)
    }
}

/// Identifies one logical stream across all links: the sender identity is chosen randomly per
///  dialer instance, the connection id is allocated by that dialer
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamKey {
    pub sender_id: u32,
    pub conn_id: u32,
}
impl StreamKey {
    pub fn new(sender_id: u32, conn_id: u32) -> StreamKey {
        StreamKey { sender_id, conn_id }
    }
}
impl Debug for StreamKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:08x}/{}]", self.sender_id, self.conn_id)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub sender_id: u32,
    pub conn_id: u32,
    /// strictly increasing per logical stream and direction, starting at 1. 0 is used for
    ///  packets outside the sequence (control packets)
    pub seq_id: u32,
    pub command: Command,
    pub payload: Bytes,
    /// nanoseconds since the epoch at the time of sending, 0 if not set
    pub timestamp: i64,

    /// Local hint for link selection, not transmitted: prefer a single datagram link if one
    ///  is alive
    pub prefer_datagram: bool,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{} {:?} ({} bytes)", self.key(), self.seq_id, self.command, self.payload.len())
    }
}

impl Packet {
    /// Worst case for the encoded header: five varint u32 fields (sender, connection, sequence,
    ///  payload length and command, which is always a single byte) and the varint u64 timestamp
    pub const MAX_HEADER_LEN: usize = 4 * max_varint_len(32) + 1 + max_varint_len(64);

    pub fn data(key: StreamKey, seq_id: u32, payload: Bytes) -> Packet {
        Packet {
            sender_id: key.sender_id,
            conn_id: key.conn_id,
            seq_id,
            command: Command::Data,
            payload,
            timestamp: 0,
            prefer_datagram: false,
        }
    }

    /// a control packet referring to a logical stream, with an optional sequence number it
    ///  refers to (ack, request-resend) or occupies (close, closed)
    pub fn control(key: StreamKey, seq_id: u32, command: Command) -> Packet {
        Packet {
            sender_id: key.sender_id,
            conn_id: key.conn_id,
            seq_id,
            command,
            payload: Bytes::new(),
            timestamp: 0,
            prefer_datagram: false,
        }
    }

    /// ping / pong are link-level and not tied to a logical stream
    pub fn heartbeat(sender_id: u32, command: Command, timestamp: i64) -> Packet {
        Packet {
            sender_id,
            conn_id: 0,
            seq_id: 0,
            command,
            payload: Bytes::new(),
            timestamp,
            prefer_datagram: false,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.sender_id, self.conn_id)
    }
}
