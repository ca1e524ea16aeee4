//! Wire encodings of a [Packet].
//!
//! Datagram links carry exactly one packet per datagram, all header fields as unsigned LEB128
//!  varints in fixed order:
//!
//! ```ascii
//! sender identity   (varint u32)
//! connection id     (varint u32)
//! sequence id       (varint u32)
//! command           (varint u8 - always a single byte)
//! timestamp         (varint u64, nanoseconds since the epoch, 0 if unset)
//! payload length    (varint u32)
//! payload
//! ```
//!
//! Connection-oriented links carry a sequence of frames, each a `u32` (BE) length followed by
//!  the datagram encoding of one packet.

use std::sync::Arc;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crate::config::TrafcaccConfig;
use crate::endpoint::LinkKind;
use crate::packet::{Command, Packet};
use crate::util::buf::{put_u32_varint, put_u64_varint, try_get_u32_varint, try_get_u64_varint};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub trait PacketCodec: Send + Sync {
    fn encode(&self, packet: &Packet, buf: &mut BytesMut);

    /// Takes the next packet from the start of `buf`. `Ok(None)` means that `buf` does not (yet)
    ///  hold a complete packet, an error means the data is corrupt.
    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Packet>>;
}

pub fn codec_for(kind: LinkKind, config: &TrafcaccConfig) -> Arc<dyn PacketCodec> {
    match kind {
        LinkKind::Tcp => Arc::new(StreamCodec { max_frame_len: config.max_stream_frame_len }),
        LinkKind::Udp => Arc::new(DatagramCodec),
    }
}

pub struct DatagramCodec;

impl DatagramCodec {
    fn decode_body(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let sender_id = try_get_u32_varint(buf, "sender")?;
        let conn_id = try_get_u32_varint(buf, "connection")?;
        let seq_id = try_get_u32_varint(buf, "sequence")?;
        let raw_command = try_get_u32_varint(buf, "command")?;
        let command = u8::try_from(raw_command).ok()
            .and_then(|c| Command::try_from(c).ok())
            .ok_or_else(|| anyhow!("unknown command {}", raw_command))?;
        let timestamp = try_get_u64_varint(buf, "timestamp")? as i64;
        let payload_len: usize = try_get_u32_varint(buf, "payload length")?.safe_cast();
        if payload_len > buf.remaining() {
            bail!("declared payload length {} exceeds the remaining {} bytes", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Packet {
            sender_id,
            conn_id,
            seq_id,
            command,
            payload,
            timestamp,
            prefer_datagram: false,
        })
    }
}

impl PacketCodec for DatagramCodec {
    fn encode(&self, packet: &Packet, buf: &mut BytesMut) {
        buf.reserve(Packet::MAX_HEADER_LEN + packet.payload.len());
        put_u32_varint(buf, packet.sender_id);
        put_u32_varint(buf, packet.conn_id);
        put_u32_varint(buf, packet.seq_id);
        put_u32_varint(buf, u8::from(packet.command) as u32);
        put_u64_varint(buf, packet.timestamp as u64);
        put_u32_varint(buf, packet.payload.len().prechecked_cast());
        buf.put_slice(&packet.payload);
    }

    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Packet>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // one datagram is one packet - trailing bytes are discarded with it
        let mut datagram = buf.split().freeze();
        Self::decode_body(&mut datagram).map(Some)
    }
}

pub struct StreamCodec {
    pub max_frame_len: usize,
}

impl PacketCodec for StreamCodec {
    fn encode(&self, packet: &Packet, buf: &mut BytesMut) {
        let len_offs = buf.len();
        buf.put_u32(0);
        DatagramCodec.encode(packet, buf);
        let frame_len: u32 = (buf.len() - len_offs - size_of::<u32>()).prechecked_cast();
        buf[len_offs..len_offs + size_of::<u32>()].copy_from_slice(&frame_len.to_be_bytes());
    }

    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Packet>> {
        if buf.len() < size_of::<u32>() {
            return Ok(None);
        }
        let frame_len: usize = Buf::try_get_u32(&mut &buf[..size_of::<u32>()])
            .map_err(|e| anyhow!("invalid frame length: {:?}", e))?
            .safe_cast();
        if frame_len > self.max_frame_len {
            bail!("frame length {} exceeds the maximum of {}", frame_len, self.max_frame_len);
        }
        if buf.len() < size_of::<u32>() + frame_len {
            buf.reserve(size_of::<u32>() + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(size_of::<u32>());
        let mut frame = buf.split_to(frame_len).freeze();
        let packet = DatagramCodec::decode_body(&mut frame)?;
        if frame.has_remaining() {
            bail!("{} trailing bytes in frame", frame.remaining());
        }
        Ok(Some(packet))
    }
}
