use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use crate::error::ConnError;
use crate::node::Node;
use crate::packet::{Packet, StreamKey};

/// A logical connection: an ordered, reliable byte stream over all links of a node
pub struct PacketConn {
    node: Arc<Node>,
    key: StreamKey,
    /// sequence number for the next sequenced packet (data or terminal), starting at 1
    next_seq_id: AtomicU32,
    read_buf: Mutex<BytesMut>,
    /// serializes writers, and holds the error of a failed write which makes all further writes
    ///  fail
    write_state: Mutex<Option<ConnError>>,
    closed: AtomicBool,
}

impl Debug for PacketConn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketConn{:?} ({:?})", self.key, self.node.role())
    }
}

impl PacketConn {
    /// The stream must be registered with the node's reorder queue
    pub fn new(node: Arc<Node>, key: StreamKey) -> PacketConn {
        PacketConn {
            node,
            key,
            next_seq_id: AtomicU32::new(1),
            read_buf: Default::default(),
            write_state: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Reads the next bytes of the stream, waiting for them if necessary. `Ok(0)` signals the end
    ///  of the stream, i.e. the stream was closed locally, or by the peer and all data sent
    ///  before the close was read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let queues = self.node.queues();
        let mut read_buf = self.read_buf.lock().await;
        loop {
            if !read_buf.is_empty() {
                let n = buf.len().min(read_buf.len());
                buf[..n].copy_from_slice(&read_buf[..n]);
                read_buf.advance(n);
                return Ok(n);
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }

            queues.wait_for_arrived(self.key).await;
            while read_buf.len() < self.node.config().read_buffer_size {
                match queues.pop(self.key).await {
                    Some(packet) => read_buf.extend_from_slice(&packet.payload),
                    None => break,
                }
            }

            if read_buf.is_empty() && queues.is_closed(self.key).await {
                trace!("{:?}: end of stream", self);
                return Ok(0);
            }
        }
    }

    /// Writes all of `data`, split into packets of the configured maximum payload size. If a
    ///  packet can not be written to any link, this connection is broken and all further writes
    ///  return the same error.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnError> {
        let mut write_state = self.write_state.lock().await;
        if let Some(e) = write_state.as_ref() {
            return Err(e.clone());
        }
        if self.closed.load(Ordering::Acquire) || self.node.queues().is_closed(self.key).await {
            return Err(ConnError::Closed);
        }

        for chunk in data.chunks(self.node.config().max_payload_len) {
            let seq_id = self.next_seq_id.fetch_add(1, Ordering::AcqRel);
            let packet = Packet::data(self.key, seq_id, Bytes::copy_from_slice(chunk));
            if let Err(e) = self.node.write(packet).await {
                debug!("{:?}: write failed: {}", self, e);
                let err = ConnError::WriteFailed(e.to_string());
                *write_state = Some(err.clone());
                return Err(err);
            }
        }
        Ok(data.len())
    }

    /// Sends the terminal packet for this side and closes the stream locally, waking up pending
    ///  reads. Closing more than once has no further effect.
    pub async fn close(&self) -> Result<(), ConnError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("closing {:?}", self);

        let result = {
            let _write_state = self.write_state.lock().await;
            let seq_id = self.next_seq_id.fetch_add(1, Ordering::AcqRel);
            let terminal = Packet::control(self.key, seq_id, self.node.role().terminal_command());
            self.node.write(terminal).await
        };
        self.node.queues().close(self.key).await;

        result.map_err(|e| ConnError::WriteFailed(e.to_string()))
    }
}

impl Drop for PacketConn {
    /// A connection that is dropped without being closed is closed in the background, so that
    ///  the peer sees the end of the stream and the stream's state can be reclaimed.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{:?} dropped outside of a runtime without being closed", self);
            return;
        };
        debug!("{:?} dropped without being closed", self);

        let node = self.node.clone();
        let key = self.key;
        let seq_id = self.next_seq_id.fetch_add(1, Ordering::AcqRel);
        runtime.spawn(async move {
            node.queues().close(key).await;
            let terminal = Packet::control(key, seq_id, node.role().terminal_command());
            if let Err(e) = node.write(terminal).await {
                debug!("failed to send terminal packet for dropped {:?}: {}", key, e);
            }
        });
    }
}
