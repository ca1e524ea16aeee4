#[cfg(test)] use mockall::automock;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::codec::PacketCodec;
use crate::config::TrafcaccConfig;
use crate::endpoint::LinkKind;
use crate::packet::Packet;
use crate::util::clock::unix_nanos_now;

/// This is an abstraction for writing an encoded packet to the physical socket, introduced to
///  facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkSender: Send + Sync + 'static {
    async fn send_buf(&self, buf: &[u8]) -> std::io::Result<()>;

    async fn shutdown(&self);
}

pub struct TcpLinkSender {
    write_half: Mutex<OwnedWriteHalf>,
}
impl TcpLinkSender {
    pub fn new(write_half: OwnedWriteHalf) -> TcpLinkSender {
        TcpLinkSender { write_half: Mutex::new(write_half) }
    }
}

#[async_trait]
impl LinkSender for TcpLinkSender {
    async fn send_buf(&self, buf: &[u8]) -> std::io::Result<()> {
        self.write_half.lock().await
            .write_all(buf).await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.write_half.lock().await.shutdown().await {
            debug!("error shutting down TCP write half: {}", e);
        }
    }
}

/// A UDP 'link' is either a connected socket of its own (dialer side) or a peer address on a
///  shared listening socket (listener side)
pub struct UdpLinkSender {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}
impl UdpLinkSender {
    pub fn connected(socket: Arc<UdpSocket>) -> UdpLinkSender {
        UdpLinkSender { socket, peer: None }
    }

    pub fn shared(socket: Arc<UdpSocket>, peer: SocketAddr) -> UdpLinkSender {
        UdpLinkSender { socket, peer: Some(peer) }
    }
}

#[async_trait]
impl LinkSender for UdpLinkSender {
    async fn send_buf(&self, buf: &[u8]) -> std::io::Result<()> {
        match self.peer {
            Some(peer) => self.socket.send_to(buf, peer).await?,
            None => self.socket.send(buf).await?,
        };
        Ok(())
    }

    async fn shutdown(&self) {
    }
}

/// Callback for packets read from a link
#[async_trait]
pub trait PacketDispatcher: Send + Sync + 'static {
    async fn on_packet(&self, link: &Arc<Link>, packet: Packet);
}

/// One physical socket to a peer, with liveness and latency tracking.
pub struct Link {
    id: u64,
    kind: LinkKind,
    peer_addr: SocketAddr,
    config: Arc<TrafcaccConfig>,
    sender: Arc<dyn LinkSender>,
    codec: Arc<dyn PacketCodec>,

    created_at: Instant,
    /// nanos after `created_at` + 1 when the last ping / pong was seen, 0 if never
    live_at: AtomicU64,
    /// best (i.e. smallest) one-way delay observed so far, based on the sender's timestamps.
    ///  This includes clock skew between the peers, which is why only the difference to
    ///  the best value is meaningful.
    best_delay: AtomicI64,
    /// last observed one-way delay minus the best one-way delay
    latency: AtomicI64,

    sent_bytes: AtomicU64,
    recv_bytes: AtomicU64,

    closed: AtomicBool,
    close_notify: Notify,
}

impl Debug for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} link #{} to {:?}", self.kind, self.id, self.peer_addr)
    }
}

impl Link {
    pub fn new(id: u64, kind: LinkKind, peer_addr: SocketAddr, config: Arc<TrafcaccConfig>, sender: Arc<dyn LinkSender>, codec: Arc<dyn PacketCodec>) -> Link {
        Link {
            id,
            kind,
            peer_addr,
            config,
            sender,
            codec,
            created_at: Instant::now(),
            live_at: AtomicU64::new(0),
            best_delay: AtomicI64::new(i64::MAX),
            latency: AtomicI64::new(0),
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn codec(&self) -> &Arc<dyn PacketCodec> {
        &self.codec
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn recv_bytes(&self) -> u64 {
        self.recv_bytes.load(Ordering::Relaxed)
    }

    pub fn latency_nanos(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Encodes and writes a packet. A link that fails to write is closed right away - it will
    ///  be discarded from its pool on the next refresh.
    pub async fn send_packet(&self, packet: &Packet) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("{:?} is closed", self);
        }

        let mut buf = BytesMut::with_capacity(Packet::MAX_HEADER_LEN + 4 + packet.payload.len());
        self.codec.encode(packet, &mut buf);

        trace!("sending {:?} on {:?}", packet, self);
        if let Err(e) = self.sender.send_buf(&buf).await {
            warn!("error sending on {:?} - closing the link: {}", self, e);
            self.close().await;
            bail!(e);
        }
        self.sent_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Updates counters and the latency estimate for a packet that was read from this link
    pub fn on_received(&self, packet: &Packet, num_bytes: usize) {
        self.recv_bytes.fetch_add(num_bytes as u64, Ordering::Relaxed);

        if packet.timestamp != 0 {
            let delay = unix_nanos_now().saturating_sub(packet.timestamp);
            let prev_best = self.best_delay.fetch_min(delay, Ordering::AcqRel);
            let best = prev_best.min(delay);
            self.latency.store(delay - best, Ordering::Relaxed);
        }
    }

    pub fn mark_live(&self) {
        let nanos = self.created_at.elapsed().as_nanos();
        self.live_at.store(u64::try_from(nanos).unwrap_or(u64::MAX - 1) + 1, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let live_at = self.live_at.load(Ordering::Acquire);
        if live_at == 0 {
            return false;
        }
        let since_live = (self.created_at.elapsed().as_nanos() as u64).saturating_sub(live_at - 1);
        if since_live > self.config.keepalive.as_nanos() as u64 {
            return false;
        }
        self.latency.load(Ordering::Relaxed) < self.config.max_link_latency.as_nanos() as i64
    }

    /// time since the link was last seen live, or since it was created if it never was
    pub fn idle_time(&self) -> std::time::Duration {
        match self.live_at.load(Ordering::Acquire) {
            0 => self.created_at.elapsed(),
            live_at => self.created_at.elapsed().saturating_sub(std::time::Duration::from_nanos(live_at - 1)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the link closed and releases the socket. This is idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {:?}", self);
        self.close_notify.notify_waiters();
        self.sender.shutdown().await;
    }

    /// completes when the link is closed
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Reads frames from the read half of a TCP link until EOF or until the link is closed.
///  A corrupt frame is returned as an error since the stream can not be resynchronized.
pub async fn tcp_read_loop(link: Arc<Link>, mut read_half: OwnedReadHalf, dispatcher: Arc<dyn PacketDispatcher>) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        loop {
            let len_before = buf.len();
            match link.codec().decode(&mut buf)? {
                Some(packet) => {
                    link.on_received(&packet, len_before - buf.len());
                    dispatcher.on_packet(&link, packet).await;
                }
                None => break,
            }
        }

        tokio::select! {
            _ = link.closed() => return Ok(()),
            n = read_half.read_buf(&mut buf) => {
                if n? == 0 {
                    debug!("{:?}: EOF", link);
                    return Ok(());
                }
            }
        }
    }
}

/// Reads datagrams from a UDP socket connected to a single peer
pub async fn udp_read_loop(link: Arc<Link>, socket: Arc<UdpSocket>, dispatcher: Arc<dyn PacketDispatcher>) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        buf.clear();
        buf.reserve(64 * 1024);
        tokio::select! {
            _ = link.closed() => return Ok(()),
            r = socket.recv_buf(&mut buf) => {
                let num_bytes = r?;
                dispatch_datagram(&link, &mut buf, num_bytes, dispatcher.as_ref()).await;
            }
        }
    }
}

/// Decodes and dispatches a single datagram. Undecodable datagrams are dropped, the link stays
///  open.
pub async fn dispatch_datagram(link: &Arc<Link>, buf: &mut BytesMut, num_bytes: usize, dispatcher: &dyn PacketDispatcher) {
    match link.codec().decode(buf) {
        Ok(Some(packet)) => {
            link.on_received(&packet, num_bytes);
            dispatcher.on_packet(link, packet).await;
        }
        Ok(None) => {}
        Err(e) => warn!("dropping unparsable datagram from {:?}: {}", link.peer_addr(), e),
    }
}
