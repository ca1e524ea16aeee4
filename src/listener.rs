use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn, Instrument, Span};
use crate::codec::codec_for;
use crate::config::TrafcaccConfig;
use crate::endpoint::{Endpoint, LinkKind};
use crate::link::{dispatch_datagram, tcp_read_loop, Link, PacketDispatcher, TcpLinkSender, UdpLinkSender};
use crate::node::{Node, Role};
use crate::packet::{Command, Packet, StreamKey};
use crate::packet_conn::PacketConn;
use crate::status::NodeStatus;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Application callback for the listener role, invoked exactly once per logical stream that a
///  dialer opens
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    async fn handle(&self, conn: PacketConn);
}

#[async_trait]
impl<F, Fut> ConnHandler for F
where
    F: Fn(PacketConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output=()> + Send + 'static,
{
    async fn handle(&self, conn: PacketConn) {
        self(conn).await
    }
}

/// The back-end role: accepts links from dialers and hands every new logical stream to a
///  [ConnHandler].
///
/// Each dialer identity gets a node of its own, and a link belongs to the dialer whose identity
///  is on the first packet it carries.
pub struct Listener {
    inner: Arc<ListenerInner>,
    local_addrs: Vec<(LinkKind, SocketAddr)>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

struct ListenerInner {
    config: Arc<TrafcaccConfig>,
    nodes: RwLock<FxHashMap<u32, Arc<Node>>>,
    handler: Arc<dyn ConnHandler>,
    next_link_id: AtomicU64,
}

impl Listener {
    /// Binds a socket for every port of every endpoint and starts serving them
    pub async fn bind(config: TrafcaccConfig, endpoints: &[Endpoint], handler: impl ConnHandler) -> anyhow::Result<Listener> {
        config.validate()?;

        let inner = Arc::new(ListenerInner {
            config: Arc::new(config),
            nodes: Default::default(),
            handler: Arc::new(handler),
            next_link_id: AtomicU64::new(1),
        });

        let mut local_addrs = Vec::new();
        let mut handles = Vec::new();
        for endpoint in endpoints {
            for addr in endpoint.addrs() {
                match endpoint.kind {
                    LinkKind::Tcp => {
                        let listener = TcpListener::bind(&addr).await?;
                        let local_addr = listener.local_addr()?;
                        info!("listening on tcp://{}", local_addr);
                        local_addrs.push((LinkKind::Tcp, local_addr));
                        handles.push(tokio::spawn(accept_loop(inner.clone(), listener)));
                    }
                    LinkKind::Udp => {
                        let socket = Arc::new(UdpSocket::bind(&addr).await?);
                        let local_addr = socket.local_addr()?;
                        info!("listening on udp://{}", local_addr);
                        local_addrs.push((LinkKind::Udp, local_addr));
                        let inner = inner.clone();
                        handles.push(tokio::spawn(async move {
                            if let Err(e) = udp_loop(inner, socket).await {
                                warn!("UDP socket {} failed: {}", local_addr, e);
                            }
                        }));
                    }
                }
            }
        }

        Ok(Listener {
            inner,
            local_addrs,
            handles,
        })
    }

    /// The actual bound addresses, which differ from the configured ones for port 0
    pub fn local_addrs(&self) -> &[(LinkKind, SocketAddr)] {
        &self.local_addrs
    }

    pub async fn status(&self) -> NodeStatus {
        let nodes = self.inner.nodes.read().await.values().cloned().collect::<Vec<_>>();
        let mut result = NodeStatus::default();
        for node in nodes {
            result += &node.status().await;
        }
        result
    }
}

impl ListenerInner {
    fn new_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn node_for(&self, sender_id: u32) -> Arc<Node> {
        if let Some(node) = self.nodes.read().await.get(&sender_id) {
            return node.clone();
        }
        self.nodes.write().await
            .entry(sender_id)
            .or_insert_with(|| {
                info!("new dialer {:08x}", sender_id);
                Node::new(Role::Listener, sender_id, self.config.clone())
            })
            .clone()
    }

    fn accept_stream(&self, node: Arc<Node>, key: StreamKey) {
        debug!("accepting logical connection {:?}", key);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = node.write(Packet::control(key, 0, Command::Connected)).await {
                debug!("failed to confirm {:?}: {}", key, e);
            }
            handler.handle(PacketConn::new(node, key)).await;
        });
    }
}

#[async_trait]
impl PacketDispatcher for ListenerInner {
    async fn on_packet(&self, link: &Arc<Link>, packet: Packet) {
        let node = self.node_for(packet.sender_id).await;
        node.pool().append(link.clone()).await;

        let opens_stream = matches!(packet.command, Command::Connect | Command::Data);
        if opens_stream && node.queues().create(packet.key()).await {
            self.accept_stream(node.clone(), packet.key());
        }

        node.on_packet(link, packet).await;
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, listener: TcpListener) {
    let mut connections = JoinSet::new();
    let mut backoff = Duration::ZERO;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    backoff = Duration::ZERO;
                    let inner = inner.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_tcp_link(addr, stream, inner).await {
                            warn!("link from {} broke with an error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    backoff = if backoff.is_zero() { MIN_ACCEPT_BACKOFF } else { (backoff * 2).min(MAX_ACCEPT_BACKOFF) };
                    warn!("error accepting connection, retrying in {:?}: {}", backoff, e);
                    sleep(backoff).await;
                }
            },
            Some(_) = connections.join_next() => {}
        }
    }
}

#[instrument(name="accepted_link", skip_all, fields(addr = %addr))]
async fn handle_tcp_link(addr: SocketAddr, stream: TcpStream, inner: Arc<ListenerInner>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let link = Arc::new(Link::new(
        inner.new_link_id(),
        LinkKind::Tcp,
        addr,
        inner.config.clone(),
        Arc::new(TcpLinkSender::new(write_half)),
        codec_for(LinkKind::Tcp, &inner.config),
    ));
    debug!("accepted {:?}", link);

    let result = tcp_read_loop(link.clone(), read_half, inner)
        .instrument(Span::current())
        .await;
    link.close().await;
    debug!("link closed");
    result
}

/// Serves a shared UDP socket, with one link per peer address
async fn udp_loop(inner: Arc<ListenerInner>, socket: Arc<UdpSocket>) -> anyhow::Result<()> {
    let mut links: FxHashMap<SocketAddr, Arc<Link>> = Default::default();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut last_prune = Instant::now();
    let stale_after = inner.config.keepalive * 2;

    loop {
        buf.clear();
        buf.reserve(64 * 1024);
        let (num_bytes, from) = socket.recv_buf_from(&mut buf).await?;

        let link = match links.get(&from) {
            Some(link) if !link.is_closed() => link.clone(),
            _ => {
                let link = Arc::new(Link::new(
                    inner.new_link_id(),
                    LinkKind::Udp,
                    from,
                    inner.config.clone(),
                    Arc::new(UdpLinkSender::shared(socket.clone(), from)),
                    codec_for(LinkKind::Udp, &inner.config),
                ));
                debug!("new {:?}", link);
                links.insert(from, link.clone());
                link
            }
        };
        dispatch_datagram(&link, &mut buf, num_bytes, inner.as_ref()).await;

        if last_prune.elapsed() >= inner.config.keepalive {
            last_prune = Instant::now();
            let mut stale = Vec::new();
            links.retain(|_, link| {
                let keep = !link.is_closed() && link.idle_time() < stale_after;
                if !keep {
                    stale.push(link.clone());
                }
                keep
            });
            for link in stale {
                debug!("discarding stale {:?}", link);
                link.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::AtomicBool;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use crate::codec::{DatagramCodec, PacketCodec};
    use crate::util::clock::unix_nanos_now;

    const SENDER: u32 = 0xabcd;

    async fn send(socket: &UdpSocket, packet: Packet) {
        let mut buf = BytesMut::new();
        DatagramCodec.encode(&packet, &mut buf);
        socket.send(&buf).await.unwrap();
    }

    async fn recv(socket: &UdpSocket) -> Packet {
        let mut buf = BytesMut::with_capacity(2048);
        tokio::time::timeout(Duration::from_secs(1), socket.recv_buf(&mut buf)).await.unwrap().unwrap();
        DatagramCodec.decode(&mut buf).unwrap().unwrap()
    }

    async fn recv_until(socket: &UdpSocket, command: Command) -> Packet {
        loop {
            let packet = recv(socket).await;
            if packet.command == command {
                return packet;
            }
        }
    }

    async fn connected_socket(listener: &Listener) -> UdpSocket {
        let addr = listener.local_addrs().iter()
            .find(|(kind, _)| *kind == LinkKind::Udp)
            .unwrap().1;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(addr).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn test_ping_pong_and_single_accept() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(
            TrafcaccConfig::default(),
            &[Endpoint::from_str("udp://127.0.0.1:0").unwrap()],
            move |conn: PacketConn| {
                let tx = tx.clone();
                async move {
                    let mut buf = [0u8; 16];
                    let n = conn.read(&mut buf).await.unwrap();
                    tx.send((conn.key(), buf[..n].to_vec())).unwrap();
                }
            },
        ).await.unwrap();

        // two 'links' from the same dialer
        let a = connected_socket(&listener).await;
        let b = connected_socket(&listener).await;
        for socket in [&a, &b] {
            send(socket, Packet::heartbeat(SENDER, Command::Ping, unix_nanos_now())).await;
            let pong = recv(socket).await;
            assert_eq!(pong.command, Command::Pong);
            assert_eq!(pong.sender_id, SENDER);
        }

        let key = StreamKey::new(SENDER, 1);
        send(&a, Packet::control(key, 0, Command::Connect)).await;
        send(&b, Packet::control(key, 0, Command::Connect)).await;
        send(&b, Packet::data(key, 1, Bytes::from_static(b"hello"))).await;
        send(&a, Packet::data(key, 1, Bytes::from_static(b"hello"))).await;

        let (accepted_key, data) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(accepted_key, key);
        assert_eq!(data, b"hello");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        let status = listener.status().await;
        assert_eq!(status.total_links, 2);
        assert_eq!(status.alive_udp_links, 2);
        assert_eq!(status.delivered_udp_bytes, 5);
    }

    #[tokio::test]
    async fn test_connected_reply() {
        let listener = Listener::bind(
            TrafcaccConfig::default(),
            &[Endpoint::from_str("udp://127.0.0.1:0").unwrap()],
            |_conn: PacketConn| async move {},
        ).await.unwrap();

        let socket = connected_socket(&listener).await;
        send(&socket, Packet::heartbeat(SENDER, Command::Ping, unix_nanos_now())).await;
        recv_until(&socket, Command::Pong).await;

        let key = StreamKey::new(SENDER, 7);
        send(&socket, Packet::control(key, 0, Command::Connect)).await;
        let connected = recv_until(&socket, Command::Connected).await;
        assert_eq!(connected.key(), key);
    }

    #[tokio::test]
    async fn test_stray_control_packet_does_not_open_stream() {
        let accepted = Arc::new(AtomicBool::new(false));
        let listener = {
            let accepted = accepted.clone();
            Listener::bind(
                TrafcaccConfig::default(),
                &[Endpoint::from_str("udp://127.0.0.1:0").unwrap()],
                move |_conn: PacketConn| {
                    accepted.store(true, Ordering::Release);
                    async move {}
                },
            ).await.unwrap()
        };

        let socket = connected_socket(&listener).await;
        send(&socket, Packet::heartbeat(SENDER, Command::Ping, unix_nanos_now())).await;
        recv_until(&socket, Command::Pong).await;
        send(&socket, Packet::control(StreamKey::new(SENDER, 3), 1, Command::Ack)).await;
        send(&socket, Packet::control(StreamKey::new(SENDER, 3), 1, Command::RequestResend)).await;

        // garbage is dropped without closing the link
        socket.send(&[0xff, 0xff]).await.unwrap();
        send(&socket, Packet::heartbeat(SENDER, Command::Ping, unix_nanos_now())).await;
        recv_until(&socket, Command::Pong).await;

        assert_eq!(listener.status().await.streams, 0);
        assert!(!accepted.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_sender_without_live_link_does_not_block_socket() {
        let listener = Listener::bind(
            TrafcaccConfig::default(),
            &[Endpoint::from_str("udp://127.0.0.1:0").unwrap()],
            |_conn: PacketConn| async move {},
        ).await.unwrap();

        // data that wants an ack, from a dialer that never pinged
        let silent = connected_socket(&listener).await;
        send(&silent, Packet::data(StreamKey::new(1, 1), 1, Bytes::from_static(b"x"))).await;

        let other = connected_socket(&listener).await;
        let start = Instant::now();
        send(&other, Packet::heartbeat(SENDER, Command::Ping, unix_nanos_now())).await;
        recv_until(&other, Command::Pong).await;
        assert!(start.elapsed() < Duration::from_millis(500), "pong took {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_bind_tcp_port_zero() {
        let listener = Listener::bind(
            TrafcaccConfig::default(),
            &Endpoint::parse_list("tcp://127.0.0.1:0,udp://127.0.0.1:0").unwrap(),
            |_conn: PacketConn| async move {},
        ).await.unwrap();

        let addrs = listener.local_addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].0, LinkKind::Tcp);
        assert_ne!(addrs[0].1.port(), 0);
        assert!(TcpStream::connect(addrs[0].1).await.is_ok());
    }
}
