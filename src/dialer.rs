use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use anyhow::anyhow;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use crate::codec::codec_for;
use crate::config::TrafcaccConfig;
use crate::endpoint::{Endpoint, LinkKind};
use crate::error::ConnError;
use crate::link::{tcp_read_loop, udp_read_loop, Link, TcpLinkSender, UdpLinkSender};
use crate::node::{Node, Role};
use crate::packet::{Command, Packet, StreamKey};
use crate::packet_conn::PacketConn;
use crate::status::NodeStatus;
use crate::util::clock::unix_nanos_now;

/// The front-end role: maintains links to a listener and opens logical connections over them.
///
/// Every dialer has a random identity that is part of all its stream keys, so that several
///  dialers can share a listener.
pub struct Dialer {
    identity: u32,
    config: Arc<TrafcaccConfig>,
    node: Arc<Node>,
    next_conn_id: AtomicU32,
    next_link_id: Arc<AtomicU64>,
    link_handles: Vec<JoinHandle<()>>,
}

impl Drop for Dialer {
    fn drop(&mut self) {
        for handle in &self.link_handles {
            handle.abort();
        }
    }
}

impl Dialer {
    pub fn new(config: TrafcaccConfig) -> anyhow::Result<Dialer> {
        config.validate()?;
        let config = Arc::new(config);
        let identity = rand::random::<u32>();
        info!("dialer identity is {:08x}", identity);

        Ok(Dialer {
            identity,
            node: Node::new(Role::Dialer, identity, config.clone()),
            config,
            next_conn_id: AtomicU32::new(1),
            next_link_id: Arc::new(AtomicU64::new(1)),
            link_handles: Vec::new(),
        })
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    /// Starts maintaining one link per port of every endpoint. A link that fails is re-established
    ///  after the configured reconnect delay, for as long as the dialer lives.
    pub fn setup(&mut self, endpoints: &[Endpoint]) {
        for endpoint in endpoints {
            for addr in endpoint.addrs() {
                self.link_handles.push(tokio::spawn(maintain_link(
                    self.node.clone(),
                    self.config.clone(),
                    endpoint.kind,
                    addr,
                    self.next_link_id.clone(),
                )));
            }
        }
    }

    /// Opens a logical connection, waiting for a link to become alive without a time limit
    pub async fn dial(&self) -> Result<PacketConn, ConnError> {
        self.node.pool().wait_for_alive().await;
        self.open_stream().await
    }

    pub async fn dial_timeout(&self, timeout: Duration) -> Result<PacketConn, ConnError> {
        if tokio::time::timeout(timeout, self.node.pool().wait_for_alive()).await.is_err() {
            return Err(ConnError::Timeout(timeout));
        }
        self.open_stream().await
    }

    async fn open_stream(&self) -> Result<PacketConn, ConnError> {
        let key = StreamKey::new(self.identity, self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        self.node.queues().create(key).await;

        if let Err(e) = self.node.write(Packet::control(key, 0, Command::Connect)).await {
            self.node.queues().close(key).await;
            return Err(ConnError::WriteFailed(e.to_string()));
        }
        debug!("opened logical connection {:?}", key);
        Ok(PacketConn::new(self.node.clone(), key))
    }

    pub async fn status(&self) -> NodeStatus {
        self.node.status().await
    }
}

#[instrument(name="link", skip_all, fields(kind = ?kind, addr = %addr))]
async fn maintain_link(node: Arc<Node>, config: Arc<TrafcaccConfig>, kind: LinkKind, addr: String, link_ids: Arc<AtomicU64>) {
    loop {
        let link_id = link_ids.fetch_add(1, Ordering::Relaxed);
        match run_link(&node, &config, kind, &addr, link_id).await {
            Ok(()) => debug!("link closed"),
            Err(e) => warn!("link failed: {}", e),
        }
        sleep(config.reconnect_delay).await;
    }
}

async fn run_link(node: &Arc<Node>, config: &Arc<TrafcaccConfig>, kind: LinkKind, addr: &str, link_id: u64) -> anyhow::Result<()> {
    match kind {
        LinkKind::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let peer_addr = stream.peer_addr()?;
            let (read_half, write_half) = stream.into_split();

            let link = Arc::new(Link::new(link_id, kind, peer_addr, config.clone(), Arc::new(TcpLinkSender::new(write_half)), codec_for(kind, config)));
            let reader = tcp_read_loop(link.clone(), read_half, node.clone());
            serve_link(node, config, link, reader).await
        }
        LinkKind::Udp => {
            let peer_addr = lookup_host(addr).await?
                .next()
                .ok_or_else(|| anyhow!("{} does not resolve to an address", addr))?;
            let bind_addr = if peer_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
            socket.connect(peer_addr).await?;

            let link = Arc::new(Link::new(link_id, kind, peer_addr, config.clone(), Arc::new(UdpLinkSender::connected(socket.clone())), codec_for(kind, config)));
            let reader = udp_read_loop(link.clone(), socket, node.clone());
            serve_link(node, config, link, reader).await
        }
    }
}

/// Runs a link's read loop and heartbeat until either of them ends, with the link in the node's
///  pool for that time
async fn serve_link(node: &Arc<Node>, config: &TrafcaccConfig, link: Arc<Link>, reader: impl Future<Output=anyhow::Result<()>>) -> anyhow::Result<()> {
    debug!("established {:?}", link);
    node.pool().append(link.clone()).await;

    let result = tokio::select! {
        r = reader => r,
        r = heartbeat_loop(&link, node.sender_id(), config.heartbeat_interval) => r,
    };

    link.close().await;
    node.pool().remove(link.id()).await;
    result
}

/// Pings the peer periodically - the pongs make the link alive
async fn heartbeat_loop(link: &Link, sender_id: u32, interval: Duration) -> anyhow::Result<()> {
    loop {
        link.send_packet(&Packet::heartbeat(sender_id, Command::Ping, unix_nanos_now())).await?;
        sleep(interval).await;
    }
}
