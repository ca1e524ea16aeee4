use std::sync::{Arc, Weak};
use std::time::Duration;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use crate::config::TrafcaccConfig;
use crate::endpoint::LinkKind;
use crate::link::{Link, PacketDispatcher};
use crate::link_pool::LinkPool;
use crate::packet::{Command, Packet, StreamKey};
use crate::reorder_queue::{AddOutcome, ReorderQueue};
use crate::send_cache::{ResendLookup, SendCache};
use crate::status::NodeStatus;
use crate::util::clock::unix_nanos_now;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Dialer,
    Listener,
}
impl Role {
    /// The terminal command a side sends when it closes a logical stream, which lets the peer
    ///  tell who initiated the shutdown
    pub fn terminal_command(&self) -> Command {
        match self {
            Role::Dialer => Command::Close,
            Role::Listener => Command::Closed,
        }
    }
}

#[derive(Default)]
struct AckState {
    last_acked: u32,
    last_ack_at: Option<Instant>,
    /// contiguous prefix that was received but not acked yet because of the ack interval
    pending: Option<u32>,
}

/// The role-neutral protocol logic for all logical streams between this process and one peer
///  identity: it routes inbound control packets to the link pool and the send cache, inbound
///  sequenced packets to the reorder queue, and runs the periodic gap scan.
pub struct Node {
    role: Role,
    sender_id: u32,
    config: Arc<TrafcaccConfig>,
    pool: LinkPool,
    queues: ReorderQueue,
    cache: SendCache,
    acks: Mutex<FxHashMap<StreamKey, AckState>>,
    scan_handle: Option<JoinHandle<()>>,
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.take() {
            handle.abort();
        }
    }
}

impl Node {
    /// Creates a node and spawns its background loops (link pool refresh and gap scan). The
    ///  loops end when the node is dropped.
    pub fn new(role: Role, sender_id: u32, config: Arc<TrafcaccConfig>) -> Arc<Node> {
        Self::create(role, sender_id, config, true)
    }

    fn create(role: Role, sender_id: u32, config: Arc<TrafcaccConfig>, spawn_loops: bool) -> Arc<Node> {
        let mut pool = LinkPool::new(config.clone());
        if spawn_loops {
            pool.spawn_refresh_loop();
        }

        Arc::new_cyclic(|weak: &Weak<Node>| Node {
            role,
            sender_id,
            config: config.clone(),
            pool,
            queues: ReorderQueue::default(),
            cache: SendCache::default(),
            acks: Default::default(),
            scan_handle: spawn_loops.then(|| tokio::spawn(Self::scan_loop(weak.clone(), config.resend_delay))),
        })
    }

    async fn scan_loop(node: Weak<Node>, period: Duration) {
        // the node is not upgradable before its construction is complete
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            match node.upgrade() {
                Some(node) => node.scan_once(Instant::now()).await,
                None => return,
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sender_id(&self) -> u32 {
        self.sender_id
    }

    pub fn config(&self) -> &Arc<TrafcaccConfig> {
        &self.config
    }

    pub fn pool(&self) -> &LinkPool {
        &self.pool
    }

    pub fn queues(&self) -> &ReorderQueue {
        &self.queues
    }

    /// Sends a packet to the peer. Sequenced packets are kept in the send cache until they are
    ///  acknowledged.
    pub async fn write(&self, mut packet: Packet) -> anyhow::Result<()> {
        packet.timestamp = unix_nanos_now();
        self.cache.add(&packet).await;
        self.pool.write(&packet).await
    }

    /// Control packets are sent only if some link is alive right now: they are sent from read
    ///  loops, and the periodic scan sends them again if they get lost.
    async fn send_control(&self, key: StreamKey, seq_id: u32, command: Command) {
        let mut packet = Packet::control(key, seq_id, command);
        packet.timestamp = unix_nanos_now();
        packet.prefer_datagram = command == Command::Ack;
        if let Err(e) = self.pool.try_write(&packet).await {
            debug!("failed to send {:?}: {}", packet, e);
        }
    }

    /// Handles the link-level and control aspects of a packet read from one of this node's links
    pub async fn proc(&self, link: &Arc<Link>, packet: &Packet) {
        match packet.command {
            Command::Ping | Command::Pong => {
                let was_alive = self.pool.is_alive(link.id()).await;
                link.mark_live();
                if !was_alive {
                    self.pool.refresh().await;
                }

                if packet.command == Command::Ping {
                    let pong = Packet::heartbeat(packet.sender_id, Command::Pong, unix_nanos_now());
                    if let Err(e) = link.send_packet(&pong).await {
                        debug!("failed to answer ping on {:?}: {}", link, e);
                    }
                }
            }
            Command::Ack => {
                trace!("received ack for {:?} up to #{}", packet.key(), packet.seq_id);
                self.cache.ack(packet.key(), packet.seq_id).await;
            }
            Command::RequestResend => {
                match self.cache.get_for_resend(packet.key(), packet.seq_id, Instant::now(), self.config.resend_delay).await {
                    ResendLookup::Resend(mut resend) => {
                        debug!("re-sending {:?} on request", resend);
                        resend.timestamp = unix_nanos_now();
                        if let Err(e) = self.pool.try_write(&resend).await {
                            debug!("failed to re-send {:?}: {}", resend, e);
                        }
                    }
                    ResendLookup::TooRecent => {
                        trace!("ignoring repeated resend request for {:?} #{}", packet.key(), packet.seq_id);
                    }
                    ResendLookup::Missing => {
                        warn!("peer requested {:?} #{} which is not in the send cache", packet.key(), packet.seq_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Handles the stream aspects of a packet read from one of this node's links
    pub async fn push(&self, arrived_via: LinkKind, packet: Packet) {
        let key = packet.key();
        let seq_id = packet.seq_id;

        match packet.command {
            Command::Data | Command::Close | Command::Closed => {
                let is_terminal = packet.command.is_terminal();
                let Some(outcome) = self.queues.add(packet, arrived_via).await else {
                    warn!("received sequenced packet #{} for unknown stream {:?}", seq_id, key);
                    return;
                };
                if is_terminal {
                    self.cache.close(key).await;
                }
                self.on_added(key, seq_id, outcome).await;
            }
            Command::Connect | Command::Connected => {
                trace!("{:?}: {:?}", key, packet.command);
            }
            _ => {
                warn!("unexpected {:?} pushed to stream {:?}", packet.command, key);
            }
        }
    }

    /// Acks the contiguous prefix if the packet completed it, rate limited per stream. An ack
    ///  that is held back is sent by the gap scan later.
    ///
    /// A duplicate is acked again, since the peer re-sends a packet when it did not see the ack.
    async fn on_added(&self, key: StreamKey, seq_id: u32, outcome: AddOutcome) {
        let ack_seq_id = {
            let now = Instant::now();
            let mut acks = self.acks.lock().await;
            let state = acks.entry(key).or_default();
            let is_duplicate = !outcome.accepted;
            if outcome.contiguous_up_to == 0 || (outcome.contiguous_up_to <= state.last_acked && !is_duplicate) {
                return;
            }

            let due = state.last_ack_at
                .map(|t| now.saturating_duration_since(t) >= self.config.ack_interval)
                .unwrap_or(true);
            if !(due && (is_duplicate || outcome.extends_prefix(seq_id))) {
                if outcome.contiguous_up_to > state.last_acked {
                    state.pending = Some(outcome.contiguous_up_to);
                }
                return;
            }
            state.last_acked = outcome.contiguous_up_to;
            state.last_ack_at = Some(now);
            state.pending = None;
            outcome.contiguous_up_to
        };
        self.send_control(key, ack_seq_id, Command::Ack).await;
    }

    /// One round of the periodic maintenance: request packets that have been missing for the
    ///  resend delay, re-send the oldest unacknowledged packets, send held back acks, and drop
    ///  state of streams closed long ago.
    pub async fn scan_once(&self, now: Instant) {
        for (key, missing) in self.queues.streams_needing_resend(now, self.config.resend_delay).await {
            debug!("requesting re-send of {:?} #{}", key, missing);
            self.send_control(key, missing, Command::RequestResend).await;
        }

        // the peer acks at least once per ack interval, and checks for due acks every resend delay
        let unacked_timeout = self.config.ack_interval + self.config.resend_delay;
        for mut packet in self.cache.overdue_heads(now, unacked_timeout).await {
            debug!("re-sending {:?} which was not acknowledged", packet);
            packet.timestamp = unix_nanos_now();
            if let Err(e) = self.pool.try_write(&packet).await {
                debug!("failed to re-send {:?}: {}", packet, e);
            }
        }

        let deferred = {
            let mut acks = self.acks.lock().await;
            let mut deferred = Vec::new();
            for (key, state) in acks.iter_mut() {
                let Some(pending) = state.pending else {
                    continue;
                };
                let due = state.last_ack_at
                    .map(|t| now.saturating_duration_since(t) >= self.config.ack_interval)
                    .unwrap_or(true);
                if due {
                    state.last_acked = pending;
                    state.last_ack_at = Some(now);
                    state.pending = None;
                    deferred.push((*key, pending));
                }
            }
            deferred
        };
        for (key, seq_id) in deferred {
            self.send_control(key, seq_id, Command::Ack).await;
        }

        let expired = self.queues.collect_garbage(now, self.config.stream_gc_grace).await;
        if !expired.is_empty() {
            debug!("cleaning up {} closed streams", expired.len());
            let mut acks = self.acks.lock().await;
            for key in expired {
                acks.remove(&key);
                self.cache.close(key).await;
            }
        }
    }

    pub async fn status(&self) -> NodeStatus {
        let counts = self.pool.alive_counts().await;
        let mut result = NodeStatus {
            total_links: counts.total,
            alive_links: counts.alive,
            alive_tcp_links: counts.alive_tcp,
            alive_udp_links: counts.alive_udp,
            streams: self.queues.num_streams().await,
            queued_packets: self.queues.len().await,
            cached_packets: self.cache.len().await,
            delivered_tcp_bytes: self.queues.delivered_bytes(LinkKind::Tcp),
            delivered_udp_bytes: self.queues.delivered_bytes(LinkKind::Udp),
            ..Default::default()
        };
        for link in self.pool.links().await {
            match link.kind() {
                LinkKind::Tcp => {
                    result.sent_tcp_bytes += link.sent_bytes();
                    result.recv_tcp_bytes += link.recv_bytes();
                }
                LinkKind::Udp => {
                    result.sent_udp_bytes += link.sent_bytes();
                    result.recv_udp_bytes += link.recv_bytes();
                }
            }
        }
        result
    }
}

#[async_trait]
impl PacketDispatcher for Node {
    async fn on_packet(&self, link: &Arc<Link>, packet: Packet) {
        self.proc(link, &packet).await;
        match packet.command {
            Command::Ping | Command::Pong | Command::Ack | Command::RequestResend => {}
            _ => self.push(link.kind(), packet).await,
        }
    }
}
