use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::endpoint::LinkKind;
use crate::packet::{Packet, StreamKey};

/// Per logical stream, buffers sequenced packets that arrive out of order and releases them
///  strictly in sequence. Duplicates and packets that were already released are dropped, which
///  is what makes redundant delivery over several links safe.
#[derive(Default)]
pub struct ReorderQueue {
    streams: RwLock<FxHashMap<StreamKey, Arc<StreamQueue>>>,
    delivered_tcp_bytes: AtomicU64,
    delivered_udp_bytes: AtomicU64,
}

struct StreamQueue {
    state: Mutex<QueueState>,
    /// notified when the head packet arrives or the queue is closed
    arrived: Notify,
}

struct QueueState {
    /// the next sequence number to be released
    waiting_seq_id: u32,
    buffer: BTreeMap<u32, (Packet, LinkKind)>,
    /// since when `waiting_seq_id` has been missing while later packets are buffered
    gap_since: Option<Instant>,
    last_resend_request: Option<Instant>,
    closed_at: Option<Instant>,
}

impl QueueState {
    fn new() -> QueueState {
        QueueState {
            waiting_seq_id: 1,
            buffer: Default::default(),
            gap_since: None,
            last_resend_request: None,
            closed_at: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    fn has_head(&self) -> bool {
        self.buffer.contains_key(&self.waiting_seq_id)
    }

    fn update_gap(&mut self, now: Instant) {
        if self.buffer.is_empty() || self.has_head() {
            self.gap_since = None;
        }
        else if self.gap_since.is_none() {
            self.gap_since = Some(now);
            self.last_resend_request = None;
        }
    }

    /// highest sequence number such that it and all its predecessors were received
    fn contiguous_up_to(&self) -> u32 {
        let mut result = self.waiting_seq_id - 1;
        while self.buffer.contains_key(&(result + 1)) {
            result += 1;
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// `false` if the packet was a duplicate, was already released, or the queue is closed
    pub accepted: bool,
    pub waiting_seq_id: u32,
    pub contiguous_up_to: u32,
}

impl AddOutcome {
    /// the added packet is part of the contiguous prefix, i.e. there is no gap before it
    pub fn extends_prefix(&self, seq_id: u32) -> bool {
        self.accepted && seq_id <= self.contiguous_up_to
    }
}

impl ReorderQueue {
    async fn get(&self, key: StreamKey) -> Option<Arc<StreamQueue>> {
        self.streams.read().await.get(&key).cloned()
    }

    /// Registers a new stream, returning `false` if it exists already
    pub async fn create(&self, key: StreamKey) -> bool {
        let mut streams = self.streams.write().await;
        if streams.contains_key(&key) {
            return false;
        }
        trace!("creating reorder queue for {:?}", key);
        streams.insert(key, Arc::new(StreamQueue {
            state: Mutex::new(QueueState::new()),
            arrived: Notify::new(),
        }));
        true
    }

    pub async fn contains(&self, key: StreamKey) -> bool {
        self.streams.read().await.contains_key(&key)
    }

    /// Buffers a packet unless it is a duplicate or was already released. Returns `None` if the
    ///  stream is unknown.
    pub async fn add(&self, packet: Packet, arrived_via: LinkKind) -> Option<AddOutcome> {
        let queue = self.get(packet.key()).await?;
        let mut state = queue.state.lock().await;

        let seq_id = packet.seq_id;
        let accepted = !state.is_closed()
            && seq_id >= state.waiting_seq_id
            && !state.buffer.contains_key(&seq_id);

        if accepted {
            state.buffer.insert(seq_id, (packet, arrived_via));
            state.update_gap(Instant::now());
            if seq_id == state.waiting_seq_id {
                queue.arrived.notify_waiters();
            }
        }
        else {
            trace!("dropping duplicate or outdated packet {:?} (waiting for #{})", packet, state.waiting_seq_id);
        }

        Some(AddOutcome {
            accepted,
            waiting_seq_id: state.waiting_seq_id,
            contiguous_up_to: state.contiguous_up_to(),
        })
    }

    /// Removes and returns the head packet if it is present. A terminal packet (close / closed)
    ///  closes the queue instead of being returned.
    pub async fn pop(&self, key: StreamKey) -> Option<Packet> {
        let queue = self.get(key).await?;
        let mut state = queue.state.lock().await;

        let waiting_seq_id = state.waiting_seq_id;
        let (packet, arrived_via) = state.buffer.remove(&waiting_seq_id)?;
        state.waiting_seq_id += 1;
        let now = Instant::now();
        state.update_gap(now);

        if packet.command.is_terminal() {
            debug!("{:?} closed by peer ({:?})", key, packet.command);
            state.closed_at = Some(now);
            queue.arrived.notify_waiters();
            return None;
        }

        let counter = match arrived_via {
            LinkKind::Tcp => &self.delivered_tcp_bytes,
            LinkKind::Udp => &self.delivered_udp_bytes,
        };
        counter.fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        Some(packet)
    }

    /// Completes when the head packet is available or the queue is closed. An unknown stream
    ///  counts as closed.
    pub async fn wait_for_arrived(&self, key: StreamKey) {
        let Some(queue) = self.get(key).await else {
            return;
        };
        loop {
            let notified = queue.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = queue.state.lock().await;
                if state.is_closed() || state.has_head() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub async fn is_closed(&self, key: StreamKey) -> bool {
        match self.get(key).await {
            Some(queue) => queue.state.lock().await.is_closed(),
            None => true,
        }
    }

    /// Marks the queue closed and wakes all readers. This is idempotent.
    pub async fn close(&self, key: StreamKey) {
        if let Some(queue) = self.get(key).await {
            let mut state = queue.state.lock().await;
            if state.closed_at.is_none() {
                state.closed_at = Some(Instant::now());
            }
            queue.arrived.notify_waiters();
        }
    }

    /// Streams whose head has been missing for at least `delay`, together with the missing
    ///  sequence number. A stream is reported at most once per `delay`.
    pub async fn streams_needing_resend(&self, now: Instant, delay: Duration) -> Vec<(StreamKey, u32)> {
        let queues = self.streams.read().await
            .iter()
            .map(|(k, q)| (*k, q.clone()))
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for (key, queue) in queues {
            let mut state = queue.state.lock().await;
            if state.is_closed() {
                continue;
            }
            let Some(gap_since) = state.gap_since else {
                continue;
            };
            if now.saturating_duration_since(gap_since) < delay {
                continue;
            }
            if let Some(last) = state.last_resend_request {
                if now.saturating_duration_since(last) < delay {
                    continue;
                }
            }
            state.last_resend_request = Some(now);
            result.push((key, state.waiting_seq_id));
        }
        result
    }

    /// Drops the state of streams that were closed at least `grace` ago, returning their keys
    pub async fn collect_garbage(&self, now: Instant, grace: Duration) -> Vec<StreamKey> {
        let mut streams = self.streams.write().await;
        let mut expired = Vec::new();
        for (key, queue) in streams.iter() {
            // a queue that is locked is in use, so it is not expired
            if let Ok(state) = queue.state.try_lock() {
                if let Some(closed_at) = state.closed_at {
                    if now.saturating_duration_since(closed_at) >= grace {
                        expired.push(*key);
                    }
                }
            }
        }
        for key in &expired {
            streams.remove(key);
        }
        expired
    }

    /// number of packets buffered over all streams
    pub async fn len(&self) -> usize {
        let queues = self.streams.read().await.values().cloned().collect::<Vec<_>>();
        let mut result = 0;
        for queue in queues {
            result += queue.state.lock().await.buffer.len();
        }
        result
    }

    pub async fn num_streams(&self) -> usize {
        self.streams.read().await.len()
    }

    pub fn delivered_bytes(&self, kind: LinkKind) -> u64 {
        match kind {
            LinkKind::Tcp => self.delivered_tcp_bytes.load(Ordering::Relaxed),
            LinkKind::Udp => self.delivered_udp_bytes.load(Ordering::Relaxed),
        }
    }
}
