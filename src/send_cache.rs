use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::trace;
use crate::packet::{Packet, StreamKey};

/// Sequenced packets that were sent but not yet acknowledged, per logical stream, so they can be
///  re-sent when the peer requests them.
#[derive(Default)]
pub struct SendCache {
    streams: RwLock<FxHashMap<StreamKey, Arc<Mutex<CacheEntry>>>>,
}

#[derive(Default)]
struct CacheEntry {
    /// everything up to and including this was acknowledged by the peer
    last_acknowledged: u32,
    /// when `last_acknowledged` last moved forward
    last_ack_progress: Option<Instant>,
    buffered: BTreeMap<u32, CachedPacket>,
}

struct CachedPacket {
    packet: Packet,
    sent_at: Instant,
    last_resent: Option<Instant>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResendLookup {
    Resend(Packet),
    /// the packet was re-sent recently, so the request is most likely a duplicate
    TooRecent,
    /// the packet is not (or no longer) cached
    Missing,
}

impl SendCache {
    async fn entry(&self, key: StreamKey) -> Option<Arc<Mutex<CacheEntry>>> {
        self.streams.read().await.get(&key).cloned()
    }

    async fn get_or_create(&self, key: StreamKey) -> Arc<Mutex<CacheEntry>> {
        if let Some(entry) = self.entry(key).await {
            return entry;
        }
        self.streams.write().await
            .entry(key)
            .or_default()
            .clone()
    }

    /// Stores a sequenced packet. Packets that are already acknowledged are ignored.
    pub async fn add(&self, packet: &Packet) {
        if !packet.command.is_sequenced() {
            return;
        }
        let entry = self.get_or_create(packet.key()).await;
        let mut entry = entry.lock().await;
        if packet.seq_id <= entry.last_acknowledged {
            return;
        }
        entry.buffered.insert(packet.seq_id, CachedPacket {
            packet: packet.clone(),
            sent_at: Instant::now(),
            last_resent: None,
        });
    }

    /// Looks up a packet for re-sending on the peer's request. A packet is handed out at most
    ///  once per `resend_delay`, which suppresses request storms for the same gap.
    pub async fn get_for_resend(&self, key: StreamKey, seq_id: u32, now: Instant, resend_delay: Duration) -> ResendLookup {
        let Some(entry) = self.entry(key).await else {
            return ResendLookup::Missing;
        };
        let mut entry = entry.lock().await;
        let Some(cached) = entry.buffered.get_mut(&seq_id) else {
            return ResendLookup::Missing;
        };

        if let Some(last_resent) = cached.last_resent {
            if now.saturating_duration_since(last_resent) < resend_delay {
                return ResendLookup::TooRecent;
            }
        }
        cached.last_resent = Some(now);
        ResendLookup::Resend(cached.packet.clone())
    }

    /// The peer holds every packet up to and including `seq_id`
    pub async fn ack(&self, key: StreamKey, seq_id: u32) {
        let Some(entry) = self.entry(key).await else {
            trace!("ack for unknown stream {:?}", key);
            return;
        };
        let mut entry = entry.lock().await;
        if seq_id <= entry.last_acknowledged {
            return;
        }
        entry.last_acknowledged = seq_id;
        entry.last_ack_progress = Some(Instant::now());
        entry.buffered = match seq_id.checked_add(1) {
            Some(first_unacked) => entry.buffered.split_off(&first_unacked),
            None => BTreeMap::new(),
        };
    }

    /// The oldest unacknowledged packet of every stream, if neither it was sent or re-sent nor did
    ///  the acknowledged prefix advance within `timeout`. The peer can not notice that the last
    ///  packets of a burst are missing, so these are re-sent without a request.
    pub async fn overdue_heads(&self, now: Instant, timeout: Duration) -> Vec<Packet> {
        let entries = self.streams.read().await.values().cloned().collect::<Vec<_>>();
        let mut result = Vec::new();
        for entry in entries {
            let mut entry = entry.lock().await;
            let last_ack_progress = entry.last_ack_progress;
            let Some((_, head)) = entry.buffered.iter_mut().next() else {
                continue;
            };
            let last_activity = [Some(head.sent_at), head.last_resent, last_ack_progress]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(head.sent_at);
            if now.saturating_duration_since(last_activity) >= timeout {
                head.last_resent = Some(now);
                result.push(head.packet.clone());
            }
        }
        result
    }

    pub async fn close(&self, key: StreamKey) {
        self.streams.write().await.remove(&key);
    }

    /// total number of cached packets over all streams
    pub async fn len(&self) -> usize {
        let entries = self.streams.read().await.values().cloned().collect::<Vec<_>>();
        let mut result = 0;
        for entry in entries {
            result += entry.lock().await.buffered.len();
        }
        result
    }

    #[cfg(test)]
    async fn cached_seq_ids(&self, key: StreamKey) -> Vec<u32> {
        match self.entry(key).await {
            Some(entry) => entry.lock().await.buffered.keys().cloned().collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::packet::Command;

    const KEY: StreamKey = StreamKey { sender_id: 1, conn_id: 2 };

    async fn cache_with(seq_ids: impl IntoIterator<Item=u32>) -> SendCache {
        let cache = SendCache::default();
        for seq_id in seq_ids {
            cache.add(&Packet::data(KEY, seq_id, Bytes::from(vec![seq_id as u8]))).await;
        }
        cache
    }

    #[rstest]
    #[case::none(0, vec![1, 2, 3, 4])]
    #[case::first(1, vec![2, 3, 4])]
    #[case::middle(3, vec![4])]
    #[case::all(4, vec![])]
    #[case::beyond(9, vec![])]
    #[tokio::test]
    async fn test_ack_prunes(#[case] acked: u32, #[case] expected: Vec<u32>) {
        let cache = cache_with(1..=4).await;
        cache.ack(KEY, acked).await;
        assert_eq!(cache.cached_seq_ids(KEY).await, expected);

        // acknowledged packets are not cached again
        cache.add(&Packet::data(KEY, 1, Bytes::new())).await;
        assert_eq!(cache.cached_seq_ids(KEY).await.contains(&1), acked == 0);
    }

    #[tokio::test]
    async fn test_stale_ack_is_ignored() {
        let cache = cache_with(1..=4).await;
        cache.ack(KEY, 3).await;
        cache.ack(KEY, 2).await;
        assert_eq!(cache.cached_seq_ids(KEY).await, vec![4]);
    }

    #[tokio::test]
    async fn test_only_sequenced_packets_are_cached() {
        let cache = SendCache::default();
        cache.add(&Packet::control(KEY, 0, Command::Connect)).await;
        cache.add(&Packet::control(KEY, 1, Command::Ack)).await;
        cache.add(&Packet::control(KEY, 3, Command::Close)).await;
        assert_eq!(cache.cached_seq_ids(KEY).await, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_for_resend() {
        let cache = cache_with([1, 2]).await;
        let delay = Duration::from_millis(500);

        let t0 = Instant::now();
        match cache.get_for_resend(KEY, 2, t0, delay).await {
            ResendLookup::Resend(p) => assert_eq!(p.seq_id, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cache.get_for_resend(KEY, 2, t0 + Duration::from_millis(499), delay).await, ResendLookup::TooRecent);
        assert!(matches!(cache.get_for_resend(KEY, 2, t0 + delay, delay).await, ResendLookup::Resend(_)));

        assert_eq!(cache.get_for_resend(KEY, 3, t0, delay).await, ResendLookup::Missing);
        assert_eq!(cache.get_for_resend(StreamKey::new(9, 9), 1, t0, delay).await, ResendLookup::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_heads() {
        let cache = cache_with(1..=3).await;
        let timeout = Duration::from_millis(1500);
        let t0 = Instant::now();

        assert!(cache.overdue_heads(t0 + Duration::from_millis(1499), timeout).await.is_empty());

        // ack progress postpones the re-send
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.ack(KEY, 1).await;
        assert!(cache.overdue_heads(t0 + timeout, timeout).await.is_empty());

        let t1 = Instant::now() + timeout;
        let overdue = cache.overdue_heads(t1, timeout).await;
        assert_eq!(overdue.iter().map(|p| p.seq_id).collect::<Vec<_>>(), vec![2]);

        // paced by the last re-send
        assert!(cache.overdue_heads(t1 + Duration::from_millis(1499), timeout).await.is_empty());
        assert_eq!(cache.overdue_heads(t1 + timeout, timeout).await.len(), 1);

        cache.ack(KEY, 3).await;
        assert!(cache.overdue_heads(t1 + timeout * 4, timeout).await.is_empty());
    }

    #[tokio::test]
    async fn test_close() {
        let cache = cache_with(1..=3).await;
        assert_eq!(cache.len().await, 3);
        cache.close(KEY).await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.get_for_resend(KEY, 1, Instant::now(), Duration::ZERO).await, ResendLookup::Missing);
    }
}
