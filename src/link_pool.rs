use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use anyhow::bail;
use tokio::sync::{Notify, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, trace, warn};
use crate::config::TrafcaccConfig;
use crate::endpoint::LinkKind;
use crate::link::Link;
use crate::packet::Packet;

/// All links to one peer, with a periodically refreshed view of which of them are alive.
///
/// Outgoing packets are written to one or two of the alive links:
/// * a single UDP link if the packet prefers datagrams and a UDP link is alive
/// * otherwise one TCP and one UDP link if both kinds are alive
/// * otherwise two links (round-robin) of the kind that is available
pub struct LinkPool {
    inner: Arc<LinkPoolInner>,
    refresh_handle: Option<JoinHandle<()>>,
}

impl Drop for LinkPool {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
    }
}

struct LinkPoolInner {
    config: Arc<TrafcaccConfig>,
    links: RwLock<Links>,
    alive_notify: Notify,
    round_robin: AtomicUsize,
}

#[derive(Default)]
struct Links {
    all: Vec<Arc<Link>>,
    alive_tcp: Vec<Arc<Link>>,
    alive_udp: Vec<Arc<Link>>,
    alive_all: Vec<Arc<Link>>,
}

impl Links {
    fn recalc_alive(&mut self) {
        self.alive_tcp.clear();
        self.alive_udp.clear();
        self.alive_all.clear();
        for link in &self.all {
            if link.is_alive() {
                match link.kind() {
                    LinkKind::Tcp => self.alive_tcp.push(link.clone()),
                    LinkKind::Udp => self.alive_udp.push(link.clone()),
                }
                self.alive_all.push(link.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AliveCounts {
    pub total: usize,
    pub alive: usize,
    pub alive_tcp: usize,
    pub alive_udp: usize,
}

impl LinkPool {
    pub fn new(config: Arc<TrafcaccConfig>) -> LinkPool {
        LinkPool {
            inner: Arc::new(LinkPoolInner {
                config,
                links: Default::default(),
                alive_notify: Notify::new(),
                round_robin: AtomicUsize::new(0),
            }),
            refresh_handle: None,
        }
    }

    pub fn spawn_refresh_loop(&mut self) {
        if self.refresh_handle.is_some() {
            warn!("refresh loop already spawned");
            return;
        }
        self.refresh_handle = Some(tokio::spawn(Self::refresh_loop(self.inner.clone())));
    }

    async fn refresh_loop(inner: Arc<LinkPoolInner>) {
        loop {
            let delay = if inner.refresh().await {
                inner.config.pool_refresh_interval
            }
            else {
                inner.config.pool_refresh_interval_unhealthy
            };
            sleep(delay).await;
        }
    }

    /// Adds a link to the pool. Adding a link that is already in the pool has no effect.
    pub async fn append(&self, link: Arc<Link>) {
        if self.contains(link.id()).await {
            return;
        }
        {
            let mut links = self.inner.links.write().await;
            if links.all.iter().any(|l| l.id() == link.id()) {
                return;
            }
            debug!("adding {:?} to pool", link);
            links.all.push(link);
        }
        self.inner.refresh().await;
    }

    pub async fn contains(&self, link_id: u64) -> bool {
        self.inner.links.read().await
            .all.iter()
            .any(|l| l.id() == link_id)
    }

    pub async fn remove(&self, link_id: u64) {
        let mut links = self.inner.links.write().await;
        links.all.retain(|l| l.id() != link_id);
        links.alive_tcp.retain(|l| l.id() != link_id);
        links.alive_udp.retain(|l| l.id() != link_id);
        links.alive_all.retain(|l| l.id() != link_id);
    }

    /// Recalculates which links are alive, dropping closed links. Returns `true` if at least one
    ///  link is alive.
    pub async fn refresh(&self) -> bool {
        self.inner.refresh().await
    }

    pub async fn is_alive(&self, link_id: u64) -> bool {
        self.inner.links.read().await
            .alive_all.iter()
            .any(|l| l.id() == link_id)
    }

    pub async fn wait_for_alive(&self) {
        self.inner.wait_for_alive().await
    }

    pub async fn pick_links(&self, prefer_datagram: bool) -> Vec<Arc<Link>> {
        self.inner.pick_links(prefer_datagram).await
    }

    /// Writes a packet to the links chosen by the selection policy, concurrently. This succeeds if
    ///  the packet was written to at least one link.
    ///
    /// If no link is alive, this waits for one to become alive for up to the configured link wait
    ///  timeout.
    pub async fn write(&self, packet: &Packet) -> anyhow::Result<()> {
        for _ in 0..2 {
            let mut links = self.inner.pick_links(packet.prefer_datagram).await;
            if links.is_empty() {
                if tokio::time::timeout(self.inner.config.link_wait_timeout, self.inner.wait_for_alive()).await.is_err() {
                    bail!("no link became alive within {:?}", self.inner.config.link_wait_timeout);
                }
                links = self.inner.pick_links(packet.prefer_datagram).await;
            }

            if Self::send_to(links, packet).await {
                return Ok(());
            }
            debug!("writing {:?} failed on all selected links - refreshing", packet);
            self.inner.refresh().await;
        }
        bail!("writing {:?} failed on all selected links", packet)
    }

    /// Like [LinkPool::write], but fails right away instead of waiting if no link is alive. This
    ///  is for control traffic sent from a link's read loop, which must never block it.
    pub async fn try_write(&self, packet: &Packet) -> anyhow::Result<()> {
        let links = self.inner.pick_links(packet.prefer_datagram).await;
        if links.is_empty() {
            bail!("no alive link for {:?}", packet);
        }
        if !Self::send_to(links, packet).await {
            self.inner.refresh().await;
            bail!("writing {:?} failed on all selected links", packet);
        }
        Ok(())
    }

    /// returns `true` if the packet was written to at least one of the links
    async fn send_to(links: Vec<Arc<Link>>, packet: &Packet) -> bool {
        let mut join_set = JoinSet::new();
        for link in links {
            let packet = packet.clone();
            join_set.spawn(async move { link.send_packet(&packet).await });
        }

        let mut any_success = false;
        while let Some(result) = join_set.join_next().await {
            if let Ok(Ok(())) = result {
                any_success = true;
            }
        }
        any_success
    }

    pub async fn links(&self) -> Vec<Arc<Link>> {
        self.inner.links.read().await.all.clone()
    }

    pub async fn alive_counts(&self) -> AliveCounts {
        let links = self.inner.links.read().await;
        AliveCounts {
            total: links.all.len(),
            alive: links.alive_all.len(),
            alive_tcp: links.alive_tcp.len(),
            alive_udp: links.alive_udp.len(),
        }
    }
}

impl LinkPoolInner {
    async fn refresh(&self) -> bool {
        let mut links = self.links.write().await;
        links.all.retain(|l| !l.is_closed());
        links.recalc_alive();
        trace!("refreshed link pool: {} of {} links alive", links.alive_all.len(), links.all.len());

        let any_alive = !links.alive_all.is_empty();
        if any_alive {
            self.alive_notify.notify_waiters();
        }
        any_alive
    }

    async fn wait_for_alive(&self) {
        loop {
            let notified = self.alive_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.links.read().await.alive_all.is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn pick_links(&self, prefer_datagram: bool) -> Vec<Arc<Link>> {
        let links = self.links.read().await;
        let rr = self.round_robin.fetch_add(1, Ordering::Relaxed);

        if prefer_datagram && !links.alive_udp.is_empty() {
            return vec![links.alive_udp[rr % links.alive_udp.len()].clone()];
        }
        if !links.alive_tcp.is_empty() && !links.alive_udp.is_empty() {
            return vec![
                links.alive_tcp[rr % links.alive_tcp.len()].clone(),
                links.alive_udp[rr % links.alive_udp.len()].clone(),
            ];
        }
        match links.alive_all.len() {
            0 => vec![],
            1 => vec![links.alive_all[0].clone()],
            n => vec![
                links.alive_all[rr % n].clone(),
                links.alive_all[(rr + 1) % n].clone(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use crate::link::MockLinkSender;
    use crate::link::tests::test_link;
    use crate::packet::{Command, StreamKey};

    fn ok_sender() -> MockLinkSender {
        let mut sender = MockLinkSender::new();
        sender.expect_send_buf().returning(|_| Ok(()));
        sender.expect_shutdown().return_const(());
        sender
    }

    fn failing_sender() -> MockLinkSender {
        let mut sender = MockLinkSender::new();
        sender.expect_send_buf().returning(|_| Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken")));
        sender.expect_shutdown().return_const(());
        sender
    }

    async fn pool_with(kinds: &[LinkKind]) -> LinkPool {
        let pool = LinkPool::new(Arc::new(TrafcaccConfig::default()));
        for (i, kind) in kinds.iter().enumerate() {
            let link = test_link(i as u64, *kind, ok_sender());
            link.mark_live();
            pool.append(link).await;
        }
        pool
    }

    #[rstest]
    #[case::none(vec![], false, vec![])]
    #[case::prefer_udp(vec![LinkKind::Tcp, LinkKind::Udp, LinkKind::Udp], true, vec![LinkKind::Udp])]
    #[case::prefer_udp_unavailable(vec![LinkKind::Tcp, LinkKind::Tcp], true, vec![LinkKind::Tcp, LinkKind::Tcp])]
    #[case::mixed(vec![LinkKind::Tcp, LinkKind::Udp, LinkKind::Udp], false, vec![LinkKind::Tcp, LinkKind::Udp])]
    #[case::only_udp(vec![LinkKind::Udp, LinkKind::Udp, LinkKind::Udp], false, vec![LinkKind::Udp, LinkKind::Udp])]
    #[case::single(vec![LinkKind::Tcp], false, vec![LinkKind::Tcp])]
    #[tokio::test]
    async fn test_pick_links(#[case] kinds: Vec<LinkKind>, #[case] prefer_datagram: bool, #[case] expected: Vec<LinkKind>) {
        let pool = pool_with(&kinds).await;
        for _ in 0..kinds.len() + 1 {
            let picked = pool.pick_links(prefer_datagram).await;
            assert_eq!(picked.iter().map(|l| l.kind()).collect::<Vec<_>>(), expected);
            if picked.len() == 2 {
                assert_ne!(picked[0].id(), picked[1].id());
            }
        }
    }

    #[tokio::test]
    async fn test_round_robin_covers_all_links() {
        let pool = pool_with(&[LinkKind::Tcp, LinkKind::Tcp, LinkKind::Tcp]).await;
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..3 {
            for link in pool.pick_links(false).await {
                seen.insert(link.id());
            }
        }
        assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let pool = LinkPool::new(Arc::new(TrafcaccConfig::default()));
        let link = test_link(5, LinkKind::Tcp, ok_sender());
        pool.append(link.clone()).await;
        pool.append(link.clone()).await;
        assert_eq!(pool.alive_counts().await, AliveCounts { total: 1, alive: 0, alive_tcp: 0, alive_udp: 0 });

        link.mark_live();
        assert!(pool.refresh().await);
        assert!(pool.is_alive(5).await);

        pool.remove(5).await;
        assert_eq!(pool.alive_counts().await, AliveCounts::default());
    }

    #[tokio::test]
    async fn test_refresh_drops_closed_links() {
        let pool = pool_with(&[LinkKind::Tcp, LinkKind::Udp]).await;
        let links = pool.links().await;
        links[0].close().await;

        assert!(pool.refresh().await);
        assert_eq!(pool.alive_counts().await, AliveCounts { total: 1, alive: 1, alive_tcp: 0, alive_udp: 1 });
    }

    #[tokio::test]
    async fn test_write_succeeds_if_one_link_succeeds() {
        let pool = LinkPool::new(Arc::new(TrafcaccConfig::default()));
        let good = test_link(1, LinkKind::Udp, ok_sender());
        let bad = test_link(2, LinkKind::Tcp, failing_sender());
        good.mark_live();
        bad.mark_live();
        pool.append(good.clone()).await;
        pool.append(bad.clone()).await;

        pool.write(&Packet::data(StreamKey::new(1, 1), 1, Bytes::from_static(b"a"))).await.unwrap();
        assert!(bad.is_closed());
        assert!(good.sent_bytes() > 0);

        pool.refresh().await;
        assert_eq!(pool.alive_counts().await.total, 1);
    }

    #[tokio::test]
    async fn test_write_fails_if_all_links_fail() {
        let pool = LinkPool::new(Arc::new(TrafcaccConfig {
            link_wait_timeout: Duration::from_millis(10),
            ..Default::default()
        }));
        let bad = test_link(1, LinkKind::Tcp, failing_sender());
        bad.mark_live();
        pool.append(bad).await;

        assert!(pool.write(&Packet::data(StreamKey::new(1, 1), 1, Bytes::new())).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_write_does_not_wait_for_links() {
        let pool = LinkPool::new(Arc::new(TrafcaccConfig::default()));
        let dead = test_link(1, LinkKind::Udp, ok_sender());
        pool.append(dead.clone()).await;

        let start = tokio::time::Instant::now();
        assert!(pool.try_write(&Packet::control(StreamKey::new(1, 1), 1, Command::Ack)).await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(dead.sent_bytes(), 0);

        dead.mark_live();
        pool.refresh().await;
        pool.try_write(&Packet::control(StreamKey::new(1, 1), 1, Command::Ack)).await.unwrap();
        assert!(dead.sent_bytes() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_alive() {
        let mut pool = LinkPool::new(Arc::new(TrafcaccConfig::default()));
        pool.spawn_refresh_loop();
        let link = test_link(1, LinkKind::Udp, ok_sender());
        pool.append(link.clone()).await;

        let pool = Arc::new(pool);
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_for_alive().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        // the unhealthy refresh cadence picks up the link without an explicit refresh
        link.mark_live();
        tokio::time::timeout(Duration::from_millis(300), waiter).await.unwrap().unwrap();
    }
}
