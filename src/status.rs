use std::ops::AddAssign;

/// Read-only snapshot of a node's counters. Byte counters cover the links that are currently
///  in the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub total_links: usize,
    pub alive_links: usize,
    pub alive_tcp_links: usize,
    pub alive_udp_links: usize,

    pub sent_tcp_bytes: u64,
    pub sent_udp_bytes: u64,
    pub recv_tcp_bytes: u64,
    pub recv_udp_bytes: u64,

    /// logical streams with a reorder queue, including closed ones awaiting cleanup
    pub streams: usize,
    /// packets waiting in reorder queues for a gap to be filled or for the application to read them
    pub queued_packets: usize,
    /// sent packets kept for re-sending until they are acknowledged
    pub cached_packets: usize,

    /// payload bytes handed to the application, by the kind of link they arrived on
    pub delivered_tcp_bytes: u64,
    pub delivered_udp_bytes: u64,
}

impl AddAssign<&NodeStatus> for NodeStatus {
    fn add_assign(&mut self, rhs: &NodeStatus) {
        self.total_links += rhs.total_links;
        self.alive_links += rhs.alive_links;
        self.alive_tcp_links += rhs.alive_tcp_links;
        self.alive_udp_links += rhs.alive_udp_links;
        self.sent_tcp_bytes += rhs.sent_tcp_bytes;
        self.sent_udp_bytes += rhs.sent_udp_bytes;
        self.recv_tcp_bytes += rhs.recv_tcp_bytes;
        self.recv_udp_bytes += rhs.recv_udp_bytes;
        self.streams += rhs.streams;
        self.queued_packets += rhs.queued_packets;
        self.cached_packets += rhs.cached_packets;
        self.delivered_tcp_bytes += rhs.delivered_tcp_bytes;
        self.delivered_udp_bytes += rhs.delivered_udp_bytes;
    }
}
