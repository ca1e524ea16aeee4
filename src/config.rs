use std::time::Duration;
use anyhow::bail;
use crate::packet::Packet;

/// The largest UDP payload that can be sent over IPv4 without relying on jumbograms
const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone)]
pub struct TrafcaccConfig {
    /// A link is considered alive only if a ping or pong was received on it within this window
    pub keepalive: Duration,
    /// A link whose measured latency (relative to the best one-way delay observed on it) exceeds
    ///  this ceiling is not selected for sending, even if it is otherwise alive
    pub max_link_latency: Duration,

    /// Interval at which the dialer pings the backend over each of its links
    pub heartbeat_interval: Duration,
    /// Cadence of the link pool's liveness refresh while at least one link is alive
    pub pool_refresh_interval: Duration,
    /// Cadence of the link pool's liveness refresh while no link is alive. This is shorter than
    ///  the regular interval to minimize latency on cold start.
    pub pool_refresh_interval_unhealthy: Duration,

    /// A missing packet is requested from the peer once it has been missing for this long, and
    ///  the same packet is neither requested nor re-sent more often than this.
    ///
    /// This should be roughly twice the RTT between the nodes.
    pub resend_delay: Duration,
    /// Minimum interval between two acks for the same logical stream
    pub ack_interval: Duration,

    /// Maximum number of payload bytes per packet. Writes to a logical connection are split
    ///  into chunks of this size, and the resulting packets must fit into a single datagram
    ///  including their header.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    pub max_payload_len: usize,
    /// A read on a logical connection moves contiguous packets into its read buffer until at
    ///  least this many bytes are buffered
    pub read_buffer_size: usize,

    /// Back-off before the dialer re-establishes a failed link
    pub reconnect_delay: Duration,
    /// How long a write waits for some link to become alive before giving up
    pub link_wait_timeout: Duration,
    /// Time after which the state of a closed logical stream is reclaimed
    pub stream_gc_grace: Duration,
    /// Upper bound for a single frame on a connection-oriented link - a bigger frame means the
    ///  stream is corrupted, and the link is closed
    pub max_stream_frame_len: usize,

    /// Timeout for dialing a logical connection on behalf of a proxied client
    pub dial_timeout: Duration,
}

impl Default for TrafcaccConfig {
    fn default() -> Self {
        TrafcaccConfig {
            keepalive: Duration::from_secs(30),
            max_link_latency: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            pool_refresh_interval: Duration::from_secs(1),
            pool_refresh_interval_unhealthy: Duration::from_millis(200),
            resend_delay: Duration::from_millis(500),
            ack_interval: Duration::from_secs(1),
            max_payload_len: 1400,
            read_buffer_size: 16 * 1024,
            reconnect_delay: Duration::from_secs(1),
            link_wait_timeout: Duration::from_secs(10),
            stream_gc_grace: Duration::from_secs(30 * 60),
            max_stream_frame_len: 1024 * 1024,
            dial_timeout: Duration::from_secs(15),
        }
    }
}

impl TrafcaccConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        if self.max_payload_len + Packet::MAX_HEADER_LEN > MAX_UDP_PAYLOAD {
            bail!("max payload length {} does not fit into a UDP datagram together with the packet header", self.max_payload_len);
        }
        if self.max_stream_frame_len < self.max_payload_len + Packet::MAX_HEADER_LEN {
            bail!("max stream frame length {} is too small for a full-size packet", self.max_stream_frame_len);
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be positive");
        }

        for (name, interval) in [
            ("keepalive", self.keepalive),
            ("max_link_latency", self.max_link_latency),
            ("heartbeat_interval", self.heartbeat_interval),
            ("pool_refresh_interval", self.pool_refresh_interval),
            ("pool_refresh_interval_unhealthy", self.pool_refresh_interval_unhealthy),
            ("resend_delay", self.resend_delay),
            ("ack_interval", self.ack_interval),
        ] {
            if interval.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        if self.heartbeat_interval >= self.keepalive {
            bail!("heartbeat interval must be shorter than the keepalive window");
        }

        Ok(())
    }
}
