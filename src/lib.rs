//! Multiplexed reliable transport: many lossy, out-of-order physical links (TCP and UDP) carry
//!  ordered, reliable logical connections between a dialer (front-end) and a listener (back-end).
//!
//! See [codec] for the wire format.
pub mod accelerate;
pub mod codec;
pub mod config;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod link_pool;
pub mod listener;
pub mod node;
pub mod packet;
pub mod packet_conn;
pub mod reorder_queue;
pub mod send_cache;
pub mod status;
pub mod util;

pub use config::TrafcaccConfig;
pub use dialer::Dialer;
pub use endpoint::{Endpoint, LinkKind};
pub use error::ConnError;
pub use listener::Listener;
pub use packet_conn::PacketConn;
pub use status::NodeStatus;
