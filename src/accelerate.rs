//! Proxy roles built on the transport: a front-end accepts plain TCP clients and carries each
//!  client connection over a logical connection to the back-end, which forwards it to the real
//!  upstream service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use anyhow::bail;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use crate::config::TrafcaccConfig;
use crate::dialer::Dialer;
use crate::endpoint::{Endpoint, LinkKind};
use crate::listener::Listener;
use crate::packet_conn::PacketConn;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

fn tcp_addrs(endpoints: &[Endpoint], role: &str) -> anyhow::Result<Vec<String>> {
    let mut result = Vec::new();
    for endpoint in endpoints {
        if endpoint.kind != LinkKind::Tcp {
            bail!("{} only supports plain tcp endpoints, not {}", role, endpoint);
        }
        result.extend(endpoint.addrs());
    }
    if result.is_empty() {
        bail!("{} requires at least one tcp endpoint", role);
    }
    Ok(result)
}

/// Accepts TCP clients on `listen` and carries every client connection over its own logical
///  connection to the back-end at `upstream`. This runs until accepting fails.
pub async fn run_frontend(listen: &[Endpoint], upstream: &[Endpoint], config: TrafcaccConfig) -> anyhow::Result<()> {
    let listen_addrs = tcp_addrs(listen, "front-end listener")?;
    let dial_timeout = config.dial_timeout;

    let mut dialer = Dialer::new(config)?;
    dialer.setup(upstream);
    let dialer = Arc::new(dialer);

    let mut accept_loops = JoinSet::new();
    for addr in listen_addrs {
        let listener = TcpListener::bind(&addr).await?;
        info!("front-end accepting clients on {}", listener.local_addr()?);

        accept_loops.spawn(accept_clients(listener, dialer.clone(), dial_timeout));
    }

    while let Some(result) = accept_loops.join_next().await {
        result??;
    }
    Ok(())
}

async fn accept_clients(listener: TcpListener, dialer: Arc<Dialer>, dial_timeout: Duration) -> anyhow::Result<()> {
    loop {
        let (stream, client_addr) = listener.accept().await?;
        tokio::spawn(proxy_client(stream, client_addr.to_string(), dialer.clone(), dial_timeout));
    }
}

#[instrument(name="client", skip_all, fields(addr = %client_addr))]
async fn proxy_client(stream: TcpStream, client_addr: String, dialer: Arc<Dialer>, dial_timeout: Duration) {
    let conn = match dialer.dial_timeout(dial_timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("could not open logical connection for client: {}", e);
            return;
        }
    };
    debug!("client connected as {:?}", conn.key());
    splice(stream, conn).await;
}

/// Runs a listener on `listen` and forwards every logical connection over plain TCP to one of the
///  `upstream` addresses, round-robin. This runs for as long as the returned future is polled.
pub async fn run_backend(listen: &[Endpoint], upstream: &[Endpoint], config: TrafcaccConfig) -> anyhow::Result<()> {
    let upstream_addrs = Arc::new(tcp_addrs(upstream, "back-end upstream")?);
    let round_robin = Arc::new(AtomicUsize::new(0));

    let listener = Listener::bind(config, listen, move |conn: PacketConn| {
        let upstream_addrs = upstream_addrs.clone();
        let round_robin = round_robin.clone();
        async move {
            let addr = &upstream_addrs[round_robin.fetch_add(1, Ordering::Relaxed) % upstream_addrs.len()];
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("forwarding {:?} to {}", conn.key(), addr);
                    splice(stream, conn).await;
                }
                Err(e) => {
                    warn!("could not connect to upstream {} for {:?}: {}", addr, conn.key(), e);
                    let _ = conn.close().await;
                }
            }
        }
    }).await?;

    for (kind, addr) in listener.local_addrs() {
        info!("back-end accepting {} links on {}", kind, addr);
    }
    std::future::pending::<()>().await;
    Ok(())
}

/// Copies bytes both ways between a TCP stream and a logical connection until both directions
///  are finished. EOF from the TCP side closes the logical connection, EOF from the logical
///  connection shuts down the TCP write half.
pub async fn splice(stream: TcpStream, conn: PacketConn) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {}", e);
    }
    let (read_half, write_half) = stream.into_split();

    let (to_conn, from_conn) = tokio::join!(
        tcp_to_conn(read_half, &conn),
        conn_to_tcp(&conn, write_half),
    );
    if let Err(e) = to_conn {
        debug!("copying to {:?} ended with an error: {}", conn.key(), e);
    }
    if let Err(e) = from_conn {
        debug!("copying from {:?} ended with an error: {}", conn.key(), e);
    }
}

async fn tcp_to_conn(mut read_half: OwnedReadHalf, conn: &PacketConn) -> anyhow::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let result: anyhow::Result<()> = async {
        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write(&buf[..n]).await?;
        }
    }.await;
    conn.close().await?;
    result
}

async fn conn_to_tcp(conn: &PacketConn, mut write_half: OwnedWriteHalf) -> anyhow::Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_half.write_all(&buf[..n]).await?;
    }
    write_half.shutdown().await?;
    Ok(())
}
