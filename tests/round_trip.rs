use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::Level;
use trafcacc::{ConnError, Dialer, Endpoint, LinkKind, Listener, PacketConn, TrafcaccConfig};

#[ctor::ctor(unsafe)]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

fn fast_config() -> TrafcaccConfig {
    TrafcaccConfig {
        heartbeat_interval: Duration::from_millis(50),
        pool_refresh_interval: Duration::from_millis(50),
        pool_refresh_interval_unhealthy: Duration::from_millis(20),
        resend_delay: Duration::from_millis(50),
        ack_interval: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(50),
        link_wait_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn echo(conn: PacketConn) {
    let mut buf = vec![0u8; 4096];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = conn.close().await;
}

fn local_addr(listener: &Listener, kind: LinkKind) -> SocketAddr {
    listener.local_addrs().iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, addr)| *addr)
        .unwrap()
}

fn endpoint(kind: LinkKind, addr: SocketAddr) -> Endpoint {
    format!("{}://{}", kind, addr).parse().unwrap()
}

async fn echo_listener() -> Listener {
    let endpoints = Endpoint::parse_list("tcp://127.0.0.1:0,udp://127.0.0.1:0").unwrap();
    Listener::bind(fast_config(), &endpoints, echo).await.unwrap()
}

async fn wait_for_links(dialer: &Dialer, tcp: usize, udp: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = dialer.status().await;
        if status.alive_tcp_links == tcp && status.alive_udp_links == udp {
            return;
        }
        assert!(Instant::now() < deadline, "links did not come up: {:?}", status);
        sleep(Duration::from_millis(10)).await;
    }
}

/// Forwards TCP connections to a target until it is killed, which drops all forwarded
///  connections at once
struct KillableProxy {
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl KillableProxy {
    async fn start(target: SocketAddr) -> KillableProxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            while let Ok((mut inbound, _)) = listener.accept().await {
                connections.spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });
        KillableProxy { addr, accept_task }
    }

    async fn kill(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

async fn read_exactly(conn: &PacketConn, len: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while result.len() < len {
        let n = conn.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "unexpected end of stream after {} bytes", result.len());
        result.extend_from_slice(&buf[..n]);
    }
    result
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip() {
    let listener = echo_listener().await;

    let mut dialer = Dialer::new(fast_config()).unwrap();
    dialer.setup(&[
        endpoint(LinkKind::Tcp, local_addr(&listener, LinkKind::Tcp)),
        endpoint(LinkKind::Udp, local_addr(&listener, LinkKind::Udp)),
    ]);
    wait_for_links(&dialer, 1, 1).await;

    let conn = dialer.dial_timeout(Duration::from_secs(5)).await.unwrap();
    let data: Vec<u8> = (0..64 * 1024).map(|_| rand::random::<u8>()).collect();

    let (write_result, echoed) = tokio::join!(
        conn.write(&data),
        timeout(Duration::from_secs(10), read_exactly(&conn, data.len())),
    );
    assert_eq!(write_result, Ok(data.len()));
    assert!(echoed.unwrap() == data);

    conn.close().await.unwrap();
    assert_eq!(conn.read(&mut [0u8; 16]).await, Ok(0));
    assert!(listener.status().await.delivered_tcp_bytes + listener.status().await.delivered_udp_bytes >= data.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_survives_link_failure() {
    let listener = echo_listener().await;
    let proxy = KillableProxy::start(local_addr(&listener, LinkKind::Tcp)).await;

    let mut dialer = Dialer::new(fast_config()).unwrap();
    dialer.setup(&[
        endpoint(LinkKind::Tcp, proxy.addr),
        endpoint(LinkKind::Udp, local_addr(&listener, LinkKind::Udp)),
    ]);
    wait_for_links(&dialer, 1, 1).await;

    let conn = dialer.dial_timeout(Duration::from_secs(5)).await.unwrap();
    let data: Vec<u8> = (0..64 * 1024).map(|_| rand::random::<u8>()).collect();
    let (first, second) = data.split_at(data.len() / 2);

    let writer = async {
        assert_eq!(conn.write(first).await, Ok(first.len()));
        proxy.kill().await;
        assert_eq!(conn.write(second).await, Ok(second.len()));
    };
    let (_, echoed) = tokio::join!(
        writer,
        timeout(Duration::from_secs(10), read_exactly(&conn, data.len())),
    );
    assert!(echoed.unwrap() == data);

    // the TCP link is gone for good, the UDP link carried the rest
    wait_for_links(&dialer, 0, 1).await;
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dial_waits_for_live_link() {
    // bind and drop a socket to get a free port
    let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

    let mut dialer = Dialer::new(fast_config()).unwrap();
    dialer.setup(&[format!("udp://127.0.0.1:{}", port).parse().unwrap()]);

    let err = dialer.dial_timeout(Duration::from_millis(200)).await.unwrap_err();
    assert_eq!(err, ConnError::Timeout(Duration::from_millis(200)));

    let endpoints = Endpoint::parse_list(&format!("udp://127.0.0.1:{}", port)).unwrap();
    let _listener = Listener::bind(fast_config(), &endpoints, echo).await.unwrap();
    let bound_at = Instant::now();

    // the next ping (or a re-dialed link's first ping) is answered, and the pong unblocks the
    //  dial right away
    let config = fast_config();
    let bound = config.heartbeat_interval.max(config.reconnect_delay) + config.pool_refresh_interval_unhealthy;
    let conn = dialer.dial_timeout(Duration::from_secs(5)).await.unwrap();
    assert!(bound_at.elapsed() < bound + Duration::from_millis(100), "dial took {:?} after bind", bound_at.elapsed());
    conn.write(b"ping").await.unwrap();
    assert_eq!(read_exactly(&conn, 4).await, b"ping");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_seen_by_peer() {
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    let tx = std::sync::Mutex::new(Some(tx));

    let endpoints = Endpoint::parse_list("udp://127.0.0.1:0").unwrap();
    let listener = Listener::bind(fast_config(), &endpoints, move |conn: PacketConn| {
        let tx = tx.lock().unwrap().take();
        async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while let Ok(n) = conn.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            if let Some(tx) = tx {
                let _ = tx.send(received);
            }
            let _ = conn.close().await;
        }
    }).await.unwrap();

    let mut dialer = Dialer::new(fast_config()).unwrap();
    dialer.setup(&[endpoint(LinkKind::Udp, local_addr(&listener, LinkKind::Udp))]);

    let conn = dialer.dial_timeout(Duration::from_secs(5)).await.unwrap();
    conn.write(b"last words").await.unwrap();
    conn.close().await.unwrap();
    conn.close().await.unwrap();

    let received = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(received, b"last words");
    assert_eq!(conn.write(b"more").await, Err(ConnError::Closed));
}
