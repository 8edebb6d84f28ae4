use std::{io::Cursor, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::{timeout_at, Instant},
};

use crate::keygate::{
    codec,
    http::ResourcePackProxy,
    identity::{self, SharedIdentityStore, UserRecord},
    net,
    notify::SharedNotifier,
    pool::BufferPool,
    protocol::{self, Handshake, LoginStart},
    telemetry::{SharedMetrics, SharedSessions},
    udp::{AuthGuard, UdpGate},
};

pub const SPLICE_BUFFER_BYTES: usize = 32 * 1024;

pub struct TcpProxyOptions {
    pub listen_addr: String,
    pub backend_addr: String,
    pub base_domain: String,
    pub store: SharedIdentityStore,
    pub gate: Arc<UdpGate>,
    pub splice_pool: BufferPool,
    pub metrics: SharedMetrics,
    pub sessions: SharedSessions,
    pub notifier: SharedNotifier,
    pub http: Arc<ResourcePackProxy>,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

pub async fn serve_tcp(
    opts: Arc<TcpProxyOptions>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_addr = net::normalize_listen_addr(&opts.listen_addr).into_owned();
    let ln = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;
    tracing::info!(listen_addr = %listen_addr, "tcp: listening");
    run(ln, opts, shutdown).await
}

async fn run(
    ln: TcpListener,
    opts: Arc<TcpProxyOptions>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let opts = opts.clone();
                tokio::spawn(async move {
                    opts.metrics.inc_active();
                    if let Err(err) = handle_conn(conn, peer, &opts).await {
                        tracing::debug!(client = %peer, "proxy: connection ended: {err:#}");
                    }
                    opts.metrics.dec_active();
                });
            }
        }
    }
}

/// The listener carries framed game protocol and plain HTTP resource-pack
/// downloads on the same port; the first bytes decide which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Http,
    Game,
}

async fn handle_conn(
    conn: TcpStream,
    peer: SocketAddr,
    opts: &Arc<TcpProxyOptions>,
) -> anyhow::Result<()> {
    let (mut rh, mut wh) = conn.into_split();

    // One deadline covers everything up to the routing decision.
    let deadline = Instant::now() + opts.handshake_timeout;

    let (sniff, peeked) = timeout_at(deadline, sniff_prefix(&mut rh))
        .await
        .context("handshake deadline")??;

    if sniff == Sniff::Http {
        return opts.http.handle(peeked, rh, wh, peer).await;
    }

    // Sniffing consumed some bytes; stitch them back in front.
    let mut client_r = Cursor::new(peeked).chain(&mut rh);

    let (handshake, record) = timeout_at(deadline, async {
        let packet = codec::read_packet(&mut client_r).await?;
        let handshake = Handshake::decode(&packet)?;
        let record = identity::token_from_host(&handshake.address, &opts.base_domain)
            .and_then(|token| opts.store.find_by_token(token))
            .with_context(|| format!("no user for host {:?}", handshake.address))?;
        Ok::<_, anyhow::Error>((handshake, record))
    })
    .await
    .context("handshake deadline")??;

    // Routing decided; the deadline no longer applies.
    match handshake.next_state {
        protocol::NEXT_STATE_STATUS => {
            handle_status(&mut client_r, &mut wh, handshake, opts).await
        }
        protocol::NEXT_STATE_LOGIN => {
            handle_login(&mut client_r, &mut wh, peer, handshake, record, opts).await
        }
        other => anyhow::bail!("unknown next state {other}"),
    }
}

async fn sniff_prefix<R>(r: &mut R) -> anyhow::Result<(Sniff, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut peeked = Vec::with_capacity(16);
    loop {
        if let Some(sniff) = classify_prefix(&peeked) {
            return Ok((sniff, peeked));
        }
        let mut tmp = [0u8; 8];
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            // Let the packet reader produce the short-read error.
            return Ok((Sniff::Game, peeked));
        }
        peeked.extend_from_slice(&tmp[..n]);
    }
}

/// `None` means the bytes so far are still an ambiguous prefix of `GET` or
/// `HTTP`. A framed handshake can start with 'G' or 'H' only as a packet
/// length, never followed by the rest of either word.
fn classify_prefix(buf: &[u8]) -> Option<Sniff> {
    const GET: &[u8] = b"GET";
    const HTTP: &[u8] = b"HTTP";

    if buf.is_empty() {
        return None;
    }
    if buf.starts_with(GET) || buf.starts_with(HTTP) {
        return Some(Sniff::Http);
    }
    let ambiguous = (buf.len() < GET.len() && GET.starts_with(buf))
        || (buf.len() < HTTP.len() && HTTP.starts_with(buf));
    if ambiguous {
        None
    } else {
        Some(Sniff::Game)
    }
}

async fn dial_backend(opts: &TcpProxyOptions) -> anyhow::Result<TcpStream> {
    let addr = net::normalize_backend_addr(&opts.backend_addr).into_owned();
    let stream = tokio::time::timeout(opts.dial_timeout, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("dial timeout {addr}"))?
        .with_context(|| format!("dial {addr}"))?;
    Ok(stream)
}

/// Status is a pure passthrough; an unreachable backend degrades to a
/// synthesized "Offline" reply instead of a dropped connection.
async fn handle_status<R, W>(
    client_r: &mut R,
    client_w: &mut W,
    handshake: Handshake,
    opts: &TcpProxyOptions,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let prefix = handshake.to_packet().encode();
    match dial_backend(opts).await {
        Ok(mut backend) => {
            backend.write_all(&prefix).await?;
            splice(client_r, client_w, &mut backend, opts).await
        }
        Err(err) => {
            tracing::debug!(backend = %opts.backend_addr, "proxy: status dial failed, replying offline: {err:#}");
            let packet = protocol::offline_status_packet(handshake.protocol_version)?;
            client_w.write_all(&packet.encode()).await?;
            client_w.shutdown().await?;
            Ok(())
        }
    }
}

async fn handle_login<R, W>(
    client_r: &mut R,
    client_w: &mut W,
    peer: SocketAddr,
    handshake: Handshake,
    record: UserRecord,
    opts: &TcpProxyOptions,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let packet = codec::read_packet(client_r).await.context("read login start")?;
    let mut login = LoginStart::decode(&packet, handshake.protocol_version)?;
    let passed_name = login.name().to_string();
    login.rewrite(&record.name);

    // Datagram relay opens for this source IP as soon as the rewrite is
    // accepted, before the backend dial; the guard releases exactly once
    // on every exit path, a failed dial included.
    let _udp_auth = AuthGuard::new(opts.gate.clone(), peer.ip());

    // The backend sees only the re-encoded packets; the client's original
    // bytes end at the login-start boundary.
    let mut prefix = handshake.to_packet().encode();
    prefix.extend_from_slice(&login.to_packet().encode());

    let mut backend = dial_backend(opts).await.context("dial backend for login")?;
    backend
        .write_all(&prefix)
        .await
        .context("write rewritten prefix")?;

    let sid = opts
        .sessions
        .open(&record.name, &handshake.address, &peer.to_string());
    opts.notifier.player_connected(&record.name);
    tracing::info!(
        owner = %record.owner_label,
        domain = %opts.base_domain,
        client = %peer,
        from = %passed_name,
        player = %record.name,
        "proxy: player connected"
    );

    let res = splice(client_r, client_w, &mut backend, opts).await;

    opts.sessions.close(sid);
    opts.notifier.player_disconnected(&record.name);
    tracing::info!(owner = %record.owner_label, player = %record.name, "proxy: player disconnected");

    res
}

/// Two half-duplex pumps over pooled buffers. Whichever direction finishes
/// first (EOF or error) wins the select, the other pump is dropped at its
/// await point, and both streams are shut down.
async fn splice<R, W, S>(
    client_r: &mut R,
    client_w: &mut W,
    backend: &mut S,
    opts: &TcpProxyOptions,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut br, mut bw) = tokio::io::split(&mut *backend);

    let res = tokio::select! {
        r = copy_half(client_r, &mut bw, opts, Direction::ClientToBackend) => r,
        r = copy_half(&mut br, client_w, opts, Direction::BackendToClient) => r,
    };

    drop(br);
    drop(bw);
    let _ = client_w.shutdown().await;
    let _ = backend.shutdown().await;

    res.map(|_| ()).map_err(Into::into)
}

#[derive(Clone, Copy)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

async fn copy_half<R, W>(
    r: &mut R,
    w: &mut W,
    opts: &TcpProxyOptions,
    dir: Direction,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = opts.splice_pool.acquire();
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        w.write_all(&buf[..n]).await?;
        match dir {
            Direction::ClientToBackend => opts.metrics.add_bytes(n as u64, 0),
            Direction::BackendToClient => opts.metrics.add_bytes(0, n as u64),
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygate::{
        identity::testing::StaticStore,
        notify::LogNotifier,
        pool::BufferPool,
        telemetry::{MetricsCollector, SessionRegistry},
        udp::UdpGate,
    };
    use std::net::IpAddr;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_store() -> SharedIdentityStore {
        Arc::new(StaticStore::new(vec![UserRecord {
            token: "tokABC".into(),
            name: "RealOne".into(),
            owner_id: 42,
            owner_label: "alice".into(),
        }]))
    }

    fn test_opts(backend_addr: String, gate: Arc<UdpGate>) -> Arc<TcpProxyOptions> {
        let store = test_store();
        let http = Arc::new(
            ResourcePackProxy::new(
                backend_addr.clone(),
                "play.example.com".into(),
                store.clone(),
                Duration::from_secs(5),
            )
            .expect("http proxy"),
        );
        Arc::new(TcpProxyOptions {
            listen_addr: String::new(),
            backend_addr,
            base_domain: "play.example.com".into(),
            store,
            gate,
            splice_pool: BufferPool::new(SPLICE_BUFFER_BYTES),
            metrics: Arc::new(MetricsCollector::new()),
            sessions: Arc::new(SessionRegistry::new()),
            notifier: Arc::new(LogNotifier),
            http,
            handshake_timeout: WAIT,
            dial_timeout: WAIT,
        })
    }

    async fn start_proxy(opts: Arc<TcpProxyOptions>) -> (SocketAddr, watch::Sender<bool>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(run(ln, opts, rx));
        (addr, tx)
    }

    fn handshake_bytes(v: i32, addr: &str, next_state: i32) -> (Handshake, Vec<u8>) {
        let hs = Handshake {
            protocol_version: v,
            raw_address: addr.to_string(),
            address: addr.to_string(),
            port: 25565,
            next_state,
        };
        let bytes = hs.to_packet().encode();
        (hs, bytes)
    }

    fn unused_port_addr() -> String {
        let ln = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);
        addr.to_string()
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn prefix_classification() {
        assert_eq!(classify_prefix(b""), None);
        assert_eq!(classify_prefix(b"G"), None);
        assert_eq!(classify_prefix(b"GE"), None);
        assert_eq!(classify_prefix(b"GET"), Some(Sniff::Http));
        assert_eq!(classify_prefix(b"GET /pack"), Some(Sniff::Http));
        assert_eq!(classify_prefix(b"H"), None);
        assert_eq!(classify_prefix(b"HTT"), None);
        assert_eq!(classify_prefix(b"HTTP"), Some(Sniff::Http));
        assert_eq!(classify_prefix(b"GX"), Some(Sniff::Game));
        assert_eq!(classify_prefix(b"HX"), Some(Sniff::Game));
        assert_eq!(classify_prefix(&[0x10, 0x00]), Some(Sniff::Game));
    }

    #[tokio::test]
    async fn login_rewrites_identity_and_brackets_udp() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        let gate = UdpGate::new();
        let opts = test_opts(backend_addr, gate.clone());
        let (proxy_addr, _shutdown) = start_proxy(opts).await;

        // what the backend must receive as its stream prefix
        let (hs, hs_bytes) = handshake_bytes(765, "tokABC.play.example.com", 2);
        let login = LoginStart::V764 {
            name: "GuestName".into(),
            id: [0u8; 16],
        };
        let mut rewritten = login.clone();
        rewritten.rewrite("RealOne");
        let mut expected = hs.to_packet().encode();
        expected.extend_from_slice(&rewritten.to_packet().encode());

        let (prefix_tx, prefix_rx) = oneshot::channel::<Vec<u8>>();
        let (inner_tx, inner_rx) = oneshot::channel::<Vec<u8>>();
        let expected_len = expected.len();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut prefix = vec![0u8; expected_len];
            conn.read_exact(&mut prefix).await.unwrap();
            let _ = prefix_tx.send(prefix);

            let mut inner = vec![0u8; 5];
            conn.read_exact(&mut inner).await.unwrap();
            let _ = inner_tx.send(inner);

            conn.write_all(b"world").await.unwrap();
            // hold the backend open until the client goes away
            let mut sink = Vec::new();
            let _ = conn.read_to_end(&mut sink).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hs_bytes).await.unwrap();
        client.write_all(&login.to_packet().encode()).await.unwrap();

        let got = timeout(WAIT, prefix_rx).await.expect("prefix in time").unwrap();
        assert_eq!(got, expected);

        let client_ip: IpAddr = "127.0.0.1".parse().unwrap();
        wait_until(|| gate.is_authorized(client_ip), "udp authorization").await;

        // bytes after the login-start boundary pass through verbatim
        client.write_all(b"hello").await.unwrap();
        let inner = timeout(WAIT, inner_rx).await.expect("inner in time").unwrap();
        assert_eq!(inner, b"hello");

        let mut reply = vec![0u8; 5];
        timeout(WAIT, client.read_exact(&mut reply))
            .await
            .expect("reply in time")
            .unwrap();
        assert_eq!(reply, b"world");

        drop(client);
        wait_until(|| !gate.is_authorized(client_ip), "udp deauthorization").await;
    }

    #[tokio::test]
    async fn unknown_token_closes_without_backend_dial() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        let dialed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let dialed = dialed.clone();
            tokio::spawn(async move {
                if backend.accept().await.is_ok() {
                    dialed.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }

        let gate = UdpGate::new();
        let opts = test_opts(backend_addr, gate.clone());
        let (proxy_addr, _shutdown) = start_proxy(opts).await;

        let (_, hs_bytes) = handshake_bytes(765, "badtok.play.example.com", 2);
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hs_bytes).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, client.read(&mut buf))
            .await
            .expect("close in time")
            .unwrap();
        assert_eq!(n, 0, "expected silent close");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dialed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!gate.is_authorized("127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[tokio::test]
    async fn signed_login_data_is_rejected() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap().to_string();
        let dialed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let dialed = dialed.clone();
            tokio::spawn(async move {
                if backend.accept().await.is_ok() {
                    dialed.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }

        let gate = UdpGate::new();
        let opts = test_opts(backend_addr, gate);
        let (proxy_addr, _shutdown) = start_proxy(opts).await;

        let (_, hs_bytes) = handshake_bytes(760, "tokABC.play.example.com", 2);
        let mut payload = Vec::new();
        codec::put_string(&mut payload, "GuestName");
        codec::put_u8(&mut payload, 1); // signed chat data present
        let login_bytes = codec::Packet { id: 0x00, payload }.encode();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hs_bytes).await.unwrap();
        client.write_all(&login_bytes).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, client.read(&mut buf))
            .await
            .expect("close in time")
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dialed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn status_falls_back_to_offline_reply() {
        let gate = UdpGate::new();
        let opts = test_opts(unused_port_addr(), gate);
        let (proxy_addr, _shutdown) = start_proxy(opts).await;

        let (_, hs_bytes) = handshake_bytes(767, "tokABC.play.example.com", 1);
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&hs_bytes).await.unwrap();

        let mut response = Vec::new();
        timeout(WAIT, client.read_to_end(&mut response))
            .await
            .expect("reply in time")
            .unwrap();

        let packet = codec::read_packet(&mut Cursor::new(response))
            .await
            .expect("framed reply");
        assert_eq!(packet.id, protocol::STATUS_RESPONSE_PACKET_ID);
        let json = codec::read_string(
            &mut Cursor::new(packet.payload.as_slice()),
            codec::MAX_CHAT_BYTES,
        )
        .expect("status json");
        assert_eq!(
            json,
            r#"{"version":{"name":"Some server","protocol":767},"description":{"text":"Offline"},"favicon":""}"#
        );
    }

    #[tokio::test]
    async fn slow_handshake_hits_deadline() {
        let gate = UdpGate::new();
        let mut opts = test_opts(unused_port_addr(), gate);
        Arc::get_mut(&mut opts).unwrap().handshake_timeout = Duration::from_millis(150);
        let (proxy_addr, _shutdown) = start_proxy(opts).await;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        // say nothing; the proxy should hang up on its own
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, client.read(&mut buf))
            .await
            .expect("close in time")
            .unwrap();
        assert_eq!(n, 0);
    }
}
