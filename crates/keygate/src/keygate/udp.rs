use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::Context;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch, Mutex, Notify},
};

use crate::keygate::{
    net,
    pool::{BufferPool, PooledBuf},
    telemetry::SharedMetrics,
};

/// Cross-protocol authorization: datagrams are relayed only for source IPs
/// that currently have at least one live TCP login session. The two maps
/// are independent on purpose; one IP can back several TCP sessions and
/// several UDP endpoints at once. Lock order is authorization before
/// sessions; [`UdpGate::deauthorize`] releases the first before taking the
/// second.
#[derive(Debug, Default)]
pub struct UdpGate {
    /// Source IP -> count of live TCP login sessions.
    authorized: RwLock<HashMap<IpAddr, i64>>,
    /// Client endpoint -> live relay session.
    sessions: RwLock<HashMap<SocketAddr, UdpSession>>,
}

#[derive(Debug)]
struct UdpSession {
    backend: Arc<UdpSocket>,
    closer: Arc<Notify>,
}

impl UdpGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn authorize(&self, ip: IpAddr) {
        let mut authed = self
            .authorized
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *authed.entry(ip).or_insert(0) += 1;
    }

    /// Drops one reference for `ip`; when the last goes, every relay
    /// session from that IP is told to close.
    pub fn deauthorize(&self, ip: IpAddr) {
        let count = {
            let mut authed = self
                .authorized
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let count = match authed.get_mut(&ip) {
                Some(c) => {
                    *c -= 1;
                    *c
                }
                None => 0,
            };
            if count <= 0 {
                authed.remove(&ip);
            }
            count
        };

        if count > 0 {
            return;
        }

        // Authorization lock is already released; enumerate sessions under
        // their own lock and let each forwarder tear itself down.
        let closers: Vec<Arc<Notify>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(peer, _)| peer.ip() == ip)
            .map(|(_, s)| s.closer.clone())
            .collect();
        for closer in closers {
            closer.notify_one();
        }
    }

    pub fn is_authorized(&self, ip: IpAddr) -> bool {
        self.authorized
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip)
            .is_some_and(|c| *c > 0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn session_backend(&self, peer: &SocketAddr) -> Option<Arc<UdpSocket>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|s| s.backend.clone())
    }

    /// Inserts unless a racing worker got there first; the loser's socket
    /// is simply dropped.
    fn insert_session(
        &self,
        peer: SocketAddr,
        backend: Arc<UdpSocket>,
        closer: Arc<Notify>,
    ) -> Result<(), Arc<UdpSocket>> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(&peer) {
            return Err(existing.backend.clone());
        }
        sessions.insert(peer, UdpSession { backend, closer });
        Ok(())
    }

    fn remove_session(&self, peer: &SocketAddr) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

/// Holds one authorization reference for the lifetime of a TCP login
/// session. Dropping the guard releases the reference exactly once, on
/// any exit path, panics included.
pub struct AuthGuard {
    gate: Arc<UdpGate>,
    ip: IpAddr,
}

impl AuthGuard {
    pub fn new(gate: Arc<UdpGate>, ip: IpAddr) -> Self {
        gate.authorize(ip);
        Self { gate, ip }
    }
}

impl Drop for AuthGuard {
    fn drop(&mut self) {
        self.gate.deauthorize(self.ip);
    }
}

pub struct UdpProxyOptions {
    pub listen_addr: String,
    pub backend_addr: String,
    pub gate: Arc<UdpGate>,
    pub pool: BufferPool,
    pub metrics: SharedMetrics,
    /// Bounded datagram queue between the listener and the workers; a full
    /// queue blocks the listener, which is the intended backpressure.
    pub queue_size: usize,
    /// 0 means one worker per available CPU.
    pub workers: usize,
}

struct Datagram {
    peer: SocketAddr,
    len: usize,
    buf: PooledBuf,
}

pub async fn serve_udp(
    opts: UdpProxyOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listen_addr = net::normalize_listen_addr(&opts.listen_addr).into_owned();
    let socket = Arc::new(
        UdpSocket::bind(&listen_addr)
            .await
            .with_context(|| format!("bind udp {listen_addr}"))?,
    );
    tracing::info!(listen_addr = %listen_addr, buffer = opts.pool.buf_len(), "udp: listening");
    run(socket, opts, shutdown).await
}

async fn run(
    socket: Arc<UdpSocket>,
    opts: UdpProxyOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let workers = if opts.workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        opts.workers
    };

    let (tx, rx) = mpsc::channel::<Datagram>(opts.queue_size.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let backend_addr: Arc<str> = net::normalize_backend_addr(&opts.backend_addr)
        .into_owned()
        .into();
    let gate = opts.gate;
    let metrics = opts.metrics;

    for _ in 0..workers {
        let rx = rx.clone();
        let socket = socket.clone();
        let backend_addr = backend_addr.clone();
        let gate = gate.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            loop {
                let datagram = {
                    let mut rx = rx.lock().await;
                    match rx.recv().await {
                        Some(d) => d,
                        None => break,
                    }
                };
                forward_datagram(&socket, &backend_addr, &gate, &metrics, datagram).await;
                // the datagram's buffer drops back into the pool here
            }
        });
    }

    loop {
        let mut buf = opts.pool.acquire();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, peer)) => {
                        if tx.send(Datagram { peer, len, buf }).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "udp: recv failed");
                    }
                }
            }
        }
    }
}

async fn forward_datagram(
    listener: &Arc<UdpSocket>,
    backend_addr: &Arc<str>,
    gate: &Arc<UdpGate>,
    metrics: &SharedMetrics,
    datagram: Datagram,
) {
    if !gate.is_authorized(datagram.peer.ip()) {
        metrics.inc_udp_dropped();
        return;
    }

    let backend = match gate.session_backend(&datagram.peer) {
        Some(b) => b,
        None => match open_session(listener, backend_addr, gate, datagram.peer).await {
            Some(b) => b,
            None => {
                metrics.inc_udp_dropped();
                return;
            }
        },
    };

    match backend.send(&datagram.buf[..datagram.len]).await {
        Ok(_) => metrics.inc_udp_forwarded(),
        Err(err) => {
            tracing::debug!(peer = %datagram.peer, err = %err, "udp: forward to backend failed");
        }
    }
}

/// Dials a connected backend socket for `peer` and registers it together
/// with its reply forwarder. The dial happens outside the sessions lock;
/// if another worker won the race the fresh socket is discarded.
async fn open_session(
    listener: &Arc<UdpSocket>,
    backend_addr: &Arc<str>,
    gate: &Arc<UdpGate>,
    peer: SocketAddr,
) -> Option<Arc<UdpSocket>> {
    let backend = match resolve_and_dial(backend_addr).await {
        Ok(s) => Arc::new(s),
        Err(err) => {
            tracing::warn!(backend = %backend_addr, err = %err, "udp: backend dial failed");
            return None;
        }
    };

    let closer = Arc::new(Notify::new());
    match gate.insert_session(peer, backend.clone(), closer.clone()) {
        Ok(()) => {}
        Err(existing) => return Some(existing),
    }

    let gate = gate.clone();
    let listener = listener.clone();
    let reply_backend = backend.clone();
    tokio::spawn(async move {
        forward_replies(&listener, &reply_backend, peer, &closer).await;
        gate.remove_session(&peer);
    });

    Some(backend)
}

async fn resolve_and_dial(backend_addr: &str) -> anyhow::Result<UdpSocket> {
    let backend = tokio::net::lookup_host(backend_addr)
        .await
        .with_context(|| format!("resolve {backend_addr}"))?
        .next()
        .with_context(|| format!("no address for {backend_addr}"))?;

    let bind_addr = if backend.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.context("bind session socket")?;
    socket
        .connect(backend)
        .await
        .with_context(|| format!("connect {backend}"))?;
    Ok(socket)
}

/// Pumps backend replies to the original client endpoint through the main
/// listening socket. Exits on the first error or when told to close, and
/// leaves map cleanup to the caller-side wrapper.
async fn forward_replies(
    listener: &UdpSocket,
    backend: &UdpSocket,
    peer: SocketAddr,
    closer: &Notify,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = closer.notified() => return,
            res = backend.recv(&mut buf) => {
                let n = match res {
                    Ok(n) => n,
                    Err(_) => return,
                };
                if listener.send_to(&buf[..n], peer).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygate::telemetry::MetricsCollector;
    use std::time::Duration;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn authorization_is_reference_counted() {
        let gate = UdpGate::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(!gate.is_authorized(ip));
        gate.authorize(ip);
        gate.authorize(ip);
        assert!(gate.is_authorized(ip));

        gate.deauthorize(ip);
        assert!(gate.is_authorized(ip));
        gate.deauthorize(ip);
        assert!(!gate.is_authorized(ip));

        // unpaired release stays harmless
        gate.deauthorize(ip);
        assert!(!gate.is_authorized(ip));
        gate.authorize(ip);
        assert!(gate.is_authorized(ip));
    }

    #[test]
    fn auth_guard_releases_on_drop() {
        let gate = UdpGate::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        {
            let _guard = AuthGuard::new(gate.clone(), ip);
            assert!(gate.is_authorized(ip));
        }
        assert!(!gate.is_authorized(ip));
    }

    async fn wait_for_sessions(gate: &Arc<UdpGate>, want: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while gate.session_count() != want {
            assert!(
                tokio::time::Instant::now() < deadline,
                "session count never reached {want}"
            );
            tokio::time::sleep(TICK).await;
        }
    }

    #[tokio::test]
    async fn relays_only_for_authorized_sources() {
        let backend = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let backend_addr = backend.local_addr().unwrap();

        // echo everything back to whoever sent it
        let echo = backend.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen_addr = listener.local_addr().unwrap();

        let gate = UdpGate::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let opts = UdpProxyOptions {
            listen_addr: String::new(),
            backend_addr: backend_addr.to_string(),
            gate: gate.clone(),
            pool: BufferPool::new(4096),
            metrics: Arc::new(MetricsCollector::new()),
            queue_size: 16,
            workers: 2,
        };
        tokio::spawn(run(listener, opts, shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        let client_ip = client.local_addr().unwrap().ip();

        // unauthorized: dropped, no session appears
        client.send(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gate.session_count(), 0);

        // two concurrent TCP sessions from the same IP
        gate.authorize(client_ip);
        gate.authorize(client_ip);

        client.send(b"voice-1").await.unwrap();
        let mut buf = [0u8; 1024];
        let n = timeout(WAIT, client.recv(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        assert_eq!(&buf[..n], b"voice-1");
        assert_eq!(gate.session_count(), 1);

        // one TCP session ends: relay stays up
        gate.deauthorize(client_ip);
        client.send(b"voice-2").await.unwrap();
        let n = timeout(WAIT, client.recv(&mut buf))
            .await
            .expect("reply in time")
            .expect("recv");
        assert_eq!(&buf[..n], b"voice-2");
        assert_eq!(gate.session_count(), 1);

        // last TCP session ends: session force-closed, traffic dropped
        gate.deauthorize(client_ip);
        wait_for_sessions(&gate, 0).await;
        client.send(b"late").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(gate.session_count(), 0);

        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn backend_dial_failure_drops_datagram_without_session() {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let listen_addr = listener.local_addr().unwrap();

        let gate = UdpGate::new();
        let metrics: SharedMetrics = Arc::new(MetricsCollector::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let opts = UdpProxyOptions {
            listen_addr: String::new(),
            // unresolvable on purpose
            backend_addr: "backend.invalid:19132".into(),
            gate: gate.clone(),
            pool: BufferPool::new(4096),
            metrics: metrics.clone(),
            queue_size: 16,
            workers: 1,
        };
        tokio::spawn(run(listener, opts, shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        gate.authorize(client.local_addr().unwrap().ip());

        client.send(b"lost").await.unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while metrics.snapshot().udp_dropped == 0 {
            assert!(tokio::time::Instant::now() < deadline, "drop never counted");
            tokio::time::sleep(TICK).await;
        }
        assert_eq!(gate.session_count(), 0);

        let _ = shutdown_tx.send(true);
    }
}
