use std::borrow::Cow;

/// Normalize a listen address. The config accepts the shorthands `":PORT"`
/// and `"PORT"` for "bind on all interfaces"; `SocketAddr` parsing and the
/// Tokio bind APIs accept neither, so expand them to `"0.0.0.0:PORT"`.
pub fn normalize_listen_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else if !addr.is_empty() && !addr.contains(':') && addr.chars().all(|c| c.is_ascii_digit()) {
        Cow::Owned(format!("0.0.0.0:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Same shorthands for the backend address, defaulting to loopback: a bare
/// port means a server on this host.
pub fn normalize_backend_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("127.0.0.1{addr}"))
    } else if !addr.is_empty() && !addr.contains(':') && addr.chars().all(|c| c.is_ascii_digit()) {
        Cow::Owned(format!("127.0.0.1:{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
