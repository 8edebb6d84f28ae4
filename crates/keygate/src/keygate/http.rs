use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::keygate::identity::{self, SharedIdentityStore};

const MAX_REQUEST_HEAD: usize = 16 * 1024;
const MAX_REQUEST_BODY: usize = 1024 * 1024;

/// Proxies one resource-pack download per connection: the same token
/// hostname rule as the game plane, replayed against the backend over a
/// plain HTTP client.
pub struct ResourcePackProxy {
    backend: String,
    base_domain: String,
    store: SharedIdentityStore,
    client: reqwest::Client,
}

impl ResourcePackProxy {
    pub fn new(
        backend: String,
        base_domain: String,
        store: SharedIdentityStore,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("http: build client")?;
        Ok(Self {
            backend,
            base_domain,
            store,
            client,
        })
    }

    /// `prefix` carries the bytes the dispatcher already consumed while
    /// sniffing the connection.
    pub async fn handle<R, W>(
        &self,
        prefix: Vec<u8>,
        mut r: R,
        mut w: W,
        peer: SocketAddr,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut raw = prefix;
        let head_len = loop {
            if let Some(n) = head_end(&raw) {
                break n;
            }
            if raw.len() > MAX_REQUEST_HEAD {
                anyhow::bail!("request head exceeds {MAX_REQUEST_HEAD} bytes");
            }
            let mut tmp = [0u8; 2048];
            let n = r.read(&mut tmp).await?;
            if n == 0 {
                anyhow::bail!("connection closed before request head");
            }
            raw.extend_from_slice(&tmp[..n]);
        };

        let req = parse_request(&raw[..head_len])?;

        let Some(record) = identity::token_from_host(&req.host, &self.base_domain)
            .and_then(|token| self.store.find_by_token(token))
        else {
            anyhow::bail!("rejected request for {} from {peer}", req.host);
        };

        tracing::info!(
            owner = %record.owner_label,
            path = %req.path,
            client = %peer,
            "http: transferring resource pack"
        );

        let body = self
            .read_body(&mut r, raw.split_off(head_len), req.content_length)
            .await?;

        let url = format!("http://{}{}", self.backend, req.path);
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .with_context(|| format!("method {:?}", req.method))?;

        let response = self
            .client
            .request(method, url)
            .headers(req.headers)
            .body(body)
            .send()
            .await
            .context("http: backend request failed")?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .context("http: read backend response")?;

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        for (name, value) in headers.iter() {
            if skip_on_write(name) {
                continue;
            }
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
        head.extend_from_slice(b"connection: close\r\n\r\n");

        w.write_all(&head).await?;
        w.write_all(&body).await?;
        w.shutdown().await?;
        Ok(())
    }

    async fn read_body<R>(
        &self,
        r: &mut R,
        mut body: Vec<u8>,
        content_length: usize,
    ) -> anyhow::Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        if content_length > MAX_REQUEST_BODY {
            anyhow::bail!("request body exceeds {MAX_REQUEST_BODY} bytes");
        }
        if body.len() < content_length {
            let mut rest = vec![0u8; content_length - body.len()];
            r.read_exact(&mut rest).await.context("read request body")?;
            body.extend_from_slice(&rest);
        } else {
            body.truncate(content_length);
        }
        Ok(body)
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    host: String,
    content_length: usize,
    /// Client headers minus the hop-by-hop ones the outbound client owns.
    headers: HeaderMap,
}

fn parse_request(head: &[u8]) -> anyhow::Result<ParsedRequest> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_buf);
    match req.parse(head).context("parse request head")? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => anyhow::bail!("truncated request head"),
    }

    let method = req.method.context("request missing method")?.to_string();
    let path = req.path.context("request missing path")?.to_string();

    let mut host = String::new();
    let mut content_length = 0usize;
    let mut headers = HeaderMap::new();
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("host") {
            host = String::from_utf8_lossy(h.value).trim().to_string();
            continue;
        }
        if h.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .context("bad content-length")?;
            continue;
        }
        if h.name.eq_ignore_ascii_case("transfer-encoding") {
            anyhow::bail!("transfer-encoding not supported");
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(h.name.as_bytes()),
            HeaderValue::from_bytes(h.value),
        ) {
            headers.append(name, value);
        }
    }

    if host.is_empty() {
        anyhow::bail!("request missing host header");
    }

    Ok(ParsedRequest {
        method,
        path,
        host,
        content_length,
        headers,
    })
}

fn head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn skip_on_write(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length" | "transfer-encoding" | "connection"
    )
}
