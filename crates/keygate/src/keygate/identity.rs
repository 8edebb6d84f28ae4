use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::watch;

/// One authorized user, as issued by the external admin surface. The proxy
/// never mutates records; it only resolves tokens to canonical names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub token: String,
    /// In-game name the login identity is rewritten to.
    pub name: String,
    pub owner_id: i64,
    pub owner_label: String,
}

pub trait IdentityStore: Send + Sync {
    fn find_by_token(&self, token: &str) -> Option<UserRecord>;
}

pub type SharedIdentityStore = Arc<dyn IdentityStore>;

/// Extracts the token from a dialed hostname: strips an optional `:port`,
/// then requires the `"."+base_domain` suffix (case-sensitive). Whatever
/// precedes the suffix is the token.
pub fn token_from_host<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    host.strip_suffix(base_domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|token| !token.is_empty())
}

/// Names the backend would refuse or that collide with admin keywords.
const RESERVED_NAMES: [&str; 3] = ["online", "list", "delete"];

pub fn is_valid_player_name(name: &str) -> bool {
    if RESERVED_NAMES.contains(&name) {
        return false;
    }
    (3..=16).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Tab-separated records file: `token \t name \t owner_id \t owner_label`,
/// one record per line. The admin surface appends to this file; the proxy
/// keeps an in-memory snapshot and swaps it on change.
pub struct FileIdentityStore {
    path: PathBuf,
    records: ArcSwap<Vec<UserRecord>>,
}

impl FileIdentityStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: ArcSwap::from_pointee(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&self) -> anyhow::Result<usize> {
        let records = load_records(&self.path)?;
        let n = records.len();
        self.records.store(Arc::new(records));
        Ok(n)
    }

    pub fn len(&self) -> usize {
        self.records.load().len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityStore for FileIdentityStore {
    fn find_by_token(&self, token: &str) -> Option<UserRecord> {
        self.records
            .load()
            .iter()
            .find(|r| r.token == token)
            .cloned()
    }
}

fn load_records(path: &Path) -> anyhow::Result<Vec<UserRecord>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        // A missing file is an empty store; the admin surface creates it
        // on first registration.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("identity: read {}", path.display()));
        }
    };

    let mut records = Vec::new();
    for line in data.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, '\t');
        let (Some(token), Some(name), Some(owner_id), Some(owner_label)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            tracing::warn!(path = %path.display(), line, "identity: skipping malformed record");
            continue;
        };

        if token.is_empty() || !is_valid_player_name(name) {
            tracing::warn!(path = %path.display(), name, "identity: skipping invalid record");
            continue;
        }

        records.push(UserRecord {
            token: token.to_string(),
            name: name.to_string(),
            owner_id: owner_id.parse().unwrap_or_default(),
            owner_label: owner_label.to_string(),
        });
    }

    Ok(records)
}

/// Polls the records file and reloads the snapshot when its size or mtime
/// changes. Runs until shutdown.
pub async fn watch_records(
    store: Arc<FileIdentityStore>,
    enabled: bool,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !enabled {
        let _ = shutdown.wait_for(|stop| *stop).await;
        return Ok(());
    }

    let poll = poll_interval.max(Duration::from_millis(200));
    let mut last_sig = file_sig(store.path());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(poll) => {
                let sig = file_sig(store.path());
                if sig == last_sig {
                    continue;
                }
                match store.reload() {
                    Ok(n) => {
                        tracing::info!(path = %store.path().display(), records = n, "identity: reloaded");
                        last_sig = sig;
                    }
                    Err(err) => {
                        tracing::warn!(path = %store.path().display(), err = %err, "identity: reload failed");
                    }
                }
            }
        }
    }
}


fn file_sig(path: &Path) -> Option<(u64, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Some((meta.len(), modified))
}
