use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

const FILE_CANDIDATES: [&str; 3] = ["keygate.toml", "keygate.yaml", "keygate.yml"];

/// The active config file plus where it was found, for the startup log.
#[derive(Debug, Clone)]
pub struct ConfigPath {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Search order: `--config` flag, `KEYGATE_CONFIG`, the working
/// directory, then the OS user config dir.
pub fn locate_config(flag: Option<PathBuf>) -> anyhow::Result<ConfigPath> {
    if let Some(p) = flag {
        return Ok(ConfigPath {
            path: resolve_explicit(p)?,
            source: "flag",
        });
    }

    // clap maps KEYGATE_CONFIG into the flag when the binary parses its
    // arguments; this branch covers direct calls and keeps the reported
    // source honest.
    match std::env::var_os("KEYGATE_CONFIG") {
        Some(v) if !v.is_empty() => {
            return Ok(ConfigPath {
                path: resolve_explicit(PathBuf::from(v))?,
                source: "env",
            });
        }
        _ => {}
    }

    if let Some(p) = config_in(Path::new(".")) {
        return Ok(ConfigPath {
            path: p,
            source: "cwd",
        });
    }

    let dirs = ProjectDirs::from("com", "keygate", "keygate")
        .context("config: cannot determine the user config directory")?;
    Ok(ConfigPath {
        path: dirs.config_dir().join(FILE_CANDIDATES[0]),
        source: "default",
    })
}

fn config_in(dir: &Path) -> Option<PathBuf> {
    FILE_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// An explicit path may point at a directory (searched for the usual
/// names) or at a file that does not exist yet (seeded later; bare names
/// get a `.toml` extension).
fn resolve_explicit(p: PathBuf) -> anyhow::Result<PathBuf> {
    anyhow::ensure!(!p.as_os_str().is_empty(), "config: empty config path");
    if p.is_dir() {
        return Ok(config_in(&p).unwrap_or_else(|| p.join(FILE_CANDIDATES[0])));
    }
    if !p.exists() && p.extension().is_none() {
        return Ok(p.with_extension("toml"));
    }
    Ok(p)
}

enum Format {
    Toml,
    Yaml,
}

fn format_of(path: &Path) -> anyhow::Result<Format> {
    match path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("toml") => Ok(Format::Toml),
        Some("yaml") | Some("yml") => Ok(Format::Yaml),
        other => anyhow::bail!(
            "config: unsupported config extension {other:?} (expected .toml or .yaml/.yml)"
        ),
    }
}

/// Writes the commented starter template when nothing exists at `path`.
/// Returns true if a new file was seeded.
pub fn seed_config_file(path: &Path) -> anyhow::Result<bool> {
    anyhow::ensure!(!path.as_os_str().is_empty(), "config: empty config path");
    if path.is_file() {
        return Ok(false);
    }
    anyhow::ensure!(
        !path.exists(),
        "config: {} exists but is not a regular file",
        path.display()
    );

    let template = match format_of(path)? {
        Format::Toml => DEFAULT_CONFIG_TEMPLATE_TOML,
        Format::Yaml => DEFAULT_CONFIG_TEMPLATE_YAML,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("config: mkdir {}", dir.display()))?;
    }

    // create_new so a concurrent seeder cannot clobber the file
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut f| {
            use std::io::Write;
            f.write_all(template.as_bytes())
        })
        .with_context(|| format!("config: seed {}", path.display()))?;
    Ok(true)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig = match format_of(path)? {
        Format::Toml => {
            toml::from_str(&raw).with_context(|| format!("parse toml {}", path.display()))?
        }
        Format::Yaml => {
            serde_yaml::from_str(&raw).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Shared TCP+UDP listen address.
    pub listen: String,
    /// The single game server behind the proxy.
    pub backend: String,
    /// Suffix under which per-user token hostnames live.
    pub base_domain: String,
    pub records_file: PathBuf,
    pub logging: LoggingConfig,
    pub timeouts: Timeouts,
    pub udp: UdpConfig,
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub handshake: Duration,
    pub dial: Duration,
    pub http: Duration,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub queue_size: usize,
    /// 0 means one worker per available CPU.
    pub workers: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    listen: String,

    #[serde(default)]
    backend: String,

    #[serde(default)]
    base_domain: String,

    #[serde(default)]
    records_file: String,

    logging: Option<FileLogging>,

    timeouts: Option<FileTimeouts>,

    udp: Option<FileUdp>,

    reload: Option<FileReload>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    handshake_timeout: Option<String>,
    handshake_timeout_ms: Option<i64>,
    dial_timeout: Option<String>,
    dial_timeout_ms: Option<i64>,
    http_timeout: Option<String>,
    http_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileUdp {
    queue_size: Option<i64>,
    workers: Option<i64>,
    buffer_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileReload {
    enabled: Option<bool>,
    poll_interval_ms: Option<i64>,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let listen = fc.listen.trim().to_string();
        if listen.is_empty() {
            anyhow::bail!("config: missing listen");
        }
        let backend = fc.backend.trim().to_string();
        if backend.is_empty() {
            anyhow::bail!("config: missing backend");
        }
        let base_domain = fc.base_domain.trim().trim_start_matches('.').to_string();
        if base_domain.is_empty() {
            anyhow::bail!("config: missing base_domain");
        }

        let records_file = if fc.records_file.trim().is_empty() {
            PathBuf::from("records.tsv")
        } else {
            PathBuf::from(fc.records_file.trim())
        };

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.level = level.to_string();
            }
            if let Some(fmt) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.format = fmt.to_string();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.output = out.to_string();
            }
            logging.add_source = l.add_source;
        }

        let t = fc.timeouts.as_ref();
        let timeouts = Timeouts {
            handshake: parse_timeout(
                t.and_then(|t| t.handshake_timeout.as_deref()),
                t.and_then(|t| t.handshake_timeout_ms),
                Duration::from_secs(5),
            )
            .context("config: invalid handshake_timeout")?,
            dial: parse_timeout(
                t.and_then(|t| t.dial_timeout.as_deref()),
                t.and_then(|t| t.dial_timeout_ms),
                Duration::from_secs(5),
            )
            .context("config: invalid dial_timeout")?,
            http: parse_timeout(
                t.and_then(|t| t.http_timeout.as_deref()),
                t.and_then(|t| t.http_timeout_ms),
                Duration::from_secs(30),
            )
            .context("config: invalid http_timeout")?,
        };

        let u = fc.udp.as_ref();
        let udp = UdpConfig {
            queue_size: u
                .and_then(|u| u.queue_size)
                .filter(|n| *n > 0)
                .unwrap_or(1024) as usize,
            workers: u.and_then(|u| u.workers).filter(|n| *n >= 0).unwrap_or(0) as usize,
            buffer_size: u
                .and_then(|u| u.buffer_size)
                .filter(|n| *n > 0)
                .unwrap_or(4096) as usize,
        };

        let reload = ReloadConfig {
            enabled: fc.reload.as_ref().and_then(|r| r.enabled).unwrap_or(true),
            poll_interval: Duration::from_millis(
                fc.reload
                    .as_ref()
                    .and_then(|r| r.poll_interval_ms)
                    .unwrap_or(1000)
                    .max(0) as u64,
            ),
        };

        Ok(Config {
            listen,
            backend,
            base_domain,
            records_file,
            logging,
            timeouts,
            udp,
            reload,
        })
    }
}

/// Timeouts accept either a humantime string (`"5s"`) or a millisecond
/// integer; the string form wins when both are present.
fn parse_timeout(
    text: Option<&str>,
    ms: Option<i64>,
    default: Duration,
) -> anyhow::Result<Duration> {
    if let Some(s) = text.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(humantime::parse_duration(s)?);
    }
    if let Some(ms) = ms {
        return Ok(Duration::from_millis(ms.max(0) as u64));
    }
    Ok(default)
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Keygate configuration (auto-generated)
#
# This file was created because Keygate could not find a configuration file
# at the resolved config path. Fill in the three addresses below; everything
# else has sensible defaults.

# Shared TCP+UDP listen address. ":25565" and "25565" mean all interfaces.
listen = ":25565"

# The game server behind the proxy. A bare port means localhost.
backend = "127.0.0.1:25566"

# Per-user hostnames look like <token>.<base_domain>.
base_domain = "play.example.com"

# Tab-separated user records: token, name, owner id, owner label.
records_file = "records.tsv"

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[timeouts]
handshake_timeout = "5s"
dial_timeout = "5s"
http_timeout = "30s"

[udp]
queue_size = 1024
workers = 0 # 0 = one per CPU
buffer_size = 4096

[reload]
enabled = true
poll_interval_ms = 1000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Keygate configuration (auto-generated)
#
# This file was created because Keygate could not find a configuration file
# at the resolved config path. Fill in the three addresses below; everything
# else has sensible defaults.

listen: ":25565"
backend: "127.0.0.1:25566"
base_domain: "play.example.com"
records_file: "records.tsv"

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

timeouts:
  handshake_timeout: "5s"
  dial_timeout: "5s"
  http_timeout: "30s"

udp:
  queue_size: 1024
  workers: 0 # 0 = one per CPU
  buffer_size: 4096

reload:
  enabled: true
  poll_interval_ms: 1000
"#;
