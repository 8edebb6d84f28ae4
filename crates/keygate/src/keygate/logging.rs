use std::{fs::File, io, path::Path};

use anyhow::Context;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::keygate::config;

/// Flushes buffered log lines when dropped; hold it for the process
/// lifetime.
pub struct LogGuard {
    _writer: WorkerGuard,
}

pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LogGuard> {
    // RUST_LOG overrides the configured level.
    let level = cfg.level.trim().parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let (writer, guard) = open_sink(cfg.output.trim())?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);

    let registry = tracing_subscriber::registry().with(filter);
    if cfg.format.trim().eq_ignore_ascii_case("text") {
        registry.with(layer.with_ansi(true)).init();
    } else {
        registry.with(layer.with_ansi(false).json()).init();
    }

    Ok(LogGuard { _writer: guard })
}

fn open_sink(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    Ok(match output {
        "" | "stderr" => tracing_appender::non_blocking(io::stderr()),
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "discard" => tracing_appender::non_blocking(io::sink()),
        path => tracing_appender::non_blocking(append_to(Path::new(path))?),
    })
}

fn append_to(path: &Path) -> anyhow::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("logging: mkdir {}", dir.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("logging: open {}", path.display()))
}
