pub mod app;
pub mod codec;
pub mod config;
pub mod http;
pub mod identity;
pub mod logging;
pub mod net;
pub mod notify;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod telemetry;
pub mod udp;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
