mod keygate;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "keygate",
    version,
    about = "Keygate - token-addressed Minecraft reverse proxy"
)]
struct Cli {
    /// Path to the Keygate config file (.toml/.yaml/.yml). If omitted, uses
    /// KEYGATE_CONFIG; then auto-detects keygate.toml > keygate.yaml >
    /// keygate.yml from CWD; then falls back to the OS user config dir.
    #[arg(long, env = "KEYGATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    keygate::run(cli.config).await
}
