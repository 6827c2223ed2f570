use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tunnelgate::{GatewayConfig, RunStatus, TunnelManager};

#[derive(Parser)]
#[clap(name = "tunnelgate")]
#[clap(about = "A configurable TCP port-forwarding gateway", long_about = None)]
struct Cli {
    /// トンネル定義ファイル (拡張子 .toml なら TOML、それ以外は INI)
    #[clap(default_value = "config.ini")]
    config: PathBuf,

    /// シャットダウン時に接続が閉じるのを待つ秒数
    #[clap(long, default_value = "5")]
    grace_period: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();

    // 接続 1 本につきソケットを 2 つ使う
    if let Some(limit) = fdlimit::raise_fd_limit() {
        debug!("File descriptor limit raised to {}", limit);
    }

    // 設定ファイルが無ければトンネルを 1 本も起動せずに終了
    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    println!("Loading tunnels from {}...", cli.config.display());

    let mut specs = Vec::new();
    for section in config.sections {
        match section.tunnel.and_then(|tunnel| tunnel.into_spec()) {
            Ok(spec) => specs.push(spec),
            Err(e) => error!("Error in section [{}]: {}", section.name, e),
        }
    }

    // Ctrl+Cハンドラー
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // シグナルを受けられなくてもトンネルは動かし続ける
            error!("Failed to listen for ctrl-c signal: {:?}", e);
            std::future::pending::<()>().await;
        }
        info!("Gateway shutdown initiated by user.");
        let _ = shutdown_tx.send(());
    });

    let status = TunnelManager::new(specs)
        .with_grace_period(Duration::from_secs(cli.grace_period))
        .run(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await;

    match status {
        RunStatus::NoTunnels => println!("No tunnels configured or failed to start."),
        RunStatus::Stopped { .. } => println!("Gateway stopped."),
    }

    Ok(())
}
