use clap::Parser;
use proxycraft::cli::Cli;
use proxycraft::error::ProxyResult;
use proxycraft::ProxyCore;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ProxyResult<()> {
    let export_ca = cli.export_ca.clone();
    let config = cli.into_config();
    config.validate()?;
    config.ensure_directories()?;

    let core = ProxyCore::new(config)?;

    if let Some(path) = export_ca {
        core.ca().export_root_cert(&path)?;
        info!(path = %path.display(), "root CA certificate exported");
        return Ok(());
    }

    let stop_core = core.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        stop_core.stop();
    });

    core.run().await
}
