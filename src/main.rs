use anyhow::Context;
use clap::Parser;
use rkn_bypasser::config::DEFAULT_CONFIG_FILE;
use rkn_bypasser::{EventQueue, FileConfig, ServerBuilder, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// RKN blocks bypass service: a local SOCKS5 proxy that sends blocked
/// addresses through Tor.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// config file (default is ./rkn-bypasser.toml when present)
  #[arg(long, env = "RKN_BYPASSER_CONFIG")]
  config: Option<PathBuf>,

  /// proxy server listen address [default: 127.0.0.1:8000]
  #[arg(long, env = "RKN_BYPASSER_LISTEN_ADDRESS")]
  listen_address: Option<String>,

  /// blocked ips list url
  #[arg(long, env = "RKN_BYPASSER_BLOCKED_IPS_URI")]
  blocked_ips_uri: Option<String>,

  /// seconds between blocked ips list updates [default: 10800]
  #[arg(long, env = "RKN_BYPASSER_BLOCKED_IPS_UPDATE_PERIOD_SECS")]
  blocked_ips_update_period_secs: Option<u64>,

  /// tor path [default: tor]
  #[arg(long, env = "RKN_BYPASSER_TOR_PATH")]
  tor_path: Option<PathBuf>,

  /// torrc file path
  #[arg(long, env = "RKN_BYPASSER_TORRC")]
  torrc: Option<PathBuf>,

  /// tor args to use, comma separated [default: --quiet]
  #[arg(
    long,
    env = "RKN_BYPASSER_TOR_ARGS",
    value_delimiter = ',',
    allow_hyphen_values = true
  )]
  tor_args: Option<Vec<String>>,

  /// tor runtime archive (.tar.gz) to extract when tor path is missing
  #[arg(long, env = "RKN_BYPASSER_TOR_ARCHIVE")]
  tor_archive: Option<PathBuf>,
}

impl Cli {
  /// defaults < config file < env < flags
  fn into_config(self) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();
    let file = match &self.config {
      Some(path) => Some(path.clone()),
      None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    if let Some(path) = file {
      FileConfig::load(&path)
        .with_context(|| format!("load config {}", path.display()))?
        .apply(&mut config);
      tracing::info!(config = %path.display(), "using config");
    }
    if let Some(v) = self.listen_address {
      config.listen_address = v;
    }
    if let Some(v) = self.blocked_ips_uri {
      config.blocked_ips_uri = v;
    }
    if let Some(v) = self.blocked_ips_update_period_secs {
      config.blocked_ips_update_period = Duration::from_secs(v);
    }
    if let Some(v) = self.tor_path {
      config.tor_path = v;
    }
    if self.torrc.is_some() {
      config.torrc = self.torrc;
    }
    if let Some(v) = self.tor_args {
      config.tor_args = v;
    }
    if self.tor_archive.is_some() {
      config.tor_archive = self.tor_archive;
    }
    Ok(config)
  }
}

async fn shutdown_signal(token: CancellationToken) {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };
  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        tracing::error!(error = %e, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };
  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();
  tokio::select! {
    _ = ctrl_c => {}
    _ = terminate => {}
  }
  tracing::info!("stop signal received, stopping");
  token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let config = Cli::parse().into_config()?;
  let (events, mut rx) = EventQueue::new().channel();
  let server = ServerBuilder::from_config(config)
    .listen_events(events)
    .build()
    .context("failed to create proxy server")?;

  tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      tracing::debug!(%event, "listen event");
    }
  });
  let token = CancellationToken::new();
  tokio::spawn(shutdown_signal(token.clone()));

  server
    .listen(&token)
    .await
    .context("proxy server failed to listen")?;
  tracing::info!("everything is stopped, exiting");
  Ok(())
}
