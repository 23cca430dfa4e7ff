//! Tor as the overlay: a child process with a private data directory and a
//! loopback SocksPort that the dial capability talks SOCKS5 to.
use super::stage::{self, RuntimeArchive};
use super::{OverlayRuntime, OverlaySession};
use crate::connector::Connector;
use crate::dial::Dialer;
use crate::errors::{Error, Result};
use crate::socket::Socket;
use crate::socks5::{Socks5Client, TargetAddr};
use std::env::consts::EXE_SUFFIX;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How to find and launch tor.
#[derive(Debug, Clone)]
pub struct TorConfig {
  /// Directory holding the tor runtime
  pub path: PathBuf,
  /// Optional torrc; an empty one is generated when absent
  pub torrc: Option<PathBuf>,
  /// Extra command line arguments
  pub args: Vec<String>,
  /// Archive to stage the runtime from
  pub archive: Option<RuntimeArchive>,
}

impl Default for TorConfig {
  fn default() -> Self {
    TorConfig {
      path: PathBuf::from("tor"),
      torrc: None,
      args: vec!["--quiet".to_string()],
      archive: None,
    }
  }
}

/// Tor runtime staged under [`TorConfig::path`].
#[derive(Debug, Clone)]
pub struct TorRuntime {
  config: TorConfig,
  connector: Connector,
}

impl TorRuntime {
  /// Runtime using `config`; dials through it use `connector`.
  pub fn new(config: TorConfig, connector: Connector) -> Self {
    TorRuntime { config, connector }
  }
  /// The launch configuration.
  pub fn config(&self) -> &TorConfig {
    &self.config
  }
}

/// Tor executable inside the runtime directory.
fn executable(root: &Path) -> Option<PathBuf> {
  ["tor", "Tor"]
    .iter()
    .map(|dir| root.join(dir).join(format!("tor{EXE_SUFFIX}")))
    .find(|p| p.is_file())
}

/// GeoIP database `name` (`geoip` or `geoip6`) inside the runtime directory.
fn geoip_file(root: &Path, name: &str) -> Option<PathBuf> {
  [root.join("data").join("tor"), root.join("Data").join("Tor")]
    .into_iter()
    .map(|dir| dir.join(name))
    .find(|p| p.is_file())
}

/// Percentage from a `Bootstrapped NN%` notice.
fn bootstrap_progress(line: &str) -> Option<u8> {
  let rest = &line[line.find("Bootstrapped ")? + "Bootstrapped ".len()..];
  rest[..rest.find('%')?].parse().ok()
}

async fn free_loopback_port() -> Result<u16> {
  let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
    .await
    .map_err(|e| Error::Bootstrap(format!("pick socks port: {e}")))?;
  Ok(listener.local_addr()?.port())
}

/// Forward lines until bootstrap completes or stdout closes.
async fn wait_bootstrapped(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<()> {
  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| Error::Bootstrap(format!("read tor output: {e}")))?
  {
    tracing::debug!(target: "tor", "{line}");
    if let Some(progress) = bootstrap_progress(&line) {
      tracing::info!(progress, "tor bootstrapping");
      if progress >= 100 {
        return Ok(());
      }
    }
  }
  Err(Error::Bootstrap(
    "tor exited before bootstrap completed".to_string(),
  ))
}

impl OverlayRuntime for TorRuntime {
  type Session = TorSession;

  async fn ensure_staged(&self, token: &CancellationToken) -> Result<()> {
    stage::ensure_staged(&self.config.path, self.config.archive.as_ref(), token).await
  }

  async fn start(&self, token: &CancellationToken) -> Result<TorSession> {
    let root = &self.config.path;
    let exe = executable(root).ok_or_else(|| {
      Error::Bootstrap(format!("no tor executable under `{}`", root.display()))
    })?;
    let temp_base = root.join("Temp");
    tokio::fs::create_dir_all(&temp_base)
      .await
      .map_err(|e| Error::Bootstrap(format!("create tor temp dir: {e}")))?;
    let data_dir = tempfile::Builder::new()
      .prefix("data-dir-")
      .tempdir_in(&temp_base)
      .map_err(|e| Error::Bootstrap(format!("create tor data dir: {e}")))?;
    let torrc = match &self.config.torrc {
      Some(torrc) => torrc.clone(),
      None => {
        // 空的 torrc，避免读取系统的 torrc
        let torrc = data_dir.path().join("torrc");
        tokio::fs::write(&torrc, b"")
          .await
          .map_err(|e| Error::Bootstrap(format!("write torrc: {e}")))?;
        torrc
      }
    };
    let port = free_loopback_port().await?;

    let mut cmd = Command::new(&exe);
    cmd
      .arg("-f")
      .arg(&torrc)
      .arg("--DataDirectory")
      .arg(data_dir.path())
      .arg("--SocksPort")
      .arg(format!("127.0.0.1:{port}"));
    if let Some(geoip) = geoip_file(root, "geoip") {
      cmd.arg("--GeoIPFile").arg(geoip);
    }
    if let Some(geoip6) = geoip_file(root, "geoip6") {
      cmd.arg("--GeoIPv6File").arg(geoip6);
    }
    cmd
      .arg("--Log")
      .arg("notice stdout")
      .arg("__OwningControllerProcess")
      .arg(std::process::id().to_string())
      .args(&self.config.args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);
    #[cfg(unix)]
    if let Some(lib_dir) = exe.parent() {
      let mut paths = vec![lib_dir.to_path_buf()];
      if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
        paths.extend(std::env::split_paths(&existing));
      }
      if let Ok(joined) = std::env::join_paths(paths) {
        cmd.env("LD_LIBRARY_PATH", joined);
      }
    }

    tracing::info!(
      exe = %exe.display(),
      torrc = %torrc.display(),
      socks_port = port,
      args = ?self.config.args,
      "starting tor"
    );
    let mut child = cmd
      .spawn()
      .map_err(|e| Error::Bootstrap(format!("spawn `{}`: {e}", exe.display())))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| Error::Bootstrap("tor stdout not captured".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let ready = tokio::select! {
      biased;
      _ = token.cancelled() => Err(Error::Canceled),
      r = wait_bootstrapped(&mut lines) => r,
    };
    if let Err(e) = ready {
      let _ = child.kill().await;
      if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(%status, "tor exited");
      }
      return Err(e);
    }
    tracing::info!(socks_port = port, "tor started");

    let drain = tokio::spawn(async move {
      while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "tor", "{line}");
      }
    });
    let proxy = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    Ok(TorSession {
      child,
      data_dir,
      drain,
      dialer: TorDialer {
        client: Socks5Client::new(proxy, self.connector.clone()),
      },
    })
  }
}

/// A running tor process.
///
/// Dropping the session kills the process; [`OverlaySession::close`] also
/// reaps it and removes the data directory.
#[derive(Debug)]
pub struct TorSession {
  child: Child,
  data_dir: tempfile::TempDir,
  drain: JoinHandle<()>,
  dialer: TorDialer,
}

impl TorSession {
  /// Loopback address of tor's SocksPort.
  pub fn socks_addr(&self) -> SocketAddr {
    self.dialer.client.addr()
  }
}

impl OverlaySession for TorSession {
  type Dialer = TorDialer;

  fn dial_capability(&self) -> TorDialer {
    self.dialer.clone()
  }

  async fn close(self) {
    let TorSession {
      mut child,
      data_dir,
      drain,
      ..
    } = self;
    if let Err(e) = child.kill().await {
      tracing::warn!(error = %e, "kill tor");
    }
    if let Err(e) = drain.await {
      tracing::warn!(error = %e, "tor output task");
    }
    let path = data_dir.path().to_path_buf();
    if let Err(e) = data_dir.close() {
      tracing::warn!(path = %path.display(), error = %e, "remove tor data dir");
    }
    tracing::info!("tor stopped");
  }
}

/// Dials through tor's SocksPort.
#[derive(Debug, Clone)]
pub struct TorDialer {
  client: Socks5Client,
}

impl Dialer for TorDialer {
  async fn dial(&self, addr: &str) -> Result<Socket> {
    let target = TargetAddr::parse(addr)?;
    self.client.connect(&target).await
  }
}
