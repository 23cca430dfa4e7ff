//! Server configuration and the optional TOML file layered under it.
use crate::errors::{Error, Result};
use crate::supervise::MAX_PERIOD;
use http::Uri;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default SOCKS5 listen address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8000";
/// Default block list source.
pub const DEFAULT_BLOCKED_IPS_URI: &str = "https://reestr.rublacklist.net/api/v2/ips/json";
/// Default refresh period of the block list.
pub const DEFAULT_BLOCKED_IPS_UPDATE_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);
/// Default tor runtime directory.
pub const DEFAULT_TOR_PATH: &str = "tor";
/// Config file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "rkn-bypasser.toml";

/// Everything a server run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  /// SOCKS5 listen address, `host:port`
  pub listen_address: String,
  /// Where the block list is downloaded from
  pub blocked_ips_uri: String,
  /// Time between block list refreshes
  pub blocked_ips_update_period: Duration,
  /// Tor runtime directory
  pub tor_path: PathBuf,
  /// torrc handed to tor
  pub torrc: Option<PathBuf>,
  /// Extra tor arguments
  pub tor_args: Vec<String>,
  /// `.tar.gz` used to stage the tor runtime when `tor_path` is missing
  pub tor_archive: Option<PathBuf>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    ServerConfig {
      listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
      blocked_ips_uri: DEFAULT_BLOCKED_IPS_URI.to_string(),
      blocked_ips_update_period: DEFAULT_BLOCKED_IPS_UPDATE_PERIOD,
      tor_path: PathBuf::from(DEFAULT_TOR_PATH),
      torrc: None,
      tor_args: vec!["--quiet".to_string()],
      tor_archive: None,
    }
  }
}

impl ServerConfig {
  /// Check the values a run cannot work without.
  pub fn validate(&self) -> Result<()> {
    if self.listen_address.trim().is_empty() {
      return Err(Error::Config("listen address is empty".to_string()));
    }
    if self.blocked_ips_update_period.is_zero() {
      return Err(Error::Config(
        "blocked ips update period must be positive".to_string(),
      ));
    }
    if self.blocked_ips_update_period > MAX_PERIOD {
      return Err(Error::Config(format!(
        "blocked ips update period must be at most {}s",
        MAX_PERIOD.as_secs()
      )));
    }
    self.blocked_ips_uri()?;
    Ok(())
  }
  /// The block list source as a URI; only http and https are accepted.
  pub fn blocked_ips_uri(&self) -> Result<Uri> {
    let uri: Uri = self
      .blocked_ips_uri
      .parse()
      .map_err(|e| Error::Config(format!("blocked ips uri {:?}: {e}", self.blocked_ips_uri)))?;
    match uri.scheme_str() {
      Some("http") | Some("https") if uri.host().is_some() => Ok(uri),
      _ => Err(Error::Config(format!(
        "blocked ips uri {:?} is not an http(s) url",
        self.blocked_ips_uri
      ))),
    }
  }
}

/// The TOML config file. Every key is optional and overrides the default.
///
/// ```toml
/// listen-address = "127.0.0.1:9050"
/// blocked-ips-update-period-secs = 3600
/// tor-args = ["--quiet"]
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
  /// `listen-address`
  pub listen_address: Option<String>,
  /// `blocked-ips-uri`
  pub blocked_ips_uri: Option<String>,
  /// `blocked-ips-update-period-secs`
  pub blocked_ips_update_period_secs: Option<u64>,
  /// `tor-path`
  pub tor_path: Option<PathBuf>,
  /// `torrc`
  pub torrc: Option<PathBuf>,
  /// `tor-args`
  pub tor_args: Option<Vec<String>>,
  /// `tor-archive`
  pub tor_archive: Option<PathBuf>,
}

impl FileConfig {
  /// Parse a config file body.
  pub fn parse(body: &str) -> Result<Self> {
    toml::from_str(body).map_err(|e| Error::Config(e.to_string()))
  }
  /// Read and parse the file at `path`.
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let body = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    Self::parse(&body)
  }
  /// Overlay the keys present in the file onto `config`.
  pub fn apply(self, config: &mut ServerConfig) {
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
  }
}
