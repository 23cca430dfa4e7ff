//! Per-connection routing between the direct path and the overlay.
use crate::blocklist::BlockListStore;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::socket::Socket;
use crate::socks5::{split_host_port, TargetAddr};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Opens an outbound stream to `host:port`.
///
/// Implementations must be shareable across connection tasks.
pub trait Dialer: Send + Sync + 'static {
  /// Connect to `addr`, given as `host:port` (IPv6 hosts bracketed).
  fn dial(&self, addr: &str) -> impl Future<Output = Result<Socket>> + Send;
}

/// Which way a connection left the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialPath {
  /// Straight to the destination
  Direct,
  /// Through the overlay network
  Overlay,
}

impl fmt::Display for DialPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DialPath::Direct => f.write_str("direct"),
      DialPath::Overlay => f.write_str("overlay"),
    }
  }
}

/// Dials the destination over plain TCP.
#[derive(Clone, Debug, Default)]
pub struct DirectDialer {
  connector: Connector,
}

impl DirectDialer {
  /// Direct dialer on top of `connector`.
  pub fn new(connector: Connector) -> Self {
    DirectDialer { connector }
  }
}

impl Dialer for DirectDialer {
  async fn dial(&self, addr: &str) -> Result<Socket> {
    let target = TargetAddr::parse(addr)?.resolve().await?;
    let mut socket = self.connector.connect_with_addr(target).await?;
    // relayed traffic may idle for a long time
    socket.read_timeout = None;
    socket.write_timeout = None;
    Ok(socket)
  }
}

/// Chooses between the direct dialer and the overlay for every dial.
///
/// The destination host is looked up in the current block list snapshot;
/// listed hosts go through the overlay, everything else goes direct.
#[derive(Clone, Debug)]
pub struct DialRouter<O> {
  store: BlockListStore,
  direct: DirectDialer,
  overlay: O,
  token: CancellationToken,
}

impl<O: Dialer> DialRouter<O> {
  /// Router over `store`; dials are abandoned once `token` is cancelled.
  pub fn new(
    store: BlockListStore,
    direct: DirectDialer,
    overlay: O,
    token: CancellationToken,
  ) -> Self {
    DialRouter {
      store,
      direct,
      overlay,
      token,
    }
  }
  /// The path a dial to `addr` would take right now.
  ///
  /// Addresses that do not parse are routed direct, where the dial fails.
  pub fn route(&self, addr: &str) -> DialPath {
    match split_host_port(addr) {
      Ok((host, _)) if self.store.contains(host) => DialPath::Overlay,
      _ => DialPath::Direct,
    }
  }
}

impl<O: Dialer> Dialer for DialRouter<O> {
  async fn dial(&self, addr: &str) -> Result<Socket> {
    let path = self.route(addr);
    tracing::debug!(addr, %path, "route");
    let dial = async {
      match path {
        DialPath::Direct => self.direct.dial(addr).await,
        DialPath::Overlay => self.overlay.dial(addr).await,
      }
    };
    let result = tokio::select! {
      biased;
      _ = self.token.cancelled() => Err(Error::Canceled),
      r = dial => r,
    };
    result.map_err(|source| Error::Dial {
      path,
      addr: addr.to_string(),
      source: Box::new(source),
    })
  }
}
