//! The proxy server: loads the block list, brings up tor, then serves SOCKS5
//! until cancelled.
use crate::blocklist::{BlockListStore, Refresher};
use crate::client::Client;
use crate::config::ServerConfig;
use crate::connector::Connector;
use crate::dial::{DialRouter, DirectDialer};
use crate::errors::{Error, Result};
use crate::event::{EventSender, ListenEvent};
use crate::overlay::tor::{TorConfig, TorRuntime};
use crate::overlay::{OverlayRuntime, OverlaySession, RuntimeArchive};
use crate::server::Socks5Server;
use crate::supervise::{self, Pace};
use http::Uri;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pause before the serve loop retries after an accept error.
const SERVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
  config: ServerConfig,
  archive: Option<RuntimeArchive>,
  connector: Option<Connector>,
  events: Option<EventSender>,
}

impl ServerBuilder {
  /// Start from an existing configuration.
  pub fn from_config(config: ServerConfig) -> Self {
    ServerBuilder {
      config,
      ..Default::default()
    }
  }
  /// SOCKS5 listen address.
  ///
  /// Default is `127.0.0.1:8000`.
  pub fn listen_address<S: Into<String>>(mut self, addr: S) -> Self {
    self.config.listen_address = addr.into();
    self
  }
  /// Block list source.
  pub fn blocked_ips_uri<S: Into<String>>(mut self, uri: S) -> Self {
    self.config.blocked_ips_uri = uri.into();
    self
  }
  /// Time between block list refreshes.
  ///
  /// Default is 3 hours.
  pub fn blocked_ips_update_period(mut self, period: Duration) -> Self {
    self.config.blocked_ips_update_period = period;
    self
  }
  /// Tor runtime directory.
  pub fn tor_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.config.tor_path = path.into();
    self
  }
  /// torrc handed to tor.
  pub fn torrc<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.config.torrc = Some(path.into());
    self
  }
  /// Extra tor arguments, replacing the default `--quiet`.
  pub fn tor_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.config.tor_args = args.into_iter().map(Into::into).collect();
    self
  }
  /// Archive the tor runtime is staged from when the directory is missing.
  pub fn runtime_archive(mut self, archive: RuntimeArchive) -> Self {
    self.archive = Some(archive);
    self
  }
  /// Connector used for the block list download and direct dials.
  pub fn connector(mut self, connector: Connector) -> Self {
    self.connector = Some(connector);
    self
  }
  /// Where lifecycle events are sent.
  pub fn listen_events(mut self, events: EventSender) -> Self {
    self.events = Some(events);
    self
  }
  /// Build a server running tor from the configured runtime directory.
  pub fn build(mut self) -> Result<Server<TorRuntime>> {
    let connector = self.connector.get_or_insert_with(Connector::default).clone();
    let archive = self
      .archive
      .clone()
      .or_else(|| self.config.tor_archive.clone().map(RuntimeArchive::File));
    #[cfg(feature = "bundled-tor")]
    let archive = archive.or_else(|| Some(RuntimeArchive::bundled()));
    let tor = TorRuntime::new(
      TorConfig {
        path: self.config.tor_path.clone(),
        torrc: self.config.torrc.clone(),
        args: self.config.tor_args.clone(),
        archive,
      },
      connector,
    );
    self.build_with_overlay(tor)
  }
  /// Build a server on top of any overlay runtime.
  pub fn build_with_overlay<O: OverlayRuntime>(self, overlay: O) -> Result<Server<O>> {
    self.config.validate()?;
    let blocked_ips_uri = self.config.blocked_ips_uri()?;
    Ok(Server {
      config: self.config,
      blocked_ips_uri,
      overlay,
      connector: self.connector.unwrap_or_default(),
      store: BlockListStore::default(),
      events: self.events,
    })
  }
}

/// Selective tor proxy.
///
/// Each [`Server::listen`] call is one run: first block list load, tor
/// bootstrap, bind, serve, and teardown once the token is cancelled.
#[derive(Debug)]
pub struct Server<O = TorRuntime> {
  config: ServerConfig,
  blocked_ips_uri: Uri,
  overlay: O,
  connector: Connector,
  store: BlockListStore,
  events: Option<EventSender>,
}

impl Server<TorRuntime> {
  /// Server with tor staged under `config.tor_path`.
  pub fn new(config: ServerConfig) -> Result<Self> {
    ServerBuilder::from_config(config).build()
  }
  /// Create a `ServerBuilder` with the default configuration.
  pub fn builder() -> ServerBuilder {
    ServerBuilder::default()
  }
}

impl<O: OverlayRuntime> Server<O> {
  /// The configuration this server was built with.
  pub fn config(&self) -> &ServerConfig {
    &self.config
  }
  /// The block list currently used for routing.
  pub fn blocked_ips(&self) -> &BlockListStore {
    &self.store
  }

  async fn emit(&self, event: ListenEvent, token: &CancellationToken) {
    if let Some(events) = &self.events {
      events.emit(event, token).await;
    }
  }

  /// Run the proxy until `token` is cancelled.
  ///
  /// Returns `Ok(())` after cancellation, or the error of the stage that
  /// failed during startup. Either way every task, socket and process of
  /// the run is released before this returns and `Stopped` is the last
  /// event sent.
  pub async fn listen(&self, token: &CancellationToken) -> Result<()> {
    let token = token.child_token();
    // listen 的 future 被 drop 时也要停掉后台任务
    let _guard = token.clone().drop_guard();
    let tracker = TaskTracker::new();
    let result = self.run(&token, &tracker).await;
    token.cancel();
    tracker.close();
    tracker.wait().await;
    self.emit(ListenEvent::Stopped, &token).await;
    match result {
      Err(e) if e.is_canceled() => {
        tracing::info!("listen cancelled");
        Ok(())
      }
      Err(e) => {
        tracing::error!(error = %e, "listen failed");
        Err(e)
      }
      Ok(()) => Ok(()),
    }
  }

  async fn run(&self, token: &CancellationToken, tracker: &TaskTracker) -> Result<()> {
    tracing::info!(uri = %self.blocked_ips_uri, "loading blocked ips");
    self.emit(ListenEvent::LoadingBlockedIps, token).await;
    let refresher = Refresher::new(Client::new(self.connector.clone()), self.blocked_ips_uri.clone());
    refresher.refresh(token, &self.store).await?;
    tracker.spawn(refresher.run(
      token.clone(),
      self.store.clone(),
      self.config.blocked_ips_update_period,
    ));

    tracing::info!(tor_path = %self.config.tor_path.display(), "initializing tor");
    self.emit(ListenEvent::InitializingTor, token).await;
    self.overlay.ensure_staged(token).await?;
    tracing::info!("tor initialized");

    self.emit(ListenEvent::StartingTor, token).await;
    let session = self.overlay.start(token).await?;

    let result = self.serve(session.dial_capability(), token, tracker).await;
    // 先等所有连接结束，再关闭 tor
    token.cancel();
    tracker.close();
    tracker.wait().await;
    session.close().await;
    result
  }

  async fn serve<D>(&self, overlay: D, token: &CancellationToken, tracker: &TaskTracker) -> Result<()>
  where
    D: crate::dial::Dialer,
  {
    let addr = &self.config.listen_address;
    tracing::info!(listen_addr = %addr, "starting proxy server");
    self.emit(ListenEvent::StartingProxy, token).await;
    let listener = TcpListener::bind(addr.as_str()).await.map_err(|source| Error::Bind {
      addr: addr.clone(),
      source,
    })?;
    let local_addr = listener.local_addr()?;

    let router = DialRouter::new(
      self.store.clone(),
      DirectDialer::new(self.connector.clone()),
      overlay,
      token.clone(),
    );
    let server = Socks5Server::new(router, tracker.clone());
    let serve_token = token.clone();
    tracker.spawn(async move {
      let (server, listener, token) = (&server, &listener, &serve_token);
      supervise::run_until_cancelled(
        serve_token.clone(),
        "proxy server",
        Pace::Backoff(SERVE_RETRY_DELAY),
        move || server.serve(listener, token),
      )
      .await;
    });

    tracing::info!(%local_addr, "proxy server started");
    self.emit(ListenEvent::Started, token).await;
    token.cancelled().await;
    Ok(())
  }
}
