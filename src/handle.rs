//! An on/off switch around [`Server::listen`] for tray or CLI front-ends.
use crate::errors::{Error, Result};
use crate::listen::Server;
use crate::overlay::tor::TorRuntime;
use crate::overlay::OverlayRuntime;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Running {
  token: CancellationToken,
  join: JoinHandle<Result<()>>,
}

/// Owns at most one running `listen` of a shared [`Server`].
#[derive(Debug)]
pub struct ServerHandle<O = TorRuntime> {
  server: Arc<Server<O>>,
  running: Option<Running>,
}

impl<O: OverlayRuntime> ServerHandle<O> {
  /// Handle for `server`; nothing runs until [`ServerHandle::enable`].
  pub fn new(server: Server<O>) -> Self {
    ServerHandle {
      server: Arc::new(server),
      running: None,
    }
  }
  /// The server this handle drives.
  pub fn server(&self) -> &Server<O> {
    &self.server
  }
  /// Whether a run is in progress.
  pub fn is_running(&self) -> bool {
    self
      .running
      .as_ref()
      .is_some_and(|running| !running.join.is_finished())
  }
  /// Start a run. Returns `false` if one is already in progress.
  ///
  /// Must be called from within a tokio runtime.
  pub fn enable(&mut self) -> bool {
    if self.is_running() {
      return false;
    }
    if let Some(previous) = self.running.take() {
      // finished on its own; its result was not collected
      previous.join.abort();
    }
    let token = CancellationToken::new();
    let server = self.server.clone();
    let run_token = token.clone();
    let join = tokio::spawn(async move { server.listen(&run_token).await });
    self.running = Some(Running { token, join });
    true
  }
  /// Stop the current run and wait until it has released everything.
  ///
  /// Returns the run's error if it had failed before being stopped.
  pub async fn disable(&mut self) -> Result<()> {
    match self.running.take() {
      Some(running) => {
        running.token.cancel();
        join(running.join).await
      }
      None => Ok(()),
    }
  }
  /// Wait for the current run to end by itself, e.g. on a startup failure.
  pub async fn wait(&mut self) -> Result<()> {
    match self.running.take() {
      Some(running) => join(running.join).await,
      None => Ok(()),
    }
  }
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
  handle
    .await
    .map_err(|e| Error::Other(format!("listen task: {e}")))?
}

impl<O> Drop for ServerHandle<O> {
  fn drop(&mut self) {
    if let Some(running) = &self.running {
      running.token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn startup_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    let server = Server::builder()
      .blocked_ips_uri(format!("http://{dead}/ips"))
      .listen_address("127.0.0.1:0")
      .build()
      .unwrap();
    let mut handle = ServerHandle::new(server);
    assert!(!handle.is_running());
    assert!(handle.enable());
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
    assert!(!handle.is_running());
  }

  #[tokio::test]
  async fn disable_without_run_is_ok() {
    let mut handle = ServerHandle::new(Server::new(Default::default()).unwrap());
    handle.disable().await.unwrap();
    handle.wait().await.unwrap();
  }
}
