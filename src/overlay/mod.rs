//! The anonymizing overlay network the proxy falls back to for blocked
//! destinations.
//!
//! The server only needs four things from it: stage the runtime files,
//! start it, get something that can dial through it, and close it again.
use crate::dial::Dialer;
use crate::errors::Result;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub mod stage;
pub mod tor;

pub use stage::RuntimeArchive;

/// A runtime that can be started to obtain an [`OverlaySession`].
pub trait OverlayRuntime: Send + Sync + 'static {
  /// The running overlay
  type Session: OverlaySession;
  /// Make sure the runtime files exist on disk. Existing files are kept.
  fn ensure_staged(&self, token: &CancellationToken) -> impl Future<Output = Result<()>> + Send;
  /// Launch the overlay and wait until it can carry traffic.
  fn start(&self, token: &CancellationToken) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// A running overlay, owned by one `listen` run.
pub trait OverlaySession: Send + 'static {
  /// Dialer routing through this session
  type Dialer: Dialer + Clone;
  /// The dial capability; valid until [`OverlaySession::close`].
  fn dial_capability(&self) -> Self::Dialer;
  /// Stop the overlay and release everything it holds.
  fn close(self) -> impl Future<Output = ()> + Send;
}
