//! SOCKS5 server: accepts clients, negotiates CONNECT and relays through a
//! [`Dialer`].
use crate::dial::Dialer;
use crate::errors::{Error, Result};
use crate::socks5::{consts, read_request, send_reply};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Time a client gets to finish the SOCKS5 negotiation.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// SOCKS5 front-end relaying every CONNECT through `D`.
///
/// Connection tasks are spawned on the given [`TaskTracker`] so the owner
/// can wait for them after cancelling.
#[derive(Debug)]
pub struct Socks5Server<D> {
  dialer: Arc<D>,
  tracker: TaskTracker,
  handshake_timeout: Duration,
}

impl<D: Dialer> Socks5Server<D> {
  /// Server dialing through `dialer`, tracking connections on `tracker`.
  pub fn new(dialer: D, tracker: TaskTracker) -> Self {
    Socks5Server {
      dialer: Arc::new(dialer),
      tracker,
      handshake_timeout: HANDSHAKE_TIMEOUT,
    }
  }
  /// Override the handshake timeout.
  pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }
  /// Accept connections until `token` is cancelled.
  ///
  /// Returns `Ok(())` on cancellation and `Err(Error::Serve)` when accepting
  /// fails; the listener stays usable in the latter case.
  pub async fn serve(&self, listener: &TcpListener, token: &CancellationToken) -> Result<()> {
    loop {
      let (stream, peer) = tokio::select! {
        biased;
        _ = token.cancelled() => return Ok(()),
        r = listener.accept() => r.map_err(Error::Serve)?,
      };
      let dialer = self.dialer.clone();
      let token = token.clone();
      let handshake_timeout = self.handshake_timeout;
      self.tracker.spawn(async move {
        tokio::select! {
          biased;
          _ = token.cancelled() => {}
          r = handle_connection(stream, peer, dialer.as_ref(), handshake_timeout) => {
            match r {
              Err(e) if e.is_canceled() => {}
              Err(e @ Error::Dial { .. }) => tracing::error!(%peer, error = %e, "connection failed"),
              Err(e) => tracing::debug!(%peer, error = %e, "connection closed"),
              Ok(()) => {}
            }
          }
        }
      });
    }
  }
}

async fn handle_connection<D: Dialer>(
  mut stream: TcpStream,
  peer: SocketAddr,
  dialer: &D,
  handshake_timeout: Duration,
) -> Result<()> {
  let target = tokio::time::timeout(handshake_timeout, read_request(&mut stream))
    .await
    .map_err(|_| Error::Protocol("handshake timed out".to_string()))??;
  // 名单里只有 IP，域名先在本地解析
  let addr = match target.resolve().await {
    Ok(addr) => addr.to_string(),
    Err(e) => {
      let _ = send_reply(&mut stream, consts::SOCKS5_REPLY_HOST_UNREACHABLE, None).await;
      return Err(e);
    }
  };
  tracing::debug!(%peer, %target, %addr, "connect");
  let mut upstream = match dialer.dial(&addr).await {
    Ok(upstream) => upstream,
    Err(e) => {
      let _ = send_reply(&mut stream, e.reply_code(), None).await;
      return Err(e);
    }
  };
  send_reply(
    &mut stream,
    consts::SOCKS5_REPLY_SUCCEEDED,
    upstream.local_addr().ok(),
  )
  .await?;
  let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
  tracing::debug!(%peer, %addr, up, down, "connection finished");
  Ok(())
}
