//! Lifecycle events reported while the proxy starts and stops.
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stage of a `listen` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenEvent {
  /// Downloading the first block list
  LoadingBlockedIps,
  /// Staging the tor runtime on disk
  InitializingTor,
  /// Launching tor and waiting for bootstrap
  StartingTor,
  /// Binding the SOCKS5 listener
  StartingProxy,
  /// Accepting connections
  Started,
  /// Everything released
  Stopped,
}

/// Number of events a single run can emit.
pub const LIFECYCLE_EVENT_COUNT: usize = 6;

impl ListenEvent {
  /// Stable lowercase name, e.g. `loading-blocked-ips`.
  pub fn as_str(&self) -> &'static str {
    match self {
      ListenEvent::LoadingBlockedIps => "loading-blocked-ips",
      ListenEvent::InitializingTor => "initializing-tor",
      ListenEvent::StartingTor => "starting-tor",
      ListenEvent::StartingProxy => "starting-proxy",
      ListenEvent::Started => "started",
      ListenEvent::Stopped => "stopped",
    }
  }
}

impl fmt::Display for ListenEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Bounded event channel constructor.
///
/// The capacity is never below [`LIFECYCLE_EVENT_COUNT`], so one run can
/// emit all of its events without waiting on the observer.
///
/// A sender may be reused across runs (see [`crate::ServerHandle`]). If the
/// observer has not drained the previous run, a send waits for room only
/// until that run is cancelled; the event is then dropped with a warning so
/// shutdown never depends on the observer.
#[derive(Debug, Clone, Copy)]
pub struct EventQueue {
  capacity: usize,
}

impl Default for EventQueue {
  fn default() -> Self {
    Self::new()
  }
}

impl EventQueue {
  /// Queue with room for one run.
  pub fn new() -> Self {
    EventQueue {
      capacity: LIFECYCLE_EVENT_COUNT,
    }
  }
  /// Queue with room for `capacity` events, clamped up to one run.
  pub fn with_capacity(capacity: usize) -> Self {
    EventQueue {
      capacity: capacity.max(LIFECYCLE_EVENT_COUNT),
    }
  }
  /// Effective capacity.
  pub fn capacity(&self) -> usize {
    self.capacity
  }
  /// Create the sender/receiver pair.
  pub fn channel(self) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(self.capacity);
    (EventSender { tx }, EventReceiver { rx })
  }
}

/// Producer side, held by the server.
#[derive(Debug, Clone)]
pub struct EventSender {
  tx: mpsc::Sender<ListenEvent>,
}

impl EventSender {
  /// Deliver `event`, waiting for room until `token` is cancelled.
  ///
  /// A closed receiver is ignored. Once cancelled, the event is queued only
  /// if there is room right away.
  pub async fn emit(&self, event: ListenEvent, token: &CancellationToken) {
    let sent = tokio::select! {
      biased;
      r = self.tx.send(event) => r.map_err(|_| mpsc::error::TrySendError::Closed(event)),
      _ = token.cancelled() => self.tx.try_send(event),
    };
    match sent {
      Ok(()) => {}
      Err(mpsc::error::TrySendError::Closed(_)) => {
        tracing::debug!(%event, "event observer gone");
      }
      Err(mpsc::error::TrySendError::Full(_)) => {
        tracing::warn!(%event, "event queue full, observer is not reading; event dropped");
      }
    }
  }
}

/// Consumer side, held by the observer.
#[derive(Debug)]
pub struct EventReceiver {
  rx: mpsc::Receiver<ListenEvent>,
}

impl EventReceiver {
  /// Next event, or `None` once every sender is gone.
  pub async fn recv(&mut self) -> Option<ListenEvent> {
    self.rx.recv().await
  }
  /// Next event if one is already queued.
  pub fn try_recv(&mut self) -> Option<ListenEvent> {
    self.rx.try_recv().ok()
  }
}
