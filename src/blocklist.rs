//! The blocked address list: an immutable snapshot, the store that swaps
//! snapshots, and the refresher that downloads new ones.
use crate::client::Client;
use crate::errors::{Error, Result};
use crate::supervise::{self, Pace};
use http::Uri;
use std::borrow::Cow;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Canonical textual form of `host`: IP literals are normalised, anything
/// else is returned untouched.
pub fn canonical_host(host: &str) -> Cow<'_, str> {
  let bare = host.trim_start_matches('[').trim_end_matches(']');
  match bare.parse::<IpAddr>() {
    Ok(ip) => Cow::Owned(ip.to_string()),
    Err(_) => Cow::Borrowed(host),
  }
}

/// One immutable snapshot of blocked addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedSet {
  addrs: HashSet<String>,
}

impl BlockedSet {
  /// Decode a JSON array of address strings.
  pub fn from_json(body: &[u8]) -> Result<Self> {
    let addrs: Vec<String> = serde_json::from_slice(body)?;
    Ok(addrs.into_iter().collect())
  }
  /// Whether `host` is listed.
  pub fn contains(&self, host: &str) -> bool {
    self.addrs.contains(canonical_host(host).as_ref())
  }
  /// Number of entries.
  pub fn len(&self) -> usize {
    self.addrs.len()
  }
  /// `true` when nothing is blocked.
  pub fn is_empty(&self) -> bool {
    self.addrs.is_empty()
  }
  /// Iterate over the stored entries.
  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.addrs.iter().map(String::as_str)
  }
}

impl<S: AsRef<str>> FromIterator<S> for BlockedSet {
  fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
    BlockedSet {
      addrs: iter
        .into_iter()
        .map(|s| canonical_host(s.as_ref()).into_owned())
        .collect(),
    }
  }
}

/// Shared holder of the current [`BlockedSet`].
///
/// Cloning the store shares the same snapshot slot.
#[derive(Debug, Clone, Default)]
pub struct BlockListStore {
  current: Arc<RwLock<Arc<BlockedSet>>>,
}

impl BlockListStore {
  /// The current snapshot.
  pub fn get(&self) -> Arc<BlockedSet> {
    self
      .current
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }
  /// Install `set` as the current snapshot.
  pub fn replace(&self, set: BlockedSet) {
    let set = Arc::new(set);
    *self.current.write().unwrap_or_else(PoisonError::into_inner) = set;
  }
  /// Whether `host` is in the current snapshot.
  pub fn contains(&self, host: &str) -> bool {
    self.get().contains(host)
  }
}

/// Downloads the block list and installs it into a store.
#[derive(Debug, Clone)]
pub struct Refresher {
  client: Client,
  uri: Uri,
}

impl Refresher {
  /// Refresher for the list published at `uri`.
  pub fn new(client: Client, uri: Uri) -> Self {
    Refresher { client, uri }
  }
  /// Download and decode the list once.
  pub async fn fetch_once(&self, token: &CancellationToken) -> Result<BlockedSet> {
    let response = tokio::select! {
      biased;
      _ = token.cancelled() => return Err(Error::Canceled),
      r = self.client.get(&self.uri) => r.map_err(|e| Error::Fetch(e.to_string()))?,
    };
    let status = response.status_code();
    if !status.is_success() {
      return Err(Error::Fetch(format!("{} returned {status}", self.uri)));
    }
    BlockedSet::from_json(response.body())
  }
  /// Fetch once and install the result, returning the entry count.
  pub async fn refresh(&self, token: &CancellationToken, store: &BlockListStore) -> Result<usize> {
    let set = self.fetch_once(token).await?;
    let count = set.len();
    if set.is_empty() {
      tracing::warn!(uri = %self.uri, "blocked ips list is empty, nothing will go through tor");
    }
    store.replace(set);
    tracing::info!(count, "blocked ips loaded");
    Ok(count)
  }
  /// Refresh every `period` until `token` is cancelled.
  ///
  /// The first refresh happens one period after the call. Failures keep the
  /// previous snapshot.
  pub async fn run(self, token: CancellationToken, store: BlockListStore, period: Duration) {
    let (refresher, run_token, store) = (&self, &token, &store);
    supervise::run_until_cancelled(
      token.clone(),
      "blocked ips loader",
      Pace::Every(period),
      move || async move { refresher.refresh(run_token, store).await.map(|_| ()) },
    )
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  async fn serve_once(status: &'static str, body: &'static str) -> Uri {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 1024];
      let _ = stream.read(&mut buf).await.unwrap();
      let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
      );
      stream.write_all(reply.as_bytes()).await.unwrap();
    });
    format!("http://{addr}/api/v2/ips/json").parse().unwrap()
  }

  #[test]
  fn ip_entries_are_canonicalised() {
    let set = BlockedSet::from_json(br#"["1.2.3.4", "2001:DB8::1", "example.com"]"#).unwrap();
    assert_eq!(set.len(), 3);
    assert!(set.contains("1.2.3.4"));
    assert!(set.contains("2001:db8::1"));
    assert!(set.contains("[2001:db8:0::1]"));
    assert!(set.contains("example.com"));
    assert!(!set.contains("5.6.7.8"));
  }

  #[test]
  fn malformed_payload_is_decode_error() {
    for body in [&b"{\"ips\": []}"[..], b"[1, 2]", b"not json"] {
      assert!(matches!(BlockedSet::from_json(body), Err(Error::Decode(_))));
    }
  }

  #[test]
  fn readers_see_whole_snapshots() {
    let store = BlockListStore::default();
    let first: BlockedSet = (0..100).map(|i| format!("10.0.0.{i}")).collect();
    let second: BlockedSet = (0..50).map(|i| format!("10.1.0.{i}")).collect();
    store.replace(first.clone());
    std::thread::scope(|s| {
      for _ in 0..4 {
        s.spawn(|| {
          for _ in 0..1000 {
            let snapshot = store.get();
            assert!(*snapshot == first || *snapshot == second);
          }
        });
      }
      s.spawn(|| {
        for i in 0..200 {
          store.replace(if i % 2 == 0 { second.clone() } else { first.clone() });
        }
      });
    });
  }

  #[test]
  fn old_snapshot_survives_replace() {
    let store = BlockListStore::default();
    store.replace(["1.2.3.4"].into_iter().collect());
    let old = store.get();
    store.replace(BlockedSet::default());
    assert!(old.contains("1.2.3.4"));
    assert!(!store.contains("1.2.3.4"));
  }

  #[tokio::test]
  async fn refresh_installs_fetched_list() {
    let uri = serve_once("200 OK", r#"["1.2.3.4"]"#).await;
    let store = BlockListStore::default();
    let refresher = Refresher::new(Client::default(), uri);
    let count = refresher
      .refresh(&CancellationToken::new(), &store)
      .await
      .unwrap();
    assert_eq!(count, 1);
    assert!(store.contains("1.2.3.4"));
  }

  #[tokio::test]
  async fn non_success_status_is_fetch_error() {
    let uri = serve_once("503 Service Unavailable", "[]").await;
    let refresher = Refresher::new(Client::default(), uri);
    let err = refresher.fetch_once(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
  }

  #[tokio::test]
  async fn unreachable_source_is_fetch_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let uri: Uri = format!("http://{addr}/").parse().unwrap();
    let err = Refresher::new(Client::default(), uri)
      .fetch_once(&CancellationToken::new())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
  }

  #[tokio::test]
  async fn cancelled_fetch_returns_canceled() {
    // accepts but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uri: Uri = format!("http://{addr}/").parse().unwrap();
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
      let _conn = listener.accept().await;
      cancel.cancel();
      tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let err = Refresher::new(Client::default(), uri)
      .fetch_once(&token)
      .await
      .unwrap_err();
    assert!(err.is_canceled());
  }
}
