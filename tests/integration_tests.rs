//! Integration tests for rkn-bypasser

use rkn_bypasser::socks5::{Socks5Client, TargetAddr};
use rkn_bypasser::{
  Connector, Dialer, DirectDialer, Error, EventQueue, EventReceiver, ListenEvent, OverlayRuntime,
  OverlaySession, Server, ServerHandle, Socket,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Overlay stand-in: dials directly but records every address it was asked for.
#[derive(Clone, Default)]
struct FakeOverlay {
  closed: Arc<AtomicBool>,
  dialed: Arc<Mutex<Vec<String>>>,
}

struct FakeSession(FakeOverlay);

#[derive(Clone)]
struct RecordingDialer(FakeOverlay);

impl OverlayRuntime for FakeOverlay {
  type Session = FakeSession;
  async fn ensure_staged(&self, _token: &CancellationToken) -> rkn_bypasser::Result<()> {
    Ok(())
  }
  async fn start(&self, _token: &CancellationToken) -> rkn_bypasser::Result<FakeSession> {
    self.closed.store(false, Ordering::SeqCst);
    Ok(FakeSession(self.clone()))
  }
}

impl OverlaySession for FakeSession {
  type Dialer = RecordingDialer;
  fn dial_capability(&self) -> RecordingDialer {
    RecordingDialer(self.0.clone())
  }
  async fn close(self) {
    self.0.closed.store(true, Ordering::SeqCst);
  }
}

impl Dialer for RecordingDialer {
  async fn dial(&self, addr: &str) -> rkn_bypasser::Result<Socket> {
    self.0.dialed.lock().unwrap().push(addr.to_string());
    DirectDialer::default().dial(addr).await
  }
}

/// Serves the given bodies in order, repeating the last one.
async fn block_list_source(status: &'static str, bodies: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counter = hits.clone();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      let body = bodies[n.min(bodies.len() - 1)];
      let mut buf = vec![0u8; 2048];
      let _ = stream.read(&mut buf).await;
      let reply = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
      );
      let _ = stream.write_all(reply.as_bytes()).await;
    }
  });
  (format!("http://{addr}/api/v2/ips/json"), hits)
}

async fn echo_server() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut r, mut w) = stream.split();
        let _ = tokio::io::copy(&mut r, &mut w).await;
      });
    }
  });
  addr
}

async fn free_addr() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap()
}

async fn wait_for(rx: &mut EventReceiver, wanted: ListenEvent) -> Vec<ListenEvent> {
  let mut seen = Vec::new();
  while let Some(event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
    .await
    .unwrap()
  {
    seen.push(event);
    if event == wanted {
      break;
    }
  }
  seen
}

async fn echo_through(proxy: SocketAddr, target: SocketAddr) {
  let client = Socks5Client::new(proxy, Connector::default());
  let mut socket = client.connect(&TargetAddr::Ip(target)).await.unwrap();
  socket.write_all(b"hello").await.unwrap();
  let mut buf = [0u8; 5];
  socket.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn clean_boot_and_shutdown() {
  let (uri, hits) = block_list_source("200 OK", vec![r#"["1.2.3.4"]"#]).await;
  let listen_addr = free_addr().await;
  let overlay = FakeOverlay::default();
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .blocked_ips_update_period(Duration::from_millis(50))
    .listen_events(events)
    .build_with_overlay(overlay.clone())
    .unwrap();
  let server = Arc::new(server);
  let token = CancellationToken::new();
  let run = {
    let (server, token) = (server.clone(), token.clone());
    tokio::spawn(async move { server.listen(&token).await })
  };

  let started = wait_for(&mut rx, ListenEvent::Started).await;
  assert_eq!(
    started,
    [
      ListenEvent::LoadingBlockedIps,
      ListenEvent::InitializingTor,
      ListenEvent::StartingTor,
      ListenEvent::StartingProxy,
      ListenEvent::Started,
    ]
  );
  assert!(server.blocked_ips().contains("1.2.3.4"));
  TcpStream::connect(listen_addr).await.unwrap();

  token.cancel();
  run.await.unwrap().unwrap();
  assert_eq!(rx.recv().await, Some(ListenEvent::Stopped));
  assert!(rx.try_recv().is_none());
  assert!(overlay.closed.load(Ordering::SeqCst));
  assert!(TcpStream::connect(listen_addr).await.is_err());

  // the refresher is gone too
  let after = hits.load(Ordering::SeqCst);
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert_eq!(hits.load(Ordering::SeqCst), after);
}

#[tokio::test]
async fn failed_first_fetch_binds_nothing() {
  let (uri, _) = block_list_source("500 Internal Server Error", vec!["oops"]).await;
  let listen_addr = free_addr().await;
  let overlay = FakeOverlay::default();
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(overlay.clone())
    .unwrap();
  let err = server.listen(&CancellationToken::new()).await.unwrap_err();
  assert!(matches!(err, Error::Fetch(_)));
  assert!(TcpStream::connect(listen_addr).await.is_err());
  assert_eq!(rx.try_recv(), Some(ListenEvent::LoadingBlockedIps));
  assert_eq!(rx.try_recv(), Some(ListenEvent::Stopped));
  assert!(rx.try_recv().is_none());
}

#[tokio::test]
async fn periodic_refresh_replaces_the_list() {
  let (uri, _) = block_list_source("200 OK", vec![r#"["10.0.0.1"]"#, r#"["10.0.0.2"]"#]).await;
  let (events, mut rx) = EventQueue::new().channel();
  let server = Arc::new(
    Server::builder()
      .listen_address(free_addr().await.to_string())
      .blocked_ips_uri(uri)
      .blocked_ips_update_period(Duration::from_millis(50))
      .listen_events(events)
      .build_with_overlay(FakeOverlay::default())
      .unwrap(),
  );
  let token = CancellationToken::new();
  let run = {
    let (server, token) = (server.clone(), token.clone());
    tokio::spawn(async move { server.listen(&token).await })
  };
  wait_for(&mut rx, ListenEvent::Started).await;

  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while !server.blocked_ips().contains("10.0.0.2") {
    assert!(tokio::time::Instant::now() < deadline, "list never refreshed");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(!server.blocked_ips().contains("10.0.0.1"));
  token.cancel();
  run.await.unwrap().unwrap();
}

#[tokio::test]
async fn blocked_destination_goes_through_overlay() {
  let echo = echo_server().await;
  let (uri, _) = block_list_source("200 OK", vec![r#"["127.0.0.1"]"#]).await;
  let listen_addr = free_addr().await;
  let overlay = FakeOverlay::default();
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(overlay.clone())
    .unwrap();
  let token = CancellationToken::new();
  let run = {
    let token = token.clone();
    tokio::spawn(async move { server.listen(&token).await })
  };
  wait_for(&mut rx, ListenEvent::Started).await;

  echo_through(listen_addr, echo).await;
  assert_eq!(*overlay.dialed.lock().unwrap(), [echo.to_string()]);

  token.cancel();
  run.await.unwrap().unwrap();
}

#[tokio::test]
async fn unlisted_destination_goes_direct() {
  let echo = echo_server().await;
  let (uri, _) = block_list_source("200 OK", vec![r#"["1.2.3.4"]"#]).await;
  let listen_addr = free_addr().await;
  let overlay = FakeOverlay::default();
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(overlay.clone())
    .unwrap();
  let token = CancellationToken::new();
  let run = {
    let token = token.clone();
    tokio::spawn(async move { server.listen(&token).await })
  };
  wait_for(&mut rx, ListenEvent::Started).await;

  echo_through(listen_addr, echo).await;
  assert!(overlay.dialed.lock().unwrap().is_empty());

  token.cancel();
  run.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancellation_closes_open_relays() {
  let echo = echo_server().await;
  let (uri, _) = block_list_source("200 OK", vec!["[]"]).await;
  let listen_addr = free_addr().await;
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(FakeOverlay::default())
    .unwrap();
  let token = CancellationToken::new();
  let run = {
    let token = token.clone();
    tokio::spawn(async move { server.listen(&token).await })
  };
  wait_for(&mut rx, ListenEvent::Started).await;

  let client = Socks5Client::new(listen_addr, Connector::default());
  let mut socket = client.connect(&TargetAddr::Ip(echo)).await.unwrap();
  token.cancel();
  tokio::time::timeout(Duration::from_secs(5), run)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  let mut rest = Vec::new();
  let n = AsyncReadExt::read_to_end(&mut socket, &mut rest).await.unwrap_or(0);
  assert_eq!(n, 0);
}

#[tokio::test]
async fn handle_can_be_toggled() {
  let (uri, _) = block_list_source("200 OK", vec!["[]"]).await;
  let listen_addr = free_addr().await;
  let overlay = FakeOverlay::default();
  let (events, mut rx) = EventQueue::with_capacity(16).channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(overlay.clone())
    .unwrap();
  let mut handle = ServerHandle::new(server);

  for _ in 0..2 {
    assert!(handle.enable());
    assert!(!handle.enable());
    wait_for(&mut rx, ListenEvent::Started).await;
    assert!(handle.is_running());
    TcpStream::connect(listen_addr).await.unwrap();

    handle.disable().await.unwrap();
    assert!(!handle.is_running());
    assert_eq!(rx.recv().await, Some(ListenEvent::Stopped));
    assert!(overlay.closed.load(Ordering::SeqCst));
    assert!(TcpStream::connect(listen_addr).await.is_err());
  }
}

#[tokio::test]
async fn idle_observer_does_not_stall_a_second_run() {
  let (uri, _) = block_list_source("200 OK", vec!["[]"]).await;
  let listen_addr = free_addr().await;
  // the receiver stays alive but is never read until the end
  let (events, mut rx) = EventQueue::new().channel();
  let server = Server::builder()
    .listen_address(listen_addr.to_string())
    .blocked_ips_uri(uri)
    .listen_events(events)
    .build_with_overlay(FakeOverlay::default())
    .unwrap();
  let mut handle = ServerHandle::new(server);

  assert!(handle.enable());
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while TcpStream::connect(listen_addr).await.is_err() {
    assert!(tokio::time::Instant::now() < deadline, "first run never started");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  tokio::time::timeout(Duration::from_secs(5), handle.disable())
    .await
    .unwrap()
    .unwrap();

  // the queue is full with the first run's events
  assert!(handle.enable());
  tokio::time::sleep(Duration::from_millis(100)).await;
  tokio::time::timeout(Duration::from_secs(5), handle.disable())
    .await
    .unwrap()
    .unwrap();
  assert!(!handle.is_running());

  let mut seen = Vec::new();
  while let Some(event) = rx.try_recv() {
    seen.push(event);
  }
  assert_eq!(
    seen,
    [
      ListenEvent::LoadingBlockedIps,
      ListenEvent::InitializingTor,
      ListenEvent::StartingTor,
      ListenEvent::StartingProxy,
      ListenEvent::Started,
      ListenEvent::Stopped,
    ]
  );
}
