use crate::errors::{new_io_error, Result};
use crate::socket::{Socket, StreamWrapper};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpSocket;

/// ConnectorBuilder
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: false,
      keepalive: false,
    }
  }
}

impl ConnectorBuilder {
  /// Set that all sockets have `SO_NODELAY` set to the supplied value `nodelay`.
  ///
  /// Default is `false`.
  pub fn nodelay(mut self, value: bool) -> ConnectorBuilder {
    self.nodelay = value;
    self
  }
  /// Enable `SO_KEEPALIVE` on every socket.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> ConnectorBuilder {
    self.keepalive = value;
    self
  }
  /// Enables a read timeout.
  ///
  /// The timeout applies to each read operation, and resets after a
  /// successful read. Relayed SOCKS5 traffic bypasses it.
  ///
  /// Default is 30 seconds.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Enables a write timeout.
  ///
  /// Default is 30 seconds.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Combine the configuration of this builder into a `Connector`.
  pub fn build(&self) -> Connector {
    Connector {
      connect_timeout: self.connect_timeout,
      nodelay: self.nodelay,
      keepalive: self.keepalive,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      #[cfg(feature = "tls")]
      tls: Default::default(),
    }
  }
}

/// Opens outbound TCP connections, optionally upgrading them to TLS.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  // loading the native roots is slow, so it happens on the first TLS upgrade
  #[cfg(feature = "tls")]
  tls: std::sync::Arc<tokio::sync::OnceCell<tokio_rustls::TlsConnector>>,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

impl Connector {
  /// Create a `ConnectorBuilder`
  pub fn builder() -> ConnectorBuilder {
    ConnectorBuilder::default()
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    if self.keepalive {
      raw_socket.set_keepalive(true)?;
    }
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      StreamWrapper::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }
  /// Resolve `host` and connect to the first address that accepts.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Socket> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(e) => last_err = Some(e),
      }
    }
    Err(last_err.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::AddrNotAvailable,
        &format!("could not resolve {host}"),
      )
    }))
  }
  #[cfg(feature = "tls")]
  /// Run a TLS client handshake over an established TCP socket.
  pub async fn upgrade_to_tls(&self, socket: Socket, domain: &str) -> Result<Socket> {
    use rustls_pki_types::ServerName;
    let connector = self.tls.get_or_try_init(|| async { crate::tls::connector() }).await?;
    let domain = ServerName::try_from(domain.to_owned())
      .map_err(|e| crate::errors::Error::Other(e.to_string()))?;
    let Socket {
      inner,
      read_timeout,
      write_timeout,
    } = socket;
    let tcp = match inner {
      StreamWrapper::Tcp(tcp) => tcp,
      StreamWrapper::Tls(_) => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidInput,
          "socket is already using tls",
        ))
      }
    };
    let handshake = connector.connect(domain, tcp);
    let tls = match self.connect_timeout {
      None => handshake.await?,
      Some(timeout) => tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(
      StreamWrapper::Tls(Box::new(tls)),
      read_timeout,
      write_timeout,
    ))
  }
}

impl Default for Connector {
  fn default() -> Self {
    ConnectorBuilder::default().build()
  }
}
