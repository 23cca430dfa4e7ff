//! SOCKS5 wire format: the server side of the handshake used by the local
//! proxy, and the client side used to reach the overlay network's SocksPort.
use crate::connector::Connector;
use crate::errors::{new_io_error, Error, ReplyError, Result};
use crate::socket::Socket;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Destination requested by a SOCKS5 client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 or IPv6 literal
  Ip(SocketAddr),
  /// Domain name
  Domain(String, u16),
}

impl TargetAddr {
  /// Parse `host:port`, where an IPv6 host may be bracketed.
  pub fn parse(addr: &str) -> Result<Self> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
      return Ok(TargetAddr::Ip(sa));
    }
    let (host, port) = split_host_port(addr)?;
    match host.parse::<IpAddr>() {
      Ok(ip) => Ok(TargetAddr::Ip(SocketAddr::new(ip, port))),
      Err(_) => Ok(TargetAddr::Domain(host.to_string(), port)),
    }
  }
  /// Get port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ip(sa) => sa.port(),
      TargetAddr::Domain(_, port) => *port,
    }
  }
  /// Resolve a domain target to a socket address; IP targets are returned as is.
  pub async fn resolve(&self) -> Result<SocketAddr> {
    match self {
      TargetAddr::Ip(sa) => Ok(*sa),
      TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
        .await?
        .next()
        .ok_or_else(|| {
          new_io_error(
            std::io::ErrorKind::AddrNotAvailable,
            &format!("could not resolve {domain}"),
          )
        }),
    }
  }
  fn to_be_bytes(&self, cmd: u8) -> Result<Vec<u8>> {
    let mut packet = vec![consts::SOCKS5_VERSION, cmd, 0x00];
    match self {
      TargetAddr::Ip(SocketAddr::V4(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
        packet.extend_from_slice(&addr.ip().octets());
        packet.extend_from_slice(&addr.port().to_be_bytes());
      }
      TargetAddr::Ip(SocketAddr::V6(addr)) => {
        packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
        packet.extend_from_slice(&addr.ip().octets());
        packet.extend_from_slice(&addr.port().to_be_bytes());
      }
      TargetAddr::Domain(domain, port) => {
        if domain.len() > u8::MAX as usize {
          return Err(new_io_error(
            std::io::ErrorKind::InvalidData,
            "domain name too long",
          ));
        }
        packet.push(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
        packet.push(domain.len() as u8);
        packet.extend_from_slice(domain.as_bytes());
        packet.extend_from_slice(&port.to_be_bytes());
      }
    }
    Ok(packet)
  }
}

impl fmt::Display for TargetAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetAddr::Ip(sa) => write!(f, "{sa}"),
      TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
    }
  }
}

/// Split `host:port` the way `net.SplitHostPort` does: brackets are
/// required around hosts that contain a colon.
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
  let missing_port = || Error::Protocol(format!("missing port in address {addr:?}"));
  let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
    let (host, rest) = rest
      .split_once(']')
      .ok_or_else(|| Error::Protocol(format!("missing ']' in address {addr:?}")))?;
    (host, rest.strip_prefix(':').ok_or_else(missing_port)?)
  } else {
    let (host, port) = addr.rsplit_once(':').ok_or_else(missing_port)?;
    if host.contains(':') {
      return Err(Error::Protocol(format!("too many colons in address {addr:?}")));
    }
    (host, port)
  };
  let port = port
    .parse::<u16>()
    .map_err(|_| Error::Protocol(format!("invalid port in address {addr:?}")))?;
  Ok((host, port))
}

/// Server side: negotiate "no authentication" and read a CONNECT request.
///
/// The caller answers with [`send_reply`] once it knows whether the
/// outbound dial succeeded.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buf = [0u8; 2];
  stream.read_exact(&mut buf).await?;
  let [version, nmethods] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::Protocol(format!(
      "unsupported SOCKS version: {version}"
    )));
  }
  let mut methods = vec![0u8; nmethods as usize];
  stream.read_exact(&mut methods).await?;
  let selected = if methods.contains(&consts::SOCKS5_AUTH_METHOD_NONE) {
    consts::SOCKS5_AUTH_METHOD_NONE
  } else {
    consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE
  };
  stream.write_all(&[consts::SOCKS5_VERSION, selected]).await?;
  if selected == consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
    return Err(Error::Protocol(
      "no acceptable authentication method".to_string(),
    ));
  }

  let mut buf = [0u8; 4];
  stream.read_exact(&mut buf).await?;
  let [version, cmd, _rsv, address_type] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::Protocol(format!(
      "invalid SOCKS version in request: {version}"
    )));
  }
  if cmd != consts::SOCKS5_CMD_TCP_CONNECT {
    send_reply(stream, consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, None).await?;
    return Err(Error::Protocol(format!("unsupported command: {cmd}")));
  }
  match read_address(stream, address_type).await {
    Err(Error::ReplyError(ReplyError::AddressTypeNotSupported)) => {
      send_reply(stream, consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
      Err(Error::Protocol(format!(
        "unsupported address type: {address_type}"
      )))
    }
    other => other,
  }
}

/// Server side: send the reply to a CONNECT request.
///
/// `bound` is the local address of the outbound connection, `0.0.0.0:0` if unknown.
pub async fn send_reply<S>(stream: &mut S, reply: u8, bound: Option<SocketAddr>) -> Result<()>
where
  S: AsyncWrite + Unpin,
{
  let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
  let mut packet = vec![consts::SOCKS5_VERSION, reply, 0x00];
  match bound {
    SocketAddr::V4(addr) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV4);
      packet.extend_from_slice(&addr.ip().octets());
    }
    SocketAddr::V6(addr) => {
      packet.push(consts::SOCKS5_ADDR_TYPE_IPV6);
      packet.extend_from_slice(&addr.ip().octets());
    }
  }
  packet.extend_from_slice(&bound.port().to_be_bytes());
  stream.write_all(&packet).await?;
  stream.flush().await?;
  Ok(())
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
  let mut port = [0u8; 2];
  stream.read_exact(&mut port).await?;
  Ok(u16::from_be_bytes(port))
}

/// 如果 ATYP 字段值是 0x03，则 DST.ADDR 的格式为：
///
/// | 字段 | 描述 | 类型 | 长度 |
/// | --- | --- | --- | --- |
/// | DLEN | 域名长度 | unsigned char | 1 |
/// | DOMAIN | 域名 | unsigned char [] | 可变长度1-255 |
async fn read_address<S: AsyncRead + Unpin>(stream: &mut S, addr_type: u8) -> Result<TargetAddr> {
  let addr = match addr_type {
    consts::SOCKS5_ADDR_TYPE_IPV4 => {
      let mut buf = [0u8; 4];
      stream.read_exact(&mut buf).await?;
      let [a, b, c, d] = buf;
      TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::new(a, b, c, d),
        read_port(stream).await?,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_IPV6 => {
      let mut buf = [0u8; 16];
      stream.read_exact(&mut buf).await?;
      TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(buf),
        read_port(stream).await?,
        0,
        0,
      )))
    }
    consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8];
      stream.read_exact(&mut len).await?;
      let mut domain = vec![0u8; len[0] as usize];
      stream.read_exact(&mut domain).await?;
      let domain = String::from_utf8(domain)
        .map_err(|_| Error::Protocol("invalid domain name".to_string()))?;
      TargetAddr::Domain(domain, read_port(stream).await?)
    }
    _ => return Err(Error::ReplyError(ReplyError::AddressTypeNotSupported)),
  };
  Ok(addr)
}

/// A SOCKS5 client for one upstream proxy.
#[derive(Clone, Debug)]
pub struct Socks5Client {
  addr: SocketAddr,
  connector: Connector,
}

impl Socks5Client {
  /// Client for the proxy listening at `addr`.
  pub fn new(addr: SocketAddr, connector: Connector) -> Self {
    Socks5Client { addr, connector }
  }
  /// Address of the upstream proxy.
  pub fn addr(&self) -> SocketAddr {
    self.addr
  }
  /// Open a tunnel to `target` through the proxy.
  ///
  /// The returned socket has its timeouts cleared so it can be relayed.
  pub async fn connect(&self, target: &TargetAddr) -> Result<Socket> {
    let mut socket = self.connector.connect_with_addr(self.addr).await?;
    // 协商认证方式: tor 的 SocksPort 不需要认证
    socket
      .write_all(&[consts::SOCKS5_VERSION, 1, consts::SOCKS5_AUTH_METHOD_NONE])
      .await?;

    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await?;
    let [version, method] = buf;
    if version != consts::SOCKS5_VERSION {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "unsupported SOCKS version",
      ));
    }
    if method != consts::SOCKS5_AUTH_METHOD_NONE {
      return Err(Error::Protocol("no acceptable auth methods".to_string()));
    }

    // 发送代理请求
    socket
      .write_all(&target.to_be_bytes(consts::SOCKS5_CMD_TCP_CONNECT)?)
      .await?;
    socket.flush().await?;

    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await?;
    let [version, reply, _rsv, address_type] = buf;
    if version != consts::SOCKS5_VERSION {
      return Err(Error::Protocol(format!("version {version:?}")));
    }
    if reply != consts::SOCKS5_REPLY_SUCCEEDED {
      return Err(Error::ReplyError(ReplyError::from(reply)));
    }
    read_address(&mut socket, address_type).await?;
    socket.read_timeout = None;
    socket.write_timeout = None;
    Ok(socket)
  }
}

impl ReplyError {
  /// Wire value of this reply.
  pub fn code(&self) -> u8 {
    match self {
      ReplyError::GeneralFailure => consts::SOCKS5_REPLY_GENERAL_FAILURE,
      ReplyError::ConnectionNotAllowed => consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
      ReplyError::NetworkUnreachable => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
      ReplyError::HostUnreachable => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
      ReplyError::ConnectionRefused => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
      ReplyError::TtlExpired => consts::SOCKS5_REPLY_TTL_EXPIRED,
      ReplyError::CommandNotSupported => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
      ReplyError::AddressTypeNotSupported => consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
      // Tor's extended onion-service codes and friends are passed on as a general failure
      ReplyError::Unknown(_) => consts::SOCKS5_REPLY_GENERAL_FAILURE,
    }
  }
}

impl From<u8> for ReplyError {
  /// 服务器响应消息中的 REP 字段如果不为 0x00 ，则表示请求失败。
  fn from(value: u8) -> Self {
    match value {
      consts::SOCKS5_REPLY_GENERAL_FAILURE => ReplyError::GeneralFailure,
      consts::SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => ReplyError::ConnectionNotAllowed,
      consts::SOCKS5_REPLY_NETWORK_UNREACHABLE => ReplyError::NetworkUnreachable,
      consts::SOCKS5_REPLY_HOST_UNREACHABLE => ReplyError::HostUnreachable,
      consts::SOCKS5_REPLY_CONNECTION_REFUSED => ReplyError::ConnectionRefused,
      consts::SOCKS5_REPLY_TTL_EXPIRED => ReplyError::TtlExpired,
      consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => ReplyError::CommandNotSupported,
      consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => ReplyError::AddressTypeNotSupported,
      other => ReplyError::Unknown(other),
    }
  }
}

/// SOCKS5 protocol constants (RFC 1928)
#[rustfmt::skip]
#[allow(missing_docs)]
pub mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;

  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
  pub const SOCKS5_REPLY_GENERAL_FAILURE: u8 = 0x01;
  pub const SOCKS5_REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
  pub const SOCKS5_REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
  pub const SOCKS5_REPLY_HOST_UNREACHABLE: u8 = 0x04;
  pub const SOCKS5_REPLY_CONNECTION_REFUSED: u8 = 0x05;
  pub const SOCKS5_REPLY_TTL_EXPIRED: u8 = 0x06;
  pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
  pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::{TcpListener, TcpStream};

  #[test]
  fn split_host_port_handles_brackets() {
    assert_eq!(split_host_port("1.2.3.4:80").unwrap(), ("1.2.3.4", 80));
    assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", 443));
    assert_eq!(split_host_port("example.com:8080").unwrap(), ("example.com", 8080));
    assert!(split_host_port("::1:443").is_err());
    assert!(split_host_port("1.2.3.4").is_err());
    assert!(split_host_port("1.2.3.4:http").is_err());
  }

  #[test]
  fn target_addr_parse() {
    assert_eq!(
      TargetAddr::parse("[2001:db8::1]:80").unwrap(),
      TargetAddr::Ip("[2001:db8::1]:80".parse().unwrap())
    );
    assert_eq!(
      TargetAddr::parse("example.com:443").unwrap(),
      TargetAddr::Domain("example.com".to_string(), 443)
    );
    assert_eq!(TargetAddr::parse("example.com:443").unwrap().to_string(), "example.com:443");
  }

  #[test]
  fn unknown_reply_codes_do_not_panic() {
    assert_eq!(ReplyError::from(0xf4), ReplyError::Unknown(0xf4));
    assert_eq!(ReplyError::from(0x05), ReplyError::ConnectionRefused);
    assert_eq!(ReplyError::ConnectionRefused.code(), 0x05);
  }

  #[tokio::test]
  async fn server_reads_domain_connect_request() {
    let (mut client, mut server) = tokio::io::duplex(256);
    let client_side = tokio::spawn(async move {
      client.write_all(&[5, 1, 0]).await.unwrap();
      let mut method = [0u8; 2];
      client.read_exact(&mut method).await.unwrap();
      assert_eq!(method, [5, 0]);
      let mut req = vec![5, 1, 0, 3, 11];
      req.extend_from_slice(b"example.com");
      req.extend_from_slice(&443u16.to_be_bytes());
      client.write_all(&req).await.unwrap();
      let mut reply = [0u8; 10];
      client.read_exact(&mut reply).await.unwrap();
      reply
    });
    let target = read_request(&mut server).await.unwrap();
    assert_eq!(target, TargetAddr::Domain("example.com".to_string(), 443));
    send_reply(&mut server, consts::SOCKS5_REPLY_SUCCEEDED, None).await.unwrap();
    let reply = client_side.await.unwrap();
    assert_eq!(reply[..2], [5, 0]);
  }

  #[tokio::test]
  async fn server_rejects_bind_command() {
    let (mut client, mut server) = tokio::io::duplex(256);
    tokio::spawn(async move {
      client.write_all(&[5, 1, 0]).await.unwrap();
      client.write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();
      let mut sink = vec![0u8; 12];
      let _ = client.read(&mut sink).await;
      let _ = client.read(&mut sink).await;
    });
    let err = read_request(&mut server).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }

  #[tokio::test]
  async fn client_round_trips_through_server_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (mut stream, _): (TcpStream, _) = listener.accept().await.unwrap();
      let target = read_request(&mut stream).await.unwrap();
      send_reply(&mut stream, consts::SOCKS5_REPLY_SUCCEEDED, None).await.unwrap();
      stream.write_all(b"hi").await.unwrap();
      target
    });
    let client = Socks5Client::new(proxy_addr, Connector::default());
    let target = TargetAddr::parse("1.2.3.4:80").unwrap();
    let mut socket = client.connect(&target).await.unwrap();
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
    assert_eq!(server.await.unwrap(), target);
  }

  #[tokio::test]
  async fn client_surfaces_reply_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      read_request(&mut stream).await.unwrap();
      send_reply(&mut stream, consts::SOCKS5_REPLY_HOST_UNREACHABLE, None).await.unwrap();
    });
    let client = Socks5Client::new(proxy_addr, Connector::default());
    let err = client
      .connect(&TargetAddr::parse("10.0.0.1:443").unwrap())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ReplyError(ReplyError::HostUnreachable)));
  }
}
