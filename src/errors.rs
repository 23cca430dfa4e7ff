//! proxy error
use crate::dial::DialPath;
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `rkn_bypasser::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while running the proxy.
#[derive(ThisError, Debug)]
pub enum Error {
  /// The block list could not be downloaded
  #[error("fetch blocked ips: {0}")]
  Fetch(String),
  /// The block list payload is not a JSON array of strings
  #[error("decode blocked ips: {0}")]
  Decode(#[from] serde_json::Error),
  /// The overlay runtime could not be staged on disk
  #[error("stage tor runtime: {0}")]
  Stage(String),
  /// The overlay process failed to start or to bootstrap
  #[error("start tor: {0}")]
  Bootstrap(String),
  /// The listen socket could not be bound
  #[error("listen bind address {addr}: {source}")]
  Bind {
    /// configured listen address
    addr: String,
    /// underlying error
    source: std::io::Error,
  },
  /// A single outbound dial failed
  #[error("{path} dial {addr}: {source}")]
  Dial {
    /// which dialer was attempted
    path: DialPath,
    /// destination address
    addr: String,
    /// underlying error
    source: Box<Error>,
  },
  /// The accept loop hit a transient error
  #[error("serve socks5: {0}")]
  Serve(std::io::Error),
  /// Malformed SOCKS5 exchange
  #[error("socks5: {0}")]
  Protocol(String),
  /// Proxy ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Invalid configuration
  #[error("config: {0}")]
  Config(String),
  /// The run was cancelled
  #[error("operation canceled")]
  Canceled,
  #[error(transparent)]
  #[cfg(feature = "tls")]
  /// tls Error
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Whether this error is the cancellation signal rather than a real failure.
  pub fn is_canceled(&self) -> bool {
    match self {
      Error::Canceled => true,
      Error::Dial { source, .. } => source.is_canceled(),
      _ => false,
    }
  }
  /// The SOCKS5 reply code that best describes this error to a client.
  pub(crate) fn reply_code(&self) -> u8 {
    use crate::socks5::consts;
    match self {
      Error::Dial { source, .. } => source.reply_code(),
      Error::ReplyError(r) => r.code(),
      Error::IO(e) => match e.kind() {
        ErrorKind::ConnectionRefused => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
        ErrorKind::TimedOut => consts::SOCKS5_REPLY_TTL_EXPIRED,
        ErrorKind::NetworkUnreachable => consts::SOCKS5_REPLY_NETWORK_UNREACHABLE,
        ErrorKind::HostUnreachable => consts::SOCKS5_REPLY_HOST_UNREACHABLE,
        _ => consts::SOCKS5_REPLY_GENERAL_FAILURE,
      },
      _ => consts::SOCKS5_REPLY_GENERAL_FAILURE,
    }
  }
}

/// Failure codes reported by a SOCKS5 server.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
  #[error("General failure")]
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  NetworkUnreachable,
  #[error("Host unreachable")]
  HostUnreachable,
  #[error("Connection refused")]
  ConnectionRefused,
  #[error("TTL expired")]
  TtlExpired,
  #[error("Command not supported")]
  CommandNotSupported,
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  #[error("Unknown reply {0:#04x}")]
  Unknown(u8),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
