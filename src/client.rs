//! Minimal HTTP/1.1 client used to download the block list.
use crate::connector::Connector;
use crate::errors::{Error, Result};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};

const MAX_REDIRECTS: usize = 10;
/// Upper bound on a downloaded body.
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;
const MAX_HEADER_LINE: usize = 16 * 1024;

/// A received response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
  status: StatusCode,
  headers: HeaderMap,
  body: Bytes,
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  pub fn status_code(&self) -> StatusCode {
    self.status
  }
  /// Get the `Headers` of this `Response`.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get the full response body.
  pub fn body(&self) -> &Bytes {
    &self.body
  }
}

/// An HTTP client that speaks just enough HTTP/1.1 for a `GET`.
///
/// Every request uses a fresh connection with `Connection: close`, so the
/// body is delimited by `Content-Length`, chunked encoding, or EOF.
#[derive(Clone, Debug, Default)]
pub struct Client {
  connector: Connector,
}

impl Client {
  /// Constructs a new `Client` on top of the given connector.
  pub fn new(connector: Connector) -> Self {
    Client { connector }
  }
  /// Send a `GET` and follow redirects.
  pub async fn get(&self, uri: &Uri) -> Result<Response> {
    let mut uri = uri.clone();
    for _ in 0..=MAX_REDIRECTS {
      let response = self.get_once(&uri).await?;
      if !response.status.is_redirection() {
        return Ok(response);
      }
      let location = response
        .headers
        .get(header::LOCATION)
        .and_then(|l| l.to_str().ok())
        .ok_or_else(|| Error::Other(format!("redirect {} without location", response.status)))?;
      uri = resolve_location(&uri, location)?;
      tracing::debug!(%uri, "following redirect");
    }
    Err(Error::Other(format!("too many redirects (max {MAX_REDIRECTS})")))
  }

  async fn get_once(&self, uri: &Uri) -> Result<Response> {
    let host = uri
      .host()
      .ok_or_else(|| Error::Other(format!("no host in url {uri}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let https = match uri.scheme_str() {
      Some("http") => false,
      Some("https") => true,
      other => return Err(Error::Other(format!("unsupported scheme {other:?}"))),
    };
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let mut socket = self.connector.connect(host, port).await?;
    if https {
      #[cfg(feature = "tls")]
      {
        socket = self.connector.upgrade_to_tls(socket, host).await?;
      }
      #[cfg(not(feature = "tls"))]
      return Err(Error::Other("https requires the `tls` feature".to_string()));
    }
    socket.write_all(&request_bytes(uri)?).await?;
    socket.flush().await?;

    // Limit the read to the body cap plus generous room for the head.
    let read_limit = MAX_BODY_SIZE + 64 * 1024;
    let mut raw = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
      // 超时只针对单次读取，慢而持续的下载不会被中断
      let n = socket.read(&mut chunk).await?;
      if n == 0 {
        break;
      }
      raw.extend_from_slice(&chunk[..n]);
      if raw.len() as u64 > read_limit {
        return Err(Error::Other(format!(
          "response exceeds {MAX_BODY_SIZE} bytes"
        )));
      }
    }
    parse_response(BufReader::new(raw.as_slice())).await
  }
}

fn request_bytes(uri: &Uri) -> Result<Vec<u8>> {
  let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let authority = uri
    .authority()
    .ok_or_else(|| Error::Other(format!("no authority in url {uri}")))?;
  let request = http::Request::get(path)
    .header(header::HOST, authority.as_str())
    .header(header::USER_AGENT, concat!("rkn-bypasser/", env!("CARGO_PKG_VERSION")))
    .header(header::ACCEPT, "application/json")
    .header(header::CONNECTION, "close")
    .body(())?;
  let mut raw = format!("{} {} HTTP/1.1\r\n", request.method(), path).into_bytes();
  for (k, v) in request.headers() {
    raw.extend_from_slice(k.as_str().as_bytes());
    raw.extend_from_slice(b": ");
    raw.extend_from_slice(v.as_bytes());
    raw.extend_from_slice(crate::CR_LF);
  }
  raw.extend_from_slice(crate::CR_LF);
  Ok(raw)
}

fn resolve_location(base: &Uri, location: &str) -> Result<Uri> {
  let target: Uri = location.parse()?;
  if target.scheme().is_some() {
    return Ok(target);
  }
  let mut parts = base.clone().into_parts();
  parts.path_and_query = target.path_and_query().cloned();
  Uri::from_parts(parts).map_err(|e| Error::Http(http::Error::from(e)))
}

pub(crate) async fn parse_response<R: AsyncBufRead + Unpin>(mut reader: R) -> Result<Response> {
  let mut line = Vec::new();
  reader.read_until(b'\n', &mut line).await?;
  let status = parse_status_line(&line)?;

  let mut headers = HeaderMap::new();
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    if line.len() > MAX_HEADER_LINE {
      return Err(Error::Other("header line too long".to_string()));
    }
    if let Some((k, v)) = parse_header(&line) {
      headers.append(k, v);
    }
  }

  let chunked = headers
    .get(header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
  let body = if chunked {
    read_chunked_body(&mut reader).await?
  } else if let Some(len) = content_length(&headers) {
    if len > MAX_BODY_SIZE {
      return Err(Error::Other(format!("response exceeds {MAX_BODY_SIZE} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    body
  } else {
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    body
  };
  Ok(Response {
    status,
    headers,
    body: Bytes::from(body),
  })
}

fn parse_status_line(line: &[u8]) -> Result<StatusCode> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = parts.next().unwrap_or_default();
  if !version.starts_with(b"HTTP/1.") {
    return Err(Error::Other(format!(
      "invalid http status line {:?}",
      String::from_utf8_lossy(line).trim_end()
    )));
  }
  let code = parts.next().unwrap_or_default();
  StatusCode::from_bytes(code).map_err(|e| Error::Http(http::Error::from(e)))
}

fn parse_header(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let colon = line.iter().position(|b| *b == b':')?;
  let (k, v) = line.split_at(colon);
  let name = HeaderName::from_bytes(k).ok()?;
  let value = HeaderValue::from_bytes(v[1..].trim_ascii()).ok()?;
  Some((name, value))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  let mut line = String::new();
  loop {
    line.clear();
    if reader.read_line(&mut line).await? == 0 {
      return Err(Error::Other("unexpected eof in chunked body".to_string()));
    }
    // chunk extensions follow a ';'
    let size = line.trim().split(';').next().unwrap_or_default();
    let size = usize::from_str_radix(size, 16)
      .map_err(|e| Error::Other(format!("invalid chunk size {size:?}: {e}")))?;
    if size == 0 {
      break;
    }
    if (body.len() + size) as u64 > MAX_BODY_SIZE {
      return Err(Error::Other(format!("response exceeds {MAX_BODY_SIZE} bytes")));
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    // CRLF after each chunk
    line.clear();
    reader.read_line(&mut line).await?;
  }
  Ok(body)
}
