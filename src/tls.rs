//! rustls backend for the block list download
use crate::errors::{Error, Result};
use std::sync::Arc;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;

/// Build a TLS connector trusting the platform's root certificates.
pub(crate) fn connector() -> Result<TlsConnector> {
  let mut root_cert_store = RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for err in &native.errors {
    tracing::warn!(error = %err, "failed to load a native root certificate");
  }
  let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
  tracing::debug!(added, ignored, "loaded native root certificates");
  if root_cert_store.is_empty() {
    return Err(Error::Other("no usable root certificates found".to_string()));
  }
  let provider = rustls::crypto::CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
  let config = rustls::ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()?
    .with_root_certificates(root_cert_store)
    .with_no_client_auth();
  Ok(TlsConnector::from(Arc::new(config)))
}
