#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # rkn-bypasser
//!
//! A local SOCKS5 proxy that sends connections to blocked addresses through
//! Tor and everything else straight to the destination.
//!
//! - The block list is a JSON array of IP addresses downloaded over HTTP(S)
//!   and refreshed periodically.
//! - Tor is staged from a `.tar.gz` runtime when missing, launched as a child
//!   process and used through its local SocksPort.
//! - Startup stages are reported as [`ListenEvent`]s.
//!
//! ## Running the proxy
//!
//! ```rust,no_run
//! # async fn run() -> rkn_bypasser::Result<()> {
//! use rkn_bypasser::{EventQueue, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! let (events, mut rx) = EventQueue::new().channel();
//! let server = Server::builder()
//!   .listen_address("127.0.0.1:8000")
//!   .tor_path("tor")
//!   .listen_events(events)
//!   .build()?;
//! tokio::spawn(async move {
//!   while let Some(event) = rx.recv().await {
//!     println!("{event}");
//!   }
//! });
//! let token = CancellationToken::new();
//! server.listen(&token).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **tls** (default): https block list sources, via rustls.
//! - **bundled-tor**: embed the tor runtime archive named by
//!   `RKN_BYPASSER_TOR_ARCHIVE` at build time.
//!
pub mod blocklist;
mod client;
pub mod config;
mod connector;
pub mod dial;
mod errors;
pub mod event;
mod handle;
mod listen;
pub mod overlay;
pub mod server;
mod socket;
pub mod socks5;
pub mod supervise;
#[cfg(feature = "tls")]
mod tls;

pub use blocklist::{BlockListStore, BlockedSet, Refresher};
pub use client::{Client, Response};
pub use config::{FileConfig, ServerConfig};
pub use connector::{Connector, ConnectorBuilder};
pub use dial::{DialPath, DialRouter, Dialer, DirectDialer};
pub use errors::{Error, ReplyError, Result};
pub use event::{EventQueue, EventReceiver, EventSender, ListenEvent};
pub use handle::ServerHandle;
pub use listen::{Server, ServerBuilder};
pub use overlay::tor::{TorConfig, TorRuntime};
pub use overlay::{OverlayRuntime, OverlaySession, RuntimeArchive};
pub use socket::{Socket, StreamWrapper};

pub(crate) const CR_LF: &[u8] = &[13, 10];
