#![forbid(unsafe_code)]
//! 9P2000.u filesystem server core.
//!
//! This crate provides the protocol-independent-of-storage half of a 9P
//! server: the wire codec, the per-session fid table, the session state
//! machine, the bounded-pool reactor, and the request handlers. It is
//! paired with a concrete [`storage::StorageDriver`] implementation (for
//! example a FAT32 volume backend) by a binary crate.
//!
//! # Getting started
//!
//! Implement [`storage::StorageDriver`] for your backend, wrap it in a
//! [`storage::StorageGateway`], and hand that to [`server::Server::bind`]:
//!
//! ```no_run
//! use ninep::server::Server;
//! use ninep::session::SessionLimits;
//! use ninep::storage::StorageGateway;
//! use std::time::Duration;
//!
//! # async fn doc(driver: Box<dyn ninep::storage::StorageDriver>) -> std::io::Result<()> {
//! let gateway = StorageGateway::new(driver, Duration::from_secs(5));
//! let limits = SessionLimits {
//!     max_msize: 8192,
//!     max_fids: 64,
//!     send_timeout: Duration::from_secs(5),
//! };
//! let mut server = Server::bind("0.0.0.0:564", gateway, limits, 3).await?;
//! server.serve().await
//! # }
//! ```
//!
//! # Protocol details
//!
//! ## Message flow
//!
//! 1. **Version negotiation**: client sends `Tversion`, server replies `Rversion`.
//! 2. **Attach**: client attaches to the export root with `Tattach`.
//! 3. **Operations**: `walk`, `open`, `create`, `read`, `write`, `stat`, `wstat`, `remove`, `clunk`.
//! 4. **Cleanup**: clients clunk fids; the session frees the rest on teardown.
//!
//! ## Fid management
//!
//! A fid is a 32-bit handle the client chooses to name a path (and
//! optionally an open object) within one session. See [`fidtable`].
//!
//! # Error handling
//!
//! Handlers return [`error::Error`]; [`session::Session`] turns a
//! non-fatal error into an `Rerror` reply and a fatal one into session
//! teardown. See [`error`].
//!
//! # Transport
//!
//! TCP only, one listener per [`server::Server`], fixed default port 564
//! (spec-level convention; [`server::Server::bind`] takes any address).
pub mod error;
pub mod fcall;
pub mod fidtable;
pub mod handlers;
pub mod serialize;
pub mod server;
pub mod session;
pub mod storage;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
