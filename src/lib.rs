//! ## Embeddable async WebDAV handler
//!
//! [`WebDAV`] (RFC 4918) is HTTP (GET/HEAD/PUT/DELETE) plus a set of
//! extension methods to manage collections (MKCOL), copy and move
//! resources (COPY/MOVE), query and patch properties (PROPFIND/PROPPATCH)
//! and take out write locks (LOCK/UNLOCK).
//!
//! This library is a *handler*: it takes an [`http::Request`], runs it
//! through the WebDAV method engine, and produces an [`http::Response`]
//! with a streaming [`Body`]. It works with the standard types from the
//! `http` and `http_body` crates, so it can be mounted inside hyper,
//! axum, or any other `http`-native framework, at an arbitrary URL
//! prefix.
//!
//! Storage is abstracted behind the [`DavFileSystem`] trait; the crate
//! ships [`MemFs`], an in-memory reference implementation with dead
//! property support. Locking (WebDAV class 2) is provided by the
//! built-in [`LockManager`], which also guards in-flight request bodies
//! with per-path stream locks.
//!
//! ```no_run
//! use davmount::{DavHandler, memfs::MemFs};
//!
//! let dav = DavHandler::builder()
//!     .strip_prefix("/dav")
//!     .filesystem(MemFs::new())
//!     .build_handler();
//! # let _ = dav;
//! ```
//!
//! [`WebDAV`]: http://www.webdav.org/specs/rfc4918.html
//! [`DavFileSystem`]: fs/trait.DavFileSystem.html
//! [`MemFs`]: memfs/struct.MemFs.html
//! [`LockManager`]: locks/struct.LockManager.html
//! [`Body`]: body/struct.Body.html

mod conditional;
mod davhandler;
mod davheaders;
mod davxml;
mod errors;
mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_lock;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod util;

pub mod body;
pub mod davpath;
pub mod fs;
pub mod locks;
pub mod memfs;

pub(crate) use crate::errors::DavError;

pub use crate::davhandler::{CorsConfig, DavConfig, DavHandler};
pub use crate::util::{DavMethod, DavMethodSet};

/// Result type used by the method engine.
pub(crate) type DavResult<T> = Result<T, DavError>;
