#![forbid(unsafe_code)]
//! Asynchronous 9P2000 (Styx) file-service library for Rust.
//!
//! This crate provides a tokio-based implementation of the 9P2000
//! protocol as spoken by Plan 9, Inferno (where it is called Styx) and
//! the Linux kernel's v9fs client: a length-prefixed, tagged
//! request/response wire protocol that projects a hierarchical, file-like
//! namespace across a reliable byte stream.
//!
//! # Overview
//!
//! Three pieces make up the crate:
//!
//! * [`fcall`] and [`serialize`] — the message types and their bit-exact
//!   wire codec (little-endian, length-prefixed, typed, tagged), including
//!   the embedded `stat` record and the variable-length walk, read and
//!   write payloads.
//! * [`srv`] — the server side: implement the [`srv::Store`] trait to
//!   describe a file tree, then hand it to [`srv::srv_async`]. A
//!   per-connection session engine owns the fid table and enforces the
//!   protocol's ordering rules (attach → walk → open/create → read/write
//!   → clunk) before anything reaches the store.
//! * [`client`] — the client side: [`client::Client`] runs the
//!   version/attach handshake and exposes file-shaped operations (`walk`,
//!   `ls`, `cd`, `mkdir`, `create`, `open`, `read`, `write`).
//!
//! # Example
//!
//! Serving a read-only tree takes four trait methods:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use styx::{srv::{srv_async, Store}, Qid, QidType, Result, Stat};
//!
//! struct HelloFs;
//!
//! #[async_trait]
//! impl Store for HelloFs {
//!     async fn attach(&self, _uname: &str, _aname: &str) -> Result<Qid> {
//!         self.qid("").await
//!     }
//!
//!     async fn qid(&self, path: &str) -> Result<Qid> {
//!         match path {
//!             "" => Ok(Qid { typ: QidType::DIR, version: 0, path: 0 }),
//!             "hello" => Ok(Qid { typ: QidType::FILE, version: 0, path: 1 }),
//!             _ => Err(styx::errstr::ENOENT.into()),
//!         }
//!     }
//!
//!     async fn stat(&self, path: &str) -> Result<Stat> {
//!         Ok(Stat {
//!             qid: self.qid(path).await?,
//!             mode: 0o444,
//!             length: 6,
//!             name: path.to_owned(),
//!             ..Stat::default()
//!         })
//!     }
//!
//!     async fn read(&self, _path: &str, _offset: u64, _count: u32) -> Result<Vec<u8>> {
//!         Ok(b"hello\n".to_vec())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(HelloFs, "127.0.0.1:5640").await
//! }
//! ```
//!
//! # Protocol notes
//!
//! * Every message is framed `size[4] type[1] tag[2] body...` with `size`
//!   counting itself; all integers are little-endian and strings are
//!   UTF-8 with a 16-bit length prefix, never NUL-terminated.
//! * Authentication is not implemented: clients must pass
//!   [`NOFID`](fcall::NOFID) as `afid`, and `Tauth` is answered with
//!   `Rerror`.
//! * Errors travel as strings (`Rerror.ename`); see [`error`] for how
//!   Rust errors map onto the canonical names.

pub mod client;
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
