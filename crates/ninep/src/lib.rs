#![forbid(unsafe_code)]
//! Asynchronous 9P2000 filesystem protocol library for Rust.
//!
//! This crate provides a tokio-based async implementation of the 9P2000
//! protocol, the file service protocol of the Plan 9 distributed operating
//! system. It contains the wire codec for the thirteen message pairs, a
//! framed [`channel`](crate::channel) with message-size negotiation, and a
//! server-side [`session`](crate::srv::Session) that manages the table of
//! client file handles ("fids") and drives an abstract
//! [`FileSys`](crate::fs::FileSys) backend.
//!
//! # Overview
//!
//! To serve a filesystem over 9P you:
//!
//! 1. Implement [`fs::FileSys`] (plus [`fs::Dirent`] and [`fs::File`]) for
//!    your backing store
//! 2. Start the server with [`srv::serve_async`], or hand an accepted
//!    duplex stream to [`srv::serve`]
//!
//! # Example
//!
//! ```no_run
//! use ninep::{srv::serve_async, Result};
//!
//! # #[derive(Clone)]
//! # struct MyFs;
//! # impl MyFs { fn new() -> MyFs { MyFs } }
//! # #[async_trait::async_trait]
//! # impl ninep::fs::FileSys for MyFs {
//! #     fn require_auth(&self) -> bool { false }
//! #     async fn auth(&self, _: &str, _: &str) -> Result<ninep::fs::BoxAuthFile> {
//! #         Err(ninep::Error::proto(ninep::ename::NO_AUTH))
//! #     }
//! #     async fn attach(&self, _: &str, _: &str, _: Option<&dyn ninep::fs::AuthFile>)
//! #         -> Result<ninep::fs::BoxDirent> { Err(ninep::Error::proto("no attach")) }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     serve_async(MyFs::new(), "tcp!0.0.0.0!564").await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Version Negotiation**: client sends `TVersion`, server responds
//!    with `RVersion` and both sides adopt the smaller msize
//! 2. **Authentication** (optional): `TAuth`/`RAuth` exchange over an auth
//!    fid
//! 3. **Attach**: the client binds a fid to the filesystem root
//! 4. **Operations**: walk, open, create, read, write, stat, wstat
//! 5. **Cleanup**: fids are released with `TClunk` (or `TRemove`)
//!
//! ## Fid Management
//!
//! A fid is a 32-bit handle chosen by the client to name one server-side
//! file reference. The session tracks the mapping from fids to backend
//! dirents and enforces the lifecycle rules:
//!
//! - each fid is unique per connection until clunked
//! - walking to a new fid leaves the old one valid; a walk that stops
//!   early establishes nothing
//! - a fid can be opened at most once
//! - after clunk or remove the fid is immediately unknown
//!
//! # Error Handling
//!
//! Backends return [`error::Error`]. Protocol errors travel to the client
//! as `RError` messages and never abort the connection; transport errors
//! tear the connection down, releasing every live fid.
//!
//! # Transport
//!
//! The listener helpers accept dial strings in Plan 9 style:
//! - **TCP**: `"tcp!host!port"` (e.g. `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!0"`
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on
//! Rust's type system for memory safety. All filesystem operations are
//! async and designed to be cancellation-safe.
pub mod channel;
pub mod error;
pub mod fcall;
pub mod fs;
pub mod path;
pub mod readdir;
pub mod serialize;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::ename;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
