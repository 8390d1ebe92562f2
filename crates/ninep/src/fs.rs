//! The abstract filesystem contract served over 9P.
//!
//! A backend implements [`FileSys`] plus [`Dirent`] (one per live file
//! reference) and [`File`] (the read/write capability handed out by open).
//! The server session guarantees it never issues two simultaneous calls on
//! the same fid, but calls on distinct fids may run concurrently even when
//! they reference the same underlying object; coherence across fids is the
//! backend's business.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::fcall::{Dir, OpenMode, QId, QIdType};
use crate::utils::Result;

/// Boxed directory-entry reference produced by attach/walk/create.
pub type BoxDirent = Box<dyn Dirent>;

/// Boxed open-file capability produced by open/create.
pub type BoxFile = Box<dyn File>;

/// Boxed authentication channel produced by auth.
pub type BoxAuthFile = Box<dyn AuthFile>;

/// A lazy sequence of directory entries, produced by [`Dirent::open_dir`].
pub type DirStream = BoxStream<'static, Result<Dir>>;

/// Entry point of a 9P backend.
#[async_trait]
pub trait FileSys: Send + Sync + 'static {
    /// Whether `attach` demands a successfully authenticated afid.
    ///
    /// Clients cannot determine this on their own; it only shows through
    /// the errors `auth` and `attach` return.
    fn require_auth(&self) -> bool;

    /// Begin an authentication exchange for `uname`/`aname`.
    ///
    /// The returned file carries the auth conversation; its
    /// [`AuthFile::success`] flag reports whether the exchange completed.
    async fn auth(&self, uname: &str, aname: &str) -> Result<BoxAuthFile>;

    /// Produce the root directory entry for `uname`/`aname`.
    ///
    /// If [`require_auth`](Self::require_auth) is true, `auth` is the
    /// verified authentication channel; otherwise it is `None`.
    async fn attach(
        &self,
        uname: &str,
        aname: &str,
        auth: Option<&dyn AuthFile>,
    ) -> Result<BoxDirent>;
}

/// One live reference to a filesystem object.
///
/// `open_dir`, `walk` with names, and `create` are only called on
/// directories (`is_dir`); `open` is never called on one, the server
/// reads directories through `open_dir` instead.
#[async_trait]
pub trait Dirent: Send + Sync {
    fn qid(&self) -> QId;

    /// Traverse `names`, which never contains `.`, empty elements or
    /// slashes, and carries `..` only as a prefix.
    ///
    /// Zero names clone this entry: return `(vec![], Some(clone))`.
    /// On full success return one qid per name plus the final entry.
    /// If traversal stops early, return the qids obtained so far and
    /// `None`; an error at the very first name is an `Err` instead.
    async fn walk(&self, names: &[String]) -> Result<(Vec<QId>, Option<BoxDirent>)>;

    /// Open this (non-directory) entry for I/O.
    ///
    /// Open is not called after create: the backend must create and open
    /// together.
    async fn open(&self, mode: OpenMode) -> Result<BoxFile>;

    /// Produce the directory listing as a lazy sequence of stat records.
    async fn open_dir(&self) -> Result<DirStream>;

    /// Create `name` in this directory and open it with `mode`.
    ///
    /// The returned entry replaces the parent on the caller's fid. If the
    /// created object is a directory, the returned file is discarded and
    /// the server reads it through `open_dir` instead.
    async fn create(&self, name: &str, perm: u32, mode: OpenMode)
        -> Result<(BoxDirent, BoxFile)>;

    async fn stat(&self) -> Result<Dir>;

    async fn wstat(&self, dir: &Dir) -> Result<()>;

    /// Release this reference without touching the underlying object.
    ///
    /// Clunk owns the release of any open-file state, including
    /// remove-on-close (`ORCLOSE`) semantics.
    async fn clunk(self: Box<Self>) -> Result<()>;

    /// Remove the underlying object. The reference is gone afterwards
    /// whether or not the backend reports an error; clunk is not called.
    async fn remove(self: Box<Self>) -> Result<()>;
}

/// I/O capability for an opened file.
#[async_trait]
pub trait File: Send {
    async fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Preferred transfer unit. `0` tells the client to fall back to
    /// `msize - 11`, the payload capacity of an `RRead` frame.
    fn iounit(&self) -> u32;
}

/// Authentication channel: a file the client reads and writes to run the
/// auth protocol, plus the outcome flag the server checks at attach time.
pub trait AuthFile: File + Sync {
    /// Was the authentication successful?
    fn success(&self) -> bool;
}

/// Check a Dirent's qid for the QTDIR bit.
pub fn is_dir(d: &dyn Dirent) -> bool {
    d.qid().typ.contains(QIdType::DIR)
}
