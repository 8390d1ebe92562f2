//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! The [`Session`] owns the table of live fids and translates each incoming
//! request into one call on the backend [`FileSys`]. Operations on one fid
//! are serialized by a per-fid lock held across the backend call; operations
//! on distinct fids run concurrently. The connection loop reads frames
//! serially, handles every request on its own task, and funnels replies
//! through a single shared writer, so replies interleave freely and clients
//! correlate them by tag.

use {
    crate::{
        channel::Channel,
        error::{ename, Error},
        fcall::*,
        fs::{is_dir, AuthFile, BoxAuthFile, BoxDirent, BoxFile, FileSys},
        io_err, path,
        readdir::Readdir,
        utils::{self, Result},
    },
    log::{error, info, warn},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{atomic::Ordering, Arc},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, OwnedMutexGuard, RwLock},
    },
};

/// The open capability held by a fid.
///
/// Auth fids carry their authentication channel here while their dirent
/// stays empty; every other fid holds a backend file (or a [`Readdir`]
/// standing in for one).
enum OpenFile {
    File(BoxFile),
    Auth(BoxAuthFile),
}

impl OpenFile {
    fn iounit(&self) -> u32 {
        match self {
            OpenFile::File(f) => f.iounit(),
            OpenFile::Auth(f) => f.iounit(),
        }
    }
}

/// Server-side record for one live fid.
///
/// The holder of the lock owns the state; `ent` is only `None` while the
/// fid is being set up or torn down, or for auth fids. A published state
/// with neither a dirent nor an auth file reads as "unknown fid".
///
/// `path` is an *internal path*: absolute, slash-joined, with no `.`, `..`
/// or empty elements. It tracks the walk steps that produced the dirent
/// and exists for diagnostics and backends.
#[derive(Default)]
struct SFidState {
    ent: Option<BoxDirent>,
    file: Option<OpenFile>,
    mode: OpenMode, // meaningful only while file is set
    path: String,
}

impl SFidState {
    fn usable(&self) -> bool {
        self.ent.is_some() || matches!(self.file, Some(OpenFile::Auth(_)))
    }
}

type SFid = Arc<Mutex<SFidState>>;

/// A 9P server session: one per connection.
///
/// Fids are managed at this level, so the [`FileSys`] only ever works with
/// dirents. All operations on a fid are transactional: the fid's lock is
/// held while backend code runs against the corresponding dirent.
pub struct Session<Fs> {
    fs: Fs,
    refs: RwLock<HashMap<u32, SFid>>,
}

async fn teardown(st: &mut SFidState, remove: bool) -> Result<()> {
    // dropping an open file is its close
    st.file = None;
    st.mode = OpenMode::default();
    match st.ent.take() {
        Some(ent) => {
            if remove {
                ent.remove().await
            } else {
                ent.clunk().await
            }
        }
        // auth fids and half-built entries have nothing to release
        None => Err(Error::proto(ename::UNKNOWN_FID)),
    }
}

impl<Fs: FileSys> Session<Fs> {
    pub fn new(fs: Fs) -> Session<Fs> {
        Session {
            fs,
            refs: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a fid and lock it.
    ///
    /// The map lock is released before the fid lock is taken; a fid caught
    /// mid-teardown is observed with an empty state and reported unknown.
    async fn get_ref(&self, fid: u32) -> Result<OwnedMutexGuard<SFidState>> {
        if fid == NOFID {
            return Err(Error::proto(ename::UNKNOWN_FID));
        }

        let sfid = {
            let refs = self.refs.read().await;
            refs.get(&fid).cloned()
        };
        let sfid = sfid.ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;

        let guard = sfid.lock_owned().await;
        if !guard.usable() {
            return Err(Error::proto(ename::UNKNOWN_FID));
        }

        Ok(guard)
    }

    /// Reserve `fid` in the table, returning its state locked and empty.
    ///
    /// Concurrent lookups of the fid block on the lock and then read
    /// "unknown fid" until the caller fills the state in.
    async fn new_ref(&self, fid: u32) -> Result<(SFid, OwnedMutexGuard<SFidState>)> {
        if fid == NOFID {
            return Err(Error::proto(ename::UNKNOWN_FID));
        }

        let sfid: SFid = Arc::new(Mutex::new(SFidState::default()));
        let guard = sfid.clone().lock_owned().await;

        let mut refs = self.refs.write().await;
        if refs.contains_key(&fid) {
            return Err(Error::proto(ename::DUP_FID));
        }
        refs.insert(fid, sfid.clone());

        Ok((sfid, guard))
    }

    /// Release a reservation made by `new_ref`.
    ///
    /// Caller still holds the fid lock: fid lock before map lock is the
    /// one permitted ordering.
    async fn drop_ref(&self, fid: u32, sfid: &SFid) {
        let mut refs = self.refs.write().await;
        if let Some(cur) = refs.get(&fid) {
            if Arc::ptr_eq(cur, sfid) {
                refs.remove(&fid);
            }
        }
    }

    /// Delete a fid from the table, then clunk (or remove) its dirent.
    ///
    /// The fid lock is taken first and held through the backend call; the
    /// map entry is gone before the backend runs, so the fid is unknown to
    /// every later request no matter what the backend reports.
    async fn del_ref(&self, fid: u32, remove: bool) -> Result<()> {
        if fid == NOFID {
            return Err(Error::proto(ename::UNKNOWN_FID));
        }

        let sfid = {
            let refs = self.refs.read().await;
            refs.get(&fid).cloned()
        };
        let sfid = sfid.ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;

        let mut guard = sfid.clone().lock_owned().await;
        {
            let mut refs = self.refs.write().await;
            match refs.get(&fid) {
                // the fid may have been clunked and re-used while we waited
                Some(cur) if Arc::ptr_eq(cur, &sfid) => {
                    refs.remove(&fid);
                }
                _ => return Err(Error::proto(ename::UNKNOWN_FID)),
            }
        }

        teardown(&mut guard, remove).await
    }

    /// Release every fid still alive. Called when the connection ends.
    pub async fn stop(&self) {
        let drained: Vec<(u32, SFid)> = {
            let mut refs = self.refs.write().await;
            refs.drain().collect()
        };

        for (fid, sfid) in drained {
            let mut guard = sfid.lock_owned().await;
            if guard.ent.is_some() {
                if let Err(e) = teardown(&mut guard, false).await {
                    warn!("stop: clunk of fid {} failed: {}", fid, e);
                }
            } else {
                guard.file = None;
            }
        }
    }

    /// Start an authentication exchange on `afid`.
    pub async fn auth(&self, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        let aqid = QId {
            typ: QIdType::AUTH,
            version: 0,
            path: 0,
        };

        if afid == NOFID {
            // the protocol leaves this case open; treat it as a no-op
            return Ok(aqid);
        }
        if !self.fs.require_auth() {
            return Err(Error::proto(ename::NO_AUTH));
        }

        let (sfid, mut guard) = self.new_ref(afid).await?;
        match self.fs.auth(uname, aname).await {
            Err(e) => {
                self.drop_ref(afid, &sfid).await;
                Err(e)
            }
            Ok(afile) => {
                guard.file = Some(OpenFile::Auth(afile));
                // the auth conversation is read/write
                guard.mode = OpenMode::RDWR;
                Ok(aqid)
            }
        }
    }

    /// Bind `fid` to the backend's root for `uname`/`aname`.
    pub async fn attach(&self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        // When auth is required the afid's lock is held across the attach
        // call so the auth file cannot be torn down under the backend.
        let aguard = if self.fs.require_auth() {
            let guard = self
                .get_ref(afid)
                .await
                .map_err(|_| Error::proto(ename::AUTH_REQUIRED))?;
            match &guard.file {
                Some(OpenFile::Auth(af)) => {
                    if !af.success() {
                        return Err(Error::proto(ename::UNAUTHORIZED));
                    }
                }
                _ => return Err(Error::proto(ename::AUTH_REQUIRED)),
            }
            Some(guard)
        } else {
            // without auth the afid is ignored entirely
            None
        };

        let (sfid, mut guard) = self.new_ref(fid).await?;

        let af: Option<&dyn AuthFile> = aguard.as_ref().and_then(|g| match &g.file {
            Some(OpenFile::Auth(af)) => Some(af.as_ref()),
            _ => None,
        });

        match self.fs.attach(uname, aname, af).await {
            Err(e) => {
                self.drop_ref(fid, &sfid).await;
                Err(e)
            }
            Ok(ent) => {
                let qid = ent.qid();
                guard.ent = Some(ent);
                guard.path = "/".to_owned();
                Ok(qid)
            }
        }
    }

    pub async fn clunk(&self, fid: u32) -> Result<()> {
        self.del_ref(fid, false).await
    }

    /// Remove the object behind `fid`. The fid is gone from the table even
    /// when the backend refuses the removal.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        self.del_ref(fid, true).await
    }

    /// Walk from `fid` toward `newfid` through `wnames`.
    ///
    /// Zero names clone; a short qid list means the walk stopped early, in
    /// which case `newfid` is not established and the partial list is
    /// returned as-is.
    pub async fn walk(&self, fid: u32, newfid: u32, wnames: &[String]) -> Result<Vec<QId>> {
        if path::valid_path(wnames).is_none() {
            return Err(Error::proto(ename::INVALID_PATH));
        }

        let mut src = self.get_ref(fid).await?;
        let new_path = path::walk_name(&src.path, wnames)?;

        // Reserve the target before calling into the backend.
        let newref = if newfid != fid {
            Some(self.new_ref(newfid).await?)
        } else {
            None
        };

        let walked = match src.ent.as_deref() {
            // auth fids are not walkable
            None => Err(Error::proto(ename::UNKNOWN_FID)),
            Some(src_ent) => {
                if wnames.is_empty() {
                    if newref.is_none() {
                        // clone onto itself: a no-op
                        return Ok(Vec::new());
                    }
                    src_ent.walk(&[]).await.map(|(_, ent)| (Vec::new(), ent))
                } else if !is_dir(src_ent) {
                    Err(Error::proto(ename::NOT_A_DIR))
                } else {
                    src_ent.walk(wnames).await
                }
            }
        };

        let (qids, ent) = match walked {
            Ok(done) => done,
            Err(e) => {
                if let Some((sfid, _guard)) = &newref {
                    self.drop_ref(newfid, sfid).await;
                }
                return Err(e);
            }
        };

        if qids.len() != wnames.len() {
            // Walk failed at step qids.len(): newfid is not affected and
            // the partial qid list is the reply.
            if let Some((sfid, _guard)) = &newref {
                self.drop_ref(newfid, sfid).await;
            }
            return Ok(qids);
        }

        let ent = match ent {
            Some(ent) => ent,
            None => {
                if let Some((sfid, _guard)) = &newref {
                    self.drop_ref(newfid, sfid).await;
                }
                return Err(Error::proto(ename::INVALID_RESULT));
            }
        };

        match newref {
            None => {
                // Re-use fid for the result of the walk: the old dirent is
                // clunked and replaced in one step under the fid lock.
                src.file = None;
                src.mode = OpenMode::default();
                if let Some(old) = src.ent.take() {
                    if let Err(e) = old.clunk().await {
                        warn!("walk: clunk of fid {} failed: {}", fid, e);
                    }
                }
                src.ent = Some(ent);
                src.path = new_path;
            }
            Some((_sfid, mut guard)) => {
                guard.ent = Some(ent);
                guard.path = new_path;
            }
        }

        Ok(qids)
    }

    /// Open `fid` with `mode`, returning the qid and iounit.
    pub async fn open(&self, fid: u32, mode: OpenMode) -> Result<(QId, u32)> {
        let mut guard = self.get_ref(fid).await?;
        open_locked(&mut guard, mode).await
    }

    /// Create `name` under the directory bound to `parent` and open it.
    ///
    /// On success the parent fid is rebound to the created object in the
    /// opened state.
    pub async fn create(
        &self,
        parent: u32,
        name: &str,
        perm: u32,
        mode: OpenMode,
    ) -> Result<(QId, u32)> {
        let mut guard = self.get_ref(parent).await?;
        let new_path = path::create_name(&guard.path, name)?;

        let created = {
            let parent_ent = guard
                .ent
                .as_deref()
                .ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;
            if guard.file.is_some() {
                return Err(Error::proto(ename::ALREADY_OPEN));
            }
            if !is_dir(parent_ent) {
                return Err(Error::proto(ename::CREATE_NON_DIR));
            }
            parent_ent.create(name, perm, mode).await?
        };
        let (ent, file) = created;

        // Directories are read through the entry stream, not the backend
        // file handle.
        let file: BoxFile = if is_dir(ent.as_ref()) {
            drop(file);
            match ent.open_dir().await {
                Ok(dirs) => Box::new(Readdir::new(dirs)),
                Err(e) => {
                    let e = match ent.clunk().await {
                        Ok(()) => e,
                        Err(e2) => Error::Proto(format!("{}/{}", e.ename(), e2.ename())),
                    };
                    return Err(e);
                }
            }
        } else {
            file
        };

        let qid = ent.qid();
        let iounit = file.iounit();

        // The parent reference is replaced by the created object.
        if let Some(old) = guard.ent.take() {
            if let Err(e) = old.clunk().await {
                warn!("create: clunk of fid {} failed: {}", parent, e);
            }
        }
        guard.ent = Some(ent);
        guard.file = Some(OpenFile::File(file));
        guard.mode = mode;
        guard.path = new_path;

        Ok((qid, iounit))
    }

    pub async fn read(&self, fid: u32, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut guard = self.get_ref(fid).await?;
        let mode = guard.mode;
        let file = guard
            .file
            .as_mut()
            .ok_or_else(|| Error::proto(ename::NO_FILE_OPEN))?;
        if !mode.allows_read() {
            return Err(Error::proto(ename::NO_READ));
        }

        match file {
            OpenFile::File(f) => f.read(buf, offset).await,
            OpenFile::Auth(f) => f.read(buf, offset).await,
        }
    }

    pub async fn write(&self, fid: u32, buf: &[u8], offset: u64) -> Result<usize> {
        let mut guard = self.get_ref(fid).await?;
        let mode = guard.mode;
        let file = guard
            .file
            .as_mut()
            .ok_or_else(|| Error::proto(ename::NO_FILE_OPEN))?;
        if !mode.allows_write() {
            return Err(Error::proto(ename::NO_WRITE));
        }

        match file {
            OpenFile::File(f) => f.write(buf, offset).await,
            OpenFile::Auth(f) => f.write(buf, offset).await,
        }
    }

    pub async fn stat(&self, fid: u32) -> Result<Dir> {
        let guard = self.get_ref(fid).await?;
        let ent = guard
            .ent
            .as_deref()
            .ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;
        ent.stat().await
    }

    pub async fn wstat(&self, fid: u32, dir: &Dir) -> Result<()> {
        let guard = self.get_ref(fid).await?;
        let ent = guard
            .ent
            .as_deref()
            .ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;
        ent.wstat(dir).await
    }
}

/// Open the dirent held by a locked fid state and stash the capability.
///
/// This does not check file permissions before opening; that is the
/// backend's concern.
async fn open_locked(st: &mut SFidState, mode: OpenMode) -> Result<(QId, u32)> {
    let ent = st
        .ent
        .as_deref()
        .ok_or_else(|| Error::proto(ename::UNKNOWN_FID))?;
    if st.file.is_some() {
        return Err(Error::proto(ename::ALREADY_OPEN));
    }

    let file: BoxFile = if is_dir(ent) {
        Box::new(Readdir::new(ent.open_dir().await?))
    } else {
        ent.open(mode).await?
    };

    let qid = ent.qid();
    let iounit = file.iounit();
    st.file = Some(OpenFile::File(file));
    st.mode = mode;

    Ok((qid, iounit))
}

/// Apply one request to the session, producing the reply body.
///
/// Protocol failures surface as `Err` and are turned into `RError` by the
/// caller; they never abort the connection.
pub async fn dispatch_once<Fs: FileSys>(
    session: &Session<Fs>,
    msg: &Msg,
    msize: u32,
) -> Result<FCall> {
    use crate::FCall::*;

    let reply = match msg.body {
        TAuth {
            afid,
            ref uname,
            ref aname,
        } => RAuth {
            aqid: session.auth(afid, uname, aname).await?,
        },
        TAttach {
            fid,
            afid,
            ref uname,
            ref aname,
        } => RAttach {
            qid: session.attach(fid, afid, uname, aname).await?,
        },
        TWalk {
            fid,
            newfid,
            ref wnames,
        } => RWalk {
            wqids: session.walk(fid, newfid, wnames).await?,
        },
        TOpen { fid, mode } => {
            let (qid, iounit) = session.open(fid, mode).await?;
            ROpen { qid, iounit }
        }
        TCreate {
            fid,
            ref name,
            perm,
            mode,
        } => {
            let (qid, iounit) = session.create(fid, name, perm, mode).await?;
            RCreate { qid, iounit }
        }
        TRead { fid, offset, count } => {
            // clamp so the reply always fits the negotiated msize
            let count = count.min(msize.saturating_sub(RREADHDRSZ)) as usize;
            let mut buf = vec![0; count];
            let n = session.read(fid, &mut buf, offset).await?;
            buf.truncate(n);
            RRead { data: Data(buf) }
        }
        TWrite {
            fid,
            offset,
            ref data,
        } => RWrite {
            count: session.write(fid, &data.0, offset).await? as u32,
        },
        TClunk { fid } => {
            session.clunk(fid).await?;
            RClunk
        }
        TRemove { fid } => {
            session.remove(fid).await?;
            RRemove
        }
        TStat { fid } => RStat {
            stat: session.stat(fid).await?,
        },
        TWStat { fid, ref stat } => {
            session.wstat(fid, stat).await?;
            RWStat
        }
        // version is negotiated before the session exists
        TVersion { .. } => return Err(Error::proto(ename::NOT_IMPLEMENTED)),
        _ => return Err(Error::proto(ename::UNKNOWN_MSG)),
    };

    Ok(reply)
}

/// Serve one connection on a duplex byte stream.
///
/// Negotiates the protocol version, then reads frames until the peer
/// closes or the transport fails, handling every request on its own task.
/// Reply order is unconstrained; the shared writer serializes frames.
pub async fn serve<Fs, Reader, Writer>(fs: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: FileSys,
    Reader: AsyncRead + Send + Unpin + 'static,
    Writer: AsyncWrite + Send + Unpin + 'static,
{
    let mut chan = Channel::new(reader, writer, DEFAULT_MSIZE);
    let (msize, version) = chan.negotiate(DEFAULT_MSIZE).await?;
    info!("negotiated msize {} version {:?}", msize, version);

    let (mut rx, tx) = chan.into_split();
    let tx = Arc::new(Mutex::new(tx));
    let session = Arc::new(Session::new(fs));

    loop {
        let msg = match rx.read_msg().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                session.stop().await;
                return Err(e);
            }
        };
        info!("\t← {:?}", msg);

        let session = session.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let body = dispatch_once(&session, &msg, msize)
                .await
                .unwrap_or_else(|e| {
                    error!("{:?}: \"{}\"", MsgType::from(&msg.body), e);
                    FCall::RError { ename: e.ename() }
                });
            let reply = Msg {
                tag: msg.tag,
                body,
            };

            {
                let mut tx = tx.lock().await;
                if let Err(e) = tx.write_msg(&reply).await {
                    error!("failed to send reply for tag {}: {}", reply.tag, e);
                    return;
                }
            }
            info!("\t→ {:?}", reply);
        });
    }

    session.stop().await;
    Ok(())
}

async fn serve_tcp<Fs>(fs: Fs, addr: &str) -> Result<()>
where
    Fs: FileSys + Clone,
{
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = fs.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = serve(fs, readhalf, writehalf).await {
                error!("connection error: {}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

pub async fn serve_async_unix<Fs>(fs: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: FileSys + Clone,
{
    use tokio::signal::unix::{signal, SignalKind};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let fs = fs.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            if let Err(e) = serve(fs, readhalf, writehalf).await {
                                error!("connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `proto!address!port` (`tcp` or `unix`) and serve every
/// accepted connection with a clone of the filesystem.
pub async fn serve_async<Fs>(fs: Fs, addr: &str) -> Result<()>
where
    Fs: FileSys + Clone,
{
    let (proto, listen_addr, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => serve_tcp(fs, &format!("{}:{}", listen_addr, port)).await,
        "unix" => serve_async_unix(fs, listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::fs::{Dirent, DirStream, File};
    use crate::serialize::Decodable;
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};
    use std::sync::atomic::AtomicU64;
    use std::sync::{Mutex as StdMutex, Weak};

    const TEST_TIME: u32 = 112321;

    struct Node {
        qid: QId,
        mode: u32,
        name: String,
        parent: StdMutex<Weak<Node>>,
        kids: StdMutex<HashMap<String, Arc<Node>>>,
        data: StdMutex<Vec<u8>>,
    }

    impl Node {
        fn stat_dir(&self) -> Dir {
            Dir {
                typ: 0,
                dev: 0,
                qid: self.qid,
                mode: self.mode,
                atime: TEST_TIME,
                mtime: TEST_TIME,
                length: if self.qid.is_dir() {
                    0
                } else {
                    self.data.lock().unwrap().len() as u64
                },
                name: self.name.clone(),
                uid: "glenda".to_owned(),
                gid: "users".to_owned(),
                muid: "glenda".to_owned(),
            }
        }
    }

    #[derive(Clone)]
    struct MemFs(Arc<MemFsInner>);

    struct MemFsInner {
        root: Arc<Node>,
        next_path: AtomicU64,
        require_auth: bool,
        auth_ok: bool,
    }

    impl MemFs {
        fn new() -> MemFs {
            MemFs::build(false, true)
        }

        fn with_auth(auth_ok: bool) -> MemFs {
            MemFs::build(true, auth_ok)
        }

        fn build(require_auth: bool, auth_ok: bool) -> MemFs {
            let root = Arc::new(Node {
                qid: QId {
                    typ: QIdType::DIR,
                    version: 0,
                    path: 1,
                },
                mode: dm::DIR | 0o775,
                name: "/".to_owned(),
                parent: StdMutex::new(Weak::new()),
                kids: StdMutex::new(HashMap::new()),
                data: StdMutex::new(Vec::new()),
            });
            MemFs(Arc::new(MemFsInner {
                root,
                next_path: AtomicU64::new(2),
                require_auth,
                auth_ok,
            }))
        }

        fn dirent(&self, node: Arc<Node>) -> BoxDirent {
            Box::new(MemDirent {
                fs: self.clone(),
                node,
            })
        }

        fn add(&self, parent: &Arc<Node>, name: &str, mode: u32) -> Arc<Node> {
            let typ = if mode & dm::DIR != 0 {
                QIdType::DIR
            } else {
                QIdType::FILE
            };
            let node = Arc::new(Node {
                qid: QId {
                    typ,
                    version: 0,
                    path: self.0.next_path.fetch_add(1, Ordering::SeqCst),
                },
                mode,
                name: name.to_owned(),
                parent: StdMutex::new(Arc::downgrade(parent)),
                kids: StdMutex::new(HashMap::new()),
                data: StdMutex::new(Vec::new()),
            });
            parent
                .kids
                .lock()
                .unwrap()
                .insert(name.to_owned(), node.clone());
            node
        }
    }

    #[async_trait]
    impl FileSys for MemFs {
        fn require_auth(&self) -> bool {
            self.0.require_auth
        }

        async fn auth(&self, _uname: &str, _aname: &str) -> Result<BoxAuthFile> {
            Ok(Box::new(MemAuthFile {
                ok: self.0.auth_ok,
                tokens: Vec::new(),
            }))
        }

        async fn attach(
            &self,
            _uname: &str,
            _aname: &str,
            auth: Option<&dyn AuthFile>,
        ) -> Result<BoxDirent> {
            if self.0.require_auth && auth.is_none() {
                return Err(Error::proto(ename::AUTH_REQUIRED));
            }
            Ok(self.dirent(self.0.root.clone()))
        }
    }

    struct MemAuthFile {
        ok: bool,
        tokens: Vec<u8>,
    }

    #[async_trait]
    impl File for MemAuthFile {
        async fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let offset = offset as usize;
            if offset >= self.tokens.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.tokens.len() - offset);
            buf[..n].copy_from_slice(&self.tokens[offset..offset + n]);
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8], _offset: u64) -> Result<usize> {
            self.tokens.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn iounit(&self) -> u32 {
            0
        }
    }

    impl AuthFile for MemAuthFile {
        fn success(&self) -> bool {
            self.ok
        }
    }

    struct MemDirent {
        fs: MemFs,
        node: Arc<Node>,
    }

    #[async_trait]
    impl Dirent for MemDirent {
        fn qid(&self) -> QId {
            self.node.qid
        }

        async fn walk(&self, names: &[String]) -> Result<(Vec<QId>, Option<BoxDirent>)> {
            if names.is_empty() {
                return Ok((Vec::new(), Some(self.fs.dirent(self.node.clone()))));
            }

            let mut cur = self.node.clone();
            let mut qids = Vec::new();
            for name in names {
                let next = if name == ".." {
                    // the root has no parent: ".." past it is an error
                    match cur.parent.lock().unwrap().upgrade() {
                        Some(p) => p,
                        None => break,
                    }
                } else {
                    match cur.kids.lock().unwrap().get(name.as_str()).cloned() {
                        Some(n) => n,
                        None => break,
                    }
                };
                qids.push(next.qid);
                cur = next;
            }

            if qids.is_empty() {
                return Err(Error::Proto(format!("{}: no such file", names[0])));
            }
            if qids.len() == names.len() {
                Ok((qids, Some(self.fs.dirent(cur))))
            } else {
                Ok((qids, None))
            }
        }

        async fn open(&self, mode: OpenMode) -> Result<BoxFile> {
            if self.node.qid.is_dir() {
                return Err(Error::proto(ename::NOT_IMPLEMENTED));
            }
            if mode.bits() & OpenMode::TRUNC.bits() != 0 {
                self.node.data.lock().unwrap().clear();
            }
            Ok(Box::new(MemFile {
                node: self.node.clone(),
            }))
        }

        async fn open_dir(&self) -> Result<DirStream> {
            // the listing is snapshotted at open time
            let mut dirs: Vec<Dir> = self
                .node
                .kids
                .lock()
                .unwrap()
                .values()
                .map(|n| n.stat_dir())
                .collect();
            dirs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(stream::iter(dirs.into_iter().map(Ok)).boxed())
        }

        async fn create(
            &self,
            name: &str,
            perm: u32,
            _mode: OpenMode,
        ) -> Result<(BoxDirent, BoxFile)> {
            if !self.node.qid.is_dir() {
                return Err(Error::proto(ename::CREATE_NON_DIR));
            }

            let node = {
                let mut kids = self.node.kids.lock().unwrap();
                if kids.contains_key(name) {
                    return Err(Error::proto(ename::DUP_NAME));
                }
                let typ = if perm & dm::DIR != 0 {
                    QIdType::DIR
                } else {
                    QIdType::FILE
                };
                let node = Arc::new(Node {
                    qid: QId {
                        typ,
                        version: 0,
                        path: self.fs.0.next_path.fetch_add(1, Ordering::SeqCst),
                    },
                    mode: perm,
                    name: name.to_owned(),
                    parent: StdMutex::new(Arc::downgrade(&self.node)),
                    kids: StdMutex::new(HashMap::new()),
                    data: StdMutex::new(Vec::new()),
                });
                kids.insert(name.to_owned(), node.clone());
                node
            };

            Ok((self.fs.dirent(node.clone()), Box::new(MemFile { node })))
        }

        async fn stat(&self) -> Result<Dir> {
            Ok(self.node.stat_dir())
        }

        async fn wstat(&self, _dir: &Dir) -> Result<()> {
            // time and name updates are accepted and ignored
            Ok(())
        }

        async fn clunk(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        async fn remove(self: Box<Self>) -> Result<()> {
            let parent = self.node.parent.lock().unwrap().upgrade();
            match parent {
                None => Err(Error::proto(ename::CANNOT_REMOVE_ROOT)),
                Some(p) => {
                    p.kids.lock().unwrap().remove(&self.node.name);
                    Ok(())
                }
            }
        }
    }

    struct MemFile {
        node: Arc<Node>,
    }

    #[async_trait]
    impl File for MemFile {
        async fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let data = self.node.data.lock().unwrap();
            let offset = offset as usize;
            if offset >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            Ok(n)
        }

        async fn write(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
            let mut data = self.node.data.lock().unwrap();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn iounit(&self) -> u32 {
            0
        }
    }

    fn names(ns: &[&str]) -> Vec<String> {
        ns.iter().map(|s| s.to_string()).collect()
    }

    /// root/ sub/ deep.txt, root/ file.txt ("hello")
    fn populated() -> (MemFs, Session<MemFs>) {
        let fs = MemFs::new();
        let sub = fs.add(&fs.0.root, "sub", dm::DIR | 0o775);
        fs.add(&sub, "deep.txt", 0o644);
        let file = fs.add(&fs.0.root, "file.txt", 0o644);
        *file.data.lock().unwrap() = b"hello".to_vec();
        (fs.clone(), Session::new(fs))
    }

    fn ename_of<T: std::fmt::Debug>(res: Result<T>) -> String {
        res.unwrap_err().ename()
    }

    #[tokio::test]
    async fn attach_walk_clunk() {
        let (_fs, sess) = populated();

        let qid = sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        assert!(qid.is_dir());

        let qids = sess.walk(0, 1, &names(&["sub"])).await.unwrap();
        assert_eq!(qids.len(), 1);
        assert!(qids[0].is_dir());

        sess.clunk(0).await.unwrap();
        assert_eq!(ename_of(sess.stat(0).await), ename::UNKNOWN_FID);
        assert_eq!(sess.stat(1).await.unwrap().name, "sub");
    }

    #[tokio::test]
    async fn create_write_read() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        // clone the root onto fid 1, then create in place
        let qids = sess.walk(0, 1, &[]).await.unwrap();
        assert!(qids.is_empty());

        let (qid, _iounit) = sess.create(1, "f", 0o644, OpenMode::RDWR).await.unwrap();
        assert!(!qid.is_dir());

        assert_eq!(sess.write(1, b"abcd", 0).await.unwrap(), 4);

        let mut buf = [0u8; 100];
        let n = sess.read(1, &mut buf, 1).await.unwrap();
        assert_eq!(&buf[..n], b"bcd");

        // fid 1 now names the created file; fid 0 still the root
        assert_eq!(sess.stat(1).await.unwrap().name, "f");
        assert!(sess.stat(0).await.unwrap().qid.is_dir());
    }

    #[tokio::test]
    async fn partial_walk_leaves_newfid_unallocated() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        let qids = sess.walk(0, 1, &names(&["sub", "missing"])).await.unwrap();
        assert_eq!(qids.len(), 1);

        assert_eq!(ename_of(sess.stat(1).await), ename::UNKNOWN_FID);
        let mut buf = [0u8; 8];
        assert_eq!(
            ename_of(sess.read(1, &mut buf, 0).await),
            ename::UNKNOWN_FID
        );

        // the source fid is unchanged and fid 1 is free for re-use
        assert!(sess.stat(0).await.unwrap().qid.is_dir());
        sess.walk(0, 1, &names(&["sub"])).await.unwrap();
    }

    #[tokio::test]
    async fn walk_failure_at_first_name_is_an_error() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        assert!(sess.walk(0, 1, &names(&["nope"])).await.is_err());

        // the reservation was released
        let qids = sess.walk(0, 1, &[]).await.unwrap();
        assert!(qids.is_empty());
    }

    #[tokio::test]
    async fn remove_root_fails_but_drops_the_fid() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        assert_eq!(ename_of(sess.remove(0).await), ename::CANNOT_REMOVE_ROOT);
        // teardown proceeded regardless of the backend error
        assert_eq!(ename_of(sess.stat(0).await), ename::UNKNOWN_FID);
    }

    #[tokio::test]
    async fn remove_unlinks_the_file() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();
        sess.remove(1).await.unwrap();
        assert_eq!(ename_of(sess.stat(1).await), ename::UNKNOWN_FID);

        // the name is gone from the directory
        assert!(sess.walk(0, 2, &names(&["file.txt"])).await.is_err());
    }

    #[tokio::test]
    async fn reopen_is_rejected() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();

        sess.open(1, OpenMode::READ).await.unwrap();
        assert_eq!(
            ename_of(sess.open(1, OpenMode::READ).await),
            ename::ALREADY_OPEN
        );
    }

    #[tokio::test]
    async fn duplicate_fids_are_rejected() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        sess.walk(0, 1, &[]).await.unwrap();
        assert_eq!(ename_of(sess.walk(0, 1, &[]).await), ename::DUP_FID);
        assert_eq!(
            ename_of(sess.attach(1, NOFID, "glenda", "/").await),
            ename::DUP_FID
        );
    }

    #[tokio::test]
    async fn clone_walks_share_the_object() {
        let (_fs, sess) = populated();
        let root_qid = sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        let qids = sess.walk(0, 1, &[]).await.unwrap();
        assert!(qids.is_empty());
        assert_eq!(sess.stat(1).await.unwrap().qid, root_qid);

        // clone onto itself is a no-op
        let qids = sess.walk(0, 0, &[]).await.unwrap();
        assert!(qids.is_empty());
        assert_eq!(sess.stat(0).await.unwrap().qid, root_qid);
    }

    #[tokio::test]
    async fn walk_in_place_rebinds_the_fid() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        let qids = sess.walk(0, 0, &names(&["sub"])).await.unwrap();
        assert_eq!(qids.len(), 1);
        assert_eq!(sess.stat(0).await.unwrap().name, "sub");

        // a failed in-place walk leaves the fid alone
        let qids = sess.walk(0, 0, &names(&["missing"])).await;
        assert!(qids.is_err());
        assert_eq!(sess.stat(0).await.unwrap().name, "sub");
    }

    #[tokio::test]
    async fn walk_above_the_root_is_rejected() {
        let (_fs, sess) = populated();
        let root_qid = sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        assert_eq!(
            ename_of(sess.walk(0, 1, &names(&[".."])).await),
            ename::INVALID_PATH
        );
        // the rejection never allocated the new fid
        assert_eq!(ename_of(sess.stat(1).await), ename::UNKNOWN_FID);

        // ".." within the tree still resolves
        sess.walk(0, 1, &names(&["sub"])).await.unwrap();
        let qids = sess.walk(1, 2, &names(&[".."])).await.unwrap();
        assert_eq!(qids, vec![root_qid]);
        assert_eq!(
            ename_of(sess.walk(1, 3, &names(&["..", ".."])).await),
            ename::INVALID_PATH
        );
    }

    #[tokio::test]
    async fn walking_through_a_file_is_rejected() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();

        assert_eq!(
            ename_of(sess.walk(1, 2, &names(&["x"])).await),
            ename::NOT_A_DIR
        );
        // but cloning a file fid is fine
        sess.walk(1, 2, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn non_normalized_walks_are_rejected() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        for bad in [
            names(&["a", "", "b"]),
            names(&["."]),
            names(&["a", ".."]),
            names(&["a/b"]),
        ] {
            assert_eq!(ename_of(sess.walk(0, 1, &bad).await), ename::INVALID_PATH);
        }
    }

    #[tokio::test]
    async fn open_modes_gate_reads_and_writes() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();
        sess.open(1, OpenMode::READ).await.unwrap();
        assert_eq!(ename_of(sess.write(1, b"x", 0).await), ename::NO_WRITE);

        sess.walk(0, 2, &names(&["file.txt"])).await.unwrap();
        sess.open(2, OpenMode::WRITE).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ename_of(sess.read(2, &mut buf, 0).await), ename::NO_READ);
    }

    #[tokio::test]
    async fn io_requires_an_open_file() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(
            ename_of(sess.read(1, &mut buf, 0).await),
            ename::NO_FILE_OPEN
        );
        assert_eq!(ename_of(sess.write(1, b"x", 0).await), ename::NO_FILE_OPEN);
    }

    #[tokio::test]
    async fn create_rejects_illegal_names() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        for bad in [".", "..", "a/b", "a\\b", ""] {
            assert_eq!(
                ename_of(sess.create(0, bad, 0o644, OpenMode::READ).await),
                ename::ILLEGAL_NAME
            );
        }
    }

    #[tokio::test]
    async fn create_needs_an_unopened_directory() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        // create through a file fid
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();
        assert_eq!(
            ename_of(sess.create(1, "x", 0o644, OpenMode::READ).await),
            ename::CREATE_NON_DIR
        );

        // create through an already-opened directory fid
        sess.walk(0, 2, &[]).await.unwrap();
        sess.open(2, OpenMode::READ).await.unwrap();
        assert_eq!(
            ename_of(sess.create(2, "x", 0o644, OpenMode::READ).await),
            ename::ALREADY_OPEN
        );
    }

    #[tokio::test]
    async fn created_directories_read_as_entry_streams() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &[]).await.unwrap();

        let (qid, _) = sess
            .create(1, "d", dm::DIR | 0o775, OpenMode::READ)
            .await
            .unwrap();
        assert!(qid.is_dir());
        assert_eq!(sess.stat(1).await.unwrap().name, "d");

        // freshly created directory: end-of-stream straight away
        let mut buf = [0u8; 512];
        assert_eq!(sess.read(1, &mut buf, 0).await.unwrap(), 0);
    }

    fn decode_dirs(buf: &[u8]) -> Vec<Dir> {
        let mut cur = std::io::Cursor::new(buf);
        let mut out = Vec::new();
        while (cur.position() as usize) < buf.len() {
            out.push(Dir::decode(&mut cur).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn directory_reads_serve_the_open_time_snapshot() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        sess.walk(0, 1, &[]).await.unwrap();
        sess.open(1, OpenMode::READ).await.unwrap();

        // mutate the directory after the open
        sess.walk(0, 2, &[]).await.unwrap();
        sess.create(2, "late.txt", 0o644, OpenMode::READ)
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let mut listing = Vec::new();
        let mut offset = 0u64;
        loop {
            let n = sess.read(1, &mut buf, offset).await.unwrap();
            if n == 0 {
                break;
            }
            listing.extend(decode_dirs(&buf[..n]));
            offset += n as u64;
        }

        let listed: Vec<&str> = listing.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(listed, ["file.txt", "sub"]);
    }

    #[tokio::test]
    async fn directory_reads_enforce_offsets() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &[]).await.unwrap();
        sess.open(1, OpenMode::READ).await.unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(ename_of(sess.read(1, &mut buf, 5).await), ename::BAD_OFFSET);
    }

    #[tokio::test]
    async fn stat_and_wstat_delegate() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        let dir = sess.stat(0).await.unwrap();
        assert_eq!(dir.name, "/");
        assert!(dir.is_dir());

        sess.wstat(0, &Dir::nochange()).await.unwrap();
    }

    #[tokio::test]
    async fn auth_flow() {
        let sess = Session::new(MemFs::with_auth(true));

        assert_eq!(
            ename_of(sess.attach(0, NOFID, "u", "/").await),
            ename::AUTH_REQUIRED
        );

        let aqid = sess.auth(5, "u", "/").await.unwrap();
        assert!(aqid.typ.contains(QIdType::AUTH));

        // the auth channel is readable and writable
        assert_eq!(sess.write(5, b"token", 0).await.unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(sess.read(5, &mut buf, 0).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"token");

        sess.attach(0, 5, "u", "/").await.unwrap();

        // an auth fid cannot be opened, walked or stat-ed
        assert_eq!(
            ename_of(sess.walk(5, 6, &names(&["x"])).await),
            ename::UNKNOWN_FID
        );
        assert_eq!(ename_of(sess.stat(5).await), ename::UNKNOWN_FID);

        // clunking an auth fid drops it from the table but reports unknown
        assert_eq!(ename_of(sess.clunk(5).await), ename::UNKNOWN_FID);
        assert_eq!(ename_of(sess.clunk(5).await), ename::UNKNOWN_FID);
        assert_eq!(
            ename_of(sess.attach(2, 5, "u", "/").await),
            ename::AUTH_REQUIRED
        );
    }

    #[tokio::test]
    async fn auth_is_refused_when_not_required() {
        let (_fs, sess) = populated();
        assert_eq!(ename_of(sess.auth(5, "u", "/").await), ename::NO_AUTH);

        // and the afid is ignored on attach
        sess.attach(0, 100, "u", "/").await.unwrap();
    }

    #[tokio::test]
    async fn failed_auth_cannot_attach() {
        let sess = Session::new(MemFs::with_auth(false));
        sess.auth(5, "u", "/").await.unwrap();
        assert_eq!(
            ename_of(sess.attach(0, 5, "u", "/").await),
            ename::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn auth_with_nofid_is_a_noop() {
        let sess = Session::new(MemFs::with_auth(true));
        let aqid = sess.auth(NOFID, "u", "/").await.unwrap();
        assert!(aqid.typ.contains(QIdType::AUTH));
    }

    #[tokio::test]
    async fn stop_releases_every_fid() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();
        sess.open(1, OpenMode::READ).await.unwrap();

        sess.stop().await;
        assert_eq!(ename_of(sess.stat(0).await), ename::UNKNOWN_FID);
        assert_eq!(ename_of(sess.stat(1).await), ename::UNKNOWN_FID);
    }

    #[tokio::test]
    async fn concurrent_clunk_and_stat_agree() {
        let (_fs, sess) = populated();
        let sess = Arc::new(sess);
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sess = sess.clone();
            tasks.push(tokio::spawn(async move {
                match sess.stat(0).await {
                    Ok(dir) => assert_eq!(dir.name, "/"),
                    Err(e) => assert_eq!(e.ename(), ename::UNKNOWN_FID),
                }
            }));
        }
        let clunker = {
            let sess = sess.clone();
            tokio::spawn(async move { sess.clunk(0).await })
        };

        for t in tasks {
            t.await.unwrap();
        }
        clunker.await.unwrap().unwrap();
        assert_eq!(ename_of(sess.stat(0).await), ename::UNKNOWN_FID);
    }

    #[tokio::test]
    async fn dispatch_clamps_read_counts() {
        let (_fs, sess) = populated();
        sess.attach(0, NOFID, "glenda", "/").await.unwrap();
        sess.walk(0, 1, &names(&["file.txt"])).await.unwrap();
        sess.open(1, OpenMode::RDWR).await.unwrap();
        sess.write(1, &vec![7u8; 2000], 0).await.unwrap();

        let msg = Msg {
            tag: 9,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 5000,
            },
        };
        match dispatch_once(&sess, &msg, 1024).await.unwrap() {
            FCall::RRead { data } => {
                assert_eq!(data.0.len(), (1024 - RREADHDRSZ) as usize);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_non_requests() {
        let (_fs, sess) = populated();

        let msg = Msg {
            tag: 1,
            body: FCall::RClunk,
        };
        assert_eq!(
            ename_of(dispatch_once(&sess, &msg, 1024).await),
            ename::UNKNOWN_MSG
        );

        let msg = Msg {
            tag: 2,
            body: FCall::TVersion {
                msize: 1024,
                version: P92000.to_owned(),
            },
        };
        assert_eq!(
            ename_of(dispatch_once(&sess, &msg, 1024).await),
            ename::NOT_IMPLEMENTED
        );
    }

    #[tokio::test]
    async fn serves_a_connection_end_to_end() {
        let (fs, _) = populated();

        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (sr, sw) = tokio::io::split(server_io);
        let server = tokio::spawn(serve(fs, sr, sw));

        let (cr, cw) = tokio::io::split(client_io);
        let mut chan = Channel::new(cr, cw, DEFAULT_MSIZE);

        // version-only handshake
        chan.write_msg(&Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 1024,
                version: P92000.to_owned(),
            },
        })
        .await
        .unwrap();
        let reply = chan.read_msg().await.unwrap().unwrap();
        assert_eq!(reply.tag, NOTAG);
        assert_eq!(
            reply.body,
            FCall::RVersion {
                msize: 1024,
                version: P92000.to_owned(),
            }
        );
        chan.set_msize(1024);

        // attach
        chan.write_msg(&Msg {
            tag: 1,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: "/".to_owned(),
            },
        })
        .await
        .unwrap();
        match chan.read_msg().await.unwrap().unwrap() {
            Msg {
                tag: 1,
                body: FCall::RAttach { qid },
            } => assert!(qid.is_dir()),
            other => panic!("unexpected reply: {:?}", other),
        }

        // two in-flight requests, replies correlated by tag
        chan.write_msg(&Msg {
            tag: 2,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["sub".to_owned()],
            },
        })
        .await
        .unwrap();
        chan.write_msg(&Msg {
            tag: 3,
            body: FCall::TStat { fid: 0 },
        })
        .await
        .unwrap();

        let mut replies = HashMap::new();
        for _ in 0..2 {
            let msg = chan.read_msg().await.unwrap().unwrap();
            replies.insert(msg.tag, msg.body);
        }
        match replies.remove(&2) {
            Some(FCall::RWalk { wqids }) => assert_eq!(wqids.len(), 1),
            other => panic!("unexpected walk reply: {:?}", other),
        }
        match replies.remove(&3) {
            Some(FCall::RStat { stat }) => assert_eq!(stat.name, "/"),
            other => panic!("unexpected stat reply: {:?}", other),
        }

        // a protocol error keeps the connection alive
        chan.write_msg(&Msg {
            tag: 4,
            body: FCall::TClunk { fid: 9 },
        })
        .await
        .unwrap();
        match chan.read_msg().await.unwrap().unwrap() {
            Msg {
                tag: 4,
                body: FCall::RError { ename: e },
            } => assert_eq!(e, ename::UNKNOWN_FID),
            other => panic!("unexpected reply: {:?}", other),
        }

        chan.write_msg(&Msg {
            tag: 5,
            body: FCall::TClunk { fid: 1 },
        })
        .await
        .unwrap();
        match chan.read_msg().await.unwrap().unwrap() {
            Msg {
                tag: 5,
                body: FCall::RClunk,
            } => {}
            other => panic!("unexpected reply: {:?}", other),
        }

        // closing the client ends the serve loop cleanly
        drop(chan);
        assert!(server.await.unwrap().is_ok());
    }
}
