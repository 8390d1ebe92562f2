//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::{size_of, size_of_val};

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with RVersion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Ample room for `TWrite`/`TRead` headers
///
/// size[4] type[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Wire overhead of an `RRead` reply
///
/// size[4] type[1] tag[2] count[4]
pub const RREADHDRSZ: u32 = 11;

/// Default maximum message size offered during version negotiation
pub const DEFAULT_MSIZE: u32 = 64 * 1024;

/// Smallest msize this implementation will negotiate down to
pub const MIN_MSIZE: u32 = 1024;

/// Plan 9 file service default port
pub const NINEP_PORT: u16 = 564;

/// Bits in Dir.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// # Protocol
    /// 9P2000
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// The type of I/O requested by `TOpen`/`TCreate`
///
/// The low two bits select the access class; `TRUNC`/`CEXEC`/`RCLOSE`
/// are or'ed in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpenMode(u8);

impl OpenMode {
    /// Open for read
    pub const READ: OpenMode = OpenMode(0);
    /// Write
    pub const WRITE: OpenMode = OpenMode(1);
    /// Read and write
    pub const RDWR: OpenMode = OpenMode(2);
    /// Execute, == read but check execute permission
    pub const EXEC: OpenMode = OpenMode(3);
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: OpenMode = OpenMode(0x10);
    /// Or'ed in, close on exec
    pub const CEXEC: OpenMode = OpenMode(0x20);
    /// Or'ed in, remove on close
    pub const RCLOSE: OpenMode = OpenMode(0x40);

    pub fn from_bits(bits: u8) -> OpenMode {
        OpenMode(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// The access class, one of `READ`, `WRITE`, `RDWR`, `EXEC`.
    pub fn access(self) -> OpenMode {
        OpenMode(self.0 & 3)
    }

    /// Reads are denied only on write-only fids.
    pub fn allows_read(self) -> bool {
        self.access() != OpenMode::WRITE
    }

    /// Writes require `WRITE` or `RDWR` access.
    pub fn allows_write(self) -> bool {
        self.access() == OpenMode::WRITE || self.access() == OpenMode::RDWR
    }
}

impl ::std::ops::BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    pub fn size(&self) -> u32 {
        (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u32
    }

    pub fn is_dir(&self) -> bool {
        self.typ.contains(QIdType::DIR)
    }
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// The leading 2-byte size field on the wire is *not* counted by `size()`;
/// it covers everything after itself so that readers can skip fields they
/// do not understand.
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Dir {
    /// Get the current encoded size of the stat record, excluding the
    /// leading size field itself.
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + self.qid.size() as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }

    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }

    /// A stat record that changes nothing when sent in `TWStat`:
    /// every numeric field is at its maximum and every string is empty.
    pub fn nochange() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::from_bits_truncate(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }
}

/// Data type used in `RRead` and `TWrite`
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        //TError        = 106,  // Illegal, never used
        RError          = 107,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        use crate::MsgType::*;

        matches!(
            *self,
            RVersion
                | RAuth
                | RAttach
                | RError
                | RWalk
                | ROpen
                | RCreate
                | RRead
                | RWrite
                | RClunk
                | RRemove
                | RStat
                | RWStat
        )
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: OpenMode,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: OpenMode,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Dir,
    },
    TWStat {
        fid: u32,
        stat: Dir,
    },
    RWStat,
}

fn str_size(s: &str) -> u32 {
    2 + s.len() as u32
}

impl FCall {
    /// Get the fids which self contains
    pub fn fids(&self) -> Vec<u32> {
        match *self {
            FCall::TAttach { fid, afid, .. } if afid != NOFID => vec![fid, afid],
            FCall::TAttach { fid, .. } => vec![fid],
            FCall::TWalk { fid, .. } => vec![fid],
            FCall::TOpen { fid, .. } => vec![fid],
            FCall::TCreate { fid, .. } => vec![fid],
            FCall::TRead { fid, .. } => vec![fid],
            FCall::TWrite { fid, .. } => vec![fid],
            FCall::TClunk { fid } => vec![fid],
            FCall::TRemove { fid } => vec![fid],
            FCall::TStat { fid } => vec![fid],
            FCall::TWStat { fid, .. } => vec![fid],
            _ => Vec::new(),
        }
    }

    /// Get the newfid which self contains
    pub fn newfid(&self) -> Option<u32> {
        match *self {
            FCall::TAuth { afid, .. } => Some(afid),
            FCall::TAttach { fid, .. } => Some(fid),
            FCall::TWalk { newfid, .. } => Some(newfid),
            _ => None,
        }
    }

    /// Get the qids which self contains
    pub fn qids(&self) -> Vec<QId> {
        match *self {
            FCall::RAuth { aqid } => vec![aqid],
            FCall::RAttach { qid } => vec![qid],
            FCall::RWalk { ref wqids } => wqids.clone(),
            FCall::ROpen { qid, .. } => vec![qid],
            FCall::RCreate { qid, .. } => vec![qid],
            _ => Vec::new(),
        }
    }

    /// Encoded size of the full frame carrying this message, including
    /// the 4-byte length prefix, the type byte and the tag.
    pub fn size(&self) -> u32 {
        let body = match *self {
            FCall::TVersion { ref version, .. } | FCall::RVersion { ref version, .. } => {
                4 + str_size(version)
            }
            FCall::TAuth {
                ref uname,
                ref aname,
                ..
            } => 4 + str_size(uname) + str_size(aname),
            FCall::RAuth { ref aqid } => aqid.size(),
            FCall::TAttach {
                ref uname,
                ref aname,
                ..
            } => 8 + str_size(uname) + str_size(aname),
            FCall::RAttach { ref qid } => qid.size(),
            FCall::RError { ref ename } => str_size(ename),
            FCall::TWalk { ref wnames, .. } => {
                10 + wnames.iter().map(|n| str_size(n)).sum::<u32>()
            }
            FCall::RWalk { ref wqids } => 2 + wqids.iter().map(|q| q.size()).sum::<u32>(),
            FCall::TOpen { .. } => 5,
            FCall::ROpen { ref qid, .. } | FCall::RCreate { ref qid, .. } => qid.size() + 4,
            FCall::TCreate { ref name, .. } => 9 + str_size(name),
            FCall::TRead { .. } => 16,
            FCall::RRead { ref data } => 4 + data.0.len() as u32,
            FCall::TWrite { ref data, .. } => 16 + data.0.len() as u32,
            FCall::RWrite { .. } => 4,
            FCall::TClunk { .. } | FCall::TRemove { .. } | FCall::TStat { .. } => 4,
            FCall::RClunk | FCall::RRemove | FCall::RWStat => 0,
            // outer stat wrapper + stat size field + stat body
            FCall::RStat { ref stat } => 4 + stat.size() as u32,
            FCall::TWStat { ref stat, .. } => 8 + stat.size() as u32,
        };

        // size[4] type[1] tag[2]
        7 + body
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}
