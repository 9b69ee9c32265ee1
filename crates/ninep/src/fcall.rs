//! 9P2000.u protocol data types and constants.
//!
//! # Protocol
//! 9P2000.u

use bitflags::bitflags;
use enum_primitive::*;
use num_traits::FromPrimitive;

/// Plain 9P2000 version string
pub const P92000: &str = "9P2000";

/// 9P2000.u version string
pub const P92000U: &str = "9P2000.u";

/// The version string Rversion carries when the server does not
/// understand the client's proposed version
pub const VERSION_UNKNOWN: &str = "unknown";

/// Special tag which Tversion/Rversion must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which Tattach with no auth must use as `afid`
pub const NOFID: u32 = !0;

/// v9fs default port
pub const V9FS_PORT: u16 = 564;

/// Ample room for Tread/Twrite header: size[4] type[1] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 23;

/// Open mode to be checked against the permissions for the file.
pub mod om {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
}

/// Bits in Stat.mode / the `perm` argument of Tcreate.
pub mod dm {
    pub const DIR: u32 = 0x80000000;
    pub const APPEND: u32 = 0x40000000;
    pub const EXCL: u32 = 0x20000000;
    pub const READ: u32 = 0x4;
    pub const WRITE: u32 = 0x2;
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in QId.typ
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

/// Server-assigned identity of a filesystem object.
///
/// # Protocol
/// 9P2000.u
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    pub typ: QIdType,
    pub version: u32,
    pub path: u64,
}

impl QId {
    /// Root directory's identity path is reserved, per spec §3.
    pub const ROOT_PATH: u64 = 1;

    pub fn root() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 0,
            path: QId::ROOT_PATH,
        }
    }

    pub const fn wire_size() -> u32 {
        13
    }
}

/// A 9P2000.u stat record: the 9P2000 fixed fields plus the four Unix
/// extension fields (spec §4.1).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: QId,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub extension: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

impl Stat {
    /// Size of the record's wire encoding, not counting the leading u16
    /// size prefix that precedes an embedded stat (spec §4.1).
    pub fn size(&self) -> u16 {
        (2 + 4 + QId::wire_size() as usize + 4 + 4 + 4 + 8
            + 2 + self.name.len()
            + 2 + self.uid.len()
            + 2 + self.gid.len()
            + 2 + self.muid.len()
            + 2 + self.extension.len()
            + 4 + 4 + 4) as u16
    }
}

/// Data payload used in Rread/Twrite.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    /// Message type, 9P2000.u operations
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion    = 100,
        RVersion    = 101,
        TAuth       = 102,
        RAuth       = 103,
        TAttach     = 104,
        RAttach     = 105,
        RError      = 107,
        TFlush      = 108,
        RFlush      = 109,
        TWalk       = 110,
        RWalk       = 111,
        TOpen       = 112,
        ROpen       = 113,
        TCreate     = 114,
        RCreate     = 115,
        TRead       = 116,
        RRead       = 117,
        TWrite      = 118,
        RWrite      = 119,
        TClunk      = 120,
        RClunk      = 121,
        TRemove     = 122,
        RRemove     = 123,
        TStat       = 124,
        RStat       = 125,
        TWStat      = 126,
        RWStat      = 127,
    }
}

impl MsgType {
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    pub fn is_r(&self) -> bool {
        use MsgType::*;
        matches!(
            *self,
            RVersion | RAuth | RAttach | RError | RFlush | RWalk | ROpen | RCreate | RRead
                | RWrite | RClunk | RRemove | RStat | RWStat
        )
    }

    /// The reply type for a given request type, per spec §4.6 ("reply
    /// type MUST equal request type + 1").
    pub fn reply_type(self) -> MsgType {
        MsgType::from_u8(self as u8 + 1).expect("every T-message has a matching R-message")
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
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
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

/// A data type encapsulating the 9P2000.u messages this server understands.
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
    TFlush {
        oldtag: u16,
    },
    RFlush,
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
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
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
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

impl FCall {
    /// The fid this request is dispatched against, if any.
    pub fn fid(&self) -> Option<u32> {
        match *self {
            FCall::TAttach { fid, .. } => Some(fid),
            FCall::TWalk { fid, .. } => Some(fid),
            FCall::TOpen { fid, .. } => Some(fid),
            FCall::TCreate { fid, .. } => Some(fid),
            FCall::TRead { fid, .. } => Some(fid),
            FCall::TWrite { fid, .. } => Some(fid),
            FCall::TClunk { fid } => Some(fid),
            FCall::TRemove { fid } => Some(fid),
            FCall::TStat { fid } => Some(fid),
            FCall::TWStat { fid, .. } => Some(fid),
            _ => None,
        }
    }
}

/// Envelope for 9P messages: the tag a reply must echo, plus the body.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}
