//! Serialize/deserialize 9P2000.u messages into/from binary.
//!
//! Encoding and decoding never panic on malformed input: every primitive
//! decode goes through `Result`, and the `Shl`/`Shr` operator chains below
//! latch the first error and make every following step in the chain a
//! no-op that preserves it (spec §4.1's "cursor with an error flag",
//! expressed here as a short-circuiting `Result` chain instead of a
//! mutable flag).

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads for
/// serializing. `<<` serializes the right-hand side into the encoder.
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads for
/// deserializing.
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
            << &self.extension
            << &self.n_uid
            << &self.n_gid
            << &self.n_muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << stat,
            TWStat { ref fid, ref stat } => buf << fid << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: QIdType::from_bits_truncate(Decodable::decode(r)?),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
            extension: Decodable::decode(r)?,
            n_uid: Decodable::decode(r)?,
            n_gid: Decodable::decode(r)?,
            n_muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(Decodable::decode(&mut buf)?);
        let tag: u16 = Decodable::decode(&mut buf)?;
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: Decodable::decode(&mut buf)?,
                version: Decodable::decode(&mut buf)?,
            },
            Some(RVersion) => FCall::RVersion {
                msize: Decodable::decode(&mut buf)?,
                version: Decodable::decode(&mut buf)?,
            },
            Some(TAuth) => FCall::TAuth {
                afid: Decodable::decode(&mut buf)?,
                uname: Decodable::decode(&mut buf)?,
                aname: Decodable::decode(&mut buf)?,
            },
            Some(RAuth) => FCall::RAuth {
                aqid: Decodable::decode(&mut buf)?,
            },
            Some(TAttach) => FCall::TAttach {
                fid: Decodable::decode(&mut buf)?,
                afid: Decodable::decode(&mut buf)?,
                uname: Decodable::decode(&mut buf)?,
                aname: Decodable::decode(&mut buf)?,
            },
            Some(RAttach) => FCall::RAttach {
                qid: Decodable::decode(&mut buf)?,
            },
            Some(RError) => FCall::RError {
                ename: Decodable::decode(&mut buf)?,
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: Decodable::decode(&mut buf)?,
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => FCall::TWalk {
                fid: Decodable::decode(&mut buf)?,
                newfid: Decodable::decode(&mut buf)?,
                wnames: Decodable::decode(&mut buf)?,
            },
            Some(RWalk) => FCall::RWalk {
                wqids: Decodable::decode(&mut buf)?,
            },
            Some(TOpen) => FCall::TOpen {
                fid: Decodable::decode(&mut buf)?,
                mode: Decodable::decode(&mut buf)?,
            },
            Some(ROpen) => FCall::ROpen {
                qid: Decodable::decode(&mut buf)?,
                iounit: Decodable::decode(&mut buf)?,
            },
            Some(TCreate) => FCall::TCreate {
                fid: Decodable::decode(&mut buf)?,
                name: Decodable::decode(&mut buf)?,
                perm: Decodable::decode(&mut buf)?,
                mode: Decodable::decode(&mut buf)?,
            },
            Some(RCreate) => FCall::RCreate {
                qid: Decodable::decode(&mut buf)?,
                iounit: Decodable::decode(&mut buf)?,
            },
            Some(TRead) => FCall::TRead {
                fid: Decodable::decode(&mut buf)?,
                offset: Decodable::decode(&mut buf)?,
                count: Decodable::decode(&mut buf)?,
            },
            Some(RRead) => FCall::RRead {
                data: Decodable::decode(&mut buf)?,
            },
            Some(TWrite) => FCall::TWrite {
                fid: Decodable::decode(&mut buf)?,
                offset: Decodable::decode(&mut buf)?,
                data: Decodable::decode(&mut buf)?,
            },
            Some(RWrite) => FCall::RWrite {
                count: Decodable::decode(&mut buf)?,
            },
            Some(TClunk) => FCall::TClunk {
                fid: Decodable::decode(&mut buf)?,
            },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove {
                fid: Decodable::decode(&mut buf)?,
            },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat {
                fid: Decodable::decode(&mut buf)?,
            },
            Some(RStat) => FCall::RStat {
                stat: Decodable::decode(&mut buf)?,
            },
            Some(TWStat) => FCall::TWStat {
                fid: Decodable::decode(&mut buf)?,
                stat: Decodable::decode(&mut buf)?,
            },
            Some(RWStat) => FCall::RWStat,
            None => return res!(io_err!(Other, "invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Read a 9P message body (tag + type + fields) from a byte-oriented
/// stream. The caller has already stripped the 4-byte size prefix.
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Write a 9P message body (tag + type + fields) into a byte-oriented
/// stream. The caller is responsible for the 4-byte size prefix.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encoder_roundtrips_bytes() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn msg_roundtrip_rversion() {
        let expected = Msg {
            tag: 0xdead,
            body: FCall::RVersion {
                msize: 8192,
                version: P92000U.to_owned(),
            },
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();

        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_roundtrip_rwalk() {
        let expected = Msg {
            tag: 7,
            body: FCall::RWalk {
                wqids: vec![
                    QId {
                        typ: QIdType::DIR,
                        version: 0,
                        path: 2,
                    },
                    QId {
                        typ: QIdType::FILE,
                        version: 0,
                        path: 3,
                    },
                ],
            },
        };
        let mut buf = Vec::new();
        expected.encode(&mut buf).unwrap();
        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn stat_roundtrip_matches_declared_size() {
        let stat = Stat {
            typ: 0,
            dev: 0,
            qid: QId {
                typ: QIdType::FILE,
                version: 0,
                path: 42,
            },
            mode: 0o100644,
            atime: 1000,
            mtime: 1000,
            length: 5,
            name: "hello.txt".to_owned(),
            uid: "picocalc".to_owned(),
            gid: "picocalc".to_owned(),
            muid: "picocalc".to_owned(),
            extension: String::new(),
            n_uid: 1000,
            n_gid: 1000,
            n_muid: 1000,
        };

        let mut buf = Vec::new();
        let bytes = stat.encode(&mut buf).unwrap();
        // size() excludes the leading u16 size field itself.
        assert_eq!(bytes, stat.size() as usize + 2);

        let mut readbuf = Cursor::new(buf);
        let decoded: Stat = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn truncated_string_is_a_framing_error() {
        // length prefix claims 10 bytes but only 2 are present.
        let buf: Vec<u8> = vec![10, 0, b'h', b'i'];
        let mut readbuf = Cursor::new(buf);
        let result: Result<String> = Decodable::decode(&mut readbuf);
        assert!(result.is_err());
    }
}
