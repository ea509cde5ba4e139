//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};
use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// Build the length-delimited codec matching the 9P framing:
/// `size[4]` little-endian, the size including its own 4 bytes.
///
/// Bounding frames at `MSIZE` keeps a malformed size field from
/// triggering a runaway read.
pub fn frame_codec() -> LengthDelimitedCodec {
    length_delimited::Builder::new()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(MSIZE as usize)
        .little_endian()
        .new_codec()
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
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

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
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
    /// Get inner reader
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
    /// Encode self to w and returns the number of bytes encoded
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

impl Encodable for Qid {
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
        use crate::Fcall::*;

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            Tversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Rversion {
                ref msize,
                ref version,
            } => buf << msize << version,
            Tauth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            Rauth { ref aqid } => buf << aqid,
            Tattach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            Rattach { ref qid } => buf << qid,
            Rerror { ref ename } => buf << ename,
            Tflush { ref oldtag } => buf << oldtag,
            Rflush => buf,
            Twalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            Rwalk { ref wqids } => buf << wqids,
            Topen { ref fid, ref mode } => buf << fid << mode,
            Ropen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tcreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            Rcreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            Tread {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            Rread { ref data } => buf << data,
            Twrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            Rwrite { ref count } => buf << count,
            Tclunk { ref fid } => buf << fid,
            Rclunk => buf,
            Tremove { ref fid } => buf << fid,
            Rremove => buf,
            Tstat { ref fid } => buf << fid,
            // stat[n]: the record is wrapped in one more 16-bit size,
            // exceeding the stat's own leading size by exactly 2
            Rstat { ref stat } => buf << &(stat.size() + 2) << stat,
            Twstat { ref fid, ref stat } => buf << fid << &(stat.size() + 2) << stat,
            Rwstat => buf,
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
            .map_err(|_| io_err!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
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
        let mut buf = Vec::new();
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

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(Tversion) => Fcall::Tversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Rversion) => Fcall::Rversion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(Tauth) => Fcall::Tauth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rauth) => Fcall::Rauth { aqid: decode!(buf) },
            Some(Tattach) => Fcall::Tattach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(Rattach) => Fcall::Rattach { qid: decode!(buf) },
            Some(Rerror) => Fcall::Rerror {
                ename: decode!(buf),
            },
            Some(Tflush) => Fcall::Tflush {
                oldtag: decode!(buf),
            },
            Some(Rflush) => Fcall::Rflush,
            Some(Twalk) => {
                let (fid, newfid) = (decode!(buf), decode!(buf));
                let wnames: Vec<String> = decode!(buf);
                if wnames.len() > MAXWELEM {
                    return res!(io_err!(InvalidData, "too many walk elements"));
                }
                Fcall::Twalk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            Some(Rwalk) => {
                let wqids: Vec<Qid> = decode!(buf);
                if wqids.len() > MAXWELEM {
                    return res!(io_err!(InvalidData, "too many walk qids"));
                }
                Fcall::Rwalk { wqids }
            }
            Some(Topen) => Fcall::Topen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(Ropen) => Fcall::Ropen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tcreate) => Fcall::Tcreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(Rcreate) => Fcall::Rcreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(Tread) => Fcall::Tread {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(Rread) => Fcall::Rread { data: decode!(buf) },
            Some(Twrite) => Fcall::Twrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(Rwrite) => Fcall::Rwrite {
                count: decode!(buf),
            },
            Some(Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
            Some(Rclunk) => Fcall::Rclunk,
            Some(Tremove) => Fcall::Tremove { fid: decode!(buf) },
            Some(Rremove) => Fcall::Rremove,
            Some(Tstat) => Fcall::Tstat { fid: decode!(buf) },
            Some(Rstat) => {
                let _wrap: u16 = decode!(buf);
                Fcall::Rstat {
                    stat: decode!(buf),
                }
            }
            Some(Twstat) => {
                let fid = decode!(buf);
                let _wrap: u16 = decode!(buf);
                Fcall::Twstat {
                    fid,
                    stat: decode!(buf),
                }
            }
            Some(Rwstat) => Fcall::Rwstat,
            None => return res!(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use std::io::Cursor;

    fn round_trip(msg: Msg) {
        let mut buf = Vec::new();
        let bytes = msg.encode(&mut buf).unwrap();
        assert_eq!(bytes, buf.len());

        let actual = read_msg(&mut Cursor::new(buf)).unwrap();
        assert_eq!(msg, actual);
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: Qid {
                typ: QidType::FILE,
                version: 0,
                path: 0x1234_5678_9abc_def0,
            },
            mode: 0o644,
            atime: 1_500_000_000,
            mtime: 1_500_000_001,
            length: 42,
            name: "hello.txt".to_owned(),
            uid: "inferno".to_owned(),
            gid: "inferno".to_owned(),
            muid: String::new(),
        }
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn msg_round_trips() {
        round_trip(Msg {
            tag: NOTAG,
            body: Fcall::Tversion {
                msize: MSIZE,
                version: P92000.to_owned(),
            },
        });
        round_trip(Msg {
            tag: 0,
            body: Fcall::Tattach {
                fid: 0,
                afid: NOFID,
                uname: "inferno".to_owned(),
                aname: String::new(),
            },
        });
        round_trip(Msg {
            tag: 1,
            body: Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["dir".to_owned(), "☺".to_owned()],
            },
        });
        round_trip(Msg {
            tag: 1,
            body: Fcall::Rwalk {
                wqids: vec![
                    Qid {
                        typ: QidType::DIR,
                        version: 0,
                        path: 7,
                    },
                    Qid {
                        typ: QidType::FILE,
                        version: 3,
                        path: 8,
                    },
                ],
            },
        });
        round_trip(Msg {
            tag: 2,
            body: Fcall::Topen { fid: 1, mode: 0 },
        });
        round_trip(Msg {
            tag: 2,
            body: Fcall::Tcreate {
                fid: 1,
                name: "x.txt".to_owned(),
                perm: 0o644,
                mode: 1,
            },
        });
        round_trip(Msg {
            tag: 3,
            body: Fcall::Rread {
                data: Data(b"Hello world!\n".to_vec()),
            },
        });
        round_trip(Msg {
            tag: 3,
            body: Fcall::Twrite {
                fid: 1,
                offset: 8,
                data: Data(vec![0xde, 0xad, 0xbe, 0xef]),
            },
        });
        round_trip(Msg {
            tag: 4,
            body: Fcall::Rerror {
                ename: "Not found.".to_owned(),
            },
        });
        round_trip(Msg {
            tag: 5,
            body: Fcall::Rstat {
                stat: sample_stat(),
            },
        });
        round_trip(Msg {
            tag: 5,
            body: Fcall::Twstat {
                fid: 1,
                stat: sample_stat(),
            },
        });
        round_trip(Msg {
            tag: 6,
            body: Fcall::Tflush { oldtag: 5 },
        });
        round_trip(Msg {
            tag: 7,
            body: Fcall::Rclunk,
        });
    }

    #[test]
    fn empty_walk_round_trips() {
        round_trip(Msg {
            tag: 1,
            body: Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: Vec::new(),
            },
        });
        round_trip(Msg {
            tag: 1,
            body: Fcall::Rwalk { wqids: Vec::new() },
        });
    }

    #[test]
    fn stat_sizes_differ_by_two() {
        let stat = sample_stat();
        let msg = Msg {
            tag: 0,
            body: Fcall::Rstat { stat: stat.clone() },
        };

        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        // type[1] tag[2] wrap[2] size[2] ...
        let wrap = u16::from_le_bytes([buf[3], buf[4]]);
        let inner = u16::from_le_bytes([buf[5], buf[6]]);
        assert_eq!(wrap, inner + 2);
        assert_eq!(inner, stat.size());
    }

    #[test]
    fn strings_are_utf8_not_nul_terminated() {
        let mut buf = Vec::new();
        "Forståelse".to_owned().encode(&mut buf).unwrap();

        let utf8 = "Forståelse".as_bytes();
        assert_eq!(&buf[..2], &(utf8.len() as u16).to_le_bytes());
        assert_eq!(&buf[2..], utf8);
    }

    #[test]
    fn walk_element_limit_is_enforced() {
        let msg = Msg {
            tag: 1,
            body: Fcall::Twalk {
                fid: 0,
                newfid: 1,
                wnames: (0..17).map(|i| i.to_string()).collect(),
            },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        assert!(read_msg(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        // Terror (106) is illegal and never valid on the wire
        let buf = vec![106u8, 0, 0];
        assert!(read_msg(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn framing_size_includes_itself() {
        let msg = Msg {
            tag: NOTAG,
            body: Fcall::Rversion {
                msize: MSIZE,
                version: P92000.to_owned(),
            },
        };
        let mut body = Vec::new();
        write_msg(&mut body, &msg).unwrap();

        let mut codec = frame_codec();
        let mut framed = BytesMut::new();
        tokio_util::codec::Encoder::encode(&mut codec, Bytes::from(body.clone()), &mut framed)
            .unwrap();

        assert_eq!(framed.len(), body.len() + 4);
        let size = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(size as usize, framed.len());
    }

    #[test]
    fn directory_read_is_a_stat_sequence() {
        // a directory read yields back-to-back stat records, each
        // carrying its own leading size
        let mut buf = Vec::new();
        let first = sample_stat();
        let second = Stat {
            name: "☺".to_owned(),
            ..sample_stat()
        };
        first.encode(&mut buf).unwrap();
        second.encode(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let a: Stat = Decodable::decode(&mut cursor).unwrap();
        let b: Stat = Decodable::decode(&mut cursor).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(<Stat as Decodable>::decode(&mut cursor).is_err());
    }
}
