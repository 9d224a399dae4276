//! Log entries and their binary encoding.
//!
//! # Format
//!
//! All integers are little-endian.
//!
//! ```text
//! Prefix (15 bytes):
//!   length: u16   (whole entry, prefix included)
//!   opcode: u8    ('c' 't' 'r' 'w' 'W' 'S')
//!   path:   u32   (target path id; the parent directory for Create)
//!   seq:    u64
//!
//! Payload by opcode:
//!   Create  new_path u32, perm u32, mtime u32, cvers u32, name s, uid s, gid s
//!   Trunc   mtime u32, cvers u32, muid s
//!   Remove  mtime u32, muid s
//!   Write   mtime u32, offset u32, count u32, vers u32, cvers u32,
//!           extent_offset u32, base u64, length u32, index u8, muid s
//!   Wstat   perm u32, mtime u32, atime u32, name s, uid s, gid s, muid s
//!   Sync    (none)
//!
//! String s: n u8 (bytes including a terminating NUL), then n bytes.
//! ```

use std::fmt;

use logfs_storage::Extent;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, WalError, WalResult};

/// Size of the fixed entry prefix.
pub const PREFIX_LEN: usize = 15;

/// Longest string payload a field can carry.
pub const MAX_STRING: usize = 254;

/// Set in a Write entry's index byte when the extent was allocated by that write.
pub const NEW_EXTENT: u8 = 0x80;

/// Wstat numeric field value meaning "not changed".
pub const UNCHANGED: u32 = u32::MAX;

const OP_CREATE: u8 = b'c';
const OP_TRUNC: u8 = b't';
const OP_REMOVE: u8 = b'r';
const OP_WRITE: u8 = b'w';
const OP_WSTAT: u8 = b'W';
const OP_SYNC: u8 = b'S';

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Globally increasing sequence number.
    pub seq: u64,
    /// Target path id (for Create, the parent directory).
    pub path: u32,
    /// Operation payload.
    pub op: LogOp,
}

/// Operation-specific fields of a [`LogEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// A file or directory was created.
    Create {
        /// Path id of the new entry.
        new_path: u32,
        /// Mode and permission bits.
        perm: u32,
        /// Modification time.
        mtime: u32,
        /// Content version.
        cvers: u32,
        /// Entry name.
        name: String,
        /// Owner id.
        uid: String,
        /// Group id.
        gid: String,
    },
    /// A file's contents were discarded.
    Trunc {
        /// Modification time.
        mtime: u32,
        /// Content version after truncation.
        cvers: u32,
        /// Modifier id.
        muid: String,
    },
    /// An entry was removed.
    Remove {
        /// Modification time of the parent.
        mtime: u32,
        /// Modifier id.
        muid: String,
    },
    /// Data was written inside one extent.
    Write {
        /// Modification time.
        mtime: u32,
        /// File offset of the first byte written.
        offset: u32,
        /// Bytes written.
        count: u32,
        /// Qid version after the write.
        vers: u32,
        /// Content version the write belongs to.
        cvers: u32,
        /// Offset of the first byte within the extent.
        extent_offset: u32,
        /// The extent written to.
        extent: Extent,
        /// Position of the extent in the file's extent list.
        index: u8,
        /// True if this write allocated the extent.
        new_extent: bool,
        /// Modifier id.
        muid: String,
    },
    /// Attributes changed. Numeric fields equal to [`UNCHANGED`] and empty
    /// strings were not changed.
    Wstat {
        /// Mode and permission bits.
        perm: u32,
        /// Modification time.
        mtime: u32,
        /// Access time.
        atime: u32,
        /// New name.
        name: String,
        /// New owner id.
        uid: String,
        /// New group id.
        gid: String,
        /// Modifier id.
        muid: String,
    },
    /// Marker with no effect on the namespace.
    Sync,
}

impl LogOp {
    /// Opcode byte used on disk.
    pub fn opcode(&self) -> u8 {
        match self {
            LogOp::Create { .. } => OP_CREATE,
            LogOp::Trunc { .. } => OP_TRUNC,
            LogOp::Remove { .. } => OP_REMOVE,
            LogOp::Write { .. } => OP_WRITE,
            LogOp::Wstat { .. } => OP_WSTAT,
            LogOp::Sync => OP_SYNC,
        }
    }

    /// Short operation name.
    pub fn name(&self) -> &'static str {
        match self {
            LogOp::Create { .. } => "create",
            LogOp::Trunc { .. } => "trunc",
            LogOp::Remove { .. } => "remove",
            LogOp::Write { .. } => "write",
            LogOp::Wstat { .. } => "wstat",
            LogOp::Sync => "sync",
        }
    }
}

fn string_len(s: &str) -> usize {
    1 + s.len() + 1
}

fn put_string(out: &mut Vec<u8>, s: &str) -> WalResult<()> {
    if s.len() > MAX_STRING {
        return Err(WalError::StringTooLong(s.len()));
    }
    out.push((s.len() + 1) as u8);
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let at = self.pos;
        let n = self.u8()? as usize;
        if n == 0 {
            return Err(DecodeError::BadString(at));
        }
        let bytes = self.take(n)?;
        if bytes[n - 1] != 0 {
            return Err(DecodeError::BadString(at));
        }
        String::from_utf8(bytes[..n - 1].to_vec()).map_err(|_| DecodeError::BadString(at))
    }
}

impl LogEntry {
    /// Creates an entry; the sequence number is assigned by the caller.
    pub fn new(seq: u64, path: u32, op: LogOp) -> Self {
        Self { seq, path, op }
    }

    /// Exact encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN
            + match &self.op {
                LogOp::Create {
                    name, uid, gid, ..
                } => 16 + string_len(name) + string_len(uid) + string_len(gid),
                LogOp::Trunc { muid, .. } => 8 + string_len(muid),
                LogOp::Remove { muid, .. } => 4 + string_len(muid),
                LogOp::Write { muid, .. } => 24 + 8 + 4 + 1 + string_len(muid),
                LogOp::Wstat {
                    name,
                    uid,
                    gid,
                    muid,
                    ..
                } => {
                    12 + string_len(name) + string_len(uid) + string_len(gid) + string_len(muid)
                }
                LogOp::Sync => 0,
            }
    }

    /// Append the encoding to `out`, returning the number of bytes written.
    /// On error `out` is left as it was.
    pub fn encode(&self, out: &mut Vec<u8>) -> WalResult<usize> {
        let start = out.len();
        let result = self.encode_fields(out);
        if result.is_err() {
            out.truncate(start);
            return result.map(|_| 0);
        }
        let len = out.len() - start;
        if len > u16::MAX as usize {
            out.truncate(start);
            return Err(WalError::EntryTooLarge(len));
        }
        out[start..start + 2].copy_from_slice(&(len as u16).to_le_bytes());
        Ok(len)
    }

    fn encode_fields(&self, out: &mut Vec<u8>) -> WalResult<()> {
        out.extend_from_slice(&[0, 0]);
        out.push(self.op.opcode());
        out.extend_from_slice(&self.path.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        let put = |v: u32, out: &mut Vec<u8>| out.extend_from_slice(&v.to_le_bytes());
        match &self.op {
            LogOp::Create {
                new_path,
                perm,
                mtime,
                cvers,
                name,
                uid,
                gid,
            } => {
                for v in [*new_path, *perm, *mtime, *cvers] {
                    put(v, out);
                }
                put_string(out, name)?;
                put_string(out, uid)?;
                put_string(out, gid)?;
            }
            LogOp::Trunc { mtime, cvers, muid } => {
                put(*mtime, out);
                put(*cvers, out);
                put_string(out, muid)?;
            }
            LogOp::Remove { mtime, muid } => {
                put(*mtime, out);
                put_string(out, muid)?;
            }
            LogOp::Write {
                mtime,
                offset,
                count,
                vers,
                cvers,
                extent_offset,
                extent,
                index,
                new_extent,
                muid,
            } => {
                for v in [*mtime, *offset, *count, *vers, *cvers, *extent_offset] {
                    put(v, out);
                }
                out.extend_from_slice(&extent.base.to_le_bytes());
                put(extent.length, out);
                out.push((index & !NEW_EXTENT) | if *new_extent { NEW_EXTENT } else { 0 });
                put_string(out, muid)?;
            }
            LogOp::Wstat {
                perm,
                mtime,
                atime,
                name,
                uid,
                gid,
                muid,
            } => {
                for v in [*perm, *mtime, *atime] {
                    put(v, out);
                }
                put_string(out, name)?;
                put_string(out, uid)?;
                put_string(out, gid)?;
                put_string(out, muid)?;
            }
            LogOp::Sync => {}
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> WalResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decode one entry from the start of `buf`, returning it with the number
    /// of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(LogEntry, usize), DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated {
                needed: 2,
                available: buf.len(),
            });
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared < PREFIX_LEN {
            return Err(DecodeError::LengthMismatch {
                declared,
                consumed: PREFIX_LEN,
            });
        }
        if declared > buf.len() {
            return Err(DecodeError::Truncated {
                needed: declared,
                available: buf.len(),
            });
        }

        let mut r = Reader {
            buf: &buf[..declared],
            pos: 2,
        };
        let opcode = r.u8()?;
        let path = r.u32()?;
        let seq = r.u64()?;
        let op = match opcode {
            OP_CREATE => LogOp::Create {
                new_path: r.u32()?,
                perm: r.u32()?,
                mtime: r.u32()?,
                cvers: r.u32()?,
                name: r.string()?,
                uid: r.string()?,
                gid: r.string()?,
            },
            OP_TRUNC => LogOp::Trunc {
                mtime: r.u32()?,
                cvers: r.u32()?,
                muid: r.string()?,
            },
            OP_REMOVE => LogOp::Remove {
                mtime: r.u32()?,
                muid: r.string()?,
            },
            OP_WRITE => {
                let mtime = r.u32()?;
                let offset = r.u32()?;
                let count = r.u32()?;
                let vers = r.u32()?;
                let cvers = r.u32()?;
                let extent_offset = r.u32()?;
                let base = r.u64()?;
                let length = r.u32()?;
                let index = r.u8()?;
                LogOp::Write {
                    mtime,
                    offset,
                    count,
                    vers,
                    cvers,
                    extent_offset,
                    extent: Extent::new(base, length),
                    index: index & !NEW_EXTENT,
                    new_extent: index & NEW_EXTENT != 0,
                    muid: r.string()?,
                }
            }
            OP_WSTAT => LogOp::Wstat {
                perm: r.u32()?,
                mtime: r.u32()?,
                atime: r.u32()?,
                name: r.string()?,
                uid: r.string()?,
                gid: r.string()?,
                muid: r.string()?,
            },
            OP_SYNC => LogOp::Sync,
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        if r.pos != declared {
            return Err(DecodeError::LengthMismatch {
                declared,
                consumed: r.pos,
            });
        }
        Ok((LogEntry { seq, path, op }, declared))
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} path {}", self.seq, self.op.name(), self.path)?;
        match &self.op {
            LogOp::Create {
                new_path,
                perm,
                mtime,
                cvers,
                name,
                uid,
                gid,
            } => write!(
                f,
                " new {} {:?} perm {:#o} uid {} gid {} mtime {} cvers {}",
                new_path, name, perm, uid, gid, mtime, cvers
            ),
            LogOp::Trunc { mtime, cvers, muid } => {
                write!(f, " mtime {} cvers {} muid {}", mtime, cvers, muid)
            }
            LogOp::Remove { mtime, muid } => write!(f, " mtime {} muid {}", mtime, muid),
            LogOp::Write {
                offset,
                count,
                vers,
                cvers,
                extent_offset,
                extent,
                index,
                new_extent,
                ..
            } => write!(
                f,
                " off {} count {} vers {} cvers {} ext[{}{}] {} eoff {}",
                offset,
                count,
                vers,
                cvers,
                index,
                if *new_extent { "+" } else { "" },
                extent,
                extent_offset
            ),
            LogOp::Wstat {
                perm,
                mtime,
                atime,
                name,
                uid,
                gid,
                muid,
            } => write!(
                f,
                " perm {:#x} mtime {} atime {} name {:?} uid {:?} gid {:?} muid {}",
                perm, mtime, atime, name, uid, gid, muid
            ),
            LogOp::Sync => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_entry() -> LogEntry {
        LogEntry::new(
            9,
            4,
            LogOp::Write {
                mtime: 1_700_000_000,
                offset: 12,
                count: 8,
                vers: 2,
                cvers: 0,
                extent_offset: 12,
                extent: Extent::new(0x1_0000_0400, 1024),
                index: 0,
                new_extent: false,
                muid: "glenda".to_string(),
            },
        )
    }

    #[test]
    fn test_prefix_layout() {
        let bytes = LogEntry::new(0x0102030405060708, 7, LogOp::Sync)
            .to_bytes()
            .unwrap();
        assert_eq!(bytes.len(), PREFIX_LEN);
        assert_eq!(&bytes[0..2], &[15, 0]);
        assert_eq!(bytes[2], b'S');
        assert_eq!(&bytes[3..7], &[7, 0, 0, 0]);
        assert_eq!(&bytes[7..15], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_write_keeps_full_extent_base() {
        let entry = write_entry();
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(bytes.len(), entry.encoded_len());
        let (decoded, n) = LogEntry::decode(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_new_extent_flag() {
        let mut entry = write_entry();
        if let LogOp::Write {
            index, new_extent, ..
        } = &mut entry.op
        {
            *index = 5;
            *new_extent = true;
        }
        let bytes = entry.to_bytes().unwrap();
        // index byte sits just before the muid string
        let muid_len = string_len("glenda");
        assert_eq!(bytes[bytes.len() - muid_len - 1], 5 | NEW_EXTENT);
        assert_eq!(LogEntry::decode(&bytes).unwrap().0, entry);
    }

    #[test]
    fn test_string_encoding() {
        let entry = LogEntry::new(
            1,
            0,
            LogOp::Remove {
                mtime: 0,
                muid: "ab".to_string(),
            },
        );
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(&bytes[PREFIX_LEN + 4..], &[3, b'a', b'b', 0]);
    }

    #[test]
    fn test_string_too_long() {
        let entry = LogEntry::new(
            1,
            0,
            LogOp::Remove {
                mtime: 0,
                muid: "x".repeat(MAX_STRING + 1),
            },
        );
        let mut out = vec![0xEE];
        let err = entry.encode(&mut out).unwrap_err();
        assert!(matches!(err, WalError::StringTooLong(255)));
        assert_eq!(out, vec![0xEE]);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = write_entry().to_bytes().unwrap();
        for cut in 0..bytes.len() {
            let err = LogEntry::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, DecodeError::Truncated { .. }), "cut {}", cut);
        }
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let mut bytes = LogEntry::new(1, 0, LogOp::Sync).to_bytes().unwrap();
        bytes[2] = b'z';
        assert_eq!(
            LogEntry::decode(&bytes).unwrap_err(),
            DecodeError::UnknownOpcode(b'z')
        );
    }

    #[test]
    fn test_decode_unterminated_string() {
        let mut bytes = LogEntry::new(
            1,
            0,
            LogOp::Remove {
                mtime: 0,
                muid: "ab".to_string(),
            },
        )
        .to_bytes()
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'c';
        assert_eq!(
            LogEntry::decode(&bytes).unwrap_err(),
            DecodeError::BadString(PREFIX_LEN + 4)
        );
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut bytes = LogEntry::new(1, 0, LogOp::Sync).to_bytes().unwrap();
        bytes.push(0);
        bytes[0] = 16;
        assert!(matches!(
            LogEntry::decode(&bytes).unwrap_err(),
            DecodeError::LengthMismatch {
                declared: 16,
                consumed: 15
            }
        ));
    }

    #[test]
    fn test_display() {
        let text = format!("{}", write_entry());
        assert!(text.starts_with("9 write path 4"));
        assert!(text.contains("count 8"));
    }
}
