//! Core types: path ids, qids, mode and open-mode bits, stat records.

use serde::{Deserialize, Serialize};

/// Unique, never-reused identifier of a namespace entry.
pub type PathId = u32;

/// Client handle number.
pub type FidId = u32;

/// Directory.
pub const DMDIR: u32 = 0x8000_0000;
/// Append only: writes always go to end of file.
pub const DMAPPEND: u32 = 0x4000_0000;
/// Exclusive use: opening takes the exclusive lock.
pub const DMEXCL: u32 = 0x2000_0000;
/// Temporary.
pub const DMTMP: u32 = 0x0400_0000;
/// Every mode bit an entry may carry.
pub const DM_VALID: u32 = DMDIR | DMAPPEND | DMEXCL | DMTMP | 0o777;

/// Qid type bit for directories.
pub const QTDIR: u8 = 0x80;
/// Qid type bit for append-only files.
pub const QTAPPEND: u8 = 0x40;
/// Qid type bit for exclusive-use files.
pub const QTEXCL: u8 = 0x20;
/// Qid type of a plain file.
pub const QTFILE: u8 = 0x00;

/// Open for reading.
pub const OREAD: u8 = 0;
/// Open for writing.
pub const OWRITE: u8 = 1;
/// Open for reading and writing.
pub const ORDWR: u8 = 2;
/// Open for execution.
pub const OEXEC: u8 = 3;
/// Truncate on open.
pub const OTRUNC: u8 = 0x10;
/// Remove when the fid is clunked.
pub const ORCLOSE: u8 = 0x40;

/// Qid type bits of a mode.
pub fn qid_type(mode: u32) -> u8 {
    (mode >> 24) as u8
}

/// Identity of a namespace entry as seen by clients.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qid {
    /// Path id.
    pub path: PathId,
    /// Version, bumped on every change.
    pub vers: u32,
    /// Type bits.
    pub qtype: u8,
}

impl Qid {
    /// Encoded size.
    pub const LEN: usize = 13;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.qtype);
        out.extend_from_slice(&self.vers.to_le_bytes());
        out.extend_from_slice(&(self.path as u64).to_le_bytes());
    }
}

/// Attributes of an entry, as returned by stat and directory reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Entry identity.
    pub qid: Qid,
    /// Mode and permission bits.
    pub mode: u32,
    /// Last access time.
    pub atime: u32,
    /// Last modification time.
    pub mtime: u32,
    /// Length in bytes (zero for directories).
    pub length: u64,
    /// Entry name.
    pub name: String,
    /// Owner name.
    pub uid: String,
    /// Group name.
    pub gid: String,
    /// Name of the last modifier.
    pub muid: String,
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let mut v = [0u8; 8];
        v.copy_from_slice(self.take(8)?);
        Some(u64::from_le_bytes(v))
    }

    fn string(&mut self) -> Option<String> {
        let n = self.u16()? as usize;
        String::from_utf8(self.take(n)?.to_vec()).ok()
    }
}

impl Stat {
    /// Size of the packed record, including its own length prefix.
    pub fn encoded_len(&self) -> usize {
        2 + 2 + 4 + Qid::LEN + 4 + 4 + 4 + 8
            + [&self.name, &self.uid, &self.gid, &self.muid]
                .iter()
                .map(|s| 2 + s.len())
                .sum::<usize>()
    }

    /// Pack in the 9P stat layout.
    pub fn encode(&self) -> Vec<u8> {
        let n = self.encoded_len();
        let mut out = Vec::with_capacity(n);
        out.extend_from_slice(&((n - 2) as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        self.qid.encode(&mut out);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.atime.to_le_bytes());
        out.extend_from_slice(&self.mtime.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        put_str(&mut out, &self.name);
        put_str(&mut out, &self.uid);
        put_str(&mut out, &self.gid);
        put_str(&mut out, &self.muid);
        out
    }

    /// Unpack one record from the start of `buf`, returning it with its size.
    pub fn decode(buf: &[u8]) -> Option<(Stat, usize)> {
        let mut c = Cursor { buf, pos: 0 };
        let size = c.u16()? as usize + 2;
        c.u16()?;
        c.u32()?;
        let qtype = c.take(1)?[0];
        let vers = c.u32()?;
        let path = c.u64()?;
        let stat = Stat {
            qid: Qid {
                path: u32::try_from(path).ok()?,
                vers,
                qtype,
            },
            mode: c.u32()?,
            atime: c.u32()?,
            mtime: c.u32()?,
            length: c.u64()?,
            name: c.string()?,
            uid: c.string()?,
            gid: c.string()?,
            muid: c.string()?,
        };
        (c.pos == size).then_some((stat, size))
    }
}

/// Attribute changes requested by wstat. `None` leaves a field unchanged, as
/// does an empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WstatRequest {
    /// New name.
    pub name: Option<String>,
    /// New owner, by name.
    pub uid: Option<String>,
    /// New group, by name.
    pub gid: Option<String>,
    /// New mode bits.
    pub mode: Option<u32>,
    /// New modification time.
    pub mtime: Option<u32>,
    /// New length; only zero is accepted.
    pub length: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Stat {
        Stat {
            qid: Qid {
                path: 42,
                vers: 3 | 1 << 16,
                qtype: QTFILE,
            },
            mode: 0o644,
            atime: 10,
            mtime: 20,
            length: 1234,
            name: "f1".into(),
            uid: "glenda".into(),
            gid: "sys".into(),
            muid: "glenda".into(),
        }
    }

    #[test]
    fn test_stat_layout() {
        let st = sample();
        let bytes = st.encode();
        assert_eq!(bytes.len(), st.encoded_len());
        assert_eq!(
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize,
            bytes.len() - 2
        );
        // qid type follows size, type and dev
        assert_eq!(bytes[8], QTFILE);
        assert_eq!(&bytes[13..21], &42u64.to_le_bytes());
        let (decoded, n) = Stat::decode(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, st);
    }

    #[test]
    fn test_stat_decode_short_buffer() {
        let bytes = sample().encode();
        assert!(Stat::decode(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_qid_type() {
        assert_eq!(qid_type(DMDIR | 0o755), QTDIR);
        assert_eq!(qid_type(DMAPPEND | DMEXCL), QTAPPEND | QTEXCL);
        assert_eq!(qid_type(0o644), QTFILE);
    }
}
