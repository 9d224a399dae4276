//! Log block headers.
//!
//! Every log block carries the same 16-byte header at its start and at its
//! end. A block whose two copies disagree was torn mid-write and counts as
//! empty.
//!
//! ```text
//! tag:  u8    0x00 never written, 0xAC unused, 0xDC boot, 0x18|set log
//! seq:  u64   position of the block within its segment
//! used: u24   bytes in use, header included
//! csum: u32   CRC-32 of bytes [HEADER_LEN, used)
//! ```

/// Size of one header copy.
pub const HEADER_LEN: usize = 16;

/// Tag of a block that has never been written.
pub const TAG_EMPTY: u8 = 0x00;
/// Tag of a block that is free for use.
pub const TAG_NONE: u8 = 0xAC;
/// Tag of a boot block; never touched by the log.
pub const TAG_BOOT: u8 = 0xDC;
/// Base tag of a log block; the low two bits select the sweep set.
pub const TAG_LOG: u8 = 0x18;

/// Tag of a block in sweep set `set`.
pub fn log_tag(set: u8) -> u8 {
    TAG_LOG | (set & 3)
}

/// Sweep set of a log tag, or None for any other tag.
pub fn tag_set(tag: u8) -> Option<u8> {
    if tag & !3 == TAG_LOG {
        Some(tag & 3)
    } else {
        None
    }
}

/// The tag that follows `tag` in the rotation.
pub fn successor(tag: u8) -> u8 {
    log_tag((tag & 3) + 1)
}

/// CRC-32 of a block's payload.
pub fn payload_checksum(block: &[u8], used: usize) -> u32 {
    crc32fast::hash(&block[HEADER_LEN..used])
}

/// One copy of a block header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block tag.
    pub tag: u8,
    /// Sequence number within the segment.
    pub seq: u64,
    /// Bytes in use, header included.
    pub used: u32,
    /// Payload checksum.
    pub csum: u32,
}

impl BlockHeader {
    /// Header written to blocks returned to the free pool.
    pub fn unused() -> Self {
        Self {
            tag: TAG_NONE,
            seq: u64::MAX,
            used: HEADER_LEN as u32,
            csum: 0,
        }
    }

    /// Serialize into the first [`HEADER_LEN`] bytes of `out`.
    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.tag;
        out[1..9].copy_from_slice(&self.seq.to_le_bytes());
        out[9..12].copy_from_slice(&self.used.to_le_bytes()[..3]);
        out[12..16].copy_from_slice(&self.csum.to_le_bytes());
    }

    /// Parse from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn read_from(buf: &[u8]) -> Self {
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&buf[1..9]);
        Self {
            tag: buf[0],
            seq: u64::from_le_bytes(seq),
            used: u32::from_le_bytes([buf[9], buf[10], buf[11], 0]),
            csum: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    /// Read both copies from a whole block. Returns None when they differ.
    pub fn read_block(block: &[u8]) -> Option<Self> {
        let front = Self::read_from(&block[..HEADER_LEN]);
        let back = Self::read_from(&block[block.len() - HEADER_LEN..]);
        (front == back).then_some(front)
    }

    /// Write both copies into a whole block.
    pub fn seal(&self, block: &mut [u8]) {
        let n = block.len();
        self.write_to(&mut block[..HEADER_LEN]);
        self.write_to(&mut block[n - HEADER_LEN..]);
    }
}
