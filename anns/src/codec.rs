//! Append codec: length-prefixed, CRC-checked blocks with a format gate.
//!
//! Every persisted structure (manifest, segment meta, delete map header,
//! LSN records, serialized column indexes) is framed as one of these
//! blocks, so readers can validate provenance and integrity uniformly.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub const BLOCK_MAGIC: u32 = 0x414E_4E53; // "ANNS"
pub const FORMAT_MAJOR: u16 = 1;
pub const FORMAT_MINOR: u16 = 0;

/// magic + major + minor + kind + reserved + payload len + payload crc.
pub const BLOCK_HEADER_LEN: usize = 4 + 2 + 2 + 1 + 3 + 4 + 4;

/// Payloads above this are assumed to be corruption, not data.
const MAX_PAYLOAD_LEN: u32 = 1 << 30;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BlockKind {
    Manifest = 1,
    SegmentMeta = 2,
    DeleteMap = 3,
    LsnRecord = 4,
    LsnCheckpoint = 5,
    VectorIndex = 6,
}

impl BlockKind {
    fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => BlockKind::Manifest,
            2 => BlockKind::SegmentMeta,
            3 => BlockKind::DeleteMap,
            4 => BlockKind::LsnRecord,
            5 => BlockKind::LsnCheckpoint,
            6 => BlockKind::VectorIndex,
            other => return Err(Error::Integrity(format!("unknown block kind {other}"))),
        })
    }
}

/// Write one block; returns the number of bytes written.
pub fn write_block<W: Write>(writer: &mut W, kind: BlockKind, payload: &[u8]) -> Result<usize> {
    debug_assert!(payload.len() as u64 <= MAX_PAYLOAD_LEN as u64);
    writer.write_u32::<LittleEndian>(BLOCK_MAGIC)?;
    writer.write_u16::<LittleEndian>(FORMAT_MAJOR)?;
    writer.write_u16::<LittleEndian>(FORMAT_MINOR)?;
    writer.write_u8(kind as u8)?;
    writer.write_all(&[0u8; 3])?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
    writer.write_all(payload)?;
    Ok(BLOCK_HEADER_LEN + payload.len())
}

/// Read one block from a stream.
pub fn read_block<R: Read>(reader: &mut R) -> Result<(BlockKind, Vec<u8>)> {
    let mut header = [0u8; BLOCK_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let (kind, payload_len, crc) = parse_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;
    check_crc(&payload, crc)?;
    Ok((kind, payload))
}

/// Decode the block starting at `offset` in `buf`.
///
/// `Ok(None)` means a clean end of input; a torn or corrupt block is an
/// error the caller may treat as a truncated tail.
pub fn block_at(buf: &[u8], offset: usize) -> Result<Option<(BlockKind, &[u8], usize)>> {
    if offset == buf.len() {
        return Ok(None);
    }
    if offset + BLOCK_HEADER_LEN > buf.len() {
        return Err(Error::Integrity("torn block header".to_string()));
    }
    let header = &buf[offset..offset + BLOCK_HEADER_LEN];
    let (kind, payload_len, crc) = parse_header(header)?;
    let start = offset + BLOCK_HEADER_LEN;
    let end = start
        .checked_add(payload_len)
        .ok_or_else(|| Error::Integrity("block length overflow".to_string()))?;
    if end > buf.len() {
        return Err(Error::Integrity("torn block payload".to_string()));
    }
    let payload = &buf[start..end];
    check_crc(payload, crc)?;
    Ok(Some((kind, payload, end)))
}

pub fn write_bincode_block<W: Write, T: Serialize>(
    writer: &mut W,
    kind: BlockKind,
    value: &T,
) -> Result<usize> {
    let payload = bincode::serialize(value)?;
    write_block(writer, kind, &payload)
}

/// Decode a single-block buffer into `T`, checking the expected kind.
pub fn read_bincode_block<T: DeserializeOwned>(buf: &[u8], expected: BlockKind) -> Result<T> {
    let (kind, payload, _) = block_at(buf, 0)?
        .ok_or_else(|| Error::Integrity("empty block buffer".to_string()))?;
    if kind != expected {
        return Err(Error::Integrity(format!(
            "expected {expected:?} block, found {kind:?}"
        )));
    }
    Ok(bincode::deserialize(payload)?)
}

fn parse_header(header: &[u8]) -> Result<(BlockKind, usize, u32)> {
    let magic = LittleEndian::read_u32(&header[0..4]);
    if magic != BLOCK_MAGIC {
        return Err(Error::Integrity(format!("bad block magic {magic:#x}")));
    }
    let major = LittleEndian::read_u16(&header[4..6]);
    if major != FORMAT_MAJOR {
        return Err(Error::IncompatibleFormat {
            found: major,
            supported: FORMAT_MAJOR,
        });
    }
    // Minor versions only add fields; unknown minors are readable.
    let kind = BlockKind::from_u8(header[8])?;
    let payload_len = LittleEndian::read_u32(&header[12..16]);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Integrity(format!(
            "implausible payload length {payload_len}"
        )));
    }
    let crc = LittleEndian::read_u32(&header[16..20]);
    Ok((kind, payload_len as usize, crc))
}

fn check_crc(payload: &[u8], expected: u32) -> Result<()> {
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(Error::Integrity(format!(
            "payload crc mismatch: stored {expected:#x}, computed {actual:#x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn stream_round_trip() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::Manifest, b"hello").unwrap();
        write_block(&mut buf, BlockKind::LsnRecord, b"").unwrap();

        let mut cursor = Cursor::new(&buf);
        let (kind, payload) = read_block(&mut cursor).unwrap();
        assert_eq!(kind, BlockKind::Manifest);
        assert_eq!(payload, b"hello");
        let (kind, payload) = read_block(&mut cursor).unwrap();
        assert_eq!(kind, BlockKind::LsnRecord);
        assert!(payload.is_empty());
    }

    #[test]
    fn slice_walk_and_clean_eof() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::LsnRecord, b"a").unwrap();
        write_block(&mut buf, BlockKind::LsnCheckpoint, b"bb").unwrap();

        let (kind, payload, next) = block_at(&buf, 0).unwrap().unwrap();
        assert_eq!((kind, payload), (BlockKind::LsnRecord, &b"a"[..]));
        let (kind, payload, next) = block_at(&buf, next).unwrap().unwrap();
        assert_eq!((kind, payload), (BlockKind::LsnCheckpoint, &b"bb"[..]));
        assert!(block_at(&buf, next).unwrap().is_none());
    }

    #[test]
    fn corrupt_payload_fails_crc() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::SegmentMeta, b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(block_at(&buf, 0), Err(Error::Integrity(_))));
    }

    #[test]
    fn torn_tail_is_detected() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::LsnRecord, b"full record").unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(block_at(&buf, 0), Err(Error::Integrity(_))));
    }

    #[test]
    fn future_major_version_is_refused() {
        let mut buf = Vec::new();
        write_block(&mut buf, BlockKind::Manifest, b"x").unwrap();
        LittleEndian::write_u16(&mut buf[4..6], FORMAT_MAJOR + 1);
        assert!(matches!(
            block_at(&buf, 0),
            Err(Error::IncompatibleFormat { .. })
        ));
    }

    #[test]
    fn bincode_block_round_trip() {
        let mut buf = Vec::new();
        write_bincode_block(&mut buf, BlockKind::SegmentMeta, &(42u64, "seg".to_string()))
            .unwrap();
        let value: (u64, String) = read_bincode_block(&buf, BlockKind::SegmentMeta).unwrap();
        assert_eq!(value, (42, "seg".to_string()));
    }
}
