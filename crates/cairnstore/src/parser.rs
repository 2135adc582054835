//! Block file header and slot parsing using nom
//!
//! File format:
//! ```text
//! CAIRNBK1
//! [version: u32]
//! [row_count: u32]
//! [slot_size: u32]
//! ...row_count slots of slot_size bytes...
//! ```
//!
//! Slot format:
//! ```text
//! [len: u32][len bytes of UTF-8 content][zero padding]
//! ```

use nom::{
    bytes::complete::tag,
    multi::length_data,
    number::complete::le_u32,
    sequence::tuple,
    IResult,
};

use crate::error::{Error, Result};

/// Magic header for block files
pub const BLOCK_MAGIC: &[u8] = b"CAIRNBK1";

/// Current block file format version
pub const BLOCK_VERSION: u32 = 1;

/// Size of the encoded header in bytes
pub const HEADER_LEN: usize = BLOCK_MAGIC.len() + 12;

/// Size of the length prefix at the start of each slot
pub const SLOT_PREFIX_LEN: usize = 4;

/// Block file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// File format version
    pub version: u32,
    /// Number of addressable rows
    pub row_count: u32,
    /// Bytes reserved per row, including the length prefix
    pub slot_size: u32,
}

impl BlockHeader {
    /// Total file length implied by this header
    pub fn file_len(&self) -> u64 {
        HEADER_LEN as u64 + self.row_count as u64 * self.slot_size as u64
    }

    /// Byte offset of a row's slot
    pub fn slot_offset(&self, row: u32) -> usize {
        HEADER_LEN + row as usize * self.slot_size as usize
    }
}

fn header(input: &[u8]) -> IResult<&[u8], BlockHeader> {
    let (rest, (_, version, row_count, slot_size)) =
        tuple((tag(BLOCK_MAGIC), le_u32, le_u32, le_u32))(input)?;
    Ok((
        rest,
        BlockHeader {
            version,
            row_count,
            slot_size,
        },
    ))
}

/// Parse a block file header
pub fn parse_header(input: &[u8]) -> Result<BlockHeader> {
    if input.len() < HEADER_LEN {
        return Err(Error::Parse("Input too short for header".to_string()));
    }

    let (_, parsed) = header(input)?;
    if parsed.version != BLOCK_VERSION {
        return Err(Error::Parse(format!(
            "Unsupported block file version {}",
            parsed.version
        )));
    }
    if (parsed.slot_size as usize) < SLOT_PREFIX_LEN {
        return Err(Error::Parse(format!(
            "Slot size {} smaller than prefix",
            parsed.slot_size
        )));
    }

    Ok(parsed)
}

/// Create a block file header
pub fn create_header(header: &BlockHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(BLOCK_MAGIC);
    buf.extend_from_slice(&header.version.to_le_bytes());
    buf.extend_from_slice(&header.row_count.to_le_bytes());
    buf.extend_from_slice(&header.slot_size.to_le_bytes());
    buf
}

/// Extract the content of one slot (without padding)
pub fn parse_slot(slot: &[u8]) -> Result<&[u8]> {
    let (_, content) = length_data(le_u32)(slot)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHeader {
        BlockHeader {
            version: BLOCK_VERSION,
            row_count: 16,
            slot_size: 64,
        }
    }

    #[test]
    fn test_parse_header() {
        let encoded = create_header(&sample());
        let parsed = parse_header(&encoded).unwrap();

        assert_eq!(parsed, sample());
        assert_eq!(encoded.len(), HEADER_LEN);
    }

    #[test]
    fn test_parse_header_invalid_magic() {
        let mut encoded = create_header(&sample());
        encoded[0] = b'X';

        assert!(parse_header(&encoded).is_err());
    }

    #[test]
    fn test_parse_header_too_short() {
        assert!(parse_header(BLOCK_MAGIC).is_err());
    }

    #[test]
    fn test_parse_header_wrong_version() {
        let mut header = sample();
        header.version = 7;
        let result = parse_header(&create_header(&header));
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_parse_slot() {
        let mut slot = vec![0u8; 32];
        slot[..4].copy_from_slice(&5u32.to_le_bytes());
        slot[4..9].copy_from_slice(b"hello");

        assert_eq!(parse_slot(&slot).unwrap(), b"hello");
    }

    #[test]
    fn test_parse_slot_truncated() {
        let mut slot = vec![0u8; 8];
        slot[..4].copy_from_slice(&100u32.to_le_bytes());

        assert!(parse_slot(&slot).is_err());
    }

    #[test]
    fn test_offsets() {
        let header = sample();
        assert_eq!(header.slot_offset(0), HEADER_LEN);
        assert_eq!(header.slot_offset(2), HEADER_LEN + 128);
        assert_eq!(header.file_len(), (HEADER_LEN + 16 * 64) as u64);
    }
}
