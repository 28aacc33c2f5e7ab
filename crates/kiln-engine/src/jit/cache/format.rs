//! Persisted cache record format
//!
//! A cache file holds a sequence of records. All integers are little-endian.
//!
//! ```text
//! header   (36 bytes)
//!   timestamp     i64   source modification time, ns since the epoch
//!   hash          u64   digest of the instruction bytes
//!   unit_size     u32   instruction bytes length
//!   code_size     u32   machine code length
//!   rodata_size   u32   side table length
//!   opcache_num   u32   inline-cache slots
//!   handler_num   u32   handler table entries
//! unit bytes     (anonymous units only)
//! machine code
//! side table
//!   handler vpcs  u32 x handler_num
//!   handler pcs   i64 x handler_num
//!   stack heights u8 or u16 x instruction count
//! ```
//!
//! Named units keep a single record per file. Anonymous units share a file
//! and are told apart by comparing their instruction bytes.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use crate::jit::runtime::StackHeights;

/// Suffix of every cache file; encodes the bytecode version
pub const CACHE_SUFFIX: &str = ".kiln-310.bin";

/// Seed mixed into the instruction digest
pub const HASH_SEED: u64 = 310;

/// Size of an encoded [`RecordHeader`]
pub const RECORD_HEADER_SIZE: usize = 36;

/// Timestamp used for frozen sources that have no file on disk
pub const FROZEN_TIMESTAMP: i64 = i64::MIN;

/// 64-bit digest of a unit's instruction bytes
pub fn instruction_hash(code: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(HASH_SEED.to_le_bytes());
    hasher.update(code);
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

/// Fixed-size record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: i64,
    pub hash: u64,
    pub unit_size: u32,
    pub code_size: u32,
    pub rodata_size: u32,
    pub opcache_num: u32,
    pub handler_num: u32,
}

impl RecordHeader {
    /// Encode header to writer in little-endian format
    pub fn encode(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.timestamp.to_le_bytes())?;
        writer.write_all(&self.hash.to_le_bytes())?;
        writer.write_all(&self.unit_size.to_le_bytes())?;
        writer.write_all(&self.code_size.to_le_bytes())?;
        writer.write_all(&self.rodata_size.to_le_bytes())?;
        writer.write_all(&self.opcache_num.to_le_bytes())?;
        writer.write_all(&self.handler_num.to_le_bytes())?;
        Ok(())
    }

    /// Decode header from reader
    pub fn decode(reader: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let timestamp = i64::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let hash = u64::from_le_bytes(buf);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let unit_size = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let code_size = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let rodata_size = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let opcache_num = u32::from_le_bytes(buf);

        reader.read_exact(&mut buf)?;
        let handler_num = u32::from_le_bytes(buf);

        Ok(Self {
            timestamp,
            hash,
            unit_size,
            code_size,
            rodata_size,
            opcache_num,
            handler_num,
        })
    }

    /// Bytes following the header, given whether the record carries its
    /// unit's instruction bytes
    pub fn body_size(&self, anonymous: bool) -> usize {
        let unit = if anonymous { self.unit_size as usize } else { 0 };
        unit + self.code_size as usize + self.rodata_size as usize
    }
}

/// Side table length for a unit with `instr_num` instructions and the given
/// stack capacity
pub fn rodata_size(handler_num: usize, instr_num: usize, stacksize: u32) -> usize {
    let width = if StackHeights::is_narrow(stacksize) { 1 } else { 2 };
    handler_num * (4 + 8) + instr_num * width
}

/// Encode the side table
pub fn encode_rodata(
    writer: &mut impl Write,
    handler_vpcs: &[u32],
    handler_pcs: &[i64],
    heights: &StackHeights,
) -> io::Result<()> {
    for vpc in handler_vpcs {
        writer.write_all(&vpc.to_le_bytes())?;
    }
    for pc in handler_pcs {
        writer.write_all(&pc.to_le_bytes())?;
    }
    match heights {
        StackHeights::U8(v) => writer.write_all(v)?,
        StackHeights::U16(v) => {
            for h in v {
                writer.write_all(&h.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Decoded side table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rodata {
    pub handler_vpcs: Vec<u32>,
    pub handler_pcs: Vec<i64>,
    pub stack_heights: StackHeights,
}

/// Decode a side table; `None` when its length does not match the unit
pub fn decode_rodata(bytes: &[u8], handler_num: usize, instr_num: usize, stacksize: u32) -> Option<Rodata> {
    if bytes.len() != rodata_size(handler_num, instr_num, stacksize) {
        return None;
    }
    let (vpc_bytes, rest) = bytes.split_at(handler_num * 4);
    let (pc_bytes, height_bytes) = rest.split_at(handler_num * 8);

    let handler_vpcs = vpc_bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    if !handler_vpcs.windows(2).all(|w| w[0] < w[1]) {
        return None;
    }
    let handler_pcs = pc_bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    let stack_heights = if StackHeights::is_narrow(stacksize) {
        StackHeights::U8(height_bytes.to_vec())
    } else {
        StackHeights::U16(
            height_bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        )
    };

    Some(Rodata { handler_vpcs, handler_pcs, stack_heights })
}

/// A record located in a cache file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Byte offset of the header
    pub offset: u64,
    pub header: RecordHeader,
    /// The record's body extends past the end of the file
    pub truncated: bool,
}

/// Walk every record in `bytes`. Trailing bytes too short for a header are
/// ignored
pub fn scan_records(bytes: &[u8], anonymous: bool) -> Vec<RecordInfo> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while bytes.len() - offset >= RECORD_HEADER_SIZE {
        let mut cursor = &bytes[offset..];
        let Ok(header) = RecordHeader::decode(&mut cursor) else {
            break;
        };
        let end = offset + RECORD_HEADER_SIZE + header.body_size(anonymous);
        let truncated = end > bytes.len();
        records.push(RecordInfo { offset: offset as u64, header, truncated });
        if truncated {
            break;
        }
        offset = end;
    }
    records
}
