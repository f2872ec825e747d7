//! # NCZ wire structures
//!
//! An NCZ file is an NCA whose body has been re-expressed as independently
//! decodable zstd blocks:
//!
//! ```text
//! [0x0000]  Verbatim NCA header prefix (0x4000 bytes, still XTS-encrypted)
//! [0x4000]  "NCZSECTN" + section count (u64 LE) + section entries
//! [......]  "NCZBLOCK" header (24 bytes)
//! [......]  compressed_sizes[block_count] (u32 LE each)
//! [......]  blocks, in order; each a zstd frame or a raw copy
//! ```
//!
//! Section entries describe how the plaintext body maps back onto encrypted
//! NCA ranges, so a decompressor can re-apply AES-CTR with the stored key
//! and counter after inflating each block.

use binrw::prelude::*;

pub const SECTION_MAGIC: &[u8; 8] = b"NCZSECTN";
pub const BLOCK_MAGIC: &[u8; 8] = b"NCZBLOCK";

/// Header of the section table.
#[binrw]
#[brw(little, magic = b"NCZSECTN")]
#[derive(Debug, Clone)]
pub struct NczSectionHeader {
    pub section_count: u64,
}

/// Descriptor for one contiguous crypto region of the source NCA.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct NczSectionEntry {
    /// Absolute byte offset within the plaintext NCA.
    pub offset: u64,
    /// Length of the region in bytes.
    pub size: u64,
    /// NCA encryption type of the region (1 = none, 2 = XTS, 3 = CTR,
    /// 4 = BKTR; BKTR subsections are fanned out to plain CTR entries).
    pub crypto_type: u64,
    pub _padding: u64,
    /// AES-128 key for the region; zeros when no title key was available.
    pub crypto_key: [u8; 0x10],
    /// Base AES-CTR counter for the region.
    pub crypto_counter: [u8; 0x10],
}

impl NczSectionEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether block compression must strip this region's encryption.
    /// Regions of other types (none/XTS) pass through untouched.
    pub fn needs_ctr(&self) -> bool {
        self.crypto_type == 3 || self.crypto_type == 4
    }
}

/// Header of the block table, directly after the section entries.
#[binrw]
#[brw(little, magic = b"NCZBLOCK")]
#[derive(Debug, Clone)]
pub struct NczBlockHeader {
    /// Format version; always 2.
    pub version: u8,
    /// Block table type; always 1.
    pub block_type: u8,
    pub _unused: u8,
    /// log2 of the block size; 20 for the 1 MiB blocks written here.
    pub block_size_exp: u8,
    /// Number of blocks covering the compressed body.
    pub block_count: u32,
    /// Total plaintext body size (file size minus the 0x4000 prefix).
    pub decompressed_size: u64,
}

impl NczBlockHeader {
    pub fn new(block_size_exp: u8, block_count: u32, decompressed_size: u64) -> Self {
        Self {
            version: 2,
            block_type: 1,
            _unused: 0,
            block_size_exp,
            block_count,
            decompressed_size,
        }
    }

    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn test_section_entry_is_0x40_bytes() {
        let entry = NczSectionEntry::default();
        let mut cursor = Cursor::new(Vec::new());
        entry.write_le(&mut cursor).unwrap();
        assert_eq!(cursor.into_inner().len(), 0x40);
    }

    #[test]
    fn test_block_header_layout() {
        let header = NczBlockHeader::new(20, 4, 0x40_0000);
        let mut cursor = Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        let bytes = cursor.into_inner();

        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..8], BLOCK_MAGIC);
        assert_eq!(bytes[8], 2); // version
        assert_eq!(bytes[9], 1); // type
        assert_eq!(bytes[11], 20); // block size exponent
        assert_eq!(&bytes[12..16], &4u32.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x40_0000u64.to_le_bytes());
        assert_eq!(header.block_size(), 1 << 20);
    }

    #[test]
    fn test_section_header_round_trip() {
        let mut cursor = Cursor::new(Vec::new());
        NczSectionHeader { section_count: 3 }
            .write_le(&mut cursor)
            .unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(&bytes[..8], SECTION_MAGIC);

        let parsed: NczSectionHeader = Cursor::new(&bytes).read_le().unwrap();
        assert_eq!(parsed.section_count, 3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let bytes = b"NCZWRONG\x01\x00\x00\x00\x00\x00\x00\x00";
        assert!(Cursor::new(&bytes).read_le::<NczSectionHeader>().is_err());
    }
}
