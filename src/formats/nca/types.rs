use binrw::prelude::*;

/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

/// The type of content stored in the NCA.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, screenshots, etc.).
    Control = 0x02,
    /// Manual content (digital manual/documentation).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

impl ContentType {
    /// Only Program and PublicData NCAs are worth block-compressing; the
    /// rest are small metadata archives that are copied through verbatim.
    pub fn is_compressible(&self) -> bool {
        matches!(self, ContentType::Program | ContentType::PublicData)
    }
}

/// The encryption key index used for the key area in the NCA header.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAreaEncryptionKeyIndex {
    /// Application key area encryption key.
    Application = 0x00,
    /// Ocean key area encryption key.
    Ocean = 0x01,
    /// System key area encryption key.
    System = 0x02,
}

/// Filesystem type
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// RomFS filesystem
    RomFs = 0x00,
    /// Partition filesystem
    PartitionFs = 0x01,
}

/// Hash type used for filesystem verification
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// Automatically select hash type
    Auto = 0x00,
    /// No hash verification
    None = 0x01,
    /// Hierarchical SHA256 hash
    HierarchicalSha256Hash = 0x02,
    /// Hierarchical integrity hash
    HierarchicalIntegrityHash = 0x03,
    /// [14.0.0+] Automatically select SHA3 hash
    AutoSha3 = 0x04,
    /// [14.0.0+] Hierarchical SHA3-256 hash
    HierarchicalSha3256Hash = 0x05,
    /// [14.0.0+] Hierarchical integrity SHA3 hash
    HierarchicalIntegritySha3Hash = 0x06,
}

/// Encryption type for NCA section content
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Automatically select encryption type
    Auto = 0x00,
    /// No encryption
    None = 0x01,
    /// AES-XTS encryption
    AesXts = 0x02,
    /// AES-CTR encryption
    AesCtr = 0x03,
    /// AES-CTR extended encryption (BKTR patch sections)
    AesCtrEx = 0x04,
    /// [14.0.0+] AES-CTR encryption with skipped layer hash
    AesCtrSkipLayerHash = 0x05,
    /// [14.0.0+] AES-CTR extended encryption with skipped layer hash
    AesCtrExSkipLayerHash = 0x06,
}

impl EncryptionType {
    /// Whether section data under this type is decrypted at block time.
    /// XTS data sections are left alone: the only XTS region this tool
    /// touches is the header prefix, which is copied through encrypted.
    pub fn needs_ctr(&self) -> bool {
        matches!(self, EncryptionType::AesCtr | EncryptionType::AesCtrEx)
    }
}

/// An entry of the section table at 0x240 of the decrypted header.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct FsEntry {
    /// StartOffset (in media units of 0x200 bytes) of the section
    pub start_offset: u32,
    /// EndOffset (in media units of 0x200 bytes) of the section
    pub end_offset: u32,
    /// Unknown
    pub _reserved: u64,
}

impl FsEntry {
    /// Entries with both offsets zero are unused slots. An entry with only
    /// one zero offset is left as-is; real NCAs do not produce them.
    pub fn is_vacant(&self) -> bool {
        self.start_offset == 0 && self.end_offset == 0
    }
}

/// The encrypted key area from the NCA header (0x300..0x340).
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct KeyArea {
    /// AES-XTS key pair slot.
    pub aes_xts_key: [u8; 0x20],
    /// AES-CTR key slot; this is the key-area-wrapped title key.
    pub aes_ctr_key: [u8; 0x10],
    /// Unknown
    pub _reserved: [u8; 0x10],
}

/// A BKTR (bucket tree) region descriptor inside an FS header.
///
/// Two of these live in the patch info region: the relocation tree at
/// +0x100 and the subsection tree at +0x120.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct BktrHeader {
    /// Offset of the bucket data within the section.
    pub offset: u64,
    /// Size of the bucket data.
    pub size: u64,
    /// Magic, "BKTR" in valid headers.
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: u32,
    pub _reserved: u32,
}

/// NCA filesystem header, one 0x200-byte block per section at
/// 0x400 + section_index * 0x200 of the decrypted header region.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct FsHeader {
    /// The filesystem version; 2 in every NCA this crate handles.
    pub version: u16,
    /// The type of filesystem used in this section.
    pub fs_type: FsType,
    /// The hash type used for filesystem verification.
    pub hash_type: HashType,
    /// The encryption type used for the section data.
    pub encryption_type: EncryptionType,
    pub metadata_hash_type: u8,
    pub _reserved: [u8; 0x2],
    #[br(count = 0xF8)]
    #[brw(pad_size_to = 0xF8)]
    pub hash_data: Vec<u8>,
    /// Relocation bucket tree (patch info, +0x100). Parsed but unused here.
    pub relocation_info: BktrHeader,
    /// Subsection bucket tree (+0x120); drives the BKTR section fan-out.
    pub subsection_info: BktrHeader,
    // 0x140
    pub generation: u32,
    pub secure_value: u32,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub sparse_info: Vec<u8>,
    #[br(count = 0x28)]
    #[brw(pad_size_to = 0x28)]
    pub compression_info: Vec<u8>,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub metadata_hashdata_info: Vec<u8>,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub _reserved2: Vec<u8>,
}

impl FsHeader {
    /// The 16-byte base IV consumed by the CTR primitive: `secure_value`
    /// big-endian at [0..4), `generation` big-endian at [4..8), zeros in the
    /// low half where the block number goes.
    pub fn base_iv(&self) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..4].copy_from_slice(&self.secure_value.to_be_bytes());
        iv[4..8].copy_from_slice(&self.generation.to_be_bytes());
        iv
    }
}

impl Default for FsHeader {
    fn default() -> Self {
        Self {
            version: 2,
            fs_type: FsType::RomFs,
            hash_type: HashType::None,
            encryption_type: EncryptionType::None,
            metadata_hash_type: 0,
            _reserved: [0; 2],
            hash_data: vec![0; 0xF8],
            relocation_info: BktrHeader::default(),
            subsection_info: BktrHeader::default(),
            generation: 0,
            secure_value: 0,
            sparse_info: vec![0; 0x30],
            compression_info: vec![0; 0x28],
            metadata_hashdata_info: vec![0; 0x30],
            _reserved2: vec![0; 0x30],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::io::Cursor;

    #[test]
    fn test_fs_header_is_0x200_bytes() {
        let header = FsHeader::default();
        let mut cursor = Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        assert_eq!(cursor.into_inner().len(), 0x200);
    }

    #[test]
    fn test_fs_header_field_offsets() {
        let header = FsHeader {
            encryption_type: EncryptionType::AesCtr,
            generation: 0x0102_0304,
            secure_value: 0x0506_0708,
            subsection_info: BktrHeader {
                offset: 0x1000,
                size: 0x4010,
                magic: *b"BKTR",
                version: 1,
                entry_count: 3,
                _reserved: 0,
            },
            ..Default::default()
        };

        let mut cursor = Cursor::new(Vec::new());
        header.write_le(&mut cursor).unwrap();
        let bytes = cursor.into_inner();

        assert_eq!(bytes[0x4], 0x03); // encryption type
        assert_eq!(&bytes[0x130..0x134], b"BKTR"); // subsection magic at +0x120+0x10
        assert_eq!(&bytes[0x140..0x148], &[0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]);

        let parsed: FsHeader = Cursor::new(&bytes).read_le().unwrap();
        assert_eq!(parsed.subsection_info.size, 0x4010);
        assert_eq!(parsed.base_iv()[..8], [5, 6, 7, 8, 1, 2, 3, 4]);
    }

    #[test]
    fn test_vacant_entries() {
        assert!(FsEntry::default().is_vacant());
        let entry = FsEntry {
            start_offset: 0x20,
            end_offset: 0x40,
            _reserved: 0,
        };
        assert!(!entry.is_vacant());
    }
}
