//! NCA parsing and section planning.
//!
//! The first 0xC00 bytes of an NCA are encrypted with AES-XTS, sector size
//! 0x200, using Nintendo's big-endian tweak: an 0x400-byte main header
//! followed by an 0x200-byte FS header per section. Section data itself is
//! (usually) AES-CTR encrypted with a title key that is either wrapped in
//! the header's key area or delivered via a ticket.

pub mod bktr;
mod types;

use binrw::prelude::*;
use binrw::io::Cursor;

use crate::error::{Error, Result};
use crate::formats::keyset::Keyset;
use crate::formats::ncz::NczSectionEntry;
use crate::io::ReadAt;

pub use types::*;

/// Size of the XTS-encrypted header region.
pub const NCA_HEADER_SIZE: usize = 0xC00;

/// Media unit used by the section table.
pub const MEDIA_SIZE: u64 = 0x200;

pub const NCA3_MAGIC: &[u8; 4] = b"NCA3";

/// NCA header, parsed from the decrypted first 0x340 bytes.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaHeader {
    #[br(count = 0x100)]
    #[brw(pad_size_to = 0x100)]
    pub fixed_key_sig: Vec<u8>,
    #[br(count = 0x100)]
    #[brw(pad_size_to = 0x100)]
    pub npdm_key_sig: Vec<u8>,
    #[brw(magic = b"NCA3")]
    pub distribution: DistributionType,
    pub content_type: ContentType,
    pub key_generation_old: u8,
    pub key_area_key_index: KeyAreaEncryptionKeyIndex,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub signature_key_generation: u8,
    #[br(count = 0xE)]
    #[brw(pad_size_to = 0xE)]
    _reserved: Vec<u8>,
    pub rights_id: [u8; 0x10],
    #[br(count = 4)]
    #[brw(pad_size_to = 0x10 * 4)]
    pub fs_entries: Vec<FsEntry>,
    #[br(count = 4)]
    #[brw(pad_size_to = 0x20 * 4)]
    pub sha256_hashes: Vec<[u8; 0x20]>,
    pub key_area: KeyArea,
}

impl NcaHeader {
    /// Parses an already-decrypted 0x340-byte header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Cursor::new(bytes).read_le()?)
    }

    /// The master key generation used by this NCA's keys.
    ///
    /// The higher of the two generation fields wins, then the value is
    /// shifted down by one because generations 0 and 1 both map to
    /// master key 0.
    pub fn effective_key_generation(&self) -> usize {
        let base = self.key_generation_old.max(self.key_generation);
        base.saturating_sub(1) as usize
    }

    /// Whether the title key comes from a ticket rather than the key area.
    pub fn has_rights_id(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }
}

/// An NCA bound to its positional reader, ready for section planning.
pub struct Nca<R> {
    reader: R,
    pub header: NcaHeader,
    /// One FS header per section table slot, vacant or not.
    pub fs_headers: Vec<FsHeader>,
    title_key: Option<[u8; 0x10]>,
}

impl<R: ReadAt> Nca<R> {
    /// Decrypt and parse the NCA header region.
    ///
    /// The key-area title key is unwrapped opportunistically: a failure is
    /// recorded as "no title key" rather than an error, because the caller
    /// may still inject a ticket-derived key before planning.
    pub fn new(reader: R, keyset: &Keyset) -> Result<Self> {
        let header_key = keyset
            .header_key()
            .ok_or_else(|| Error::MissingKey("header_key".to_string()))?;

        let mut decrypted = vec![0u8; NCA_HEADER_SIZE];
        reader.read_exact_at(&mut decrypted, 0)?;
        crate::crypto::decrypt_nca_header(&mut decrypted, header_key);

        let magic = &decrypted[0x200..0x204];
        if magic != NCA3_MAGIC {
            return Err(Error::InvalidMagic {
                expected: String::from_utf8_lossy(NCA3_MAGIC).into_owned(),
                found: String::from_utf8_lossy(magic).into_owned(),
            });
        }

        let header = NcaHeader::from_bytes(&decrypted[..0x340])?;

        let mut fs_headers = Vec::with_capacity(4);
        for i in 0..4 {
            let offset = 0x400 + i * 0x200;
            let fs_header: FsHeader =
                Cursor::new(&decrypted[offset..offset + 0x200]).read_le()?;
            fs_headers.push(fs_header);
        }

        let key_gen = header.effective_key_generation();
        let title_key = match keyset.unwrap_title_key(&header.key_area.aes_ctr_key, key_gen) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!(key_gen, error = %e, "Key area unwrap failed");
                None
            }
        };

        Ok(Self {
            reader,
            header,
            fs_headers,
            title_key,
        })
    }

    pub fn title_key(&self) -> Option<&[u8; 0x10]> {
        self.title_key.as_ref()
    }

    /// Inject a ticket-derived title key, replacing any key-area unwrap.
    pub fn set_title_key(&mut self, key: [u8; 0x10]) {
        self.title_key = Some(key);
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Enumerate the crypto regions of this NCA as NCZ section entries,
    /// sorted ascending by offset.
    ///
    /// BKTR sections with a usable subsection index fan out into one CTR
    /// entry per subsection (each with its own counter seed in bytes [4..8)
    /// of the IV) plus a tail entry covering the rest of the section with
    /// the base counter. Everything else maps to a single entry.
    pub fn encryption_sections(&self) -> Vec<NczSectionEntry> {
        let mut sections = Vec::new();

        for (entry, fs_header) in self.header.fs_entries.iter().zip(&self.fs_headers) {
            if entry.is_vacant() {
                continue;
            }

            let section_offset = entry.start_offset as u64 * MEDIA_SIZE;
            let section_end = entry.end_offset as u64 * MEDIA_SIZE;
            let base_iv = fs_header.base_iv();

            if fs_header.encryption_type == EncryptionType::AesCtrEx
                && fs_header.subsection_info.size > 0
            {
                let fanned = self.bktr_sections(section_offset, section_end, fs_header, &base_iv);
                if !fanned.is_empty() {
                    sections.extend(fanned);
                    continue;
                }
            }

            sections.push(self.make_section(
                section_offset,
                section_end - section_offset,
                fs_header.encryption_type as u64,
                base_iv,
            ));
        }

        sections.sort_by_key(|s| s.offset);
        sections
    }

    fn bktr_sections(
        &self,
        section_offset: u64,
        section_end: u64,
        fs_header: &FsHeader,
        base_iv: &[u8; 16],
    ) -> Vec<NczSectionEntry> {
        let Some(title_key) = self.title_key.as_ref() else {
            return Vec::new();
        };

        let entries = bktr::parse_subsections(
            &self.reader,
            section_offset,
            &fs_header.subsection_info,
            title_key,
            base_iv,
        );

        let mut sections = Vec::new();
        let mut last_end = 0u64;

        for entry in entries {
            if entry.size == 0 {
                continue;
            }

            sections.push(self.make_section(
                section_offset + entry.virtual_offset,
                entry.size,
                EncryptionType::AesCtr as u64,
                bktr_counter(base_iv, entry.ctr_seed),
            ));

            let end = section_offset + entry.virtual_offset + entry.size;
            last_end = last_end.max(end);
        }

        // The index rarely covers the whole section; the remainder is
        // plain CTR under the base counter.
        if !sections.is_empty() && last_end < section_end {
            sections.push(self.make_section(
                last_end,
                section_end - last_end,
                EncryptionType::AesCtr as u64,
                *base_iv,
            ));
        }

        sections
    }

    fn make_section(
        &self,
        offset: u64,
        size: u64,
        crypto_type: u64,
        counter: [u8; 16],
    ) -> NczSectionEntry {
        NczSectionEntry {
            offset,
            size,
            crypto_type,
            _padding: 0,
            crypto_key: self.title_key.unwrap_or_default(),
            crypto_counter: counter,
        }
    }
}

/// A subsection counter: the base IV with bytes [4..8) replaced by the
/// big-endian counter seed from the BKTR entry.
fn bktr_counter(base_iv: &[u8; 16], ctr_seed: u32) -> [u8; 16] {
    let mut counter = *base_iv;
    counter[4..8].copy_from_slice(&ctr_seed.to_be_bytes());
    counter
}
