//! BKTR subsection index parsing.
//!
//! Patch (AesCtrEx) sections carry a bucket tree that splits the section
//! into subsections, each encrypted with its own 32-bit counter seed. The
//! index itself is CTR-encrypted with the section's base counter, so parsing
//! needs the title key. Every parsed subsection becomes its own NCZ section
//! entry, which is how a decompressor finds the right counter without
//! replaying the tree.

use binrw::prelude::*;
use binrw::io::Cursor;

use crate::crypto;
use crate::io::ReadAt;

pub use super::types::BktrHeader;

/// Upper bounds from the format; anything beyond is treated as garbage.
const MAX_BUCKET_COUNT: u32 = 100;
const MAX_ENTRY_COUNT: u32 = 0xFFFF;

/// Bytes before the first bucket: 16-byte index header plus the 0x3FF0-byte
/// base offset table.
const BUCKETS_START: usize = 0x10 + 0x3FF0;

/// One subsection of a BKTR section, with its size already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsectionEntry {
    /// Offset of the subsection relative to the section start.
    pub virtual_offset: u64,
    /// Size in bytes; derived from the following entry's offset, or from the
    /// bucket end offset for the last entry.
    pub size: u64,
    /// Counter seed for bytes [4..8) of the section IV.
    pub ctr_seed: u32,
}

#[binrw]
#[brw(little)]
struct BucketHeader {
    _padding: u32,
    entry_count: u32,
    end_offset: u64,
}

#[binrw]
#[brw(little)]
struct RawEntry {
    virtual_offset: u64,
    _padding: u32,
    ctr: u32,
}

/// Read and decrypt the subsection index of a section, yielding the flat
/// entry list in file order.
///
/// Degrades to an empty list on any bounds violation or truncation; the
/// caller then falls back to a single section covering the whole range.
pub fn parse_subsections<R: ReadAt + ?Sized>(
    reader: &R,
    section_offset: u64,
    header: &BktrHeader,
    title_key: &[u8; 0x10],
    base_iv: &[u8; 16],
) -> Vec<SubsectionEntry> {
    if header.size == 0 {
        return Vec::new();
    }

    let index_offset = section_offset + header.offset;
    let mut data = vec![0u8; header.size as usize];
    if reader.read_exact_at(&mut data, index_offset).is_err() {
        tracing::warn!(offset = index_offset, "Truncated BKTR subsection index");
        return Vec::new();
    }

    // The index is encrypted like the rest of the section.
    crypto::apply_ctr(&mut data, title_key, base_iv, index_offset);

    parse_buckets(&data)
}

fn parse_buckets(data: &[u8]) -> Vec<SubsectionEntry> {
    if data.len() < 0x10 {
        return Vec::new();
    }

    let bucket_count = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if bucket_count == 0 || bucket_count > MAX_BUCKET_COUNT {
        tracing::warn!(bucket_count, "Implausible BKTR bucket count, ignoring index");
        return Vec::new();
    }
    if data.len() < BUCKETS_START {
        return Vec::new();
    }

    let mut entries = Vec::new();
    let mut cursor = Cursor::new(&data[BUCKETS_START..]);

    for _ in 0..bucket_count {
        let Ok(bucket) = cursor.read_le::<BucketHeader>() else {
            break;
        };
        if bucket.entry_count > MAX_ENTRY_COUNT {
            break;
        }

        let first = entries.len();
        for _ in 0..bucket.entry_count {
            let Ok(raw) = cursor.read_le::<RawEntry>() else {
                break;
            };
            entries.push(SubsectionEntry {
                virtual_offset: raw.virtual_offset,
                size: 0,
                ctr_seed: raw.ctr,
            });
        }

        // Sizes come from consecutive offsets; the bucket end closes the last.
        for i in first..entries.len().saturating_sub(1) {
            entries[i].size = entries[i + 1].virtual_offset - entries[i].virtual_offset;
        }
        if entries.len() > first {
            let last = entries.last_mut().unwrap();
            last.size = bucket.end_offset.saturating_sub(last.virtual_offset);
        }
    }

    entries
}

/// Serialize a subsection index: header, base offset table, then buckets of
/// (virtual_offset, ctr) pairs closed by an end offset. Test fixture helper.
#[cfg(test)]
pub(crate) fn build_index(buckets: &[(&[(u64, u32)], u64)]) -> Vec<u8> {
    let mut data = vec![0u8; BUCKETS_START];
    data[4..8].copy_from_slice(&(buckets.len() as u32).to_le_bytes());

    for (entries, end_offset) in buckets {
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        data.extend_from_slice(&end_offset.to_le_bytes());
        for (virtual_offset, ctr) in *entries {
            data.extend_from_slice(&virtual_offset.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&ctr.to_le_bytes());
        }
    }
    data
}
