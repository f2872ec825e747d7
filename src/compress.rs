//! NCA to NCZ block compression.
//!
//! The NCZ body is a sequence of 1 MiB blocks covering `[0x4000, file_end)`
//! of the source NCA. Each block is read, stripped of its AES-CTR
//! encryption, and zstd-compressed independently; a block that does not
//! shrink is stored raw so the output never grows. Because the CTR counter
//! is a pure function of the absolute offset, blocks can be processed by a
//! worker pool in any order.

use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;

use binrw::BinWrite;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::crypto;
use crate::error::{Error, Result};
use crate::formats::nca::Nca;
use crate::formats::ncz::{NczBlockHeader, NczSectionEntry, NczSectionHeader};
use crate::io::ReadAt;

/// The NCA header region copied into the NCZ verbatim. It is XTS-encrypted
/// and effectively incompressible, and a decompressor needs it bit-exact.
pub const UNCOMPRESSABLE_HEADER_SIZE: u64 = 0x4000;

/// log2 of the block size; 2^20 = 1 MiB blocks.
pub const DEFAULT_BLOCK_SIZE_EXP: u8 = 20;

/// Default zstd level, matching the reference NSZ tooling.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 18;

/// Compress one NCA into NCZ form at the writer's current position.
///
/// The writer must be seekable: the per-block compressed-size table is
/// reserved up front and back-patched once every block size is known.
/// Returns the number of bytes written.
pub fn compress_nca<R, W>(nca: &Nca<R>, writer: &mut W, total_size: u64, level: i32) -> Result<u64>
where
    R: ReadAt + Sync,
    W: Write + Seek,
{
    if total_size <= UNCOMPRESSABLE_HEADER_SIZE {
        return Err(Error::InvalidFormat(format!(
            "NCA of {} bytes has no compressible body",
            total_size
        )));
    }

    let start_pos = writer.stream_position()?;

    // 1. Verbatim header prefix.
    let mut header_buf = vec![0u8; UNCOMPRESSABLE_HEADER_SIZE as usize];
    nca.reader().read_exact_at(&mut header_buf, 0)?;
    writer.write_all(&header_buf)?;

    // 2. Section table.
    let sections = nca.encryption_sections();
    NczSectionHeader {
        section_count: sections.len() as u64,
    }
    .write_le(writer)?;
    for section in &sections {
        section.write_le(writer)?;
    }

    // 3. Block table header.
    let block_size = 1u64 << DEFAULT_BLOCK_SIZE_EXP;
    let data_size = total_size - UNCOMPRESSABLE_HEADER_SIZE;
    let block_count = data_size.div_ceil(block_size) as u32;
    NczBlockHeader::new(DEFAULT_BLOCK_SIZE_EXP, block_count, data_size).write_le(writer)?;

    // 4. Placeholder for the compressed-size table.
    let size_list_offset = writer.stream_position()?;
    writer.write_all(&vec![0u8; block_count as usize * 4])?;

    // 5. Compress and write the blocks in index order.
    let blocks = compress_blocks(nca.reader(), total_size, block_size, block_count, &sections, level)?;
    let mut compressed_sizes = Vec::with_capacity(block_count as usize);
    for block in &blocks {
        writer.write_all(block)?;
        compressed_sizes.push(block.len() as u32);
    }

    // 6. Back-patch the size table.
    let end_pos = writer.stream_position()?;
    writer.seek(SeekFrom::Start(size_list_offset))?;
    for size in &compressed_sizes {
        writer.write_u32::<LittleEndian>(*size)?;
    }
    writer.seek(SeekFrom::Start(end_pos))?;

    let written = end_pos - start_pos;
    let ratio = format!("{:.1}%", written as f64 / total_size as f64 * 100.0);
    tracing::info!(
        input_size = total_size,
        output_size = written,
        ratio = %ratio,
        "NCA compressed"
    );
    Ok(written)
}

/// Read, decrypt and compress every block with a scoped worker pool.
///
/// Work is distributed by an atomic block counter; results flow back over a
/// bounded channel so that at most `workers * 4` finished blocks are held
/// before the collector catches up. The first worker error is recorded
/// under a once-only latch; from then on the remaining work items are
/// drained without processing, and the error surfaces after join.
fn compress_blocks<R: ReadAt + Sync>(
    reader: &R,
    total_size: u64,
    block_size: u64,
    block_count: u32,
    sections: &[NczSectionEntry],
    level: i32,
) -> Result<Vec<Vec<u8>>> {
    let workers = thread::available_parallelism().map_or(4, |n| n.get());
    let next_block = AtomicU32::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<Error>> = Mutex::new(None);
    let (tx, rx) = mpsc::sync_channel::<(u32, Vec<u8>)>(workers * 4);

    let mut results: Vec<Vec<u8>> = vec![Vec::new(); block_count as usize];

    thread::scope(|s| {
        let next_block = &next_block;
        let failed = &failed;
        let first_error = &first_error;

        for _ in 0..workers {
            let tx = tx.clone();
            s.spawn(move || {
                let latch = |e: Error| {
                    let mut guard = first_error.lock().unwrap();
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                    failed.store(true, Ordering::Relaxed);
                };

                let mut encoder = match zstd::bulk::Compressor::new(level) {
                    Ok(encoder) => encoder,
                    Err(e) => return latch(e.into()),
                };
                let mut buf = vec![0u8; block_size as usize];

                loop {
                    let index = next_block.fetch_add(1, Ordering::Relaxed);
                    if index >= block_count {
                        break;
                    }

                    // Once any worker has latched an error, claim and drop
                    // the remaining items instead of processing them.
                    if failed.load(Ordering::Relaxed) {
                        continue;
                    }

                    let offset = UNCOMPRESSABLE_HEADER_SIZE + index as u64 * block_size;
                    let size = block_size.min(total_size - offset) as usize;
                    let chunk = &mut buf[..size];

                    if let Err(e) = reader.read_exact_at(chunk, offset) {
                        latch(e.into());
                        continue;
                    }

                    decrypt_chunk(chunk, offset, sections);

                    let compressed = match encoder.compress(chunk) {
                        Ok(compressed) => compressed,
                        Err(e) => {
                            latch(e.into());
                            continue;
                        }
                    };

                    // Keep whichever representation is smaller; ties go to
                    // the raw bytes, which is what decompressors expect.
                    let data = if compressed.len() < chunk.len() {
                        compressed
                    } else {
                        chunk.to_vec()
                    };

                    if tx.send((index, data)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        for (index, data) in rx {
            results[index as usize] = data;
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    Ok(results)
}

/// Strip the CTR encryption from every section range intersecting the chunk.
///
/// Only CTR and BKTR-typed sections are touched; `None` and XTS ranges pass
/// through as stored. The counter is rebuilt from the intersection's
/// absolute offset, so chunk boundaries never matter.
fn decrypt_chunk(chunk: &mut [u8], chunk_offset: u64, sections: &[NczSectionEntry]) {
    let chunk_end = chunk_offset + chunk.len() as u64;

    for section in sections {
        if !section.needs_ctr() {
            continue;
        }

        let start = chunk_offset.max(section.offset);
        let end = chunk_end.min(section.end());
        if start >= end {
            continue;
        }

        let slice = &mut chunk[(start - chunk_offset) as usize..(end - chunk_offset) as usize];
        crypto::apply_ctr(slice, &section.crypto_key, &section.crypto_counter, start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::nca::testing::{
        build_header_region, ctr_fs_header, test_keyset, TEST_HEADER_KEY, TEST_TITLE_KEY,
    };
    use crate::formats::ncz;
    use std::io::Cursor;

    /// Deterministic high-entropy bytes; xorshift is enough to make zstd
    /// give up on the block.
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            out.extend_from_slice(&seed.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[test]
    fn test_block_ranges_partition_the_body() {
        for exp in 14..=22u32 {
            let block_size = 1u64 << exp;
            for total_size in [
                UNCOMPRESSABLE_HEADER_SIZE + 1,
                UNCOMPRESSABLE_HEADER_SIZE + block_size,
                UNCOMPRESSABLE_HEADER_SIZE + block_size + 1,
                UNCOMPRESSABLE_HEADER_SIZE + 5 * block_size - 17,
            ] {
                let data_size = total_size - UNCOMPRESSABLE_HEADER_SIZE;
                let block_count = data_size.div_ceil(block_size);

                let mut cursor = UNCOMPRESSABLE_HEADER_SIZE;
                for index in 0..block_count {
                    let offset = UNCOMPRESSABLE_HEADER_SIZE + index * block_size;
                    let size = block_size.min(total_size - offset);
                    assert_eq!(offset, cursor);
                    assert!(size > 0);
                    cursor = offset + size;
                }
                assert_eq!(cursor, total_size);
            }
        }
    }

    #[test]
    fn test_decrypt_chunk_skips_plain_sections() {
        let sections = vec![NczSectionEntry {
            offset: 0x4000,
            size: 0x1000,
            crypto_type: 1, // none
            ..Default::default()
        }];
        let mut chunk = vec![0xAB; 0x1000];
        decrypt_chunk(&mut chunk, 0x4000, &sections);
        assert!(chunk.iter().all(|&b| b == 0xAB));
    }

    /// Build a 4 MiB single-CTR-section NCA, compress it, and pull the
    /// result apart against the on-disk layout.
    #[test]
    fn test_compress_round_trip() {
        let keyset = test_keyset();
        let block_size = 1usize << DEFAULT_BLOCK_SIZE_EXP;
        let data_size = 4 * block_size;
        let total_size = UNCOMPRESSABLE_HEADER_SIZE as usize + data_size;

        // Media units: section spans [0x4000, total_size).
        let media_end = (total_size as u64 / 0x200) as u32;
        let fs_header = ctr_fs_header(0x11, 0x22);
        let base_iv = fs_header.base_iv();
        let region = build_header_region(&keyset, 0, (1, 0), &[(0x20, media_end, fs_header)]);

        // Body: three compressible blocks and one of pure noise.
        let mut plaintext = Vec::with_capacity(data_size);
        plaintext.extend(std::iter::repeat(0u8).take(block_size));
        plaintext.extend((0..block_size).map(|i| (i % 251) as u8));
        plaintext.extend(noise(block_size, 0x1234_5678_9abc_def0));
        plaintext.extend(b"nsz".iter().cycle().take(block_size));

        let mut file = region;
        crate::crypto::encrypt_nca_header(&mut file, &TEST_HEADER_KEY);
        file.resize(UNCOMPRESSABLE_HEADER_SIZE as usize, 0);
        let mut body = plaintext.clone();
        crate::crypto::apply_ctr(&mut body, &TEST_TITLE_KEY, &base_iv, UNCOMPRESSABLE_HEADER_SIZE);
        file.extend_from_slice(&body);

        let nca = crate::formats::nca::Nca::new(file.as_slice(), &keyset).unwrap();
        let mut out = Cursor::new(Vec::new());
        let written = compress_nca(&nca, &mut out, total_size as u64, 3).unwrap();
        let out = out.into_inner();
        assert_eq!(written, out.len() as u64);

        // Verbatim encrypted prefix.
        assert_eq!(&out[..0x4000], &file[..0x4000]);

        // Section table: one CTR section covering the body.
        assert_eq!(&out[0x4000..0x4008], ncz::SECTION_MAGIC);
        assert_eq!(&out[0x4008..0x4010], &1u64.to_le_bytes());
        let entry: ncz::NczSectionEntry =
            binrw::BinRead::read_le(&mut Cursor::new(&out[0x4010..0x4050])).unwrap();
        assert_eq!(entry.offset, 0x4000);
        assert_eq!(entry.size, data_size as u64);
        assert_eq!(entry.crypto_type, 3);
        assert_eq!(entry.crypto_key, TEST_TITLE_KEY);
        assert_eq!(entry.crypto_counter, base_iv);

        // Block header.
        let block_header: ncz::NczBlockHeader =
            binrw::BinRead::read_le(&mut Cursor::new(&out[0x4050..0x4068])).unwrap();
        assert_eq!(block_header.version, 2);
        assert_eq!(block_header.block_type, 1);
        assert_eq!(block_header.block_size_exp, DEFAULT_BLOCK_SIZE_EXP);
        assert_eq!(block_header.block_count, 4);
        assert_eq!(block_header.decompressed_size, data_size as u64);

        // Size table, then the blocks it describes.
        let mut sizes = Vec::new();
        for i in 0..4 {
            let at = 0x4068 + i * 4;
            sizes.push(u32::from_le_bytes(out[at..at + 4].try_into().unwrap()) as usize);
        }
        let blocks_start = 0x4068 + 16;
        assert_eq!(blocks_start + sizes.iter().sum::<usize>(), out.len());

        // The noise block must have been kept raw.
        assert!(sizes[0] < block_size);
        assert_eq!(sizes[2], block_size);

        let mut decompressed = Vec::new();
        let mut at = blocks_start;
        for &size in &sizes {
            let raw = &out[at..at + size];
            if size == block_size {
                decompressed.extend_from_slice(raw);
            } else {
                decompressed.extend_from_slice(&zstd::decode_all(raw).unwrap());
            }
            at += size;
        }
        assert_eq!(decompressed, plaintext);
    }

    #[test]
    fn test_too_small_nca_is_rejected() {
        let keyset = test_keyset();
        let region = build_header_region(&keyset, 0, (1, 0), &[(0x20, 0x40, ctr_fs_header(1, 2))]);
        let mut file = region;
        crate::crypto::encrypt_nca_header(&mut file, &TEST_HEADER_KEY);

        let nca = crate::formats::nca::Nca::new(file.as_slice(), &keyset).unwrap();
        let mut out = Cursor::new(Vec::new());
        assert!(compress_nca(&nca, &mut out, 0x1000, 3).is_err());
    }

    #[test]
    fn test_read_error_is_latched() {
        let keyset = test_keyset();
        let region = build_header_region(&keyset, 0, (1, 0), &[(0x20, 0x40, ctr_fs_header(1, 2))]);
        let mut file = region;
        crate::crypto::encrypt_nca_header(&mut file, &TEST_HEADER_KEY);
        file.resize(0x4800, 0);

        let nca = crate::formats::nca::Nca::new(file.as_slice(), &keyset).unwrap();
        let mut out = Cursor::new(Vec::new());
        // Claimed size is larger than the backing data, so a block read
        // must fail and surface after join.
        match compress_nca(&nca, &mut out, 0x10000, 3) {
            Err(Error::Io(_)) => {}
            other => panic!("expected Io error, got {:?}", other.map(|_| ())),
        }
    }
}
