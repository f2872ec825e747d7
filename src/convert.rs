//! The per-file driver: NSP repacking and single-NCA compression.
//!
//! An NSP is rebuilt entry by entry into a new PFS0: eligible `.nca`
//! entries (Program or PublicData, large enough to have a body) are
//! compressed to `.ncz`, everything else is copied verbatim in the same
//! order. A `.tik` entry, when present, seeds the title key for every NCA
//! in the archive.

use std::fs::File;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::compress::{self, UNCOMPRESSABLE_HEADER_SIZE};
use crate::error::Result;
use crate::formats::nca::Nca;
use crate::formats::pfs0::{Pfs0, Pfs0Writer};
use crate::formats::Keyset;
use crate::io::{ReadAt, SubFile};

/// Offset of the encrypted title key inside a ticket file.
const TICKET_TITLE_KEY_OFFSET: u64 = 0x180;

/// Compress `input` (an NSP or a bare NCA) next to itself and return the
/// output path.
pub fn convert(input: &Path, keyset: &Keyset, level: i32) -> Result<PathBuf> {
    let file = File::open(input)?;

    let mut magic = [0u8; 4];
    file.read_exact_at(&mut magic, 0)?;

    if &magic == b"PFS0" {
        convert_nsp(input, &file, keyset, level)
    } else {
        convert_nca(input, &file, keyset, level)
    }
}

fn output_path_for_nsp(input: &Path) -> PathBuf {
    match input.extension().and_then(|e| e.to_str()) {
        Some("nsp") => input.with_extension("nsz"),
        _ => {
            let mut out = input.as_os_str().to_owned();
            out.push(".nsz");
            PathBuf::from(out)
        }
    }
}

fn convert_nsp(input: &Path, file: &File, keyset: &Keyset, level: i32) -> Result<PathBuf> {
    let mut header_reader = file;
    let pfs0 = Pfs0::parse(&mut header_reader)?;
    info!(files = pfs0.file_count(), "Valid PFS0 (NSP) found");

    let title_key = ticket_title_key(&pfs0, file, keyset);

    // First pass: parse each NCA once, decide its fate and output name.
    let mut names = Vec::with_capacity(pfs0.file_count());
    let mut ncas: Vec<Option<Nca<SubFile<&File>>>> = Vec::with_capacity(pfs0.file_count());

    for entry in &pfs0.files {
        let mut parsed = None;
        let mut name = entry.name.clone();

        if entry.name.to_lowercase().ends_with(".nca") {
            // The output name keeps the entry's original casing.
            let stem = &entry.name[..entry.name.len() - 4];
            let offset = pfs0.entry_offset(entry);
            let reader = SubFile::new(file, offset, offset + entry.entry.data_size);
            match Nca::new(reader, keyset) {
                Ok(mut nca) => {
                    if let Some(key) = title_key {
                        nca.set_title_key(key);
                    }
                    if nca.header.content_type.is_compressible()
                        && entry.entry.data_size > UNCOMPRESSABLE_HEADER_SIZE
                    {
                        if nca.title_key().is_none() {
                            warn!(name = %entry.name, "No title key; encrypted sections will not decompress correctly");
                        }
                        name = format!("{}.ncz", stem);
                        parsed = Some(nca);
                    }
                }
                Err(e) => {
                    warn!(name = %entry.name, error = %e, "Not compressing unparseable NCA");
                }
            }
        }

        names.push(name);
        ncas.push(parsed);
    }

    let output = output_path_for_nsp(input);
    info!(output = %output.display(), "Creating NSZ");
    let mut writer = Pfs0Writer::new(File::create(&output)?, &names)?;

    let progress = ProgressBar::new(pfs0.file_count() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    for (index, entry) in pfs0.files.iter().enumerate() {
        progress.set_message(names[index].clone());

        match &ncas[index] {
            Some(nca) => {
                writer.add_compressed(index, nca, entry.entry.data_size, level)?;
            }
            None => {
                let offset = pfs0.entry_offset(entry);
                let mut reader = SubFile::new(file, offset, offset + entry.entry.data_size);
                writer.add_file(index, &mut reader)?;
            }
        }
        progress.inc(1);
    }

    writer.finish()?;
    progress.finish_with_message("done");
    Ok(output)
}

/// Pull the encrypted title key out of a `.tik` entry and decrypt it with
/// the title kek of the archive's key generation.
///
/// The generation comes from the first parseable `.nca` entry; all NCAs of
/// an NSP share one. Returns `None` (with a warning) when any step fails,
/// and compression proceeds with whatever the key areas provide.
fn ticket_title_key(pfs0: &Pfs0, file: &File, keyset: &Keyset) -> Option<[u8; 0x10]> {
    let ticket = pfs0
        .files
        .iter()
        .find(|f| f.name.to_lowercase().ends_with(".tik"))?;
    info!(name = %ticket.name, "Found ticket");

    if ticket.entry.data_size < TICKET_TITLE_KEY_OFFSET + 0x10 {
        warn!(name = %ticket.name, "Ticket too small to hold a title key");
        return None;
    }

    let mut encrypted = [0u8; 0x10];
    if let Err(e) = file.read_exact_at(
        &mut encrypted,
        pfs0.entry_offset(ticket) + TICKET_TITLE_KEY_OFFSET,
    ) {
        warn!(error = %e, "Failed to read ticket");
        return None;
    }

    let key_gen = pfs0
        .files
        .iter()
        .filter(|f| f.name.to_lowercase().ends_with(".nca"))
        .find_map(|f| {
            let offset = pfs0.entry_offset(f);
            let reader = SubFile::new(file, offset, offset + f.entry.data_size);
            Nca::new(reader, keyset).ok()
        })
        .map(|nca| nca.header.effective_key_generation())?;

    match keyset.decrypt_ticket_title_key(&encrypted, key_gen) {
        Ok(key) => {
            info!(key_gen, "Decrypted title key from ticket");
            Some(key)
        }
        Err(e) => {
            warn!(key_gen, error = %e, "Failed to decrypt ticket title key");
            None
        }
    }
}

fn convert_nca(input: &Path, file: &File, keyset: &Keyset, level: i32) -> Result<PathBuf> {
    let nca = Nca::new(file, keyset)?;
    if nca.title_key().is_none() {
        // Sections of type None/XTS still compress correctly; CTR sections
        // would come out garbled on decompression.
        warn!("No title key available for this NCA; proceeding anyway");
    }

    let total_size = file.metadata()?.len();
    let mut output = input.as_os_str().to_owned();
    output.push(".nsz");
    let output = PathBuf::from(output);

    info!(output = %output.display(), "Compressing NCA");
    let mut out = File::create(&output)?;
    compress::compress_nca(&nca, &mut out, total_size, level)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::formats::nca::testing::{
        build_header_region, ctr_fs_header, test_keyset, TEST_HEADER_KEY, TEST_TITLE_KEY,
    };
    use std::io::{Cursor, Read, Seek, SeekFrom};

    /// A Program NCA whose key area is zeroed: only the ticket can supply
    /// the right title key. Body is CTR-encrypted `plaintext`.
    fn build_game_nca(keyset: &Keyset, plaintext: &[u8]) -> Vec<u8> {
        let total_size = UNCOMPRESSABLE_HEADER_SIZE as usize + plaintext.len();
        let media_end = (total_size as u64 / 0x200) as u32;
        let fs_header = ctr_fs_header(0x31, 0x32);
        let base_iv = fs_header.base_iv();

        let mut region = build_header_region(keyset, 0, (3, 5), &[(0x20, media_end, fs_header)]);
        // Wipe the wrapped key so the key-area unwrap yields garbage.
        region[0x300..0x340].fill(0);

        let mut file = region;
        crypto::encrypt_nca_header(&mut file, &TEST_HEADER_KEY);
        file.resize(UNCOMPRESSABLE_HEADER_SIZE as usize, 0);

        let mut body = plaintext.to_vec();
        crypto::apply_ctr(&mut body, &TEST_TITLE_KEY, &base_iv, UNCOMPRESSABLE_HEADER_SIZE);
        file.extend_from_slice(&body);
        file
    }

    fn build_ticket(keyset: &Keyset, key_gen: usize) -> Vec<u8> {
        let mut tik = vec![0u8; 0x2C0];
        let master = keyset
            .get_key::<16>(&format!("master_key_{:02x}", key_gen))
            .unwrap();
        let kek = crypto::ecb_decrypt(keyset.raw_key("titlekek_source").unwrap(), &master).unwrap();
        let encrypted =
            crypto::ecb_encrypt(&TEST_TITLE_KEY, &kek[..16].try_into().unwrap()).unwrap();
        tik[0x180..0x190].copy_from_slice(&encrypted);
        tik
    }

    #[test]
    fn test_nsp_repack_with_ticket() {
        let keyset = test_keyset();
        let dir = tempfile::tempdir().unwrap();

        let plaintext: Vec<u8> = (0..0x2000u32).map(|i| (i % 7) as u8).collect();
        let game = build_game_nca(&keyset, &plaintext);
        let control = vec![0x5Au8; 0x400];
        // Key generations (3, 5) -> effective 4.
        let ticket = build_ticket(&keyset, 4);

        let input = dir.path().join("game.nsp");
        {
            let names = vec![
                "control.nacp.xml".to_string(),
                "game.nca".to_string(),
                "0.tik".to_string(),
            ];
            let mut writer = Pfs0Writer::new(File::create(&input).unwrap(), &names).unwrap();
            writer.add_file(0, &mut Cursor::new(&control)).unwrap();
            writer.add_file(1, &mut Cursor::new(&game)).unwrap();
            writer.add_file(2, &mut Cursor::new(&ticket)).unwrap();
            writer.finish().unwrap();
        }

        let output = convert(&input, &keyset, 3).unwrap();
        assert_eq!(output, dir.path().join("game.nsz"));

        let mut out_file = File::open(&output).unwrap();
        let pfs0 = Pfs0::parse(&mut out_file).unwrap();
        let names: Vec<_> = pfs0.files.iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, ["control.nacp.xml", "game.ncz", "0.tik"]);

        // Passthrough entries are byte-for-byte copies.
        for (index, expected) in [(0usize, &control), (2, &ticket)] {
            let offset = pfs0.entry_offset(&pfs0.files[index]);
            let mut data = vec![0u8; pfs0.files[index].entry.data_size as usize];
            out_file.seek(SeekFrom::Start(offset)).unwrap();
            out_file.read_exact(&mut data).unwrap();
            assert_eq!(&data, expected);
        }

        // The NCZ prefix is the verbatim encrypted header, and its single
        // block inflates back to the plaintext body, proving the ticket key
        // was injected over the useless key area.
        let ncz_offset = pfs0.entry_offset(&pfs0.files[1]) as usize;
        let ncz_size = pfs0.files[1].entry.data_size as usize;
        let mut ncz = vec![0u8; ncz_size];
        out_file.seek(SeekFrom::Start(ncz_offset as u64)).unwrap();
        out_file.read_exact(&mut ncz).unwrap();

        assert_eq!(&ncz[..0x4000], &game[..0x4000]);
        assert_eq!(&ncz[0x4000..0x4008], b"NCZSECTN");
        let section_count = u64::from_le_bytes(ncz[0x4008..0x4010].try_into().unwrap());
        assert_eq!(section_count, 1);
        assert_eq!(&ncz[0x4050..0x4058], b"NCZBLOCK");
        let block_count = u32::from_le_bytes(ncz[0x405C..0x4060].try_into().unwrap());
        assert_eq!(block_count, 1);

        let size_table_at = 0x4068;
        let block_size =
            u32::from_le_bytes(ncz[size_table_at..size_table_at + 4].try_into().unwrap()) as usize;
        let block = &ncz[size_table_at + 4..size_table_at + 4 + block_size];
        assert_eq!(zstd::decode_all(block).unwrap(), plaintext);
    }

    #[test]
    fn test_single_nca_mode() {
        let keyset = test_keyset();
        let dir = tempfile::tempdir().unwrap();

        let plaintext = vec![0x42u8; 0x1000];
        let game = build_game_nca(&keyset, &plaintext);
        let input = dir.path().join("game.nca");
        std::fs::write(&input, &game).unwrap();

        // No ticket in this mode, so the garbled key-area key is used; the
        // file must still come out structurally valid.
        let output = convert(&input, &keyset, 3).unwrap();
        assert_eq!(output, dir.path().join("game.nca.nsz"));

        let ncz = std::fs::read(&output).unwrap();
        assert_eq!(&ncz[..0x4000], &game[..0x4000]);
        assert_eq!(&ncz[0x4000..0x4008], b"NCZSECTN");
    }

    #[test]
    fn test_uppercase_nca_extension_is_compressed() {
        let keyset = test_keyset();
        let dir = tempfile::tempdir().unwrap();

        let plaintext = vec![0x33u8; 0x1000];
        let game = build_game_nca(&keyset, &plaintext);

        let input = dir.path().join("game.nsp");
        {
            let names = vec!["Game.NCA".to_string()];
            let mut writer = Pfs0Writer::new(File::create(&input).unwrap(), &names).unwrap();
            writer.add_file(0, &mut Cursor::new(&game)).unwrap();
            writer.finish().unwrap();
        }

        let output = convert(&input, &keyset, 3).unwrap();
        let mut out_file = File::open(&output).unwrap();
        let pfs0 = Pfs0::parse(&mut out_file).unwrap();

        // Extension matching is case-insensitive; the rename keeps the
        // entry's original casing.
        assert_eq!(pfs0.files[0].name, "Game.ncz");
        let offset = pfs0.entry_offset(&pfs0.files[0]) as usize;
        let mut magic = vec![0u8; 8];
        out_file.seek(SeekFrom::Start(offset as u64 + 0x4000)).unwrap();
        out_file.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"NCZSECTN");
    }

    #[test]
    fn test_output_path_rules() {
        assert_eq!(
            output_path_for_nsp(Path::new("/x/game.nsp")),
            PathBuf::from("/x/game.nsz")
        );
        assert_eq!(
            output_path_for_nsp(Path::new("/x/game.pfs0")),
            PathBuf::from("/x/game.pfs0.nsz")
        );
    }
}
