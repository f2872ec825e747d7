//! # Nintendo PFS0 (PartitionFS0) format
//!
//! The Partition File System (PFS0) is the flat archive format Nintendo
//! Switch uses for packaging files. NSP files are PFS0 images; NSZ files are
//! PFS0 images whose eligible `.nca` entries have been replaced by
//! compressed `.ncz` entries.
//!
//! Layout: a 0x10-byte header, one 0x18-byte entry per file, a string table
//! of NUL-terminated names, then the concatenated file data.

use std::io::{Read, Seek, SeekFrom, Write};

use binrw::prelude::*;

use crate::error::{Error, Result};
use crate::formats::nca::Nca;
use crate::io::ReadAt;

/// PFS0 header at the start of the archive.
///
/// # Format Layout
/// - 0x00: Magic "PFS0" (4 bytes, validated by binrw)
/// - 0x04: Number of files (4 bytes)
/// - 0x08: String table size (4 bytes)
/// - 0x0C: Reserved (4 bytes)
#[binrw]
#[brw(little, magic = b"PFS0")]
#[derive(Debug)]
pub struct Pfs0Header {
    /// Number of files contained in this PFS0 archive
    pub num_files: u32,
    /// Size of the string table in bytes
    pub string_table_size: u32,
    /// Reserved field, typically zeros
    pub reserved: [u8; 4],
}

/// A single file entry.
///
/// `data_offset` is relative to the start of the data region, which begins
/// after the header, all entries, and the string table.
#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct Pfs0Entry {
    /// Offset to file data, relative to the start of the data region
    pub data_offset: u64,
    /// Size of the file data in bytes
    pub data_size: u64,
    /// Offset into the string table for the NUL-terminated filename
    pub name_offset: u32,
    /// Reserved field, usually zeros
    pub reserved: [u8; 4],
}

/// A file within the archive with its name resolved.
#[derive(Debug)]
pub struct Pfs0File {
    pub name: String,
    pub entry: Pfs0Entry,
}

/// A parsed PFS0 archive.
pub struct Pfs0 {
    pub header: Pfs0Header,
    pub files: Vec<Pfs0File>,
}

impl Pfs0 {
    /// Parse the header, entry table and string table from `reader`.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let header: Pfs0Header = reader.read_le()?;

        let entries = (0..header.num_files)
            .map(|_| reader.read_le::<Pfs0Entry>())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut string_table = vec![0u8; header.string_table_size as usize];
        reader.read_exact(&mut string_table)?;

        let files = entries
            .into_iter()
            .map(|entry| {
                let name = read_name(&string_table, entry.name_offset)?;
                Ok(Pfs0File { name, entry })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { header, files })
    }

    /// Absolute file offset where the data region begins:
    /// header + entry table + string table.
    pub fn data_region_offset(&self) -> u64 {
        0x10 + 0x18 * self.header.num_files as u64 + self.header.string_table_size as u64
    }

    /// Absolute offset of an entry's data.
    pub fn entry_offset(&self, file: &Pfs0File) -> u64 {
        self.data_region_offset() + file.entry.data_offset
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

fn read_name(string_table: &[u8], offset: u32) -> Result<String> {
    let start = offset as usize;
    if start >= string_table.len() {
        return Err(Error::InvalidFormat(
            "name offset beyond string table".to_string(),
        ));
    }
    let end = string_table[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .unwrap_or(string_table.len());

    String::from_utf8(string_table[start..end].to_vec())
        .map_err(|_| Error::InvalidFormat("file name is not UTF-8".to_string()))
}

/// Sequential PFS0 writer with a back-patched header.
///
/// Entry sizes are only known after compression, so the writer seeks past
/// the computed header, streams the data region, and writes the header,
/// entry table and string table in [`Pfs0Writer::finish`].
pub struct Pfs0Writer<W> {
    writer: W,
    string_table: Vec<u8>,
    entries: Vec<Pfs0Entry>,
    data_offset: u64,
}

impl<W: Write + Seek> Pfs0Writer<W> {
    /// Start an archive holding `names`, in order.
    pub fn new(mut writer: W, names: &[String]) -> Result<Self> {
        let mut string_table = Vec::new();
        let mut entries = Vec::with_capacity(names.len());

        for name in names {
            entries.push(Pfs0Entry {
                name_offset: string_table.len() as u32,
                ..Default::default()
            });
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
        }

        let header_size = 0x10 + 0x18 * entries.len() as u64 + string_table.len() as u64;
        writer.seek(SeekFrom::Start(header_size))?;

        Ok(Self {
            writer,
            string_table,
            entries,
            data_offset: 0,
        })
    }

    /// Copy the `index`-th file into the archive byte for byte.
    pub fn add_file<R: Read>(&mut self, index: usize, reader: &mut R) -> Result<()> {
        self.entries[index].data_offset = self.data_offset;
        let written = std::io::copy(reader, &mut self.writer)?;
        self.entries[index].data_size = written;
        self.data_offset += written;
        Ok(())
    }

    /// Compress the `index`-th file (an NCA) into the archive as NCZ.
    pub fn add_compressed<R: ReadAt + Sync>(
        &mut self,
        index: usize,
        nca: &Nca<R>,
        total_size: u64,
        level: i32,
    ) -> Result<()> {
        self.entries[index].data_offset = self.data_offset;
        let written = crate::compress::compress_nca(nca, &mut self.writer, total_size, level)?;
        self.entries[index].data_size = written;
        self.data_offset += written;
        Ok(())
    }

    /// Seek back and write the header, entry table and string table.
    pub fn finish(mut self) -> Result<W> {
        self.writer.seek(SeekFrom::Start(0))?;

        let header = Pfs0Header {
            num_files: self.entries.len() as u32,
            string_table_size: self.string_table.len() as u32,
            reserved: [0; 4],
        };
        header.write_le(&mut self.writer)?;
        for entry in &self.entries {
            entry.write_le(&mut self.writer)?;
        }
        self.writer.write_all(&self.string_table)?;
        self.writer.flush()?;

        Ok(self.writer)
    }
}
