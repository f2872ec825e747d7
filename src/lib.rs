//! **nsz** - compress Nintendo Switch NSP/NCA archives into NSZ/NCZ.
//!
//! An NSZ is a PFS0 archive whose eligible NCA entries have been replaced by
//! NCZ files: the 0x4000-byte encrypted NCA header kept verbatim, the body
//! decrypted and re-expressed as independently decodable zstd blocks, with a
//! section table that lets a decompressor re-apply the original AES-CTR
//! encryption.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`formats::keyset`] | `prod.keys` loading and the key derivation ladder |
//! | [`formats::nca`]    | NCA header decryption, BKTR parsing, section planning |
//! | [`formats::ncz`]    | NCZ wire structures |
//! | [`formats::pfs0`]   | PFS0 (NSP) reading and writing |
//! | [`compress`]        | Parallel block compression and the NCZ writer |
//! | [`convert`]         | Per-file driver (NSP repacking, ticket handling) |

pub mod compress;
pub mod convert;
pub mod crypto;
pub mod error;
pub mod formats;
pub mod io;

pub use error::{Error, Result};
