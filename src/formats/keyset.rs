//! Switch key material: loading, derivation and title-key operations.
//!
//! A [`Keyset`] is loaded once from a `prod.keys`-style file, derived once
//! with [`Keyset::derive_keys`], and read-only afterwards, so it can be
//! shared freely with the compression workers.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use hex::FromHex;

use crate::crypto;
use crate::error::{Error, Result};

/// Number of master key generations understood by this crate.
pub const MAX_KEY_GENERATION: usize = 32;

/// Key area encryption key families.
const KAK_SOURCES: [&str; 3] = [
    "key_area_key_application_source",
    "key_area_key_ocean_source",
    "key_area_key_system_source",
];

#[derive(Clone, Default)]
pub struct Keyset {
    /// Raw storage for every key found in the keys file.
    raw_keys: HashMap<String, Vec<u8>>,

    /// Cached header key for NCA header decryption.
    header_key_cache: Option<[u8; 0x20]>,

    /// Derived per-generation title keks.
    title_keks: [Option<[u8; 0x10]>; MAX_KEY_GENERATION],

    /// Derived per-generation key area keys, indexed Application/Ocean/System.
    key_area_keys: [[Option<[u8; 0x10]>; MAX_KEY_GENERATION]; 3],
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material must never end up in logs; only report inventory.
        f.debug_struct("Keyset")
            .field("total_keys", &self.raw_keys.len())
            .field("has_header_key", &self.header_key_cache.is_some())
            .field(
                "derived_title_keks",
                &self.title_keks.iter().filter(|k| k.is_some()).count(),
            )
            .field(
                "derived_application_kaks",
                &self.key_area_keys[0].iter().filter(|k| k.is_some()).count(),
            )
            .finish()
    }
}

impl Keyset {
    /// Load a keyset from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Load a keyset from the first existing default location:
    /// `./prod.keys`, `./keys.txt`, `~/.switch/prod.keys`,
    /// `~/.switch/keys.txt`.
    pub fn load_default() -> Result<Self> {
        let mut paths = vec![PathBuf::from("prod.keys"), PathBuf::from("keys.txt")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".switch").join("prod.keys"));
            paths.push(home.join(".switch").join("keys.txt"));
        }

        for path in paths {
            if path.exists() {
                tracing::info!(path = %path.display(), "Loading keys");
                return Self::from_file(path);
            }
        }

        Err(Error::NotFound(
            "no keys file found in default locations".to_string(),
        ))
    }

    /// Parse a `name = hexvalue` keys file.
    ///
    /// Blank lines and `#`/`;` comments are ignored; lines with invalid hex
    /// are skipped with a warning.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut keyset = Keyset::default();
        let mut keys_loaded = 0;

        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            let key_data = match Vec::from_hex(value) {
                Ok(data) => data,
                Err(_) => {
                    tracing::warn!(key = name, "Skipping invalid hex value");
                    continue;
                }
            };

            keyset.raw_keys.insert(name.to_string(), key_data);
            keys_loaded += 1;
        }

        keyset.update_caches();
        tracing::info!(keys_loaded, "Parsed keys file");

        Ok(keyset)
    }

    fn update_caches(&mut self) {
        if let Some(key_data) = self.raw_keys.get("header_key") {
            if key_data.len() == 0x20 {
                let mut header_key = [0u8; 0x20];
                header_key.copy_from_slice(key_data);
                self.header_key_cache = Some(header_key);
            }
        }
    }

    /// Derive the title keks and key area keys for every master key
    /// generation present in the keys file.
    ///
    /// Call once after loading; absent master keys leave their generation
    /// slot empty, which only becomes an error when a key of that generation
    /// is demanded.
    pub fn derive_keys(&mut self) {
        let Some(aes_kek_gen) = self.raw_key("aes_kek_generation_source") else {
            tracing::warn!("Missing aes_kek_generation_source; cannot derive keys");
            return;
        };
        let Some(aes_key_gen) = self.raw_key("aes_key_generation_source") else {
            tracing::warn!("Missing aes_key_generation_source; cannot derive keys");
            return;
        };
        let aes_kek_gen = aes_kek_gen.to_vec();
        let aes_key_gen = aes_key_gen.to_vec();
        let title_kek_source = self.raw_key("titlekek_source").map(<[u8]>::to_vec);
        let kak_sources: Vec<Option<Vec<u8>>> = KAK_SOURCES
            .iter()
            .map(|name| self.raw_key(name).map(<[u8]>::to_vec))
            .collect();

        for generation in 0..MAX_KEY_GENERATION {
            let name = format!("master_key_{:02x}", generation);
            let Some(master_key) = self.get_key::<16>(&name) else {
                continue;
            };

            if let Some(source) = &title_kek_source {
                if let Ok(kek) = crypto::ecb_decrypt(source, &master_key) {
                    self.title_keks[generation] = kek.try_into().ok();
                }
            }

            for (family, source) in kak_sources.iter().enumerate() {
                let Some(source) = source else { continue };
                if let Ok(kak) = derive_key_area_key(
                    source,
                    &master_key,
                    &aes_kek_gen,
                    &aes_key_gen,
                ) {
                    self.key_area_keys[family][generation] = kak.try_into().ok();
                }
            }
        }

        tracing::debug!(keyset = ?self, "Key derivation complete");
    }

    /// Unwrap a key-area-wrapped title key with the Application KAK of the
    /// given generation.
    pub fn unwrap_title_key(&self, wrapped: &[u8; 0x10], key_gen: usize) -> Result<[u8; 0x10]> {
        let kak = self
            .key_area_keys
            .first()
            .and_then(|family| family.get(key_gen))
            .and_then(|k| k.as_ref())
            .ok_or_else(|| {
                Error::KeyNotDerived(format!("key_area_key_application_{:02x}", key_gen))
            })?;

        let dec = crypto::ecb_decrypt(wrapped, kak)?;
        Ok(dec.try_into().expect("ECB output is 16 bytes"))
    }

    /// Decrypt a ticket-encrypted title key with the title kek of the given
    /// generation.
    pub fn decrypt_ticket_title_key(
        &self,
        encrypted: &[u8; 0x10],
        key_gen: usize,
    ) -> Result<[u8; 0x10]> {
        let kek = self
            .title_keks
            .get(key_gen)
            .and_then(|k| k.as_ref())
            .ok_or_else(|| Error::KeyNotDerived(format!("title_kek_{:02x}", key_gen)))?;

        let dec = crypto::ecb_decrypt(encrypted, kek)?;
        Ok(dec.try_into().expect("ECB output is 16 bytes"))
    }

    /// The 0x20-byte NCA header key, if present.
    pub fn header_key(&self) -> Option<&[u8; 0x20]> {
        self.header_key_cache.as_ref()
    }

    /// Look up a raw key by exact name.
    pub fn raw_key(&self, name: &str) -> Option<&[u8]> {
        self.raw_keys.get(name).map(|v| v.as_slice())
    }

    /// Look up a fixed-size key by exact name.
    pub fn get_key<const N: usize>(&self, name: &str) -> Option<[u8; N]> {
        self.raw_keys
            .get(name)
            .and_then(|data| data.as_slice().try_into().ok())
    }

    /// Whether the keyset can decrypt NCA headers and at least one
    /// generation of content keys.
    pub fn has_required_nca_keys(&self) -> bool {
        self.header_key_cache.is_some()
            && self.key_area_keys[0].iter().any(|k| k.is_some())
            && self.title_keks.iter().any(|k| k.is_some())
    }
}

/// The key area key ladder:
/// `ECB_Dec(key_seed, ECB_Dec(source, ECB_Dec(kek_seed, master_key)))`.
fn derive_key_area_key(
    source: &[u8],
    master_key: &[u8; 16],
    kek_seed: &[u8],
    key_seed: &[u8],
) -> Result<Vec<u8>> {
    let kek = crypto::ecb_decrypt(kek_seed, master_key)?;
    let kek: [u8; 16] = kek
        .try_into()
        .map_err(|_| Error::InvalidFormat("kek seed must be 16 bytes".to_string()))?;

    let src_kek = crypto::ecb_decrypt(source, &kek)?;
    let src_kek: [u8; 16] = src_kek
        .try_into()
        .map_err(|_| Error::InvalidFormat("key area source must be 16 bytes".to_string()))?;

    crypto::ecb_decrypt(key_seed, &src_kek)
}
