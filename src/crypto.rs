//! AES primitives for Switch content.
//!
//! Three modes are in play: ECB for the key derivation ladder and key-area
//! unwrapping, CTR for section data, and XTS with Nintendo's non-standard
//! tweak for the NCA header. The CTR helper takes the absolute file offset so
//! that any 16-byte-aligned range can be decrypted in isolation; this is what
//! lets the block compression workers process blocks out of order.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use xts_mode::Xts128;

use crate::error::{Error, Result};

pub const AES_BLOCK_SIZE: usize = 0x10;

/// Sector size of the XTS-encrypted NCA header region.
pub const HEADER_SECTOR_SIZE: usize = 0x200;

/// Builds a tweak for Nintendo XTS operations.
///
/// The sector index is stored big-endian, the reverse of the IEEE tweak.
pub fn nintendo_tweak(sector_index: u128) -> [u8; 16] {
    sector_index.to_be_bytes()
}

fn check_aligned(len: usize) -> Result<()> {
    if len % AES_BLOCK_SIZE != 0 {
        return Err(Error::CryptoSize {
            len,
            align: AES_BLOCK_SIZE,
        });
    }
    Ok(())
}

/// AES-128-ECB decryption without padding.
///
/// ECB is only safe here because every block is an independent random key;
/// the Switch key ladder is built out of 16-byte ECB unwraps.
pub fn ecb_decrypt(data: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    check_aligned(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

/// AES-128-ECB encryption without padding.
pub fn ecb_encrypt(data: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    check_aligned(data.len())?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(out)
}

/// Applies the AES-128-CTR keystream for data located at `absolute_offset`.
///
/// `base_iv` carries the section-specific counter in bytes [0..8); bytes
/// [8..16) are replaced with the big-endian block number (`offset / 16`).
/// Because the counter is a pure function of position, decrypting a range in
/// one call or in any partition of it yields identical bytes.
pub fn apply_ctr(data: &mut [u8], key: &[u8; 16], base_iv: &[u8; 16], absolute_offset: u64) {
    let mut iv = *base_iv;
    iv[8..].copy_from_slice(&(absolute_offset >> 4).to_be_bytes());

    let mut cipher = Ctr128BE::<Aes128>::new(key.into(), (&iv).into());
    cipher.apply_keystream(data);
}

/// Builds the XTS cipher for the NCA header from the 0x20-byte `header_key`.
///
/// The first half is the data unit key, the second half the tweak key.
pub fn header_xts(header_key: &[u8; 0x20]) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(&header_key[..0x10]));
    let cipher_2 = Aes128::new(GenericArray::from_slice(&header_key[0x10..]));
    Xts128::new(cipher_1, cipher_2)
}

/// XTS-decrypts the 0xC00-byte NCA header region in place.
///
/// Sectors are 0x200 bytes, numbered from 0, with the Nintendo tweak.
pub fn decrypt_nca_header(data: &mut [u8], header_key: &[u8; 0x20]) {
    header_xts(header_key).decrypt_area(data, HEADER_SECTOR_SIZE, 0, nintendo_tweak);
}

/// XTS-encrypts an NCA header region in place. The inverse of
/// [`decrypt_nca_header`], used when building fixtures.
pub fn encrypt_nca_header(data: &mut [u8], header_key: &[u8; 0x20]) {
    header_xts(header_key).encrypt_area(data, HEADER_SECTOR_SIZE, 0, nintendo_tweak);
}
