//! Payload encryption of audio datagrams.
//!
//! Both ends share a 256 bit application key. Every datagram carries its own
//! initialization vector.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

pub type Key = [u8; 32];

/// Bytes of initialization vector [`Aes256Cbc`] expects.
pub const IV_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key or initialization vector length")]
    InvalidKeyOrIv,
    #[error("bad padding, wrong key or corrupted payload")]
    Padding,
    #[error("output buffer too small")]
    OutputTooSmall,
}

pub trait Decryptor {
    /// Decrypts `ciphertext` into `out`, returning the plaintext length.
    fn decrypt(&self, key: &Key, iv: &[u8], ciphertext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;
}

pub trait Encryptor {
    /// Upper bound of the ciphertext length for `plaintext_len` bytes.
    fn ciphertext_len(&self, plaintext_len: usize) -> usize;

    /// Encrypts `plaintext` into `out`, returning the ciphertext length.
    fn encrypt(&self, key: &Key, iv: &[u8], plaintext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError>;
}

/// AES-256 in CBC mode, PKCS#7 padded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes256Cbc;

impl Decryptor for Aes256Cbc {
    fn decrypt(&self, key: &Key, iv: &[u8], ciphertext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        if out.len() < ciphertext.len() {
            return Err(CryptoError::OutputTooSmall);
        }

        let dec = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyOrIv)?;

        dec.decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out)
            .map(<[u8]>::len)
            .map_err(|_| CryptoError::Padding)
    }
}

impl Encryptor for Aes256Cbc {
    #[inline(always)]
    fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        (plaintext_len / IV_LEN + 1) * IV_LEN
    }

    fn encrypt(&self, key: &Key, iv: &[u8], plaintext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let enc = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::InvalidKeyOrIv)?;

        enc.encrypt_padded_b2b_mut::<Pkcs7>(plaintext, out)
            .map(<[u8]>::len)
            .map_err(|_| CryptoError::OutputTooSmall)
    }
}

/// No encryption at all. The IV is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Decryptor for Plaintext {
    fn decrypt(&self, _: &Key, _: &[u8], ciphertext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        let out = out
            .get_mut(..ciphertext.len())
            .ok_or(CryptoError::OutputTooSmall)?;
        out.copy_from_slice(ciphertext);
        Ok(out.len())
    }
}

impl Encryptor for Plaintext {
    #[inline(always)]
    fn ciphertext_len(&self, plaintext_len: usize) -> usize {
        plaintext_len
    }

    fn encrypt(&self, key: &Key, iv: &[u8], plaintext: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        self.decrypt(key, iv, plaintext, out)
    }
}
