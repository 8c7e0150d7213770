/*!
AEAD envelope encryption for chunk payloads.

Every stored envelope has the shape `type_byte | header_metadata | ciphertext
| tag`, where `header_metadata` is the scheme's nonce/IV and `type_byte |
header_metadata` together form the additional authenticated data. Two of the
four schemes (`Aes256CtrHmacSha256`, `Aes256CtrBlake2b`) compose a stream
cipher with a keyed MAC over the AAD and ciphertext to get AEAD properties;
the other two (`Aes256Ocb`, `ChaCha20Poly1305`) are AEAD constructions
directly.
*/

// This is an encrypting archiver; every arm below is reachable depending on
// the scheme the repository was created with.
#![allow(clippy::match_same_arms)]

use aead::{Aead, KeyInit, Payload};
use aes::Aes256;
use chacha20poly1305::ChaCha20Poly1305;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use ocb3::Ocb3;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::repository::Key;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Error describing things that can go wrong with encryption/decryption
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("AEAD tag verification failed")]
    TagMismatch,
    #[error("Envelope was truncated or malformed")]
    Malformed,
    #[error("Envelope's type byte did not match the Encryption variant used to open it")]
    WrongScheme,
}

type Result<T> = std::result::Result<T, EncryptionError>;

/// Tag for the encryption algorithm and nonce/IV used by a particular chunk
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub enum Encryption {
    NoEncryption,
    /// AES-256 in CTR mode, authenticated by encrypt-then-MAC with HMAC-SHA256.
    Aes256CtrHmacSha256 { iv: [u8; 16] },
    /// AES-256 in CTR mode, authenticated by encrypt-then-MAC with keyed BLAKE2b.
    Aes256CtrBlake2b { iv: [u8; 16] },
    /// AES-256-OCB, a single-pass AEAD construction.
    Aes256Ocb { nonce: [u8; 12] },
    /// ChaCha20-Poly1305, a single-pass AEAD construction.
    ChaCha20Poly1305 { nonce: [u8; 12] },
}

impl Encryption {
    pub fn new_aes256ctr_hmac() -> Encryption {
        let mut iv = [0_u8; 16];
        thread_rng().fill_bytes(&mut iv);
        Encryption::Aes256CtrHmacSha256 { iv }
    }

    pub fn new_aes256ctr_blake2b() -> Encryption {
        let mut iv = [0_u8; 16];
        thread_rng().fill_bytes(&mut iv);
        Encryption::Aes256CtrBlake2b { iv }
    }

    pub fn new_aes256ocb() -> Encryption {
        let mut nonce = [0_u8; 12];
        thread_rng().fill_bytes(&mut nonce);
        Encryption::Aes256Ocb { nonce }
    }

    pub fn new_chacha20poly1305() -> Encryption {
        let mut nonce = [0_u8; 12];
        thread_rng().fill_bytes(&mut nonce);
        Encryption::ChaCha20Poly1305 { nonce }
    }

    /// Returns the key length of this encryption method in bytes.
    ///
    /// `NoEncryption` has a key length of 16 bytes, as some things rely on a
    /// non-zero key length.
    pub fn key_length(&self) -> usize {
        match self {
            Encryption::NoEncryption => 16,
            Encryption::Aes256CtrHmacSha256 { .. }
            | Encryption::Aes256CtrBlake2b { .. }
            | Encryption::Aes256Ocb { .. }
            | Encryption::ChaCha20Poly1305 { .. } => 32,
        }
    }

    fn type_byte(self) -> u8 {
        match self {
            Encryption::NoEncryption => 0,
            Encryption::Aes256CtrHmacSha256 { .. } => 1,
            Encryption::Aes256CtrBlake2b { .. } => 2,
            Encryption::Aes256Ocb { .. } => 3,
            Encryption::ChaCha20Poly1305 { .. } => 4,
        }
    }

    /// Returns a copy of this tag with a freshly generated nonce/IV, same scheme.
    pub fn new_nonce(self) -> Encryption {
        match self {
            Encryption::NoEncryption => Encryption::NoEncryption,
            Encryption::Aes256CtrHmacSha256 { .. } => Encryption::new_aes256ctr_hmac(),
            Encryption::Aes256CtrBlake2b { .. } => Encryption::new_aes256ctr_blake2b(),
            Encryption::Aes256Ocb { .. } => Encryption::new_aes256ocb(),
            Encryption::ChaCha20Poly1305 { .. } => Encryption::new_chacha20poly1305(),
        }
    }

    fn header_bytes(self) -> Vec<u8> {
        match self {
            Encryption::NoEncryption => Vec::new(),
            Encryption::Aes256CtrHmacSha256 { iv } | Encryption::Aes256CtrBlake2b { iv } => {
                iv.to_vec()
            }
            Encryption::Aes256Ocb { nonce } | Encryption::ChaCha20Poly1305 { nonce } => {
                nonce.to_vec()
            }
        }
    }

    /// Encrypts `data` under `key`, producing a full `type_byte | header |
    /// ciphertext | tag` envelope. Draws a fresh nonce/IV for this call.
    pub fn seal(self, data: &[u8], key: &Key) -> Vec<u8> {
        let fresh = self.new_nonce();
        fresh.seal_bytes(data, key.key())
    }

    /// Like [`seal`](Self::seal), but takes a raw key slice instead of a `Key`
    /// bundle (used for key-wrapping, where there is no chunk id/hmac split).
    pub fn seal_bytes(self, data: &[u8], key: &[u8]) -> Vec<u8> {
        let aad = {
            let mut aad = vec![self.type_byte()];
            aad.extend_from_slice(&self.header_bytes());
            aad
        };
        let mut envelope = aad.clone();
        match self {
            Encryption::NoEncryption => envelope.extend_from_slice(data),
            Encryption::Aes256CtrHmacSha256 { iv } => {
                let ciphertext = aes256_ctr_apply(key, &iv, data);
                let mut mac = <HmacSha256 as Mac>::new_from_slice(padded_key(key, 32).as_slice())
                    .expect("HMAC accepts any key length");
                mac.update(&aad);
                mac.update(&ciphertext);
                let tag = mac.finalize().into_bytes();
                envelope.extend_from_slice(&ciphertext);
                envelope.extend_from_slice(&tag);
            }
            Encryption::Aes256CtrBlake2b { iv } => {
                let ciphertext = aes256_ctr_apply(key, &iv, data);
                let tag = blake2b_mac(key, &aad, &ciphertext);
                envelope.extend_from_slice(&ciphertext);
                envelope.extend_from_slice(&tag);
            }
            Encryption::Aes256Ocb { nonce } => {
                let cipher = Ocb3::<Aes256>::new(padded_key(key, 32).as_slice().into());
                let sealed = cipher
                    .encrypt(nonce[..].into(), Payload { msg: data, aad: &aad })
                    .expect("OCB3 sealing with a fresh nonce cannot fail");
                envelope.extend_from_slice(&sealed);
            }
            Encryption::ChaCha20Poly1305 { nonce } => {
                let cipher = ChaCha20Poly1305::new(padded_key(key, 32).as_slice().into());
                let sealed = cipher
                    .encrypt(nonce[..].into(), Payload { msg: data, aad: &aad })
                    .expect("ChaCha20-Poly1305 sealing with a fresh nonce cannot fail");
                envelope.extend_from_slice(&sealed);
            }
        }
        envelope
    }

    /// Opens an envelope previously produced by [`seal`](Self::seal).
    ///
    /// `self` supplies the scheme to attempt to verify with; the envelope's
    /// own `type_byte` must agree or `WrongScheme` is returned.
    pub fn open(&self, envelope: &[u8], key: &Key) -> Result<Vec<u8>> {
        self.open_bytes(envelope, key.key())
    }

    pub fn open_bytes(&self, envelope: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        if envelope.is_empty() || envelope[0] != self.type_byte() {
            return Err(EncryptionError::WrongScheme);
        }
        let header_len = self.header_bytes().len();
        if envelope.len() < 1 + header_len {
            return Err(EncryptionError::Malformed);
        }
        let aad = &envelope[..1 + header_len];
        let body = &envelope[1 + header_len..];
        match self {
            Encryption::NoEncryption => Ok(body.to_vec()),
            Encryption::Aes256CtrHmacSha256 { iv } => {
                if body.len() < 32 {
                    return Err(EncryptionError::Malformed);
                }
                let (ciphertext, tag) = body.split_at(body.len() - 32);
                let mut mac = <HmacSha256 as Mac>::new_from_slice(padded_key(key, 32).as_slice())
                    .expect("HMAC accepts any key length");
                mac.update(aad);
                mac.update(ciphertext);
                mac.verify_slice(tag)
                    .map_err(|_| EncryptionError::TagMismatch)?;
                Ok(aes256_ctr_apply(key, iv, ciphertext))
            }
            Encryption::Aes256CtrBlake2b { iv } => {
                if body.len() < 64 {
                    return Err(EncryptionError::Malformed);
                }
                let (ciphertext, tag) = body.split_at(body.len() - 64);
                let expected = blake2b_mac(key, aad, ciphertext);
                if !constant_time_eq(&expected, tag) {
                    return Err(EncryptionError::TagMismatch);
                }
                Ok(aes256_ctr_apply(key, iv, ciphertext))
            }
            Encryption::Aes256Ocb { nonce } => {
                let cipher = Ocb3::<Aes256>::new(padded_key(key, 32).as_slice().into());
                cipher
                    .decrypt(nonce[..].into(), Payload { msg: body, aad })
                    .map_err(|_| EncryptionError::TagMismatch)
            }
            Encryption::ChaCha20Poly1305 { nonce } => {
                let cipher = ChaCha20Poly1305::new(padded_key(key, 32).as_slice().into());
                cipher
                    .decrypt(nonce[..].into(), Payload { msg: body, aad })
                    .map_err(|_| EncryptionError::TagMismatch)
            }
        }
    }

    /// Convenience wrapper matching the teacher's `encrypt`/`decrypt` naming;
    /// draws a fresh nonce and replaces `self` with the scheme actually used.
    pub fn encrypt(&mut self, data: &[u8], key: &Key) -> Vec<u8> {
        *self = self.new_nonce();
        self.seal_bytes(data, key.key())
    }

    pub fn decrypt(&self, data: &[u8], key: &Key) -> Result<Vec<u8>> {
        self.open(data, key)
    }

    pub fn encrypt_bytes(&mut self, data: &[u8], key: &[u8]) -> Vec<u8> {
        *self = self.new_nonce();
        self.seal_bytes(data, key)
    }

    pub fn decrypt_bytes(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        self.open_bytes(data, key)
    }
}

fn padded_key(key: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0_u8; len];
    let copy_len = key.len().min(len);
    out[..copy_len].copy_from_slice(&key[..copy_len]);
    out
}

fn aes256_ctr_apply(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let key = padded_key(key, 32);
    let mut cipher = Aes256Ctr::new(key.as_slice().into(), iv.into());
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

fn blake2b_mac(key: &[u8], aad: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(aad.len() + ciphertext.len());
    data.extend_from_slice(aad);
    data.extend_from_slice(ciphertext);
    blake2b_simd::Params::new()
        .hash_length(64)
        .key(key)
        .hash(&data)
        .as_bytes()
        .to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str;

    fn test_encryption(enc: Encryption) {
        let key = Key::random(32);

        let data_string =
            "The quick brown fox jumps over the lazy dog. Jackdaws love my big sphinx of quartz.";
        let mut enc = enc;
        let encrypted = enc.encrypt(data_string.as_bytes(), &key);
        let decrypted_bytes = enc.decrypt(&encrypted, &key).unwrap();
        let decrypted_string = str::from_utf8(&decrypted_bytes).unwrap();

        assert_eq!(data_string, decrypted_string);
    }

    #[test]
    fn test_aes256ctr_hmac() {
        test_encryption(Encryption::new_aes256ctr_hmac());
    }

    #[test]
    fn test_aes256ctr_blake2b() {
        test_encryption(Encryption::new_aes256ctr_blake2b());
    }

    #[test]
    fn test_aes256ocb() {
        test_encryption(Encryption::new_aes256ocb());
    }

    #[test]
    fn test_chacha20poly1305() {
        test_encryption(Encryption::new_chacha20poly1305());
    }

    #[test]
    fn test_no_encryption() {
        test_encryption(Encryption::NoEncryption);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = Key::random(32);
        let mut enc = Encryption::new_aes256ctr_hmac();
        let mut envelope = enc.encrypt(b"hello world", &key);
        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        assert!(enc.decrypt(&envelope, &key).is_err());
    }

    #[test]
    fn wrong_scheme_rejected() {
        let key = Key::random(32);
        let mut enc = Encryption::new_aes256ctr_hmac();
        let envelope = enc.encrypt(b"hello world", &key);
        let other = Encryption::new_chacha20poly1305();
        assert!(other.decrypt(&envelope, &key).is_err());
    }
}
