/*!
This module contains types for describing and interacting with cryptographic
key material, and for wrapping that material under a user passphrase.
*/
use crate::repository::Encryption;

use pbkdf2::pbkdf2_hmac;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_cbor::{de::from_slice, Serializer};
use sha2::Sha256;
use thiserror::Error;
use tracing::trace;
use zeroize::Zeroize;

/// Minimum PBKDF2 iteration count accepted when wrapping/unwrapping a key.
/// Repositories created with fewer iterations than this are rejected.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Error describing things that can go wrong with key handling
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key wrapping/unwrapping failed")]
    EncryptionError(#[from] super::EncryptionError),
    #[error("Something went wrong with Serialization/Deserialization")]
    DecodeError(#[from] serde_cbor::error::Error),
    #[error("Passphrase is incorrect, or the key material is corrupted")]
    PassphraseWrong,
    #[error("Key was wrapped with fewer than {MIN_PBKDF2_ITERATIONS} PBKDF2 iterations")]
    IterationsTooLow,
}

type Result<T> = std::result::Result<T, KeyError>;

/// Stores the key material used by a strongbox repository.
///
/// Contains the key material described by the crypto/key component:
///
/// - `enc_key`: used for the bulk encryption/decryption of chunk payloads.
/// - `enc_hmac_key`: used for the MAC half of the encrypt-then-MAC schemes.
/// - `id_key`: used for `ChunkID` derivation — a keyed MAC of the plaintext.
/// - `chunk_seed`: seeds the buzhash lookup table so identical plaintext
///   produces different cut points across repositories.
/// - `repository_id`: 16 random bytes identifying this repository instance.
/// - `tam_required`: whether this repository rejects manifests without a
///   valid TAM.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Zeroize)]
#[zeroize(drop)]
pub struct Key {
    enc_key: Vec<u8>,
    enc_hmac_key: Vec<u8>,
    id_key: Vec<u8>,
    chunk_seed: u32,
    repository_id: [u8; 16],
    tam_required: bool,
}

impl Key {
    /// Creates a key from the given array of bytes, splitting the key stream
    /// into thirds for `enc_key`/`enc_hmac_key`/`id_key`. Does not pad.
    pub fn from_bytes(bytes: &[u8], chunk_seed: u32, repository_id: [u8; 16]) -> Key {
        let mut buffer1 = Vec::new();
        let mut buffer2 = Vec::new();
        let mut buffer3 = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            match i % 3 {
                0 => buffer1.push(*byte),
                1 => buffer2.push(*byte),
                2 => buffer3.push(*byte),
                _ => unreachable!(),
            };
        }
        Key {
            enc_key: buffer1,
            enc_hmac_key: buffer2,
            id_key: buffer3,
            chunk_seed,
            repository_id,
            tam_required: false,
        }
    }

    /// Securely generates a random bundle of key material, with a fresh
    /// random `repository_id`.
    #[tracing::instrument(level = "trace")]
    pub fn random(length: usize) -> Key {
        let mut buffer1 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer1);
        let mut buffer2 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer2);
        let mut buffer3 = vec![0; length];
        thread_rng().fill_bytes(&mut buffer3);
        let mut repository_id = [0_u8; 16];
        thread_rng().fill_bytes(&mut repository_id);
        trace!("Generated a random key");
        Key {
            enc_key: buffer1,
            enc_hmac_key: buffer2,
            id_key: buffer3,
            chunk_seed: thread_rng().next_u32(),
            repository_id,
            tam_required: false,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.enc_key
    }

    pub fn hmac_key(&self) -> &[u8] {
        &self.enc_hmac_key
    }

    pub fn id_key(&self) -> &[u8] {
        &self.id_key
    }

    pub fn chunk_seed(&self) -> u32 {
        self.chunk_seed
    }

    pub fn repository_id(&self) -> [u8; 16] {
        self.repository_id
    }

    pub fn tam_required(&self) -> bool {
        self.tam_required
    }

    pub fn set_tam_required(&mut self, required: bool) {
        self.tam_required = required;
    }
}

/// Stores a `Key`, encrypted with a key derived from a user passphrase via
/// PBKDF2-HMAC-SHA256.
///
/// Uses a random 32-byte salt and the `Aes256CtrHmacSha256` envelope scheme
/// for wrapping, per the key-wrapping algorithm the repository format
/// specifies; the wrap is independent of the `Encryption` scheme used for
/// chunk payloads.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EncryptedKey {
    encrypted_bytes: Vec<u8>,
    salt: [u8; 32],
    iterations: u32,
}

impl EncryptedKey {
    /// Produces an encrypted key from the specified user passphrase.
    ///
    /// # Panics
    ///
    /// Panics if `iterations < MIN_PBKDF2_ITERATIONS`.
    #[tracing::instrument(level = "trace", skip(user_key))]
    pub fn encrypt(key: &Key, iterations: u32, user_key: &[u8]) -> EncryptedKey {
        assert!(
            iterations >= MIN_PBKDF2_ITERATIONS,
            "key wrapping must use at least {MIN_PBKDF2_ITERATIONS} PBKDF2 iterations"
        );
        let mut key_buffer = Vec::<u8>::new();
        key.serialize(&mut Serializer::new(&mut key_buffer))
            .expect("Key contains no types that can fail to serialize");
        let mut salt = [0_u8; 32];
        thread_rng().fill_bytes(&mut salt);

        let mut derived_key = [0_u8; 32];
        pbkdf2_hmac::<Sha256>(user_key, &salt, iterations, &mut derived_key);

        let mut scheme = Encryption::new_aes256ctr_hmac();
        let encrypted_bytes = scheme.encrypt_bytes(&key_buffer, &derived_key);
        derived_key.zeroize();
        trace!("Encrypted key material");
        EncryptedKey {
            encrypted_bytes,
            salt,
            iterations,
        }
    }

    /// Wraps with the minimum acceptable PBKDF2 iteration count.
    pub fn encrypt_defaults(key: &Key, user_key: &[u8]) -> EncryptedKey {
        EncryptedKey::encrypt(key, MIN_PBKDF2_ITERATIONS, user_key)
    }

    /// Attempts to decrypt the key material using the user supplied passphrase.
    #[tracing::instrument(level = "error", skip(user_key))]
    pub fn decrypt(&self, user_key: &[u8]) -> Result<Key> {
        if self.iterations < MIN_PBKDF2_ITERATIONS {
            return Err(KeyError::IterationsTooLow);
        }
        let mut derived_key = [0_u8; 32];
        pbkdf2_hmac::<Sha256>(user_key, &self.salt, self.iterations, &mut derived_key);

        let scheme = Encryption::new_aes256ctr_hmac();
        let key_bytes = scheme
            .decrypt_bytes(&self.encrypted_bytes, &derived_key)
            .map_err(|_| KeyError::PassphraseWrong)?;
        derived_key.zeroize();

        let key = from_slice(&key_bytes[..])?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let input_key = Key::random(8);
        let user_key = "A secure password".as_bytes();
        let enc_key = EncryptedKey::encrypt(&input_key, MIN_PBKDF2_ITERATIONS, user_key);
        let output_key = enc_key.decrypt(user_key).unwrap();

        assert_eq!(input_key, output_key);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let input_key = Key::random(8);
        let enc_key = EncryptedKey::encrypt(&input_key, MIN_PBKDF2_ITERATIONS, b"correct horse");
        assert!(enc_key.decrypt(b"incorrect horse").is_err());
    }

    #[test]
    fn from_bytes() {
        let input = [1, 2, 3, 1, 2, 3, 1, 2, 3];
        let key = Key::from_bytes(&input, 4, [0_u8; 16]);
        assert_eq!(key.enc_key, [1, 1, 1]);
        assert_eq!(key.enc_hmac_key, [2, 2, 2]);
        assert_eq!(key.id_key, [3, 3, 3]);
        assert_eq!(key.chunk_seed(), 4);
    }

    #[test]
    #[should_panic]
    fn low_iterations_panic_on_encrypt() {
        let input_key = Key::random(8);
        EncryptedKey::encrypt(&input_key, 10, b"password");
    }
}
