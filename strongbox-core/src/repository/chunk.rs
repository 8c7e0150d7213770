/*!
The Chunk is the lowest level of abstraction in a strongbox repository.

Chunks are raw binary blobs, compressed then sealed under an AEAD envelope,
and keyed by a MAC of their plaintext contents. The envelope's own
authentication tag is what protects chunk integrity; a corrupted or
tampered chunk fails to open rather than failing a separate check.
*/
use super::{Compression, Encryption, Key, HMAC};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::cmp;

/// Error for all the various things that can go wrong with handling chunks
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Compression Error")]
    CompressionError(#[from] super::CompressionError),
    #[error("Encryption Error")]
    EncryptionError(#[from] super::EncryptionError),
    #[error("Chunk id did not match the MAC of its decrypted contents")]
    IdMismatch,
}

type Result<T> = std::result::Result<T, ChunkError>;

/// Key used for indexing a `Chunk` in a repository.
///
/// Derived via a keyed MAC of the chunk's plaintext; identical `ChunkID`s are
/// assumed to carry identical plaintext, which is the basis for
/// deduplication.
#[derive(PartialEq, Eq, Copy, Clone, Serialize, Deserialize, Hash, Debug)]
pub struct ChunkID {
    id: [u8; 32],
}

impl ChunkID {
    /// Will create a new id from a slice.
    ///
    /// Ids longer than 32 bytes will be truncated.
    /// Ids shorter than 32 bytes will be padded at the end with zeros.
    pub fn new(input_id: &[u8]) -> ChunkID {
        let mut id: [u8; 32] = [0; 32];
        id[..cmp::min(32, input_id.len())]
            .clone_from_slice(&input_id[..cmp::min(32, input_id.len())]);
        ChunkID { id }
    }

    /// Provides a reference to an id's raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.id
    }

    /// Verifies equality of this id with the first 32 bytes of a slice
    pub fn verify(&self, slice: &[u8]) -> bool {
        slice.len() >= self.id.len() && self.id[..] == slice[..self.id.len()]
    }

    /// Returns the special all-zero id used for the manifest
    pub fn manifest_id() -> ChunkID {
        ChunkID { id: [0_u8; 32] }
    }

    /// Returns whether this is the manifest's all-zero id
    pub fn is_manifest_id(&self) -> bool {
        self.id == [0_u8; 32]
    }

    /// Returns a random id, used for testing
    pub fn random_id() -> ChunkID {
        let id = rand::random();
        ChunkID { id }
    }
}

/// Encapsulates the Encryption, Compression, and HMAC tags to use for chunks
/// produced by a repository.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkSettings {
    pub compression: Compression,
    pub encryption: Encryption,
    pub hmac: HMAC,
}

impl ChunkSettings {
    /// Returns a `ChunkSettings` with `Encryption::NoEncryption`,
    /// `Compression::NoCompression`, and `HMAC::Blake2b`.
    ///
    /// These settings are the least computationally intensive strongbox
    /// supports; useful for tests and for benchmarking other layers in
    /// isolation.
    pub fn lightweight() -> ChunkSettings {
        ChunkSettings {
            compression: Compression::NoCompression,
            encryption: Encryption::NoEncryption,
            hmac: HMAC::Blake2b,
        }
    }
}

/// A split representation of a `Chunk`'s 'header' or metadata.
/// Used for on disk storage.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkHeader {
    compression: Compression,
    encryption: Encryption,
    id: ChunkID,
}

/// A split representation of a `Chunk`'s body, or contained data
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChunkBody(pub Vec<u8>);

/// A binary blob, ready to be committed to storage.
///
/// Data in a `Chunk` has already undergone compression and AEAD sealing; the
/// envelope's own tag is the sole integrity check on decryption.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Chunk {
    /// The AEAD envelope: `type_byte | header | ciphertext | tag`
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    /// Compression algorithm used, informational: the codec/level byte pair
    /// is also embedded in the sealed plaintext.
    compression: Compression,
    /// Encryption algorithm used, also carries the nonce/IV.
    encryption: Encryption,
    /// `ChunkID`, used for indexing in the repository and deduplication
    id: ChunkID,
}

impl Chunk {
    /// Produces a `Chunk` from the given data, using the specified
    /// compression and encryption, deriving its id via the given `HMAC`
    /// algorithm's keyed MAC of the plaintext.
    pub fn pack(data: Vec<u8>, compression: Compression, encryption: Encryption, hmac: HMAC, key: &Key) -> Result<Chunk> {
        let id_mac = hmac.id(&data, key);
        let id = ChunkID::new(&id_mac);
        Chunk::pack_with_id(data, compression, encryption, key, id)
    }

    /// Constructs a `Chunk` from its raw, already-sealed parts.
    pub fn from_parts(data: Vec<u8>, compression: Compression, encryption: Encryption, id: ChunkID) -> Chunk {
        Chunk {
            data,
            compression,
            encryption,
            id,
        }
    }

    /// Produces a `Chunk` using the provided settings, but overriding the
    /// `ChunkID`. Used for the manifest object, which is always stored at the
    /// all-zero id regardless of its plaintext's MAC.
    pub fn pack_with_id(
        data: Vec<u8>,
        compression: Compression,
        mut encryption: Encryption,
        key: &Key,
        id: ChunkID,
    ) -> Result<Chunk> {
        let tagged = compression.clone().compress_tagged(data)?;
        let sealed = encryption.encrypt(&tagged, key);
        Ok(Chunk {
            data: sealed,
            compression,
            encryption,
            id,
        })
    }

    /// Opens, decrypts, and decompresses the data in a `Chunk`, and checks
    /// that its recomputed MAC matches `self.id` (skipped for the manifest
    /// id, which is not content-addressed).
    pub fn unpack(&self, hmac: HMAC, key: &Key) -> Result<Vec<u8>> {
        let tagged = self.encryption.decrypt(&self.data, key)?;
        let plaintext = self.compression.clone().decompress(tagged[2..].to_vec())?;
        if !self.id.is_manifest_id() {
            let recomputed = ChunkID::new(&hmac.id(&plaintext, key));
            if recomputed != self.id {
                return Err(ChunkError::IdMismatch);
            }
        }
        Ok(plaintext)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn get_id(&self) -> ChunkID {
        self.id
    }

    /// Splits a `Chunk` into its header and body components
    pub fn split(self) -> (ChunkHeader, ChunkBody) {
        let header = ChunkHeader {
            compression: self.compression,
            encryption: self.encryption,
            id: self.id,
        };
        let body = ChunkBody(self.data);

        (header, body)
    }

    /// Combines a header and a body into a `Chunk`
    pub fn unsplit(header: ChunkHeader, body: ChunkBody) -> Chunk {
        Chunk {
            data: body.0,
            compression: header.compression,
            encryption: header.encryption,
            id: header.id,
        }
    }

    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    pub fn compression(&self) -> Compression {
        self.compression.clone()
    }

    #[cfg(test)]
    /// Testing only function used to corrupt the data
    pub fn break_data(&mut self, index: usize) {
        let val = self.data[index];
        self.data[index] = if val == 0 { 1 } else { 0 };
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data == other.data
    }
}

impl Eq for Chunk {}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with_settings(compression: Compression, encryption: Encryption, hmac: HMAC) {
        let data_string =
            "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.";

        let data_bytes = data_string.as_bytes().to_vec();
        let key = Key::random(32);
        let packed = Chunk::pack(data_bytes, compression, encryption, hmac, &key).unwrap();

        let output_bytes = packed.unpack(hmac, &key).expect("Failed to unpack output bytes");

        assert_eq!(data_string.as_bytes().to_vec(), output_bytes);
    }

    #[test]
    fn all_combos() {
        let compressions = [
            Compression::NoCompression,
            Compression::ZStd { level: 1 },
            Compression::LZ4 { level: 1 },
            Compression::LZMA { level: 1 },
        ];
        let encryptions = [
            Encryption::NoEncryption,
            Encryption::new_aes256ctr_hmac(),
            Encryption::new_aes256ctr_blake2b(),
            Encryption::new_aes256ocb(),
            Encryption::new_chacha20poly1305(),
        ];
        let hmacs = [
            HMAC::SHA256,
            HMAC::Blake2b,
            HMAC::Blake2bp,
            HMAC::Blake3,
            HMAC::SHA3,
        ];
        for c in compressions.iter() {
            for e in encryptions.iter() {
                for h in hmacs.iter() {
                    chunk_with_settings(*c, *e, *h);
                }
            }
        }
    }

    #[test]
    fn detect_bad_data() {
        let data_string = "I am but a humble test string";
        let data_bytes = data_string.as_bytes().to_vec();
        let compression = Compression::NoCompression;
        let encryption = Encryption::NoEncryption;
        let hmac = HMAC::SHA256;

        let key = Key::random(32);

        let mut packed = Chunk::pack(data_bytes, compression, encryption, hmac, &key).unwrap();
        packed.break_data(5);

        let result = packed.unpack(hmac, &key);

        assert!(result.is_err());
    }

    #[test]
    fn chunk_id_equality() {
        let data1 = [1_u8; 64];
        let data2 = [2_u8; 64];
        let id = ChunkID::new(&data1);
        assert!(id.verify(&data1));
        assert!(!id.verify(&data2));
    }

    #[test]
    fn split_unsplit() {
        let data_string = "I am but a humble test string";
        let data_bytes = data_string.as_bytes().to_vec();
        let compression = Compression::LZ4 { level: 1 };
        let encryption = Encryption::new_aes256ctr_hmac();
        let hmac = HMAC::SHA256;

        let key = Key::random(32);

        let packed = Chunk::pack(data_bytes, compression, encryption, hmac, &key).unwrap();
        let (header, body) = packed.split();
        let packed = Chunk::unsplit(header, body);

        let result = packed.unpack(hmac, &key);

        assert!(result.is_ok());
    }

    #[test]
    fn manifest_id_skips_mac_check() {
        let data_bytes = b"manifest bytes".to_vec();
        let key = Key::random(32);
        let packed = Chunk::pack_with_id(
            data_bytes.clone(),
            Compression::NoCompression,
            Encryption::new_aes256ctr_hmac(),
            &key,
            ChunkID::manifest_id(),
        )
        .unwrap();
        let output = packed.unpack(HMAC::Blake3, &key).unwrap();
        assert_eq!(data_bytes, output);
    }
}
