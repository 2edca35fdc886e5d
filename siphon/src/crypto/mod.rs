//! Key derivation and piece encryption.
//!
//! Every piece of every chunk is encrypted under its own subkey, derived from
//! the file's master key and the (chunk, piece) coordinates. The cipher is a
//! seekable stream cipher so that any byte-aligned slice of a stored piece
//! can be decrypted without fetching the whole piece — the property the
//! partial-range download path depends on.

pub mod merkle;

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;

/// Size of a master or derived key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a derived cipher nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Root secret from which all piece keys of a file are derived.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Wraps raw key material.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives a master key from arbitrary seed bytes.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(*blake3::hash(seed).as_bytes())
    }

    /// Derives the cipher key for one piece of one chunk.
    ///
    /// Derivation is keyed BLAKE3 over the little-endian coordinates, so the
    /// same (chunk, piece) pair always yields the same key and no two pairs
    /// collide.
    pub fn derive_piece_key(&self, chunk_index: u64, piece_index: u64) -> PieceKey {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(b"siphon/piece");
        hasher.update(&chunk_index.to_le_bytes());
        hasher.update(&piece_index.to_le_bytes());
        let mut okm = [0u8; KEY_SIZE + NONCE_SIZE];
        hasher.finalize_xof().fill(&mut okm);

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&okm[KEY_SIZE..]);
        PieceKey { key, nonce }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("MasterKey(..)")
    }
}

/// Cipher key for a single piece.
#[derive(Clone)]
pub struct PieceKey {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl PieceKey {
    /// Applies the keystream to `data` as it appears at byte `offset` within
    /// the piece. Encryption and decryption are the same operation.
    pub fn apply_at(&self, offset: u64, data: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.seek(offset);
        cipher.apply_keystream(data);
    }

    /// Encrypts (or decrypts) a whole piece in place.
    pub fn apply(&self, data: &mut [u8]) {
        self.apply_at(0, data);
    }
}

impl std::fmt::Debug for PieceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PieceKey(..)")
    }
}
