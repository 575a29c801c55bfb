//! Encrypted control-message envelope.
//!
//! Wire form: `IV(16) || AES-256-CBC/PKCS7 ciphertext`. The IV is random
//! per seal and travels in the clear; the key is the shared secret of the
//! topic's agreement.

use crate::cipher::{self, CipherError, Iv, SymmetricKey, BLOCK_SIZE, IV_SIZE};

/// Smallest well-formed envelope: one IV plus one cipher block.
pub const MIN_ENVELOPE_LEN: usize = IV_SIZE + BLOCK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope too short: {got} bytes, need an iv and at least one block")]
    TooShort { got: usize },
    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Encrypt `plaintext` under `key` with a fresh IV and prepend the IV.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let iv = Iv::generate()?;
    let mut out = Vec::with_capacity(IV_SIZE + cipher::padded_len(plaintext.len()));
    out.extend_from_slice(iv.as_bytes());
    out.extend_from_slice(&cipher::encrypt(key, &iv, plaintext));
    Ok(out)
}

/// Split an envelope at the IV boundary and decrypt the remainder.
pub fn open(key: &SymmetricKey, blob: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if blob.len() < MIN_ENVELOPE_LEN {
        return Err(EnvelopeError::TooShort { got: blob.len() });
    }
    let (iv_bytes, ciphertext) = blob.split_at(IV_SIZE);
    let iv = Iv::from_slice(iv_bytes)?;
    Ok(cipher::decrypt(key, &iv, ciphertext)?)
}
