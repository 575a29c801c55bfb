//! AES-256-CBC with PKCS7 padding.
//!
//! One-shot helpers cover whole control messages; [`CipherStream`] covers
//! chunked transforms and produces byte-identical output for any split of
//! the input. Key and IV lengths are enforced by construction, so the only
//! runtime failures are ragged ciphertext and bad padding.

use std::fmt;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;
/// IV length in bytes (one block).
pub const IV_SIZE: usize = 16;

/// Error type for cipher operations.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid iv length: expected {expected}, got {got}")]
    InvalidIvLength { expected: usize, got: usize },
    #[error("ciphertext length {got} is not a positive multiple of the block size")]
    RaggedCiphertext { got: usize },
    #[error("decryption failed: bad padding")]
    InvalidPadding,
    #[error("RNG failed")]
    Rng,
}

/// An AES-256 key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey([redacted])")
    }
}

/// A CBC initialization vector. Random per encryption, not secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    /// Generate a fresh random IV.
    pub fn generate() -> Result<Self, CipherError> {
        let mut bytes = [0u8; IV_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|_| CipherError::Rng)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let arr: [u8; IV_SIZE] = bytes.try_into().map_err(|_| CipherError::InvalidIvLength {
            expected: IV_SIZE,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

/// Ciphertext length for a plaintext of `plaintext_len` bytes: padded up
/// to the next block boundary, with a full padding block when the input
/// is already aligned.
pub fn padded_len(plaintext_len: usize) -> usize {
    (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Encrypt a whole message.
pub fn encrypt(key: &SymmetricKey, iv: &Iv, plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(&key.0.into(), &iv.0.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypt a whole message.
pub fn decrypt(key: &SymmetricKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CipherError::RaggedCiphertext {
            got: ciphertext.len(),
        });
    }
    Aes256CbcDec::new(&key.0.into(), &iv.0.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CipherError::InvalidPadding)
}

enum Mode {
    Encrypt(Aes256CbcEnc),
    Decrypt(Aes256CbcDec),
}

/// An incremental CBC transform.
///
/// Feed chunks of any size through [`update`](Self::update) and close with
/// [`finalize`](Self::finalize), which consumes the stream: a finished
/// stream cannot be reused or fed further input. The concatenated output
/// equals the one-shot transform of the concatenated input.
pub struct CipherStream {
    mode: Mode,
    /// Input bytes not yet transformed: a partial block, plus for
    /// decryption the held-back final block that may carry the padding.
    buffer: Vec<u8>,
    seen: usize,
}

impl CipherStream {
    /// Open an encrypting stream.
    pub fn encrypt(key: &SymmetricKey, iv: &Iv) -> Self {
        Self {
            mode: Mode::Encrypt(Aes256CbcEnc::new(&key.0.into(), &iv.0.into())),
            buffer: Vec::new(),
            seen: 0,
        }
    }

    /// Open a decrypting stream.
    pub fn decrypt(key: &SymmetricKey, iv: &Iv) -> Self {
        Self {
            mode: Mode::Decrypt(Aes256CbcDec::new(&key.0.into(), &iv.0.into())),
            buffer: Vec::new(),
            seen: 0,
        }
    }

    /// Upper bound on the bytes the next `update` with `input_len` bytes
    /// of input (or a closing `finalize`) may produce.
    pub fn max_output_len(&self, input_len: usize) -> usize {
        padded_len(self.buffer.len() + input_len)
    }

    /// Feed a chunk through the transform, returning whatever whole
    /// blocks became available.
    pub fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.seen += chunk.len();
        self.buffer.extend_from_slice(chunk);
        let tail = match self.mode {
            Mode::Encrypt(_) => self.buffer.len() % BLOCK_SIZE,
            // Decryption keeps the last complete block back for finalize.
            Mode::Decrypt(_) => match self.buffer.len() % BLOCK_SIZE {
                0 => BLOCK_SIZE.min(self.buffer.len()),
                partial => partial,
            },
        };
        let processable = self.buffer.len() - tail;
        if processable == 0 {
            return Vec::new();
        }
        let mut out: Vec<u8> = self.buffer.drain(..processable).collect();
        match &mut self.mode {
            Mode::Encrypt(enc) => {
                for block in out.chunks_exact_mut(BLOCK_SIZE) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            Mode::Decrypt(dec) => {
                for block in out.chunks_exact_mut(BLOCK_SIZE) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
        out
    }

    /// Close the stream: pad and emit the final block when encrypting,
    /// or unpad the held-back block when decrypting.
    pub fn finalize(self) -> Result<Vec<u8>, CipherError> {
        match self.mode {
            Mode::Encrypt(enc) => Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(&self.buffer)),
            Mode::Decrypt(dec) => {
                if self.buffer.len() != BLOCK_SIZE {
                    return Err(CipherError::RaggedCiphertext { got: self.seen });
                }
                dec.decrypt_padded_vec_mut::<Pkcs7>(&self.buffer)
                    .map_err(|_| CipherError::InvalidPadding)
            }
        }
    }
}
