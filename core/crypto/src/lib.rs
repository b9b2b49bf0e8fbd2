//! Cryptographic primitives for the case vault.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256 or Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Secure key management with automatic zeroization
//! - A self-describing envelope with one-shot and streaming modes
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons
//! - Decrypted data is released only after authentication

pub mod aead;
pub mod encoding;
pub mod envelope;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use aead::{decrypt, encrypt, open_payload, seal_payload};
pub use envelope::{CipherAlgorithm, EnvelopeHeader, SealedInfo};
pub use kdf::{derive_key, unlock_key, KdfParams};
pub use keys::{FileKey, MasterKey, Salt, VerificationToken};
pub use stream::{DecryptingStream, EncryptingStream};
