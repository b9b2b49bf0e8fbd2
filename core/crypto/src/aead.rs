//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.
//!
//! Besides the raw `nonce || ciphertext` helpers, this module implements the
//! one-shot vault envelope used for small payloads.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::envelope::{CipherAlgorithm, EnvelopeHeader};
use crate::keys::KEY_LENGTH;
use casevault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Generate a random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&nonce);
    out
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - The nonce is randomly generated
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_nonce();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext, &[])?;

    // Prepend nonce to ciphertext
    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt `nonce || ciphertext || tag` produced by [`encrypt`].
///
/// # Errors
/// - Returns error if key length is incorrect
/// - `Error::Integrity` if the input is too short or authentication fails
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Integrity("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);
    decrypt_with_nonce(key, &nonce, encrypted, &[])
}

/// Encrypt plaintext with a specific nonce and associated data.
///
/// # Warning
/// Using the same nonce twice with the same key completely breaks security.
/// Callers derive nonces from a random per-file base.
pub fn encrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    cipher(key)?
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt ciphertext with a specific nonce and associated data.
///
/// # Errors
/// - `Error::Integrity` on any authentication failure; no plaintext is returned
pub fn decrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Integrity("Ciphertext too short".to_string()));
    }

    cipher(key)?
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Integrity("Authentication tag mismatch".to_string()))
}

/// Seal a small payload into a one-shot envelope.
///
/// Returns the envelope bytes and the nonce used.
pub fn seal_payload(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    let header = EnvelopeHeader::new(CipherAlgorithm::XChaCha20Poly1305, 0, generate_nonce());
    let header_bytes = header.to_bytes();
    let ciphertext = encrypt_with_nonce(key, &header.nonce, plaintext, &header_bytes)?;

    let mut out = Vec::with_capacity(header_bytes.len() + ciphertext.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&ciphertext);
    Ok((out, header.nonce))
}

/// Open a one-shot envelope produced by [`seal_payload`].
///
/// # Errors
/// - `Error::Integrity` for malformed, truncated, or forged envelopes
pub fn open_payload(key: &[u8], envelope: &[u8]) -> Result<Vec<u8>> {
    let mut reader = envelope;
    let header = EnvelopeHeader::read_from(&mut reader)?;
    open_payload_body(key, &header, reader)
}

/// Decrypt the body of a one-shot envelope whose header was already parsed.
pub(crate) fn open_payload_body(
    key: &[u8],
    header: &EnvelopeHeader,
    body: &[u8],
) -> Result<Vec<u8>> {
    if header.algorithm != CipherAlgorithm::XChaCha20Poly1305 {
        return Err(Error::Integrity(
            "Envelope is not a one-shot payload".to_string(),
        ));
    }
    decrypt_with_nonce(key, &header.nonce, body, &header.to_bytes())
}
