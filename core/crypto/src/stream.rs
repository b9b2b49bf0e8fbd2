//! Streaming encryption for large files.
//!
//! This module provides chunk-based encryption to handle files that are
//! too large to fit in memory. Each chunk is independently authenticated,
//! and its position and finality are bound into the associated data, so
//! reordering, dropping, duplicating or appending chunks is detected.
//!
//! # Format
//! - Header: see [`crate::envelope`] (stream mode carries the chunk size)
//! - Chunks: `ciphertext || tag`, each holding `chunk_size` plaintext bytes
//!   except the final one, which may be shorter or empty
//!
//! Chunk `i` uses the nonce base with its last 8 bytes XORed with `i`
//! (big-endian), and associated data `header || i (u64 LE) || final (u8)`.

use std::io::{ErrorKind, Read, Write};

use zeroize::Zeroizing;

use crate::aead::{decrypt_with_nonce, encrypt_with_nonce, generate_nonce, NONCE_SIZE, TAG_SIZE};
use crate::envelope::{CipherAlgorithm, EnvelopeHeader};
use crate::keys::KEY_LENGTH;
use casevault_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest accepted chunk size (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

fn chunk_nonce(base: &[u8; NONCE_SIZE], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (slot, byte) in nonce[NONCE_SIZE - 8..]
        .iter_mut()
        .zip(counter.to_be_bytes())
    {
        *slot ^= byte;
    }
    nonce
}

fn chunk_aad(header: &[u8], counter: u64, is_final: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + 9);
    aad.extend_from_slice(header);
    aad.extend_from_slice(&counter.to_le_bytes());
    aad.push(u8::from(is_final));
    aad
}

/// Fill `buf` as far as the reader allows. Returns the bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto("Invalid key length".to_string()));
    }
    Ok(())
}

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a [u8],
    chunk_size: usize,
    nonce_base: [u8; NONCE_SIZE],
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream with a fresh random nonce base.
    ///
    /// # Preconditions
    /// - `key` must be KEY_LENGTH bytes
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8]) -> Result<Self> {
        check_key(key)?;
        Ok(Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
            nonce_base: generate_nonce(),
        })
    }

    /// Set custom chunk size.
    ///
    /// # Errors
    /// - Returns error if `size` is zero or above MAX_CHUNK_SIZE
    pub fn with_chunk_size(mut self, size: usize) -> Result<Self> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "Chunk size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        self.chunk_size = size;
        Ok(self)
    }

    /// Nonce base written into the header.
    pub fn nonce_base(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce_base
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// Memory use is bounded by two chunks regardless of input size.
    ///
    /// # Postconditions
    /// - All data is encrypted and authenticated
    /// - Empty input produces a single empty final chunk
    ///
    /// # Errors
    /// - I/O errors from reader/writer
    /// - Encryption errors
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let header = EnvelopeHeader::new(
            CipherAlgorithm::XChaCha20Poly1305Stream,
            self.chunk_size as u32,
            self.nonce_base,
        )
        .to_bytes();
        writer.write_all(&header)?;

        let mut current = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut next = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut current_len = read_full(&mut reader, &mut current)?;
        let mut counter = 0u64;
        let mut total_bytes = 0u64;

        loop {
            // A short chunk already hit EOF; a full one needs a look ahead.
            let next_len = if current_len < self.chunk_size {
                0
            } else {
                read_full(&mut reader, &mut next)?
            };
            let is_final = next_len == 0;

            let encrypted = encrypt_with_nonce(
                self.key,
                &chunk_nonce(&self.nonce_base, counter),
                &current[..current_len],
                &chunk_aad(&header, counter, is_final),
            )?;
            writer.write_all(&encrypted)?;
            total_bytes += current_len as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            counter += 1;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    key: &'a [u8],
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8]) -> Result<Self> {
        check_key(key)?;
        Ok(Self { key })
    }

    /// Decrypt a complete stream envelope from reader and write to writer.
    ///
    /// # Errors
    /// - I/O errors
    /// - `Error::Integrity` for an invalid header, tampered or truncated data
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, writer: W) -> Result<u64> {
        let header = EnvelopeHeader::read_from(&mut reader)?;
        self.decrypt_body(&header, reader, writer, |_| Ok(()))
    }

    /// Decrypt the chunks following an already parsed header.
    ///
    /// Each chunk is authenticated before `before_release` sees it and before
    /// anything is written. Plaintext of a chunk that fails authentication is
    /// never released.
    ///
    /// # Errors
    /// - `Error::Integrity` on authentication failure or truncation
    /// - Any error returned by `before_release`
    pub fn decrypt_body<R, W, F>(
        &self,
        header: &EnvelopeHeader,
        mut reader: R,
        mut writer: W,
        mut before_release: F,
    ) -> Result<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(&[u8]) -> Result<()>,
    {
        if header.algorithm != CipherAlgorithm::XChaCha20Poly1305Stream {
            return Err(Error::Integrity("Envelope is not a stream".to_string()));
        }
        let header_bytes = header.to_bytes();
        let encrypted_chunk_size = header.chunk_size as usize + TAG_SIZE;

        let mut buffer = vec![0u8; encrypted_chunk_size];
        let mut carry: Option<u8> = None;
        let mut counter = 0u64;
        let mut total_bytes = 0u64;

        loop {
            let mut filled = 0;
            if let Some(byte) = carry.take() {
                buffer[0] = byte;
                filled = 1;
            }
            filled += read_full(&mut reader, &mut buffer[filled..])?;

            if filled < TAG_SIZE {
                return Err(Error::Integrity("Truncated stream chunk".to_string()));
            }

            let is_final = if filled < encrypted_chunk_size {
                true
            } else {
                let mut peek = [0u8; 1];
                if read_full(&mut reader, &mut peek)? == 0 {
                    true
                } else {
                    carry = Some(peek[0]);
                    false
                }
            };

            let plaintext = Zeroizing::new(decrypt_with_nonce(
                self.key,
                &chunk_nonce(&header.nonce, counter),
                &buffer[..filled],
                &chunk_aad(&header_bytes, counter, is_final),
            )?);

            before_release(&plaintext)?;
            writer.write_all(&plaintext)?;
            total_bytes += plaintext.len() as u64;

            if is_final {
                break;
            }
            counter += 1;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; KEY_LENGTH] = [42u8; KEY_LENGTH];

    fn encrypt(data: &[u8], chunk_size: usize) -> Vec<u8> {
        let stream = EncryptingStream::new(&KEY)
            .unwrap()
            .with_chunk_size(chunk_size)
            .unwrap();
        let mut out = Vec::new();
        stream.encrypt_stream(data, &mut out).unwrap();
        out
    }

    fn decrypt(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        DecryptingStream::new(&KEY)?.decrypt_stream(data, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_stream_roundtrip_boundaries() {
        let chunk = 64;
        for len in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk, 3 * chunk + 7] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let encrypted = encrypt(&data, chunk);
            assert_eq!(decrypt(&encrypted).unwrap(), data, "length {}", len);
        }
    }

    #[test]
    fn test_empty_input_single_chunk() {
        let encrypted = encrypt(b"", 64);
        let header_len = 6 + 4 + NONCE_SIZE;
        assert_eq!(encrypted.len(), header_len + TAG_SIZE);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_chunk() {
        let encrypted = encrypt(&[0u8; 128], 64);
        let header_len = 6 + 4 + NONCE_SIZE;
        assert_eq!(encrypted.len(), header_len + 2 * (64 + TAG_SIZE));
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let encrypted = encrypt(b"evidence log line 1\nevidence log line 2\n", 16);

        for byte in 0..encrypted.len() {
            for bit in 0..8 {
                let mut tampered = encrypted.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(decrypt(&tampered), Err(Error::Integrity(_))),
                    "flip at byte {} bit {} was not detected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_truncation_detected() {
        let encrypted = encrypt(&[7u8; 100], 32);
        for len in 0..encrypted.len() {
            assert!(
                decrypt(&encrypted[..len]).is_err(),
                "truncation to {} bytes was not detected",
                len
            );
        }
    }

    #[test]
    fn test_appended_data_detected() {
        let mut encrypted = encrypt(&[7u8; 100], 32);
        encrypted.push(0);
        assert!(matches!(decrypt(&encrypted), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_chunk_reorder_detected() {
        let chunk = 32;
        let encrypted = encrypt(&[1u8; 3 * 32], chunk);
        let header_len = 6 + 4 + NONCE_SIZE;
        let enc_chunk = chunk + TAG_SIZE;

        let mut swapped = encrypted[..header_len].to_vec();
        swapped.extend_from_slice(&encrypted[header_len + enc_chunk..header_len + 2 * enc_chunk]);
        swapped.extend_from_slice(&encrypted[header_len..header_len + enc_chunk]);
        swapped.extend_from_slice(&encrypted[header_len + 2 * enc_chunk..]);

        assert!(matches!(decrypt(&swapped), Err(Error::Integrity(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt(b"secret", 64);
        let other = [1u8; KEY_LENGTH];
        let mut out = Vec::new();
        let result = DecryptingStream::new(&other)
            .unwrap()
            .decrypt_stream(encrypted.as_slice(), &mut out);
        assert!(matches!(result, Err(Error::Integrity(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_before_release_sees_chunks_in_order() {
        let data: Vec<u8> = (0..100u8).collect();
        let encrypted = encrypt(&data, 40);

        let mut reader = encrypted.as_slice();
        let header = EnvelopeHeader::read_from(&mut reader).unwrap();
        let mut seen = Vec::new();
        let mut out = Vec::new();
        DecryptingStream::new(&KEY)
            .unwrap()
            .decrypt_body(&header, reader, &mut out, |chunk| {
                seen.push(chunk.len());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec![40, 40, 20]);
        assert_eq!(out, data);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        assert!(EncryptingStream::new(&KEY).unwrap().with_chunk_size(0).is_err());
        assert!(EncryptingStream::new(&KEY)
            .unwrap()
            .with_chunk_size(MAX_CHUNK_SIZE + 1)
            .is_err());
    }

    #[test]
    fn test_chunk_nonces_distinct() {
        let base = [0xAAu8; NONCE_SIZE];
        assert_ne!(chunk_nonce(&base, 0), chunk_nonce(&base, 1));
        assert_eq!(chunk_nonce(&base, 0), base);
        assert_eq!(chunk_nonce(&base, 1)[NONCE_SIZE - 1], 0xAB);
    }

    proptest! {
        #[test]
        fn prop_stream_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk_size in 1usize..300,
        ) {
            let encrypted = encrypt(&data, chunk_size);
            prop_assert_eq!(decrypt(&encrypted).unwrap(), data);
        }
    }
}
