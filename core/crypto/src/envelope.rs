//! Self-describing ciphertext envelope.
//!
//! Every encrypted case file starts with a small header:
//!
//! ```text
//! magic "CVLT" (4) | version (1) | mode (1) | [chunk_size u32 LE (4)] | nonce (24)
//! ```
//!
//! The chunk size is present only in stream mode. The whole header is bound
//! into the associated data of every AEAD operation, so no header field can
//! be altered without failing authentication.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::aead::{self, NONCE_SIZE};
use crate::stream::{DecryptingStream, EncryptingStream, MAX_CHUNK_SIZE};
use casevault_common::{Error, Result};

/// Magic bytes identifying a case vault ciphertext.
pub const MAGIC: [u8; 4] = *b"CVLT";

/// Envelope format version.
pub const FORMAT_VERSION: u8 = 1;

/// Magic, version and mode.
const PREFIX_LEN: usize = 6;

/// Cipher mode of an envelope, as recorded in manifest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    /// Whole payload sealed in one AEAD operation.
    #[serde(rename = "xchacha20poly1305")]
    XChaCha20Poly1305,
    /// Payload split into independently authenticated chunks.
    #[serde(rename = "xchacha20poly1305-stream")]
    XChaCha20Poly1305Stream,
}

impl CipherAlgorithm {
    fn mode_byte(self) -> u8 {
        match self {
            Self::XChaCha20Poly1305 => 1,
            Self::XChaCha20Poly1305Stream => 2,
        }
    }

    fn from_mode_byte(mode: u8) -> Result<Self> {
        match mode {
            1 => Ok(Self::XChaCha20Poly1305),
            2 => Ok(Self::XChaCha20Poly1305Stream),
            other => Err(Error::Integrity(format!("Unknown envelope mode {}", other))),
        }
    }
}

/// Parsed envelope header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub algorithm: CipherAlgorithm,
    /// Plaintext bytes per chunk; zero in one-shot mode.
    pub chunk_size: u32,
    /// Nonce (one-shot) or nonce base (stream).
    pub nonce: [u8; NONCE_SIZE],
}

impl EnvelopeHeader {
    pub fn new(algorithm: CipherAlgorithm, chunk_size: u32, nonce: [u8; NONCE_SIZE]) -> Self {
        Self {
            algorithm,
            chunk_size,
            nonce,
        }
    }

    /// Encoded header length.
    pub fn encoded_len(&self) -> usize {
        match self.algorithm {
            CipherAlgorithm::XChaCha20Poly1305 => PREFIX_LEN + NONCE_SIZE,
            CipherAlgorithm::XChaCha20Poly1305Stream => PREFIX_LEN + 4 + NONCE_SIZE,
        }
    }

    /// Encode the header. These bytes are also the associated data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.algorithm.mode_byte());
        if self.algorithm == CipherAlgorithm::XChaCha20Poly1305Stream {
            out.extend_from_slice(&self.chunk_size.to_le_bytes());
        }
        out.extend_from_slice(&self.nonce);
        out
    }

    /// Read and validate a header from the start of `reader`.
    ///
    /// # Errors
    /// - `Error::Integrity` if the data is truncated, has the wrong magic,
    ///   an unknown version or mode, or an out-of-range chunk size
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut prefix = [0u8; PREFIX_LEN];
        read_header_bytes(reader, &mut prefix)?;

        if prefix[..4] != MAGIC {
            return Err(Error::Integrity("Not a case vault ciphertext".to_string()));
        }
        if prefix[4] != FORMAT_VERSION {
            return Err(Error::Integrity(format!(
                "Unsupported envelope version {}",
                prefix[4]
            )));
        }
        let algorithm = CipherAlgorithm::from_mode_byte(prefix[5])?;

        let chunk_size = if algorithm == CipherAlgorithm::XChaCha20Poly1305Stream {
            let mut size = [0u8; 4];
            read_header_bytes(reader, &mut size)?;
            let size = u32::from_le_bytes(size);
            if size == 0 || size as usize > MAX_CHUNK_SIZE {
                return Err(Error::Integrity(format!("Invalid chunk size {}", size)));
            }
            size
        } else {
            0
        };

        let mut nonce = [0u8; NONCE_SIZE];
        read_header_bytes(reader, &mut nonce)?;

        Ok(Self::new(algorithm, chunk_size, nonce))
    }
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::Integrity("Truncated envelope header".to_string()),
        _ => Error::Io(e),
    })
}

/// Summary of a sealed payload.
#[derive(Debug, Clone)]
pub struct SealedInfo {
    pub algorithm: CipherAlgorithm,
    pub nonce: [u8; NONCE_SIZE],
    /// Plaintext bytes consumed.
    pub plaintext_len: u64,
}

/// Encrypt `reader` into `writer`, choosing the mode by size.
///
/// Payloads of at least `streaming_threshold` bytes use stream mode with
/// `chunk_size` chunks; smaller ones are sealed in one shot.
pub fn seal<R: Read, W: Write>(
    key: &[u8],
    mut reader: R,
    mut writer: W,
    plaintext_len: u64,
    streaming_threshold: u64,
    chunk_size: usize,
) -> Result<SealedInfo> {
    if plaintext_len >= streaming_threshold {
        let stream = EncryptingStream::new(key)?.with_chunk_size(chunk_size)?;
        let written = stream.encrypt_stream(reader, writer)?;
        return Ok(SealedInfo {
            algorithm: CipherAlgorithm::XChaCha20Poly1305Stream,
            nonce: *stream.nonce_base(),
            plaintext_len: written,
        });
    }

    let mut plaintext = zeroize::Zeroizing::new(Vec::with_capacity(plaintext_len as usize));
    reader.read_to_end(&mut plaintext)?;
    let (envelope, nonce) = aead::seal_payload(key, &plaintext)?;
    writer.write_all(&envelope)?;
    Ok(SealedInfo {
        algorithm: CipherAlgorithm::XChaCha20Poly1305,
        nonce,
        plaintext_len: plaintext.len() as u64,
    })
}

/// Decrypt an envelope of either mode from `reader` into `writer`.
///
/// `before_release` sees every authenticated plaintext block before it is
/// written; returning an error stops decryption with nothing further released.
/// Returns the parsed header and the number of plaintext bytes written.
///
/// # Errors
/// - `Error::Integrity` on any tampering or truncation
pub fn open<R, W, F>(
    key: &[u8],
    mut reader: R,
    mut writer: W,
    mut before_release: F,
) -> Result<(EnvelopeHeader, u64)>
where
    R: Read,
    W: Write,
    F: FnMut(&[u8]) -> Result<()>,
{
    let header = EnvelopeHeader::read_from(&mut reader)?;
    match header.algorithm {
        CipherAlgorithm::XChaCha20Poly1305 => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            let plaintext = zeroize::Zeroizing::new(aead::open_payload_body(key, &header, &body)?);
            before_release(&plaintext)?;
            writer.write_all(&plaintext)?;
            Ok((header, plaintext.len() as u64))
        }
        CipherAlgorithm::XChaCha20Poly1305Stream => {
            let written = DecryptingStream::new(key)?.decrypt_body(
                &header,
                reader,
                writer,
                before_release,
            )?;
            Ok((header, written))
        }
    }
}

/// Check whether `bytes` begin with the envelope magic.
pub fn looks_encrypted(bytes: &[u8]) -> bool {
    bytes.len() >= PREFIX_LEN && bytes[..4] == MAGIC && bytes[4] == FORMAT_VERSION
}
