//! Whole-file encryption and decryption against manifest entries.
//!
//! Every sealed file is written to a temporary sibling and decrypted back
//! before it is handed to the committer, so an encoder fault never replaces
//! good plaintext with unreadable ciphertext.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use zeroize::Zeroizing;

use crate::config::TEMP_PREFIX;
use crate::manifest::FileEntry;
use crate::session::KeyLease;
use casevault_common::{CasePath, Error, Result};
use casevault_crypto::envelope::{self, EnvelopeHeader};
use casevault_crypto::{FileKey, MasterKey};

/// Mode selection and chunking for new ciphertexts.
#[derive(Debug, Clone, Copy)]
pub struct CipherParams {
    pub streaming_threshold: u64,
    pub chunk_size: usize,
}

/// Content key of `path` under `key`.
pub fn file_key(key: &MasterKey, path: &CasePath) -> FileKey {
    key.derive_file_key(path.as_string().as_bytes())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> (u64, String) {
        (self.count, hex(&self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn temp_in(dir: &Path) -> Result<NamedTempFile> {
    Ok(tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?)
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", path.display())))
}

/// Encrypt `reader` into a temporary file in `dir` and verify it decrypts
/// back to the same bytes.
fn seal_reader<R: Read>(
    key: &MasterKey,
    path: &CasePath,
    reader: R,
    len_hint: u64,
    dir: &Path,
    params: CipherParams,
) -> Result<(TempPath, FileEntry)> {
    let fkey = file_key(key, path);
    let mut temp = temp_in(dir)?;
    let mut hashing = HashingReader::new(reader);

    let info = {
        let mut writer = BufWriter::new(temp.as_file_mut());
        let info = envelope::seal(
            fkey.as_bytes(),
            &mut hashing,
            &mut writer,
            len_hint,
            params.streaming_threshold,
            params.chunk_size,
        )?;
        writer.flush()?;
        info
    };
    temp.as_file().sync_all()?;
    let (plaintext_size, plaintext_hash) = hashing.finish();

    let entry = FileEntry {
        path: path.clone(),
        algorithm: info.algorithm,
        nonce_base: info.nonce,
        plaintext_size,
        plaintext_hash,
        encrypted_size: temp.as_file().metadata()?.len(),
        encrypted_at: Utc::now(),
    };

    // Round trip before the ciphertext may replace anything.
    let mut file = temp.reopen()?;
    file.seek(SeekFrom::Start(0))?;
    open_reader(key, BufReader::new(file), &entry, io::sink(), None).map_err(|e| {
        Error::Integrity(format!("Round-trip verification failed for {}: {}", path, e))
    })?;

    Ok((temp.into_temp_path(), entry))
}

/// Encrypt the plaintext file `src` (case path `path`) into a verified
/// temporary sibling.
pub fn seal_file(
    key: &MasterKey,
    path: &CasePath,
    src: &Path,
    params: CipherParams,
) -> Result<(TempPath, FileEntry)> {
    let file = File::open(src)?;
    let metadata = file.metadata()?;
    let (temp, entry) = seal_reader(
        key,
        path,
        BufReader::new(file),
        metadata.len(),
        parent_of(src)?,
        params,
    )?;
    fs::set_permissions(&temp, metadata.permissions())?;
    Ok((temp, entry))
}

/// Encrypt in-memory plaintext for `path` into a verified temporary in `dir`.
pub fn seal_bytes(
    key: &MasterKey,
    path: &CasePath,
    bytes: &[u8],
    dir: &Path,
    params: CipherParams,
) -> Result<(TempPath, FileEntry)> {
    seal_reader(key, path, bytes, bytes.len() as u64, dir, params)
}

/// Re-encrypt `src` from `old` to `new` without plaintext touching disk.
///
/// Decryption runs on a helper thread feeding a bounded channel, so memory
/// stays bounded for streamed files.
pub fn reseal_file(
    old: &MasterKey,
    new: &MasterKey,
    src: &Path,
    entry: &FileEntry,
    params: CipherParams,
) -> Result<(TempPath, FileEntry)> {
    let dir = parent_of(src)?;
    let metadata = fs::metadata(src)?;

    let (sealed, opened) = std::thread::scope(|scope| {
        let (tx, rx) = sync_channel(4);
        let decrypt = scope.spawn(move || {
            let file = BufReader::new(File::open(src)?);
            open_reader(old, file, entry, ChannelWriter(tx), None)
        });
        let sealed = seal_reader(
            new,
            &entry.path,
            ChannelReader::new(rx),
            entry.plaintext_size,
            dir,
            params,
        );
        let opened = decrypt
            .join()
            .unwrap_or_else(|_| Err(Error::Vault("Decrypt worker panicked".to_string())));
        (sealed, opened)
    });

    let (temp, new_entry) = sealed.and_then(|s| opened.map(|_| s))?;
    if new_entry.plaintext_hash != entry.plaintext_hash {
        return Err(Error::Integrity(format!(
            "Re-encrypted content of {} differs from the original",
            entry.path
        )));
    }
    fs::set_permissions(&temp, metadata.permissions())?;
    Ok((temp, new_entry))
}

/// Decrypt the ciphertext file `src` into a temporary sibling, ready to be
/// renamed over it.
pub fn unseal_file(key: &MasterKey, src: &Path, entry: &FileEntry) -> Result<TempPath> {
    let metadata = fs::metadata(src)?;
    let temp = temp_in(parent_of(src)?)?;
    decrypt_into(key, src, entry, &temp, None)?;
    fs::set_permissions(temp.path(), metadata.permissions())?;
    Ok(temp.into_temp_path())
}

/// Decrypt `src` into an already created temporary file and fsync it.
pub fn decrypt_into(
    key: &MasterKey,
    src: &Path,
    entry: &FileEntry,
    temp: &NamedTempFile,
    lease: Option<&KeyLease>,
) -> Result<u64> {
    let written = {
        let mut writer = BufWriter::new(temp.as_file());
        let written = open_file(key, src, entry, &mut writer, lease)?;
        writer.flush()?;
        written
    };
    temp.as_file().sync_all()?;
    Ok(written)
}

/// Decrypt the ciphertext file `src` into `writer`.
///
/// With a lease, every chunk is checked against the session before release.
///
/// # Errors
/// - `Error::Integrity` if the header does not match the entry, any chunk
///   fails authentication, or the content hash differs
/// - `Error::SessionExpired` if the session ended mid-file
pub fn open_file<W: Write>(
    key: &MasterKey,
    src: &Path,
    entry: &FileEntry,
    writer: W,
    lease: Option<&KeyLease>,
) -> Result<u64> {
    let file = File::open(src)?;
    open_reader(key, BufReader::new(file), entry, writer, lease)
}

fn open_reader<R: Read, W: Write>(
    key: &MasterKey,
    mut reader: R,
    entry: &FileEntry,
    writer: W,
    lease: Option<&KeyLease>,
) -> Result<u64> {
    let header = EnvelopeHeader::read_from(&mut reader)?;
    if header.algorithm != entry.algorithm || header.nonce != entry.nonce_base {
        return Err(Error::Integrity(format!(
            "Ciphertext of {} does not match its manifest entry",
            entry.path
        )));
    }

    // Hand the parsed header back in front of the remaining body.
    let header_bytes = header.to_bytes();
    let chained = io::Cursor::new(header_bytes).chain(reader);

    let fkey = file_key(key, &entry.path);
    let mut hashing = HashingWriter {
        inner: writer,
        hasher: Sha256::new(),
    };
    let (_, written) = envelope::open(fkey.as_bytes(), chained, &mut hashing, |_| match lease {
        Some(lease) => lease.check(),
        None => Ok(()),
    })?;

    let hash = hex(&hashing.hasher.finalize());
    if written != entry.plaintext_size || hash != entry.plaintext_hash {
        return Err(Error::Integrity(format!(
            "Content hash mismatch for {}",
            entry.path
        )));
    }
    Ok(written)
}

struct ChannelWriter(SyncSender<Zeroizing<Vec<u8>>>);

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(Zeroizing::new(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelReader {
    rx: Receiver<Zeroizing<Vec<u8>>>,
    current: Zeroizing<Vec<u8>>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Zeroizing<Vec<u8>>>) -> Self {
        Self {
            rx,
            current: Zeroizing::new(Vec::new()),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.current.len() {
            match self.rx.recv() {
                Ok(next) => {
                    self.current = next;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
