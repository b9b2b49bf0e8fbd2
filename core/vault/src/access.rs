//! Scoped plaintext access for collaborators.
//!
//! Decrypted content leaves the vault in two shapes: bytes that zeroize on
//! drop, and a [`MaterializedFile`] for tools that need a real path. A
//! materialized temporary is owner-only and removed when its guard drops,
//! whichever way the consumer exits.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::{decrypt_into, open_file};
use crate::config::TEMP_PREFIX;
use crate::manager::VaultInner;
use crate::migration::blocking;
use casevault_common::{CasePath, Error, Result, SensitiveBytes};

/// Plaintext path handed to a consumer for the duration of a scope.
#[derive(Debug)]
pub enum MaterializedFile {
    /// Decrypted copy, deleted on drop.
    Temporary(TempPath),
    /// The case file itself, which is stored as plaintext.
    Borrowed(PathBuf),
}

impl MaterializedFile {
    pub fn path(&self) -> &Path {
        match self {
            Self::Temporary(temp) => &**temp,
            Self::Borrowed(path) => path.as_path(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Release the file, reporting a failed removal.
    pub fn close(self) -> Result<()> {
        match self {
            Self::Temporary(temp) => Ok(temp.close()?),
            Self::Borrowed(_) => Ok(()),
        }
    }
}

impl AsRef<Path> for MaterializedFile {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}

/// Handle for reading case files regardless of their encryption state.
///
/// Cheap to clone; shares the session of the [`VaultManager`](crate::VaultManager)
/// that created it.
#[derive(Clone)]
pub struct ScopedDecryptedAccess {
    inner: Arc<VaultInner>,
}

impl ScopedDecryptedAccess {
    pub(crate) fn new(inner: Arc<VaultInner>) -> Self {
        Self { inner }
    }

    /// Whether `path` can be read directly from disk.
    pub async fn is_plaintext(&self, path: &CasePath) -> Result<bool> {
        let _gate = self.inner.gate.read().await;
        Ok(self.inner.entry_for(path).await?.is_none())
    }

    /// Read the whole plaintext of `path`.
    ///
    /// # Errors
    /// - `Error::Locked` or `Error::SessionExpired` for an encrypted file
    ///   without a live session
    /// - `Error::Integrity` if the ciphertext fails authentication or its hash
    /// - `Error::MigrationInterrupted` while a migration is pending
    /// - `Error::Conflict` while another process migrates the case
    ///
    /// Waits for a write of the same manager to commit first.
    pub async fn read(&self, path: &CasePath) -> Result<SensitiveBytes> {
        let src = self.inner.resolve(path)?;
        let _gate = self.inner.gate.read().await;
        let Some(entry) = self.inner.entry_for(path).await? else {
            let bytes = tokio::fs::read(&src).await?;
            return Ok(SensitiveBytes::new(bytes));
        };

        let lease = self.inner.session.acquire().await?;
        blocking(move || {
            let capacity = usize::try_from(entry.plaintext_size).unwrap_or(0);
            let mut buffer = Zeroizing::new(Vec::with_capacity(capacity));
            open_file(&*lease.key()?, &src, &entry, &mut *buffer, Some(&lease))?;
            Ok(SensitiveBytes::new(std::mem::take(&mut *buffer)))
        })
        .await
    }

    /// Produce a plaintext path for `path`.
    ///
    /// Encrypted files are decrypted into the configured temp directory;
    /// the temporary keeps the original extension so tools can sniff the
    /// format.
    pub async fn materialize(&self, path: &CasePath) -> Result<MaterializedFile> {
        let src = self.inner.resolve(path)?;
        let _gate = self.inner.gate.read().await;
        let Some(entry) = self.inner.entry_for(path).await? else {
            if !tokio::fs::try_exists(&src).await? {
                return Err(Error::NotFound(format!("{} does not exist", path)));
            }
            return Ok(MaterializedFile::Borrowed(src));
        };

        let lease = self.inner.session.acquire().await?;
        let dir = self
            .inner
            .config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let suffix = path.extension().map(|ext| format!(".{}", ext)).unwrap_or_default();

        let temp = blocking(move || {
            let temp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(&suffix)
                .tempfile_in(&dir)?;
            restrict_to_owner(temp.path())?;
            decrypt_into(&*lease.key()?, &src, &entry, &temp, Some(&lease))?;
            Ok(temp.into_temp_path())
        })
        .await?;

        debug!(path = %path, "Materialized plaintext");
        Ok(MaterializedFile::Temporary(temp))
    }

    /// Run `f` against a plaintext path of `path`, then release it.
    ///
    /// The temporary is removed even when `f` fails; `f`'s error wins over a
    /// removal error.
    pub async fn with_materialized<T, F>(&self, path: &CasePath, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let file = self.materialize(path).await?;
        let result = f(file.path());
        let closed = file.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Async form of [`with_materialized`](Self::with_materialized).
    pub async fn with_materialized_async<T, F, Fut>(&self, path: &CasePath, f: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let file = self.materialize(path).await?;
        let result = f(file.path().to_path_buf()).await;
        let closed = file.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
