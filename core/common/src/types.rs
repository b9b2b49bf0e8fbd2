//! Common types used throughout the case vault.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use zeroize::Zeroize;

/// Identifier of a case, used to label sessions and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(String);

impl CaseId {
    /// Create a new CaseId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "CaseId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Derive an id from the case directory name.
    pub fn from_dir(dir: &Path) -> crate::Result<Self> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.to_string_lossy().into_owned());
        Self::new(name)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file path relative to the case root.
///
/// This is the identity of a file in the manifest and the journal. It is
/// always relative, uses `/` as separator, and never contains `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CasePath {
    components: Vec<String>,
}

impl CasePath {
    /// Create a path from string components.
    ///
    /// # Errors
    /// - Returns error if the list is empty
    /// - Returns error if any component is empty, `.`, `..`, or contains a separator
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        if components.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Case path cannot be empty".to_string(),
            ));
        }
        for comp in &components {
            if comp.is_empty() || comp == "." || comp == ".." {
                return Err(crate::Error::InvalidInput(format!(
                    "Invalid path component: {:?}",
                    comp
                )));
            }
            if comp.contains('/') || comp.contains('\\') {
                return Err(crate::Error::InvalidInput(
                    "Path component cannot contain separators".to_string(),
                ));
            }
        }
        Ok(Self { components })
    }

    /// Parse a `/`-separated relative path.
    ///
    /// Leading and trailing separators are ignored.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let trimmed = path.trim_matches('/');
        let components = trimmed
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        Self::from_components(components)
    }

    /// Build the identity of `path`, which must live under `root`.
    pub fn from_fs_path(root: &Path, path: &Path) -> crate::Result<Self> {
        let relative = path.strip_prefix(root).map_err(|_| {
            crate::Error::InvalidInput(format!(
                "{} is outside the case directory",
                path.display()
            ))
        })?;

        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => components.push(
                    name.to_str()
                        .ok_or_else(|| {
                            crate::Error::InvalidInput(format!(
                                "Non UTF-8 file name under {}",
                                root.display()
                            ))
                        })?
                        .to_string(),
                ),
                _ => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Unsupported path component in {}",
                        relative.display()
                    )))
                }
            }
        }
        Self::from_components(components)
    }

    /// Resolve this path under a case root.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut fs_path = root.to_path_buf();
        for component in &self.components {
            fs_path.push(component);
        }
        fs_path
    }

    /// Get the file name (last component).
    pub fn name(&self) -> &str {
        // Construction guarantees at least one component.
        self.components.last().map(String::as_str).unwrap_or_default()
    }

    /// Extension of the file name, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(&name[idx + 1..]),
        }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Join the components with `/`.
    pub fn as_string(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for CasePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl TryFrom<String> for CasePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<CasePath> for String {
    fn from(path: CasePath) -> Self {
        path.as_string()
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SensitiveBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}
