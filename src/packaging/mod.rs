//! # Packaging Validator
//!
//! Decides whether an upload is safe to containerize and derives its
//! dependency manifest.
//!
//! ```text
//! (filename, bytes)
//!        │
//!        ├── .py ──────────────────────▶ source
//!        ├── .zip / .tar / .tar.gz ────▶ app.py (+ requirements.txt)
//!        └── anything else ────────────▶ UnsupportedFileType
//!                     │
//!              denylist scan ──▶ DangerousImport
//!                     │
//!       supplied manifest, or inferred from imports
//!                     ▼
//!            PackagedSource { source, manifest }
//! ```
//!
//! Everything here is pure: identical bytes always yield an identical result.

mod archive;
mod imports;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{DANGEROUS_IMPORTS, MAX_UPLOAD_SIZE};

pub use imports::{infer_manifest, top_level_imports};

/// Rejection reasons for an upload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackagingError {
    #[error("Unsupported file type. Upload .py, .zip, .tar or .tar.gz")]
    UnsupportedFileType,

    #[error("Archive must contain app.py")]
    MissingEntrypoint,

    #[error("Dangerous import detected: {0}")]
    DangerousImport(String),

    #[error("{0} is not valid UTF-8")]
    InvalidEncoding(String),

    #[error("Upload exceeds size limit: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unreadable archive: {0}")]
    Archive(String),
}

/// Where the manifest of a [`PackagedSource`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestOrigin {
    /// Derived from the entry point's imports.
    Inferred,
    /// Taken verbatim from the archive's `requirements.txt`.
    Supplied,
}

/// Validated upload: entry-point source plus dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedSource {
    pub source: String,
    pub manifest: String,
    pub manifest_origin: ManifestOrigin,
}

impl PackagedSource {
    /// Non-empty manifest lines.
    pub fn requirements(&self) -> Vec<&str> {
        self.manifest
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// `sha256:<hex>` over source and manifest; stable across uploads of the same bytes.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.manifest.as_bytes());
        format!("sha256:{:x}", hasher.finalize())
    }
}

/// Upload format, decided by file extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Script,
    Zip,
    Tar,
    TarGz,
}

impl UploadKind {
    /// Classifies `filename` by extension (case-insensitive).
    pub fn from_filename(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        if lower.ends_with(".py") {
            Some(Self::Script)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Validates an upload with the default size bound.
pub fn validate(filename: &str, data: &[u8]) -> Result<PackagedSource, PackagingError> {
    validate_with_limit(filename, data, MAX_UPLOAD_SIZE)
}

/// Validates an upload, rejecting anything larger than `max_bytes`.
pub fn validate_with_limit(
    filename: &str,
    data: &[u8],
    max_bytes: usize,
) -> Result<PackagedSource, PackagingError> {
    if data.len() > max_bytes {
        return Err(PackagingError::TooLarge {
            size: data.len() as u64,
            limit: max_bytes as u64,
        });
    }

    let kind = UploadKind::from_filename(filename).ok_or(PackagingError::UnsupportedFileType)?;
    let contents = match kind {
        UploadKind::Script => {
            let source = decode(filename, data)?;
            archive::ArchiveContents {
                entrypoint: Some(source),
                manifest: None,
            }
        }
        UploadKind::Zip => archive::read_zip(data)?,
        UploadKind::Tar => archive::read_tar(data, false)?,
        UploadKind::TarGz => archive::read_tar(data, true)?,
    };

    let source = contents.entrypoint.ok_or(PackagingError::MissingEntrypoint)?;
    detect_dangerous(&source)?;

    let packaged = match contents.manifest {
        Some(manifest) => PackagedSource {
            source,
            manifest,
            manifest_origin: ManifestOrigin::Supplied,
        },
        None => PackagedSource {
            manifest: infer_manifest(&source),
            source,
            manifest_origin: ManifestOrigin::Inferred,
        },
    };
    Ok(packaged)
}

/// Literal substring scan against [`DANGEROUS_IMPORTS`].
pub fn detect_dangerous(source: &str) -> Result<(), PackagingError> {
    match DANGEROUS_IMPORTS.iter().find(|banned| source.contains(*banned)) {
        Some(banned) => Err(PackagingError::DangerousImport((*banned).to_string())),
        None => Ok(()),
    }
}

pub(crate) fn decode(name: &str, data: &[u8]) -> Result<String, PackagingError> {
    String::from_utf8(data.to_vec()).map_err(|_| PackagingError::InvalidEncoding(name.to_string()))
}
