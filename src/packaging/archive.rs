//! Archive readers for `.zip` and `.tar[.gz]` uploads.
//!
//! Entries are matched by file name regardless of directory, so
//! `my-tool/app.py` counts as the entry point. When several entries share a
//! name the last one in archive order wins. Directory entries are skipped.

use std::io::{Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use super::{PackagingError, decode};
use crate::constants::{ENTRYPOINT_FILE, MANIFEST_FILE, MAX_ARCHIVE_ENTRIES, MAX_ARCHIVE_ENTRY_SIZE};

/// The two files the validator cares about.
#[derive(Debug, Default)]
pub(crate) struct ArchiveContents {
    pub entrypoint: Option<String>,
    pub manifest: Option<String>,
}

impl ArchiveContents {
    fn accept(&mut self, entry_name: &str, reader: impl Read) -> Result<(), PackagingError> {
        let Some(file_name) = Path::new(entry_name).file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };
        let slot = if file_name == ENTRYPOINT_FILE {
            &mut self.entrypoint
        } else if file_name == MANIFEST_FILE {
            &mut self.manifest
        } else {
            return Ok(());
        };

        let mut data = Vec::new();
        reader
            .take(MAX_ARCHIVE_ENTRY_SIZE + 1)
            .read_to_end(&mut data)
            .map_err(|e| PackagingError::Archive(e.to_string()))?;
        if data.len() as u64 > MAX_ARCHIVE_ENTRY_SIZE {
            return Err(PackagingError::TooLarge {
                size: data.len() as u64,
                limit: MAX_ARCHIVE_ENTRY_SIZE,
            });
        }
        *slot = Some(decode(entry_name, &data)?);
        Ok(())
    }
}

/// Reads a zip archive.
pub(crate) fn read_zip(data: &[u8]) -> Result<ArchiveContents, PackagingError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| PackagingError::Archive(e.to_string()))?;
    if archive.len() > MAX_ARCHIVE_ENTRIES {
        return Err(PackagingError::Archive(format!(
            "too many entries ({} > {})",
            archive.len(),
            MAX_ARCHIVE_ENTRIES
        )));
    }

    let mut contents = ArchiveContents::default();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| PackagingError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        contents.accept(&name, entry)?;
    }
    Ok(contents)
}

/// Reads a tar archive, gzip-compressed when `gzip` is set.
pub(crate) fn read_tar(data: &[u8], gzip: bool) -> Result<ArchiveContents, PackagingError> {
    if gzip {
        scan_tar(tar::Archive::new(GzDecoder::new(data)))
    } else {
        scan_tar(tar::Archive::new(data))
    }
}

fn scan_tar<R: Read>(mut archive: tar::Archive<R>) -> Result<ArchiveContents, PackagingError> {
    let entries = archive
        .entries()
        .map_err(|e| PackagingError::Archive(e.to_string()))?;

    let mut contents = ArchiveContents::default();
    for (count, entry) in entries.enumerate() {
        if count >= MAX_ARCHIVE_ENTRIES {
            return Err(PackagingError::Archive(format!(
                "too many entries (> {})",
                MAX_ARCHIVE_ENTRIES
            )));
        }
        let entry = entry.map_err(|e| PackagingError::Archive(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| PackagingError::Archive(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        contents.accept(&name, entry)?;
    }
    Ok(contents)
}
