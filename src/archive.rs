//! Directory ⇄ zip conversion used for artifact import and export.
//!
//! Entries are stored with `/`-separated paths relative to the packed directory.
//! Unpacking refuses any entry that would land outside the target directory.

use crate::error::{ModeldError, Result};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Leading bytes of a zip local file header
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Whether `bytes` look like a zip archive
#[must_use]
pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Pack every file and directory under `dir` into zip bytes
pub fn pack(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(ModeldError::Archive(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut entries = Vec::new();
    collect_entries(dir, dir, &mut entries)?;
    entries.sort();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, path) in entries {
        if path.is_dir() {
            writer
                .add_directory(name.as_str(), options)
                .map_err(|e| ModeldError::Archive(format!("Failed to add {name}: {e}")))?;
        } else {
            writer
                .start_file(name.as_str(), options)
                .map_err(|e| ModeldError::Archive(format!("Failed to add {name}: {e}")))?;
            writer.write_all(&fs::read(&path)?)?;
        }
    }

    let cursor = writer
        .finish()
        .map_err(|e| ModeldError::Archive(format!("Failed to finish archive: {e}")))?;
    Ok(cursor.into_inner())
}

/// Unpack zip bytes into `target`, creating it if needed
pub fn unpack(bytes: &[u8], target: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ModeldError::Archive(format!("Not a valid zip archive: {e}")))?;

    // Validate every entry before writing anything
    let mut plan = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| ModeldError::Archive(format!("Failed to read entry {i}: {e}")))?;
        let relative = safe_relative_path(entry.name())?;
        plan.push((i, relative, entry.is_dir()));
    }

    fs::create_dir_all(target)?;
    let mut written = Vec::new();

    for (i, relative, is_dir) in plan {
        let dest = target.join(&relative);
        if is_dir {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry = archive
            .by_index(i)
            .map_err(|e| ModeldError::Archive(format!("Failed to read entry {i}: {e}")))?;
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        fs::write(&dest, contents)?;
        written.push(relative);
    }

    Ok(written)
}

/// Relative, normal-components-only path for an entry name
pub(crate) fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut relative = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ModeldError::Archive(format!(
                    "Entry '{name}' escapes the target directory"
                )))
            }
        }
    }

    if relative.as_os_str().is_empty() || name.contains('\\') {
        return Err(ModeldError::Archive(format!("Invalid entry name '{name}'")));
    }

    Ok(relative)
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| ModeldError::Archive(format!("Failed to relativize path: {e}")))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if path.is_dir() {
            out.push((format!("{name}/"), path.clone()));
            collect_entries(root, &path, out)?;
        } else {
            out.push((name, path));
        }
    }
    Ok(())
}
