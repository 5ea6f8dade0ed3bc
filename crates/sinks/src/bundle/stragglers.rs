//! Startup recovery of rolled-over files a previous run never uploaded

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// List rolled-over files in `dir` that still need uploading
///
/// A file qualifies when its name starts with `base_name` and is longer than
/// it; the live file itself and anything else in the directory is ignored.
/// Entries come back in directory listing order. Unreadable entries are
/// skipped; only a failure to list the directory is an error.
pub fn scan(dir: &Path, base_name: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.len() > base_name.len() && name.starts_with(base_name) {
            found.push(entry.path());
        }
    }

    Ok(found)
}
