//! File checks and copies for stage directories.

use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Returns true if `path` is a regular file with at least one byte.
#[must_use]
pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Names from `names` that are missing or empty in `dir`, in input order.
#[must_use]
pub fn missing_or_empty<S: AsRef<str>>(dir: &Path, names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !is_non_empty_file(&dir.join(name)))
        .map(str::to_string)
        .collect()
}

/// Copies `source` into `dir`, keeping its file name.
pub fn copy_into(source: &Path, dir: &Path) -> io::Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", source.display()),
        )
    })?;
    let target = dir.join(name);
    fs::copy(source, &target)?;
    Ok(target)
}

/// Converts a shell glob (`*`, `?`) matching a single file name into an
/// anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Regular files directly inside `dir` whose names match `pattern`, sorted.
pub fn matching_files(dir: &Path, pattern: &Regex) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if pattern.is_match(name) {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    Ok(found)
}
