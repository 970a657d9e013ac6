//! Capability-scoped file access for key material, CA bundles and compose
//! files.

use std::io::Write;

use camino::Utf8Path;
use cap_std::fs::{OpenOptions, OpenOptionsExt};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// When `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use prevue::fs::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &Utf8Path), String> {
    if path.is_absolute() {
        let parent = path
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path}"))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path}"))?;
        Ok((parent, Utf8Path::new(file_name)))
    } else {
        Ok((Utf8Path::new("."), path))
    }
}

/// Like [`split`], but anchors absolute paths at their deepest existing
/// ancestor so missing parents can be created inside it.
fn split_at_existing(path: &Utf8Path) -> Result<(&Utf8Path, &Utf8Path), String> {
    if !path.is_absolute() {
        return split(path);
    }
    let existing = path
        .ancestors()
        .skip(1)
        .find(|ancestor| ancestor.is_dir())
        .ok_or_else(|| format!("no existing parent directory for {path}"))?;
    let rest = path
        .strip_prefix(existing)
        .map_err(|err| format!("{path}: {err}"))?;
    Ok((existing, rest))
}

/// Reads a UTF-8 file after tilde expansion.
///
/// # Errors
///
/// Returns a message describing the failure, prefixed with the path.
pub fn read_to_string(path: &str) -> Result<String, String> {
    let expanded = expand_tilde(path);
    let path_buf = Utf8Path::new(&expanded);
    let (dir_path, file_path) = split(path_buf)?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| format!("{expanded}: {err}"))?;
    dir.read_to_string(file_path)
        .map_err(|err| format!("{expanded}: {err}"))
}

/// Returns `true` when `path` names an existing file.
#[must_use]
pub fn exists(path: &str) -> bool {
    let expanded = expand_tilde(path);
    let Ok((dir_path, file_path)) = split(Utf8Path::new(&expanded)) else {
        return false;
    };
    Dir::open_ambient_dir(dir_path, ambient_authority())
        .is_ok_and(|dir| dir.is_file(file_path))
}

/// Creates `path` with owner-only permissions, making parent directories as
/// needed. Fails if the file already exists.
///
/// # Errors
///
/// Returns a message describing the failure, prefixed with the path.
pub fn write_private(path: &str, contents: &str) -> Result<(), String> {
    let expanded = expand_tilde(path);
    let path_buf = Utf8Path::new(&expanded);
    let (dir_path, file_path) = split_at_existing(path_buf)?;
    let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
        .map_err(|err| format!("{expanded}: {err}"))?;
    if let Some(parent) = file_path.parent()
        && !parent.as_str().is_empty()
    {
        dir.create_dir_all(parent)
            .map_err(|err| format!("{expanded}: {err}"))?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    let mut file = dir
        .open_with(file_path, &options)
        .map_err(|err| format!("{expanded}: {err}"))?;
    file.write_all(contents.as_bytes())
        .map_err(|err| format!("{expanded}: {err}"))
}

/// Removes the file at `path`. Returns `false` when it did not exist.
///
/// # Errors
///
/// Returns a message describing the failure, prefixed with the path.
pub fn remove_file(path: &str) -> Result<bool, String> {
    let expanded = expand_tilde(path);
    let (dir_path, file_path) = split(Utf8Path::new(&expanded))?;
    let dir = match Dir::open_ambient_dir(dir_path, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(format!("{expanded}: {err}")),
    };
    match dir.remove_file(file_path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(format!("{expanded}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_files_read_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested/key");
        let path = path.to_str().expect("utf-8 path");
        write_private(path, "seed").expect("write");
        assert!(exists(path));
        assert_eq!(read_to_string(path).expect("read"), "seed");
        assert!(write_private(path, "again").is_err());
    }

    #[test]
    fn removing_reports_whether_the_file_existed() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("sessions/demo.port");
        let path = path.to_str().expect("utf-8 path");
        write_private(path, "4242").expect("write");
        assert_eq!(remove_file(path), Ok(true));
        assert!(!exists(path));
        assert_eq!(remove_file(path), Ok(false));
    }

    #[test]
    fn missing_files_report_their_path() {
        let err = read_to_string("/nonexistent-prevue-dir/file").expect_err("missing");
        assert!(err.contains("/nonexistent-prevue-dir/file"), "{err}");
    }
}
