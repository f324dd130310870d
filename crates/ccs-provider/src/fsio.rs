use std::fs;
use std::io::{self, Read};
use std::path::Path;

use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// A bounded read refused the file or could not read it.
#[derive(Debug, Error)]
pub enum BoundedReadError {
    #[error("{path} exceeds the {limit}-byte limit")]
    TooLarge { path: String, limit: u64 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Reads a file to a string, refusing anything larger than `limit` bytes.
/// Token files are user-writable JSON; the bound keeps a corrupt or hostile
/// file from ballooning memory.
pub fn read_to_string_bounded(path: &Path, limit: u64) -> Result<String, BoundedReadError> {
    let io_err = |source| BoundedReadError::Io {
        path: path.display().to_string(),
        source,
    };

    let metadata = fs::metadata(path).map_err(io_err)?;
    if metadata.len() > limit {
        return Err(BoundedReadError::TooLarge {
            path: path.display().to_string(),
            limit,
        });
    }

    let file = fs::File::open(path).map_err(io_err)?;
    let mut contents = String::new();
    // take() guards against the file growing between stat and read.
    file.take(limit).read_to_string(&mut contents).map_err(io_err)?;
    Ok(contents)
}

/// Writes `contents` to `path` atomically: temp file in the same directory,
/// then rename. Readers never observe a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with_mode(path, contents, None)
}

/// [`write_atomic`] with owner-only (0600) permissions applied before the
/// rename, for token and registry files.
pub fn write_secret_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with_mode(path, contents, Some(0o600))
}

fn write_atomic_with_mode(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, contents)?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        let perms = fs::Permissions::from_mode(mode);
        fs::set_permissions(&temp_path, perms)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bounded_read_accepts_small_rejects_large() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token.json");
        fs::write(&path, "{}").unwrap();
        assert_eq!(read_to_string_bounded(&path, 1024).unwrap(), "{}");

        fs::write(&path, vec![b'x'; 64]).unwrap();
        assert!(matches!(
            read_to_string_bounded(&path, 16),
            Err(BoundedReadError::TooLarge { .. })
        ));
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn secret_write_is_owner_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("token.json");
        write_secret_atomic(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
