//! Preallocator (§4.J): reserves disk space for the final file up front so a
//! full disk fails fast at the start of a Download rather than partway
//! through the Merge Worker's copy.

use std::fs::File;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::error::DownloadError;

/// Creates (or truncates) `path` and reserves `size` bytes for it.
///
/// On Unix, prefers `posix_fallocate` for real block allocation; falls back
/// to `File::set_len` (a sparse-file resize) on failure or on non-Unix
/// targets. `set_len` always succeeds on space as long as the filesystem
/// permits sparse files, so this never blocks preallocation outright: the
/// worst case is a write-time ENOSPC deferred to the Fetchers instead of
/// caught here.
pub fn preallocate_file(path: &Path, size: u64) -> Result<File, DownloadError> {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| DownloadError::io("create final file", path.to_path_buf(), e))?;

    #[cfg(unix)]
    {
        let fd = file.as_raw_fd();
        let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
        if r == 0 {
            return Ok(file);
        }
        tracing::debug!(errno = r, path = %path.display(), "posix_fallocate failed, falling back to set_len");
    }

    file.set_len(size)
        .map_err(|e| DownloadError::io("preallocate final file", path.to_path_buf(), e))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn preallocates_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = preallocate_file(&path, 4096).unwrap();
        drop(file);
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 4096);
    }

    #[test]
    fn truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, vec![7u8; 10_000]).unwrap();
        preallocate_file(&path, 100).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), 100);
    }
}
