//! Anonymous temporary files honoring `TMPDIR`. Prefers Linux's `O_TMPFILE`, which
//! creates an unnamed inode directly — no name to race on, nothing to
//! unlink — falling back to a named-then-unlinked file for filesystems
//! that reject it (NFS and a few others return `EOPNOTSUPP`).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;

use crate::error::RuntimeError;

fn tmp_dir() -> String {
    std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_owned())
}

/// Creates an anonymous temporary file. The returned handle has no
/// directory entry once this function returns: on the `O_TMPFILE` path
/// there never was one, and on the fallback path the name is unlinked
/// immediately after open.
pub fn create() -> Result<File, RuntimeError> {
    let dir = tmp_dir();

    let tmpfile_attempt = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_TMPFILE | libc::O_DIRECTORY | libc::O_CLOEXEC)
        .mode(0o600)
        .open(&dir);

    match tmpfile_attempt {
        Ok(file) => Ok(file),
        Err(e)
            if e.raw_os_error() == Some(libc::EISDIR)
                || e.raw_os_error() == Some(libc::EOPNOTSUPP) =>
        {
            create_named_then_unlink(&dir)
        }
        Err(e) => Err(e.into()),
    }
}

fn create_named_then_unlink(dir: &str) -> Result<File, RuntimeError> {
    let path = std::path::Path::new(dir).join(format!(".daemonrt-tmp-{}", std::process::id()));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_CLOEXEC)
        .mode(0o600)
        .open(&path)?;

    std::fs::remove_file(&path)?;

    Ok(file)
}
