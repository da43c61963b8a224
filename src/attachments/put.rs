//! Write-once file placement.
//!
//! [`idempotent_put`] writes bytes to a sibling temp file and links it into
//! place without clobbering. Whenever the target turns out to exist already,
//! whether before the write or because a concurrent writer won the race, the
//! existing file is handed to a verifier instead of being overwritten.

use std::fs;
use std::io::Write;
use std::path::Path;

use super::AttachmentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    AlreadyPresent,
}

/// Restrict a file or directory to its owner.
pub(crate) fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// `mkdir -p` with owner-only permissions on newly created directories.
pub(crate) fn create_private_dir_all(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

pub fn idempotent_put<F>(target: &Path, data: &[u8], verify_existing: F) -> Result<PutOutcome, AttachmentError>
where
    F: Fn(&Path) -> Result<(), AttachmentError>,
{
    match fs::symlink_metadata(target) {
        Ok(_) => {
            verify_existing(target)?;
            return Ok(PutOutcome::AlreadyPresent);
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(AttachmentError::io("lstat attachment file", target, err)),
    }

    let dir = target
        .parent()
        .ok_or_else(|| AttachmentError::NotADirectory(target.to_path_buf()))?;
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}.tmp."))
        .tempfile_in(dir)
        .map_err(|err| AttachmentError::io("create temp attachment file", dir, err))?;
    restrict_permissions(tmp.path(), 0o600)
        .map_err(|err| AttachmentError::io("chmod temp attachment file", tmp.path(), err))?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| AttachmentError::io("write attachment file", tmp.path(), err))?;

    match tmp.persist_noclobber(target) {
        Ok(_) => Ok(PutOutcome::Written),
        Err(persist) => {
            // The temp file is removed when `persist.file` drops.
            if fs::symlink_metadata(target).is_ok() {
                drop(persist);
                verify_existing(target)?;
                Ok(PutOutcome::AlreadyPresent)
            } else {
                Err(AttachmentError::io(
                    "rename attachment file into place",
                    target,
                    persist.error,
                ))
            }
        }
    }
}
