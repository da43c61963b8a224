//! Content-addressed attachment storage.
//!
//! Blobs live at `<base>/<hash[0:2]>/<hash>` where `hash` is the lowercase
//! hex SHA-256 of the content. Several importers may write the same content
//! at once; correctness relies on [`put::idempotent_put`] rather than locks.
//! An existing blob is never trusted blindly: its size and hash must match
//! what the caller is storing, otherwise the store reports corruption.

pub mod put;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use put::{create_private_dir_all, idempotent_put, restrict_permissions};

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("invalid attachment content hash {0:?}")]
    InvalidHash(String),
    #[error("attachment content hash mismatch: provided {declared:?}, computed {computed:?}")]
    HashMismatch { declared: String, computed: String },
    #[error("attachments dir {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("attachment dir {0} is a symlink")]
    SymlinkedDirectory(PathBuf),
    #[error("attachment file {0} is not a regular file")]
    NotRegularFile(PathBuf),
    #[error("attachment file {path} has size {actual}, want {expected}")]
    SizeMismatch {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
    #[error("attachment file {path} has hash {actual:?}, want {expected:?}")]
    ContentMismatch {
        path: PathBuf,
        actual: String,
        expected: String,
    },
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AttachmentError {
    pub(crate) fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        AttachmentError::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Location of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Path relative to the store root, `ab/abcdef...`.
    pub storage_path: String,
    pub content_hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ValidationKey {
    path: PathBuf,
    size: u64,
    hash: String,
}

pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

pub fn is_valid_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Compute the content hash, checking it against a caller-declared one.
pub fn resolve_content_hash(content: &[u8], declared: Option<&str>) -> Result<String, AttachmentError> {
    let computed = sha256_hex(content);
    let Some(declared) = declared.filter(|hash| !hash.is_empty()) else {
        return Ok(computed);
    };

    let normalized = declared.to_ascii_lowercase();
    if !is_valid_content_hash(&normalized) {
        return Err(AttachmentError::InvalidHash(normalized));
    }
    if normalized != computed {
        return Err(AttachmentError::HashMismatch {
            declared: normalized,
            computed,
        });
    }
    Ok(normalized)
}

pub struct AttachmentContentStore {
    base_dir: PathBuf,
    /// Absolute, symlink-resolved `base_dir` after its first successful setup.
    resolved_base: OnceLock<PathBuf>,
    /// (path, size, hash) -> modification time of the last successful check.
    validated: DashMap<ValidationKey, SystemTime>,
}

impl AttachmentContentStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            resolved_base: OnceLock::new(),
            validated: DashMap::new(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Store `content`, returning `None` when there is nothing to store.
    pub fn store(
        &self,
        content: &[u8],
        declared_hash: Option<&str>,
    ) -> Result<Option<StoredBlob>, AttachmentError> {
        if self.base_dir.as_os_str().is_empty() || content.is_empty() {
            return Ok(None);
        }

        let hash = resolve_content_hash(content, declared_hash)?;
        let prefix = &hash[..2];

        let base = self.resolved_base_dir()?;
        let subdir = ensure_subdir_safe(base, prefix)?;
        let target = subdir.join(&hash);
        let size = content.len() as u64;

        let outcome = idempotent_put(&target, content, |existing| {
            self.validate_existing(existing, size, &hash)
        })?;
        log::debug!("attachment {} {:?}", hash, outcome);

        Ok(Some(StoredBlob {
            storage_path: format!("{prefix}/{hash}"),
            content_hash: hash.clone(),
            size,
        }))
    }

    fn resolved_base_dir(&self) -> Result<&Path, AttachmentError> {
        if let Some(base) = self.resolved_base.get() {
            return Ok(base);
        }
        let resolved = self.prepare_base_dir()?;
        Ok(self.resolved_base.get_or_init(|| resolved))
    }

    fn prepare_base_dir(&self) -> Result<PathBuf, AttachmentError> {
        let base = std::path::absolute(&self.base_dir)
            .map_err(|err| AttachmentError::io("abs attachments dir", &self.base_dir, err))?;
        create_private_dir_all(&base)
            .map_err(|err| AttachmentError::io("create attachments dir", &base, err))?;
        restrict_permissions(&base, 0o700)
            .map_err(|err| AttachmentError::io("chmod attachments dir", &base, err))?;
        let resolved = fs::canonicalize(&base)
            .map_err(|err| AttachmentError::io("resolve attachments dir", &base, err))?;
        let metadata = fs::symlink_metadata(&resolved)
            .map_err(|err| AttachmentError::io("lstat attachments dir", &resolved, err))?;
        if !metadata.is_dir() {
            return Err(AttachmentError::NotADirectory(resolved));
        }
        Ok(resolved)
    }

    fn validate_existing(&self, path: &Path, size: u64, hash: &str) -> Result<(), AttachmentError> {
        let link = fs::symlink_metadata(path)
            .map_err(|err| AttachmentError::io("lstat attachment file", path, err))?;
        if !link.file_type().is_file() {
            return Err(AttachmentError::NotRegularFile(path.to_path_buf()));
        }

        let mut file = File::open(path)
            .map_err(|err| AttachmentError::io("open attachment file for validation", path, err))?;
        let metadata = file
            .metadata()
            .map_err(|err| AttachmentError::io("stat attachment file", path, err))?;
        if !metadata.is_file() {
            return Err(AttachmentError::NotRegularFile(path.to_path_buf()));
        }
        if metadata.len() != size {
            return Err(AttachmentError::SizeMismatch {
                path: path.to_path_buf(),
                actual: metadata.len(),
                expected: size,
            });
        }

        let key = ValidationKey {
            path: path.to_path_buf(),
            size,
            hash: hash.to_string(),
        };
        let modified = metadata.modified().ok();
        if let (Some(modified), Some(cached)) = (modified, self.validated.get(&key)) {
            if *cached == modified {
                return Ok(());
            }
        }

        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)
            .map_err(|err| AttachmentError::io("hash attachment file", path, err))?;
        let actual = format!("{:x}", hasher.finalize());
        if actual != hash {
            return Err(AttachmentError::ContentMismatch {
                path: path.to_path_buf(),
                actual,
                expected: hash.to_string(),
            });
        }

        if let Some(modified) = modified {
            self.validated.insert(key, modified);
        }
        Ok(())
    }
}

fn ensure_subdir_safe(base: &Path, prefix: &str) -> Result<PathBuf, AttachmentError> {
    let subdir = base.join(prefix);
    match fs::symlink_metadata(&subdir) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            return Err(AttachmentError::SymlinkedDirectory(subdir));
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(AttachmentError::io("lstat attachment dir", &subdir, err)),
    }
    create_private_dir_all(&subdir)
        .map_err(|err| AttachmentError::io("create attachment dir", &subdir, err))?;
    Ok(subdir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    const HELLO_HASH: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_stores_under_hash_prefix() {
        let tmp = TempDir::new().expect("tempdir");
        let store = AttachmentContentStore::new(tmp.path().join("attachments"));

        let blob = store.store(b"hello", None).expect("store").expect("blob");
        assert_eq!(blob.storage_path, format!("2c/{HELLO_HASH}"));
        assert_eq!(blob.size, 5);
        let on_disk = tmp.path().join("attachments").join(&blob.storage_path);
        assert_eq!(fs::read(on_disk).expect("read"), b"hello");
    }

    #[test]
    fn test_nothing_to_store() {
        let tmp = TempDir::new().expect("tempdir");
        let store = AttachmentContentStore::new(tmp.path());
        assert_eq!(store.store(b"", None).expect("store"), None);
        let disabled = AttachmentContentStore::new("");
        assert_eq!(disabled.store(b"hello", None).expect("store"), None);
    }

    #[test]
    fn test_declared_hash_is_checked_before_writing() {
        let tmp = TempDir::new().expect("tempdir");
        let base = tmp.path().join("attachments");
        let store = AttachmentContentStore::new(&base);

        let upper = HELLO_HASH.to_ascii_uppercase();
        assert!(store.store(b"hello", Some(upper.as_str())).expect("store").is_some());

        let wrong = "0".repeat(64);
        let err = store.store(b"other", Some(wrong.as_str())).expect_err("mismatch");
        assert!(matches!(err, AttachmentError::HashMismatch { .. }));
        let err = store.store(b"other", Some("xyz")).expect_err("invalid");
        assert!(matches!(err, AttachmentError::InvalidHash(_)));

        let other_hash = sha256_hex(b"other");
        assert!(!base.join(&other_hash[..2]).join(&other_hash).exists());
    }

    #[test]
    fn test_corrupt_existing_blob_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let store = AttachmentContentStore::new(tmp.path());
        let blob = store.store(b"hello", None).expect("store").expect("blob");
        let path = tmp.path().join(&blob.storage_path);

        fs::write(&path, b"HELLO").expect("corrupt");
        let fresh = AttachmentContentStore::new(tmp.path());
        let err = fresh.store(b"hello", None).expect_err("corruption");
        assert!(matches!(err, AttachmentError::ContentMismatch { .. }));

        fs::write(&path, b"hi").expect("truncate");
        let err = fresh.store(b"hello", None).expect_err("size");
        assert!(matches!(err, AttachmentError::SizeMismatch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_prefix_dir_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let elsewhere = TempDir::new().expect("tempdir");
        let base = tmp.path().join("attachments");
        fs::create_dir_all(&base).expect("mkdir");
        std::os::unix::fs::symlink(elsewhere.path(), base.join("2c")).expect("symlink");

        let store = AttachmentContentStore::new(&base);
        let err = store.store(b"hello", None).expect_err("symlink");
        assert!(matches!(err, AttachmentError::SymlinkedDirectory(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_base_dir_is_set_up_once() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir");
        let base = tmp.path().join("attachments");
        let store = AttachmentContentStore::new(&base);

        store.store(b"hello", None).expect("store").expect("blob");
        let mode = fs::metadata(&base).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        fs::set_permissions(&base, fs::Permissions::from_mode(0o750)).expect("chmod");
        store.store(b"other", None).expect("store").expect("blob");
        let mode = fs::metadata(&base).expect("stat").permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_concurrent_identical_writers() {
        let tmp = TempDir::new().expect("tempdir");
        let base = tmp.path().join("attachments");
        let content = vec![7u8; 256 * 1024];
        let barrier = Arc::new(Barrier::new(4));

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let base = base.clone();
                    let content = &content;
                    scope.spawn(move || {
                        let store = AttachmentContentStore::new(base);
                        barrier.wait();
                        store.store(content, None)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread"))
                .collect()
        });

        for result in &results {
            assert!(result.as_ref().expect("store").is_some());
        }
        let hash = sha256_hex(&content);
        let prefix_dir = base.join(&hash[..2]);
        let entries: Vec<_> = fs::read_dir(&prefix_dir)
            .expect("list")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(fs::read(prefix_dir.join(&hash)).expect("read"), content);
    }
}
