//! Mailbox discovery for Apple Mail directory trees.
//!
//! A mailbox is a directory named `*.mbox` or `*.imapmbox` holding its
//! message files either directly in `Messages/` or, in newer layouts, in
//! `<account GUID>/Data/Messages/`.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;
use walkdir::WalkDir;

use super::EmlxError;

const MESSAGES_DIR: &str = "Messages";
const MAILBOX_SUFFIXES: [&str; 2] = [".imapmbox", ".mbox"];

/// One discovered mailbox and its eligible message files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub path: PathBuf,
    pub label: String,
    pub messages_dir: PathBuf,
    /// File names inside `messages_dir`, sorted.
    pub files: Vec<String>,
}

impl Mailbox {
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.messages_dir.join(name)
    }
}

/// Find every non-empty mailbox under `root`, sorted by path.
///
/// When `root` is itself a mailbox only that mailbox is returned.
pub fn discover_mailboxes(root: &Path) -> Result<Vec<Mailbox>, EmlxError> {
    let root = std::path::absolute(root).map_err(|source| EmlxError::Read {
        path: root.to_path_buf(),
        source,
    })?;
    let metadata = fs::metadata(&root).map_err(|source| EmlxError::Read {
        path: root.clone(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(EmlxError::NotADirectory(root));
    }

    if let Some(messages_dir) = messages_dir_for(&root) {
        let files = list_emlx_files(&messages_dir)?;
        if !files.is_empty() {
            let parent = root.parent().unwrap_or(&root).to_path_buf();
            return Ok(vec![Mailbox {
                label: label_from_path(&parent, &root),
                path: root,
                messages_dir,
                files,
            }]);
        }
    }

    let mut mailboxes = Vec::new();
    let walker = WalkDir::new(&root)
        .into_iter()
        .filter_entry(|entry| entry.file_name() != MESSAGES_DIR);
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        let Some(messages_dir) = messages_dir_for(path) else {
            continue;
        };
        let files = match list_emlx_files(&messages_dir) {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => continue,
            Err(err) => {
                log::warn!("skipping mailbox {}: {}", path.display(), err);
                continue;
            }
        };
        mailboxes.push(Mailbox {
            label: label_from_path(&root, path),
            path: path.to_path_buf(),
            messages_dir,
            files,
        });
    }

    mailboxes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(mailboxes)
}

fn has_mailbox_suffix(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    MAILBOX_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

fn strip_mailbox_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    MAILBOX_SUFFIXES
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| &name[..name.len() - suffix.len()])
        .unwrap_or(name)
}

/// Message directory of a mailbox container, if `path` is one.
fn messages_dir_for(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    if !has_mailbox_suffix(name) {
        return None;
    }

    let legacy = path.join(MESSAGES_DIR);
    if legacy.is_dir() {
        return Some(legacy);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(path)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| entry.path().join("Data").join(MESSAGES_DIR))
        .filter(|dir| dir.is_dir())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn is_eligible_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".emlx") && !lower.ends_with(".partial.emlx")
}

fn list_emlx_files(messages_dir: &Path) -> Result<Vec<String>, EmlxError> {
    let entries = match fs::read_dir(messages_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(EmlxError::Read {
                path: messages_dir.to_path_buf(),
                source,
            });
        }
    };

    let mut files: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| !kind.is_dir()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_eligible_file(name))
        .collect();
    files.sort();
    Ok(files)
}

fn is_wrapper_segment(segment: &str) -> bool {
    segment == "Mailboxes"
        || segment.starts_with("IMAP-")
        || segment.starts_with("POP-")
        || (segment.len() == 36 && Uuid::try_parse(segment).is_ok())
}

/// Derive a label from the mailbox path relative to `root`.
pub fn label_from_path(root: &Path, mailbox: &Path) -> String {
    let fallback = || {
        mailbox
            .file_name()
            .map(|name| strip_mailbox_suffix(&name.to_string_lossy()).to_string())
            .unwrap_or_default()
    };

    let Ok(relative) = mailbox.strip_prefix(root) else {
        return fallback();
    };

    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .filter(|part| !is_wrapper_segment(part))
        .map(|part| strip_mailbox_suffix(&part).to_string())
        .collect();

    if parts.is_empty() {
        fallback()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"0\n").expect("write");
    }

    #[test]
    fn test_label_from_path() {
        let root = Path::new("/Mail");
        assert_eq!(
            label_from_path(root, Path::new("/Mail/Mailboxes/Classes/Accardi.mbox")),
            "Classes/Accardi"
        );
        assert_eq!(
            label_from_path(root, Path::new("/Mail/IMAP-user@host/INBOX.imapmbox")),
            "INBOX"
        );
        assert_eq!(
            label_from_path(root, Path::new("/Mail/POP-user@host/Sent Messages.mbox")),
            "Sent Messages"
        );
        assert_eq!(
            label_from_path(root, Path::new("/Mail/Mailboxes/Sent.mbox")),
            "Sent"
        );
        assert_eq!(
            label_from_path(
                root,
                Path::new("/Mail/V10/2F1A9C4E-1B2C-4D5E-8F90-A1B2C3D4E5F6/Work.mbox")
            ),
            "V10/Work"
        );
        assert_eq!(label_from_path(root, Path::new("/Mail/INBOX.mbox")), "INBOX");
        assert_eq!(label_from_path(root, Path::new("/Mail/Mailboxes")), "Mailboxes");
    }

    #[test]
    fn test_discovers_legacy_and_modern_layouts() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path();
        touch(&root.join("Mailboxes/Inbox.mbox/Messages/2.emlx"));
        touch(&root.join("Mailboxes/Inbox.mbox/Messages/1.emlx"));
        touch(&root.join("Mailboxes/Inbox.mbox/Messages/3.partial.emlx"));
        touch(&root.join("Mailboxes/Inbox.mbox/Messages/notes.txt"));
        touch(&root.join(
            "IMAP-me@example.com/Archive.imapmbox/0A1B2C3D-0000-4000-8000-000000000001/Data/Messages/10.EMLX",
        ));
        fs::create_dir_all(root.join("Mailboxes/Empty.mbox/Messages")).expect("mkdir");

        let mailboxes = discover_mailboxes(root).expect("discover");
        let labels: Vec<&str> = mailboxes.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["Archive", "Inbox"]);
        assert_eq!(mailboxes[0].files, vec!["10.EMLX"]);
        assert_eq!(mailboxes[1].files, vec!["1.emlx", "2.emlx"]);
        assert!(mailboxes[1].file_path("1.emlx").ends_with("Inbox.mbox/Messages/1.emlx"));
    }

    #[test]
    fn test_root_that_is_a_mailbox() {
        let tmp = TempDir::new().expect("tempdir");
        let mailbox = tmp.path().join("INBOX.mbox");
        touch(&mailbox.join("Messages/1.emlx"));

        let mailboxes = discover_mailboxes(&mailbox).expect("discover");
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].label, "INBOX");
    }

    #[test]
    fn test_root_must_be_directory() {
        let tmp = TempDir::new().expect("tempdir");
        let file = tmp.path().join("file.txt");
        fs::write(&file, b"x").expect("write");
        assert!(matches!(
            discover_mailboxes(&file),
            Err(EmlxError::NotADirectory(_))
        ));
    }
}
