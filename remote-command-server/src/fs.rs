//! Path resolution and the filesystem operations behind the dispatcher.
//!
//! The wire protocol reports a single success flag per operation, so errors
//! are deliberately collapsed into booleans here instead of being propagated.

use std::fs;
use std::path::{Path, PathBuf};

use remote_command_proto::{DirectoryEntry, DirectoryListing, EntryKind};

/// Resolves a request-supplied path against the session working directory.
/// Absolute paths pass through untouched; traversal above the working
/// directory is not restricted.
pub(crate) fn resolve_path(cwd: &Path, input: &str) -> PathBuf {
    let path = Path::new(input);
    if path.is_absolute() {
        path.to_owned()
    } else {
        cwd.join(path)
    }
}

/// Initial working directory: the supplied path canonicalized, falling back
/// to the literal path when canonicalization fails, or the process CWD when
/// the argument is empty.
pub(crate) fn initial_working_directory(arg: &str) -> PathBuf {
    let path = if arg.is_empty() {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    } else {
        PathBuf::from(arg)
    };

    path.canonicalize().unwrap_or(path)
}

/// Best-effort listing: an unreadable directory yields an empty listing,
/// unreadable entries are skipped, and so is anything that is neither a
/// regular file nor a directory.
pub(crate) fn list_directory(path: &Path) -> DirectoryListing {
    let mut listing = DirectoryListing::default();

    let Ok(entries) = fs::read_dir(path) else {
        return listing;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if file_type.is_dir() {
            listing.entries.push(DirectoryEntry::new(EntryKind::Directory, name));
        } else if file_type.is_file() {
            listing.entries.push(DirectoryEntry::new(EntryKind::File, name));
        }
    }

    listing
}

/// Reports `true` only when a directory was actually created; asking for a
/// directory that already exists is a failure to the caller.
pub(crate) fn create_directory(path: &Path) -> bool {
    if path.is_dir() {
        return false;
    }

    fs::create_dir_all(path).is_ok()
}

/// Removes the target and everything below it. Reports `true` only when at
/// least one entry was removed, so a nonexistent target is a failure.
pub(crate) fn remove_directory(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    removed.is_ok()
}

/// Recursive copy; the source may be a single file. Any error reports as
/// `false`, possibly leaving a partial destination behind.
pub(crate) fn copy_directory(from: &Path, to: &Path) -> bool {
    copy_recursive(from, to).is_ok()
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::metadata(from)?.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        fs::copy(from, to)?;
    }

    Ok(())
}

/// Rename-based move.
pub(crate) fn move_directory(from: &Path, to: &Path) -> bool {
    fs::rename(from, to).is_ok()
}

/// Writes an uploaded file, creating parent directories first.
pub(crate) fn write_file(path: &Path, data: &[u8]) -> bool {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    fs::write(path, data).is_ok()
}

/// Reads a file for download; `None` when it cannot be opened.
pub(crate) fn read_file(path: &Path) -> Option<Vec<u8>> {
    fs::read(path).ok()
}
