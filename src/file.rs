//! File versions, file histories and conflict naming.

use std::{collections::BTreeMap, fmt};

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, FileChecksum, FileHistoryId};

/// Kind of filesystem object a version describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileType {
    /// A regular file.
    File,
    /// A directory.
    Folder,
    /// A symbolic link.
    Symlink,
}

/// How a version relates to its predecessor in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FileStatus {
    /// First version of a history.
    New,
    /// Content changed.
    Changed,
    /// Path changed.
    Renamed,
    /// The file was deleted. Terminal.
    Deleted,
    /// The history was folded into another one that covers the same path
    /// with the same content. Terminal.
    Merged,
}

impl FileStatus {
    /// Terminal statuses end a history; nothing may follow them.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Deleted | FileStatus::Merged)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::New => "new",
            FileStatus::Changed => "changed",
            FileStatus::Renamed => "renamed",
            FileStatus::Deleted => "deleted",
            FileStatus::Merged => "merged",
        };
        f.write_str(s)
    }
}

/// One immutable version of one file.
///
/// The field order doubles as the deterministic tie break order: when two
/// divergent versions carry the same `updated` timestamp, the conflict
/// resolver falls back to the derived [`Ord`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileVersion {
    /// Version number within the history, starting at 1.
    pub version: u64,
    /// Relative path, `/`-separated.
    pub path: String,
    /// What kind of filesystem object this is.
    pub file_type: FileType,
    /// Relation to the previous version.
    pub status: FileStatus,
    /// Size in bytes, zero for folders.
    pub size: u64,
    /// Filesystem mtime, milliseconds since the epoch.
    pub last_modified: u64,
    /// When this version was recorded, milliseconds since the epoch.
    pub updated: u64,
    /// Content checksum; `None` for folders and symlinks.
    pub checksum: Option<FileChecksum>,
    /// Client that created this version, when known.
    pub created_by: Option<ClientId>,
    /// Symlink target, for symlinks only.
    pub link_target: Option<String>,
}

impl FileVersion {
    /// The final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Error appending a version to a history.
///
/// Both variants indicate a bug in the caller, not an environmental
/// fault: version numbers are assigned by this crate and must arrive in
/// order.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// Version numbers within a history object grow by exactly one.
    #[error("version {got} does not follow {last} in history {history:?}")]
    NonMonotonic {
        /// The history being appended to.
        history: FileHistoryId,
        /// Highest version currently held.
        last: u64,
        /// The rejected version number.
        got: u64,
    },
    /// Nothing may follow a deleted or merged version.
    #[error("history {history:?} is terminated at version {last}")]
    Terminated {
        /// The history being appended to.
        history: FileHistoryId,
        /// The terminal version.
        last: u64,
    },
}

/// The (partial) lineage of one file: its versions in order.
///
/// A database version carries only the file versions it adds, so a
/// history object may start anywhere in the lineage; the database's full
/// view glues the pieces back together. Within one object the version
/// numbers are contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    id: FileHistoryId,
    versions: BTreeMap<u64, FileVersion>,
}

impl FileHistory {
    /// Create an empty history.
    pub fn new(id: FileHistoryId) -> Self {
        Self {
            id,
            versions: BTreeMap::new(),
        }
    }

    /// The history's identity.
    pub fn id(&self) -> &FileHistoryId {
        &self.id
    }

    /// Append the next version.
    ///
    /// The version number must be exactly one above the last version held
    /// here (any number at least 1 starts an empty object), and the last
    /// version must not be terminal.
    pub fn add(&mut self, version: FileVersion) -> Result<(), HistoryError> {
        if let Some(last) = self.last() {
            if last.status.is_terminal() {
                return Err(HistoryError::Terminated {
                    history: self.id,
                    last: last.version,
                });
            }
            if version.version != last.version + 1 {
                return Err(HistoryError::NonMonotonic {
                    history: self.id,
                    last: last.version,
                    got: version.version,
                });
            }
        } else if version.version == 0 {
            return Err(HistoryError::NonMonotonic {
                history: self.id,
                last: 0,
                got: 0,
            });
        }
        self.versions.insert(version.version, version);
        Ok(())
    }

    /// Union `other`'s versions into this history, skipping version
    /// numbers already present. Returns how many versions were added.
    ///
    /// Unlike [`add`](Self::add) this accepts pieces in any order, so the
    /// database can glue partial histories from different files back
    /// together. It assumes overlapping version numbers carry identical
    /// versions; divergent histories must be reconciled before merging.
    pub(crate) fn merge_versions(&mut self, other: &FileHistory) -> usize {
        let mut added = 0;
        for version in other.versions() {
            if !self.versions.contains_key(&version.version) {
                self.versions.insert(version.version, version.clone());
                added += 1;
            }
        }
        added
    }

    /// Drop every version numbered `at` or higher. Returns the removed
    /// versions in order.
    pub(crate) fn truncate_from(&mut self, at: u64) -> Vec<FileVersion> {
        self.versions.split_off(&at).into_values().collect()
    }

    /// The version with the given number, if held here.
    pub fn get(&self, version: u64) -> Option<&FileVersion> {
        self.versions.get(&version)
    }

    /// The earliest version held here.
    pub fn first(&self) -> Option<&FileVersion> {
        self.versions.values().next()
    }

    /// The latest version held here.
    pub fn last(&self) -> Option<&FileVersion> {
        self.versions.values().next_back()
    }

    /// Iterate over the versions in version order.
    pub fn versions(&self) -> impl Iterator<Item = &FileVersion> {
        self.versions.values()
    }

    /// Number of versions held here.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version is held here.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// The rename target for the losing side of a path conflict.
///
/// Built only from the loser's own fields, so every replica synthesizes
/// the same name: `report.txt` last edited by `bob` becomes
/// `report (bob's conflicted copy, 25 Aug 26, 8-15 PM).txt`. Times render
/// in UTC for the same reason.
pub fn conflicted_copy_name(version: &FileVersion) -> String {
    let date = DateTime::from_timestamp_millis(version.updated as i64)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .format("%-d %b %y, %-I-%M %p");
    let owner = match &version.created_by {
        Some(client) => format!("{client}'s conflicted copy"),
        None => "conflicted copy".to_string(),
    };
    let name = version.name();
    let (stem, ext) = match name.rfind('.') {
        // a leading dot is a hidden file, not an extension
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    format!("{stem} ({owner}, {date}){ext}")
}

/// Like [`conflicted_copy_name`], but keeping the parent directory.
pub fn conflicted_copy_path(version: &FileVersion) -> String {
    let name = conflicted_copy_name(version);
    match version.path.rfind('/') {
        Some(pos) => format!("{}/{}", &version.path[..pos], name),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(n: u64, status: FileStatus) -> FileVersion {
        FileVersion {
            version: n,
            path: "docs/report.txt".to_string(),
            file_type: FileType::File,
            status,
            size: 10,
            last_modified: 1_000,
            updated: 2_000,
            checksum: Some(FileChecksum::of(b"content")),
            created_by: Some(ClientId::new("bob").unwrap()),
            link_target: None,
        }
    }

    #[test]
    fn test_add_requires_contiguous_versions() {
        let mut history = FileHistory::new(FileHistoryId::from_bytes([1; 20]));
        history.add(version(1, FileStatus::New)).unwrap();
        history.add(version(2, FileStatus::Changed)).unwrap();
        let err = history.add(version(4, FileStatus::Changed)).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::NonMonotonic { last: 2, got: 4, .. }
        ));
    }

    #[test]
    fn test_partial_history_may_start_anywhere() {
        let mut tail = FileHistory::new(FileHistoryId::from_bytes([1; 20]));
        tail.add(version(7, FileStatus::Changed)).unwrap();
        tail.add(version(8, FileStatus::Changed)).unwrap();
        assert_eq!(tail.first().unwrap().version, 7);
    }

    #[test]
    fn test_nothing_follows_terminal_status() {
        let mut history = FileHistory::new(FileHistoryId::from_bytes([1; 20]));
        history.add(version(1, FileStatus::New)).unwrap();
        history.add(version(2, FileStatus::Deleted)).unwrap();
        let err = history.add(version(3, FileStatus::New)).unwrap_err();
        assert!(matches!(err, HistoryError::Terminated { last: 2, .. }));
    }

    #[test]
    fn test_version_zero_is_rejected() {
        let mut history = FileHistory::new(FileHistoryId::from_bytes([1; 20]));
        assert!(history.add(version(0, FileStatus::New)).is_err());
    }

    #[test]
    fn test_merge_versions_glues_pieces() {
        let id = FileHistoryId::from_bytes([1; 20]);
        let mut head = FileHistory::new(id);
        head.add(version(1, FileStatus::New)).unwrap();
        let mut tail = FileHistory::new(id);
        tail.add(version(2, FileStatus::Changed)).unwrap();
        tail.add(version(3, FileStatus::Changed)).unwrap();

        assert_eq!(head.merge_versions(&tail), 2);
        assert_eq!(head.len(), 3);
        // merging again adds nothing
        assert_eq!(head.merge_versions(&tail), 0);
    }

    #[test]
    fn test_truncate_from() {
        let id = FileHistoryId::from_bytes([1; 20]);
        let mut history = FileHistory::new(id);
        history.add(version(1, FileStatus::New)).unwrap();
        history.add(version(2, FileStatus::Changed)).unwrap();
        history.add(version(3, FileStatus::Changed)).unwrap();

        let removed = history.truncate_from(2);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].version, 2);
        assert_eq!(history.last().unwrap().version, 1);
    }

    #[test]
    fn test_conflicted_copy_name() {
        let mut v = version(2, FileStatus::Changed);
        v.updated = 0;
        assert_eq!(
            conflicted_copy_name(&v),
            "report (bob's conflicted copy, 1 Jan 70, 12-00 AM).txt"
        );
        assert_eq!(
            conflicted_copy_path(&v),
            "docs/report (bob's conflicted copy, 1 Jan 70, 12-00 AM).txt"
        );
    }

    #[test]
    fn test_conflicted_copy_name_edge_cases() {
        let mut v = version(1, FileStatus::New);
        v.updated = 0;
        v.created_by = None;
        v.path = ".gitignore".to_string();
        // hidden files keep their whole name as the stem
        assert_eq!(
            conflicted_copy_name(&v),
            ".gitignore (conflicted copy, 1 Jan 70, 12-00 AM)"
        );
    }

    #[test]
    fn test_name_is_final_component() {
        let v = version(1, FileStatus::New);
        assert_eq!(v.name(), "report.txt");
        let mut top = v.clone();
        top.path = "plain".to_string();
        assert_eq!(top.name(), "plain");
    }
}
