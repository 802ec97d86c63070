//! A transfer backend over a plain local directory.
//!
//! This is the reference backend: a shared folder, a mounted NAS or
//! anything else that looks like a directory works as a remote. It is
//! also what the tests run against.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use tracing::trace;

use super::{RemoteKind, RemoteRef, TransferError, TransferManager};

/// Remote store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    root: PathBuf,
}

impl LocalTransfer {
    /// Open a directory as a remote store, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory this store lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &RemoteRef) -> PathBuf {
        self.root.join(reference.to_string())
    }
}

impl TransferManager for LocalTransfer {
    fn list(&self, kind: RemoteKind) -> Result<BTreeMap<String, RemoteRef>, TransferError> {
        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(reference) = name.parse::<RemoteRef>() else {
                trace!("list: skipping unrecognized file {name:?}");
                continue;
            };
            if reference.kind() == kind {
                entries.insert(name.to_string(), reference);
            }
        }
        Ok(entries)
    }

    fn upload(&self, source: &Path, target: &RemoteRef) -> Result<(), TransferError> {
        trace!("upload {} -> {target}", source.display());
        fs::copy(source, self.path_for(target))?;
        Ok(())
    }

    fn download(&self, source: &RemoteRef, target: &Path) -> Result<(), TransferError> {
        trace!("download {source} -> {}", target.display());
        match fs::copy(self.path_for(source), target) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(TransferError::not_found(source))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn rename(&self, source: &RemoteRef, target: &RemoteRef) -> Result<(), TransferError> {
        trace!("rename {source} -> {target}");
        match fs::rename(self.path_for(source), self.path_for(target)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(TransferError::not_found(source))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, target: &RemoteRef) -> Result<bool, TransferError> {
        trace!("delete {target}");
        match fs::remove_file(self.path_for(target)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
