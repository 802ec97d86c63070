//! Remote file references and the transfer seam.
//!
//! The remote store is dumb: it can list, copy files in and out, rename
//! and delete, nothing more. Everything smarter (atomicity, resumption)
//! is layered on top by [`crate::transaction`]. File kinds are encoded
//! in the name itself so a plain listing is enough to classify them.

use std::{collections::BTreeMap, fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, InvalidClientId, MultiChunkId, ParseIdError};

pub mod local;

/// The kinds of files kept on a remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteKind {
    /// A serialized database version file, `db-<client>-<sequence>`.
    Database,
    /// A packed multichunk, `multichunk-<hex id>`.
    MultiChunk,
    /// A transaction manifest, `transaction-<number>`.
    Transaction,
    /// A parked file belonging to an in-flight transaction,
    /// `temp-<number>`.
    Temp,
}

impl RemoteKind {
    /// The name prefix of this kind, without the separator.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Database => "db",
            Self::MultiChunk => "multichunk",
            Self::Transaction => "transaction",
            Self::Temp => "temp",
        }
    }
}

/// A reference to one file on the remote store.
///
/// Renders to and parses from the remote naming scheme, so a reference
/// and a listed file name are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RemoteRef {
    /// One client's database version file.
    Database {
        /// The authoring client.
        client: ClientId,
        /// The author's local sequence number.
        sequence: u64,
    },
    /// A packed multichunk.
    MultiChunk(MultiChunkId),
    /// A transaction manifest.
    Transaction(u64),
    /// A parked temp file.
    Temp(u64),
}

impl RemoteRef {
    /// Reference to a database version file.
    pub fn database(client: ClientId, sequence: u64) -> Self {
        Self::Database { client, sequence }
    }

    /// Reference to a packed multichunk.
    pub fn multichunk(id: MultiChunkId) -> Self {
        Self::MultiChunk(id)
    }

    /// Reference to a transaction manifest.
    pub fn transaction(id: u64) -> Self {
        Self::Transaction(id)
    }

    /// Reference to a parked temp file.
    pub fn temp(id: u64) -> Self {
        Self::Temp(id)
    }

    /// The kind of file this reference points at.
    pub fn kind(&self) -> RemoteKind {
        match self {
            Self::Database { .. } => RemoteKind::Database,
            Self::MultiChunk(_) => RemoteKind::MultiChunk,
            Self::Transaction(_) => RemoteKind::Transaction,
            Self::Temp(_) => RemoteKind::Temp,
        }
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Database { client, sequence } => {
                write!(f, "db-{client}-{sequence:010}")
            }
            Self::MultiChunk(id) => write!(f, "multichunk-{id}"),
            Self::Transaction(id) => write!(f, "transaction-{id}"),
            Self::Temp(id) => write!(f, "temp-{id}"),
        }
    }
}

/// Error parsing a remote file name.
#[derive(Debug, thiserror::Error)]
pub enum ParseRemoteRefError {
    /// The name does not start with a known kind prefix.
    #[error("unrecognized remote file name {0:?}")]
    UnknownKind(String),
    /// A database file name misses one of its parts.
    #[error("malformed database file name {0:?}")]
    MalformedDatabase(String),
    /// The client part is not a valid client id.
    #[error("invalid client in remote file name: {0}")]
    InvalidClient(#[from] InvalidClientId),
    /// The id part is not valid hex of the right length.
    #[error("invalid id in remote file name: {0}")]
    InvalidId(#[from] ParseIdError),
    /// A numeric part does not parse.
    #[error("invalid number in remote file name {0:?}")]
    InvalidNumber(String),
}

impl FromStr for RemoteRef {
    type Err = ParseRemoteRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once('-')
            .ok_or_else(|| ParseRemoteRefError::UnknownKind(s.to_string()))?;
        let number = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| ParseRemoteRefError::InvalidNumber(s.to_string()))
        };
        match kind {
            "db" => {
                let (client, sequence) = rest
                    .rsplit_once('-')
                    .ok_or_else(|| ParseRemoteRefError::MalformedDatabase(s.to_string()))?;
                Ok(Self::Database {
                    client: client.parse()?,
                    sequence: number(sequence)?,
                })
            }
            "multichunk" => Ok(Self::MultiChunk(rest.parse()?)),
            "transaction" => Ok(Self::Transaction(number(rest)?)),
            "temp" => Ok(Self::Temp(number(rest)?)),
            _ => Err(ParseRemoteRefError::UnknownKind(s.to_string())),
        }
    }
}

/// Error from a transfer backend.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The referenced remote file does not exist.
    #[error("remote file not found: {0}")]
    NotFound(String),
    /// Any other storage failure. Retryable by the caller.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Shorthand for the not found case.
    pub(crate) fn not_found(target: &RemoteRef) -> Self {
        Self::NotFound(target.to_string())
    }

    /// Whether this error means the remote file is simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Blocking access to a remote store.
///
/// Implementations only need the five primitives below; none of them
/// has to be atomic across files. Timeouts and retry policy live in the
/// implementation, the sync core retries whole steps instead.
pub trait TransferManager {
    /// List all remote files of one kind, keyed by file name.
    ///
    /// Names that do not parse as any known kind are skipped, so the
    /// store may hold unrelated files.
    fn list(&self, kind: RemoteKind) -> Result<BTreeMap<String, RemoteRef>, TransferError>;

    /// Copy a local file to the remote store.
    fn upload(&self, source: &Path, target: &RemoteRef) -> Result<(), TransferError>;

    /// Copy a remote file to a local path, replacing it.
    fn download(&self, source: &RemoteRef, target: &Path) -> Result<(), TransferError>;

    /// Rename a remote file. Fails with [`TransferError::NotFound`] if
    /// the source is missing.
    fn rename(&self, source: &RemoteRef, target: &RemoteRef) -> Result<(), TransferError>;

    /// Delete a remote file. Returns whether it existed.
    fn delete(&self, target: &RemoteRef) -> Result<bool, TransferError>;
}
