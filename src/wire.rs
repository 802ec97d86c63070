//! The database file container.
//!
//! A database file is a magic preamble followed by pairs of framed
//! records, one header and one body per database version. Each frame is
//! a big endian u32 length and a postcard payload. Headers and bodies
//! are framed separately so a reader can scan all headers without
//! decoding (or even reading) the bodies, which is what clock range
//! loads and remote listings rely on.

use std::{
    io::{self, Read, Write},
    path::Path,
};

use serde::Serialize;

use crate::{
    clock::{Causality, VectorClock},
    util,
    version::{DatabaseVersion, DatabaseVersionHeader, VersionBody},
};

/// File magic, also the format name.
pub const MAGIC: &[u8; 8] = b"cairndb1";
/// Current container format version.
pub const FORMAT_VERSION: u8 = 1;
/// Upper bound for a single framed record.
pub const MAX_RECORD_SIZE: u32 = 1024 * 1024 * 64;

/// Error reading or writing a database file.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The file does not start with the database magic.
    #[error("not a database file")]
    BadMagic,
    /// The file was written by an unknown format version.
    #[error("unsupported database format version {0}")]
    UnsupportedVersion(u8),
    /// The file ends in the middle of a frame.
    #[error("truncated database file")]
    Truncated,
    /// A frame is larger than [`MAX_RECORD_SIZE`].
    #[error("record of {0} bytes is too large")]
    Oversize(u32),
    /// A body was requested but no header was pending.
    #[error("no header was read before the body")]
    NoPendingBody,
    /// A record failed to encode or decode.
    #[error("codec error: {0}")]
    Postcard(#[from] postcard::Error),
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Whether a clock falls into the load range `[from, to]`.
///
/// A version is included iff its clock is not smaller than `from` and
/// not greater than `to`. Concurrent clocks pass both bounds, so a
/// range load never drops versions another client raced in sideways.
pub fn clock_in_range(
    clock: &VectorClock,
    from: Option<&VectorClock>,
    to: Option<&VectorClock>,
) -> bool {
    if let Some(from) = from {
        if clock.compare(from) == Causality::Smaller {
            return false;
        }
    }
    if let Some(to) = to {
        if clock.compare(to) == Causality::Greater {
            return false;
        }
    }
    true
}

/// Streaming writer for a database file.
#[derive(Debug)]
pub struct DatabaseFileWriter<W> {
    writer: W,
}

impl<W: Write> DatabaseFileWriter<W> {
    /// Start a database file, writing the preamble.
    pub fn new(mut writer: W) -> Result<Self, WireError> {
        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT_VERSION])?;
        Ok(Self { writer })
    }

    /// Append one database version, header and body framed separately.
    pub fn write_version(&mut self, version: &DatabaseVersion) -> Result<(), WireError> {
        self.write_record(version.header())?;
        self.write_record(version.body())?;
        Ok(())
    }

    fn write_record<T: Serialize>(&mut self, record: &T) -> Result<(), WireError> {
        let payload = postcard::to_allocvec(record)?;
        let len = u32::try_from(payload.len()).map_err(|_| WireError::Oversize(u32::MAX))?;
        if len > MAX_RECORD_SIZE {
            return Err(WireError::Oversize(len));
        }
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(&payload)?;
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W, WireError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Streaming reader for a database file.
///
/// Drives a header/body alternation: [`Self::next_header`] yields the
/// next header, after which the body may be decoded with
/// [`Self::read_body`] or skipped entirely by asking for the next
/// header again.
#[derive(Debug)]
pub struct DatabaseFileReader<R> {
    reader: R,
    pending_body: bool,
}

impl<R: Read> DatabaseFileReader<R> {
    /// Open a database file, checking the preamble.
    pub fn new(mut reader: R) -> Result<Self, WireError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => WireError::BadMagic,
            _ => err.into(),
        })?;
        if &magic != MAGIC {
            return Err(WireError::BadMagic);
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => WireError::Truncated,
            _ => err.into(),
        })?;
        if version[0] != FORMAT_VERSION {
            return Err(WireError::UnsupportedVersion(version[0]));
        }
        Ok(Self {
            reader,
            pending_body: false,
        })
    }

    /// The next version header, or `None` at the end of the file.
    ///
    /// If the previous body was not read it is skipped without decoding.
    pub fn next_header(&mut self) -> Result<Option<DatabaseVersionHeader>, WireError> {
        if self.pending_body {
            self.skip_body()?;
        }
        let Some(len) = self.read_len()? else {
            return Ok(None);
        };
        let header = postcard::from_bytes(&self.read_payload(len)?)?;
        self.pending_body = true;
        Ok(Some(header))
    }

    /// Decode the body belonging to the header just returned.
    pub fn read_body(
        &mut self,
        header: DatabaseVersionHeader,
    ) -> Result<DatabaseVersion, WireError> {
        if !self.pending_body {
            return Err(WireError::NoPendingBody);
        }
        let len = self.read_len()?.ok_or(WireError::Truncated)?;
        let body: VersionBody = postcard::from_bytes(&self.read_payload(len)?)?;
        self.pending_body = false;
        Ok(DatabaseVersion::from_parts(header, body))
    }

    /// Skip over an unread body without decoding it.
    fn skip_body(&mut self) -> Result<(), WireError> {
        let len = self.read_len()?.ok_or(WireError::Truncated)?;
        let copied = io::copy(&mut (&mut self.reader).take(len as u64), &mut io::sink())?;
        if copied != len as u64 {
            return Err(WireError::Truncated);
        }
        self.pending_body = false;
        Ok(())
    }

    /// Read a frame length. `None` on a clean end of file.
    fn read_len(&mut self) -> Result<Option<u32>, WireError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..])?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(WireError::Truncated)
                };
            }
            filled += n;
        }
        let len = u32::from_be_bytes(buf);
        if len > MAX_RECORD_SIZE {
            return Err(WireError::Oversize(len));
        }
        Ok(Some(len))
    }

    fn read_payload(&mut self, len: u32) -> Result<Vec<u8>, WireError> {
        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|err| match err.kind() {
                io::ErrorKind::UnexpectedEof => WireError::Truncated,
                _ => err.into(),
            })?;
        Ok(payload)
    }
}

/// Write database versions to a file, synced to disk.
pub fn save<'a>(
    path: &Path,
    versions: impl IntoIterator<Item = &'a DatabaseVersion>,
) -> Result<(), WireError> {
    let mut writer = DatabaseFileWriter::new(Vec::new())?;
    for version in versions {
        writer.write_version(version)?;
    }
    let buf = writer.finish()?;
    util::overwrite_and_sync(path, &buf)?;
    Ok(())
}

/// Read every version header in a database file, skipping all bodies.
pub fn load_headers(path: &Path) -> Result<Vec<DatabaseVersionHeader>, WireError> {
    let mut reader = DatabaseFileReader::new(io::BufReader::new(std::fs::File::open(path)?))?;
    let mut headers = Vec::new();
    while let Some(header) = reader.next_header()? {
        headers.push(header);
    }
    Ok(headers)
}

/// Read the versions in a database file whose clock falls into
/// `[from, to]`, skipping the bodies of everything outside the range.
pub fn load(
    path: &Path,
    from: Option<&VectorClock>,
    to: Option<&VectorClock>,
) -> Result<Vec<DatabaseVersion>, WireError> {
    let mut reader = DatabaseFileReader::new(io::BufReader::new(std::fs::File::open(path)?))?;
    let mut versions = Vec::new();
    while let Some(header) = reader.next_header()? {
        if clock_in_range(&header.vector_clock, from, to) {
            versions.push(reader.read_body(header)?);
        }
    }
    Ok(versions)
}

/// Read all versions in a database file.
pub fn load_all(path: &Path) -> Result<Vec<DatabaseVersion>, WireError> {
    load(path, None, None)
}
