//! Small time and filesystem helpers.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    time::SystemTime,
};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Overwrite a file with the given data and fsync it.
///
/// Unlike `std::fs::write` this syncs before returning, so once this
/// returns the bytes survive a crash.
pub(crate) fn overwrite_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    tracing::trace!(
        "overwriting file {} with {} bytes",
        path.display(),
        data.len()
    );
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}
