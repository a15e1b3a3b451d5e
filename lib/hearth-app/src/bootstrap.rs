//! Bootstrap utilities.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::debug;

/// A PID file for the current process.
///
/// The file is written when created, and removed when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process ID to the given file.
    ///
    /// # Errors
    ///
    /// If the file cannot be written, an error is returned.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "Wrote PID file.");

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Failed to remove PID file.");
        }
    }
}

/// Reads the process ID stored in the given PID file.
///
/// Returns `None` if the file does not exist or does not contain a process ID.
pub fn read_pid_file<P: AsRef<Path>>(path: P) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
