//! Scratch workspace for intermediate media.
//!
//! A [`Workspace`] owns a temporary directory holding named pipes and
//! materialised intermediates. Every path it hands out is unique, so two
//! buffers never share a FIFO.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use reelforge_common::{Error, Result};
use tempfile::TempDir;
use tracing::debug;

/// File extension for an intermediate carrying the given channels.
///
/// Matroska for audio+video, YUV4MPEG for video only and WAV for audio only.
pub fn intermediate_extension(video: bool, audio: bool) -> &'static str {
    match (video, audio) {
        (true, true) => "mkv",
        (true, false) => "y4m",
        _ => "wav",
    }
}

/// Temporary directory for one process run.
#[derive(Debug)]
pub struct Workspace {
    temp_dir: TempDir,
    counter: AtomicUsize,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix("reelforge-")
            .tempdir()
            .map_err(|e| Error::system(format!("failed to create temp dir: {e}")))?;
        debug!("workspace at {}", temp_dir.path().display());

        Ok(Self {
            temp_dir,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A fresh, never-before-returned path `<stem>-<n>.<ext>` in the workspace.
    pub fn unique_path(&self, stem: &str, ext: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.path().join(format!("{stem}-{n}.{ext}"))
    }

    /// Create a named pipe at a fresh path.
    pub fn make_fifo(&self, stem: &str, ext: &str) -> Result<PathBuf> {
        let path = self.unique_path(stem, ext);
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(std::io::Error::from)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn unique_paths_do_not_repeat() {
        let ws = Workspace::new().unwrap();
        let a = ws.unique_path("buf", "wav");
        let b = ws.unique_path("buf", "wav");
        assert_ne!(a, b);
        assert!(a.starts_with(ws.path()));
        assert_eq!(a.extension().unwrap(), "wav");
    }

    #[test]
    fn make_fifo_creates_named_pipe() {
        let ws = Workspace::new().unwrap();
        let path = ws.make_fifo("main", "mkv").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let ws = Workspace::new().unwrap();
        let dir = ws.path().to_path_buf();
        drop(ws);
        assert!(!dir.exists());
    }

    #[test]
    fn intermediate_extensions() {
        assert_eq!(intermediate_extension(true, true), "mkv");
        assert_eq!(intermediate_extension(true, false), "y4m");
        assert_eq!(intermediate_extension(false, true), "wav");
    }
}
