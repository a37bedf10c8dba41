//! Buffered named pipes between processing stages.
//!
//! A [`FifoBuffer`] is a pair of named pipes with two workers in between:
//! the ingest worker drains whatever a writer puts into [`FifoBuffer::input`]
//! and the egress worker feeds it to whoever opens [`FifoBuffer::output`].
//! The writer is never blocked by a slow or late reader: chunks are held in
//! memory up to a bound and spilled to a scratch file beyond it.
//!
//! A reader that has not shown up within the reader-open limit of the writer
//! going idle is abandoned, so a stalled downstream stage cannot hang the
//! pipeline.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use parking_lot::Mutex;
use reelforge_common::{timeout_or_live, Error, Result, Worker, WorkerHandle};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::workspace::Workspace;

/// Buffering knobs (the `[fifo]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoConfig {
    /// Bytes read from the writer per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks held in memory before spilling to disk.
    #[serde(default = "default_memory_chunks")]
    pub memory_chunks: usize,
    /// How long a reader may take to open the output once the writer went
    /// idle; defaults to twice the supervising worker's timeout.
    #[serde(default)]
    pub reader_open_limit_secs: Option<u64>,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_memory_chunks() -> usize {
    256
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            memory_chunks: default_memory_chunks(),
            reader_open_limit_secs: None,
        }
    }
}

impl FifoConfig {
    pub fn reader_open_limit(&self, timeout: Duration) -> Duration {
        self.reader_open_limit_secs
            .map(Duration::from_secs)
            .unwrap_or(timeout * 2)
    }
}

/// Interval between attempts to connect to a late reader.
const READER_POLL: Duration = Duration::from_millis(50);

/// A named-pipe pair with a buffering worker pair in between.
#[derive(Debug)]
pub struct FifoBuffer {
    input: PathBuf,
    output: PathBuf,
    ingest: WorkerHandle<u64>,
    egress: WorkerHandle<u64>,
}

impl FifoBuffer {
    /// Create both pipes in `workspace` and start buffering under `parent`.
    pub fn spawn(
        parent: &Worker,
        workspace: &Workspace,
        ext: &str,
        config: &FifoConfig,
    ) -> Result<Self> {
        let input = workspace.make_fifo("in", ext)?;
        let output = workspace.make_fifo("out", ext)?;
        let spool = Arc::new(Spool::new(config.memory_chunks, workspace.path()));
        let open_limit = config.reader_open_limit(parent.timeout());
        let chunk_size = config.chunk_size.max(1);

        debug!(
            "Buffering {} > {} (reader open limit {:?})",
            input.display(),
            output.display(),
            open_limit
        );

        let ingest = {
            let path = input.clone();
            let spool = spool.clone();
            parent.spawn(format!("fifo ingest {}", file_name(&input)), move |worker| async move {
                let result = ingest(&worker, &path, &spool, chunk_size).await;
                spool.finish();
                result
            })
        };
        let egress = {
            let path = output.clone();
            parent.spawn(format!("fifo egress {}", file_name(&output)), move |worker| async move {
                let result = egress(&worker, &path, &spool, open_limit).await;
                if result.is_err() {
                    spool.close();
                }
                result
            })
        };

        Ok(Self {
            input,
            output,
            ingest,
            egress,
        })
    }

    /// The pipe a writer writes into.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// The pipe a reader reads from.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Wait for both workers; returns the number of bytes delivered.
    pub async fn join(self) -> Result<u64> {
        let delivered = self.egress.join().await;
        let ingested = self.ingest.join().await;
        let (delivered, ingested) = (delivered?, ingested?);
        if delivered < ingested {
            info!(
                "{} delivered {} of {} bytes",
                self.output.display(),
                delivered,
                ingested
            );
        }
        Ok(delivered)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn ingest(worker: &Worker, path: &Path, spool: &Spool, chunk_size: usize) -> Result<u64> {
    let file = open_reader(worker, path).await?;
    let mut rx = pipe::Receiver::from_file(file)?;
    let mut total = 0u64;

    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        let n = timeout_or_live(
            worker,
            None,
            worker.timeout(),
            || format!("reading {}", path.display()),
            rx.read_buf(&mut buf),
        )
        .await??;
        if n == 0 {
            break;
        }
        total += n as u64;
        spool.push(buf.freeze())?;
    }

    debug!("{} ingested {} bytes", path.display(), total);
    Ok(total)
}

/// Open the read end, waiting for a writer without blocking the runtime.
async fn open_reader(worker: &Worker, path: &Path) -> Result<File> {
    let target = path.to_path_buf();
    let mut opening = tokio::task::spawn_blocking(move || File::open(target));

    let waited = timeout_or_live(
        worker,
        None,
        worker.timeout(),
        || format!("waiting for a writer of {}", path.display()),
        &mut opening,
    )
    .await;

    match waited {
        Ok(joined) => {
            let file = joined.map_err(|e| Error::system(format!("FIFO opener failed: {e}")))?;
            Ok(file?)
        }
        Err(e) => {
            // A writer of our own releases the blocked open.
            if let Ok(unblock) = pipe::OpenOptions::new().open_sender(path) {
                drop(unblock);
            }
            let _ = opening.await;
            Err(e)
        }
    }
}

async fn egress(
    worker: &Worker,
    path: &Path,
    spool: &Spool,
    open_limit: Duration,
) -> Result<u64> {
    let mut tx = loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(tx) => break tx,
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                if spool.idle_for() >= open_limit {
                    warn!("Nobody opened {} in time, abandoning it", path.display());
                    return Err(Error::time_limit(
                        format!("waiting for a reader of {}", path.display()),
                        open_limit,
                    ));
                }
                worker.live()?;
                tokio::time::sleep(READER_POLL).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut total = 0u64;
    loop {
        let next = timeout_or_live(
            worker,
            None,
            worker.timeout(),
            || format!("buffering {}", path.display()),
            spool.pop(),
        )
        .await??;
        let Some(chunk) = next else {
            break;
        };

        match tx.write_all(&chunk).await {
            Ok(()) => total += chunk.len() as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Reader of {} went away after {} bytes", path.display(), total);
                spool.close();
                return Ok(total);
            }
            Err(e) => return Err(e.into()),
        }
    }

    debug!("{} delivered {} bytes", path.display(), total);
    Ok(total)
}

/// Chunk queue shared by the ingest and egress workers.
struct Spool {
    state: Mutex<SpoolState>,
    available: Notify,
}

struct SpoolState {
    memory: VecDeque<Bytes>,
    memory_chunks: usize,
    spill_dir: PathBuf,
    disk: Option<Spill>,
    eof: bool,
    closed: bool,
    last_activity: Instant,
}

struct Spill {
    file: File,
    read_pos: u64,
    write_pos: u64,
    lengths: VecDeque<usize>,
}

impl Spool {
    fn new(memory_chunks: usize, spill_dir: &Path) -> Self {
        Self {
            state: Mutex::new(SpoolState {
                memory: VecDeque::new(),
                memory_chunks,
                spill_dir: spill_dir.to_path_buf(),
                disk: None,
                eof: false,
                closed: false,
                last_activity: Instant::now(),
            }),
            available: Notify::new(),
        }
    }

    /// Queue a chunk; discarded once the consumer has gone away.
    fn push(&self, chunk: Bytes) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            if state.closed {
                return Ok(());
            }

            let spilling = state.disk.as_ref().is_some_and(|d| !d.lengths.is_empty());
            if !spilling && state.memory.len() < state.memory_chunks {
                state.memory.push_back(chunk);
            } else {
                if state.disk.is_none() {
                    debug!("Spilling buffered chunks to {}", state.spill_dir.display());
                    state.disk = Some(Spill {
                        file: tempfile::tempfile_in(&state.spill_dir)?,
                        read_pos: 0,
                        write_pos: 0,
                        lengths: VecDeque::new(),
                    });
                }
                if let Some(disk) = state.disk.as_mut() {
                    disk.file.write_all_at(&chunk, disk.write_pos)?;
                    disk.write_pos += chunk.len() as u64;
                    disk.lengths.push_back(chunk.len());
                }
            }
        }
        self.available.notify_one();
        Ok(())
    }

    /// The writer is done.
    fn finish(&self) {
        {
            let mut state = self.state.lock();
            state.eof = true;
            state.last_activity = Instant::now();
        }
        self.available.notify_one();
    }

    /// The reader is gone; drop everything from now on.
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.memory.clear();
        state.disk = None;
    }

    fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Next chunk in write order, or `None` once the writer is done and
    /// everything was handed out.
    async fn pop(&self) -> Result<Option<Bytes>> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(chunk) = state.take()? {
                    return Ok(Some(chunk));
                }
                if state.eof || state.closed {
                    return Ok(None);
                }
            }
            self.available.notified().await;
        }
    }
}

impl SpoolState {
    fn take(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(chunk) = self.memory.pop_front() {
            return Ok(Some(chunk));
        }
        let Some(disk) = self.disk.as_mut() else {
            return Ok(None);
        };
        let Some(len) = disk.lengths.pop_front() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; len];
        disk.file.read_exact_at(&mut buf, disk.read_pos)?;
        disk.read_pos += len as u64;
        if disk.lengths.is_empty() {
            disk.read_pos = 0;
            disk.write_pos = 0;
            disk.file.set_len(0)?;
        }
        Ok(Some(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::{Read, Write};

    #[tokio::test]
    async fn spool_keeps_order_across_spill() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(2, dir.path());
        for i in 0..5u8 {
            spool.push(Bytes::from(vec![i; 3])).unwrap();
        }
        assert_eq!(spool.pop().await.unwrap().unwrap()[0], 0);
        spool.push(Bytes::from(vec![5u8; 3])).unwrap();
        spool.finish();

        let mut seen = vec![0u8];
        while let Some(chunk) = spool.pop().await.unwrap() {
            seen.push(chunk[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn closed_spool_discards() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::new(4, dir.path());
        spool.push(Bytes::from_static(b"abc")).unwrap();
        spool.close();
        spool.push(Bytes::from_static(b"def")).unwrap();
        assert_eq!(spool.pop().await.unwrap(), None);
    }

    #[tokio::test]
    async fn buffers_writer_to_late_reader() {
        let ws = Workspace::new().unwrap();
        let root = Worker::root("test").with_timeout(Duration::from_millis(100));
        let config = FifoConfig {
            chunk_size: 4,
            memory_chunks: 2,
            reader_open_limit_secs: Some(5),
        };
        let fifo = FifoBuffer::spawn(&root, &ws, "wav", &config).unwrap();

        let input = fifo.input().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut w = std::fs::OpenOptions::new().write(true).open(input).unwrap();
            w.write_all(b"the quick brown fox jumps").unwrap();
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let output = fifo.output().to_path_buf();
        let read = tokio::task::spawn_blocking(move || {
            let mut r = File::open(output).unwrap();
            let mut text = String::new();
            r.read_to_string(&mut text).unwrap();
            text
        })
        .await
        .unwrap();

        assert_eq!(read, "the quick brown fox jumps");
        assert_eq!(fifo.join().await.unwrap(), 25);
        root.join_children(None, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_reader_is_abandoned() {
        let ws = Workspace::new().unwrap();
        let root = Worker::root("test").with_timeout(Duration::from_millis(50));
        let config = FifoConfig {
            reader_open_limit_secs: Some(0),
            ..FifoConfig::default()
        };
        let fifo = FifoBuffer::spawn(&root, &ws, "wav", &config).unwrap();

        let input = fifo.input().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut w = std::fs::OpenOptions::new().write(true).open(input).unwrap();
            w.write_all(b"nobody listens").unwrap();
        })
        .await
        .unwrap();

        let err = fifo.join().await.unwrap_err();
        assert_matches!(err, Error::TimeLimit { .. });
    }
}
