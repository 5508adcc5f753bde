//! Chunked file copy with cancellation checks between chunks.

use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;

use plateshift_core::{MIN_CHUNK_SIZE, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Copies files in fixed-size chunks.
///
/// The cancellation signal is checked before every read and after every
/// write, so a cancelled copy stops within one chunk. A cancelled or failed
/// copy never leaves its destination behind.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedCopier {
    chunk_size: usize,
}

impl ChunkedCopier {
    /// Create a copier. Chunk sizes below 4 KiB are raised to 4 KiB.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        }
    }

    /// Bytes per read/write step.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `source` to `destination` as a single stream.
    ///
    /// `on_progress` receives the number of bytes written by each chunk.
    /// Returns the total bytes written; size verification is up to the caller.
    pub fn copy<F>(
        &self,
        source: &Path,
        destination: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<u64, TransferError>
    where
        F: FnMut(u64),
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let mut src = File::open(source).map_err(|e| TransferError::io(source, e))?;
        let partial = PartialFile::new(destination);
        let mut dst = partial.create()?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            if cancel.is_cancelled() {
                debug!(
                    "cancelled after {} bytes, removing {}",
                    total,
                    destination.display()
                );
                return Err(TransferError::Cancelled);
            }

            let read = match src.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::io(source, e)),
            };

            dst.write_all(&buffer[..read])
                .map_err(|e| TransferError::io(destination, e))?;

            total += read as u64;
            on_progress(read as u64);

            if cancel.is_cancelled() {
                debug!(
                    "cancelled after {} bytes, removing {}",
                    total,
                    destination.display()
                );
                return Err(TransferError::Cancelled);
            }
        }

        partial.commit();
        Ok(total)
    }

    /// Copy `source` to `destination` using `streams` parallel ranges.
    ///
    /// The destination is pre-sized and each range is written in place with
    /// positional I/O, one scoped thread per range. Failure or cancellation
    /// of any range stops its siblings and removes the destination.
    /// `on_progress` is called concurrently from every range thread.
    pub fn copy_ranged<F>(
        &self,
        source: &Path,
        destination: &Path,
        streams: usize,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<u64, TransferError>
    where
        F: Fn(u64) + Sync,
    {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let src = File::open(source).map_err(|e| TransferError::io(source, e))?;
        let len = src
            .metadata()
            .map_err(|e| TransferError::io(source, e))?
            .len();

        let partial = PartialFile::new(destination);
        let dst = partial.create()?;
        dst.set_len(len)
            .map_err(|e| TransferError::io(destination, e))?;

        let ranges = split_ranges(len, streams);
        debug!("copying {} in {} ranges", source.display(), ranges.len());

        let siblings = cancel.child_token();
        let chunk_size = self.chunk_size;
        let dst = &dst;

        let results: Vec<Result<u64, TransferError>> = thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(start, end)| {
                    let src = &src;
                    let siblings = &siblings;
                    let on_progress = &on_progress;
                    scope.spawn(move || {
                        let result = copy_range(
                            RangeJob {
                                src,
                                dst,
                                start,
                                end,
                                chunk_size,
                                source,
                                destination,
                            },
                            siblings,
                            on_progress,
                        );
                        if result.is_err() {
                            siblings.cancel();
                        }
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TransferError::TaskPanicked {
                            message: "range copy thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        });

        let mut total = 0u64;
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(bytes) => total += bytes,
                Err(TransferError::Cancelled) => cancelled = true,
                Err(e) => return Err(e),
            }
        }
        if cancelled || cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        partial.commit();
        Ok(total)
    }
}

/// Split `[0, len)` into at most `streams` contiguous, non-empty ranges.
pub fn split_ranges(len: u64, streams: usize) -> Vec<(u64, u64)> {
    let streams = (streams.max(1) as u64).min(len.max(1));
    let base = len / streams;
    let remainder = len % streams;

    let mut ranges = Vec::with_capacity(streams as usize);
    let mut start = 0u64;
    for i in 0..streams {
        let size = base + u64::from(i < remainder);
        if size == 0 {
            continue;
        }
        ranges.push((start, start + size));
        start += size;
    }
    ranges
}

struct RangeJob<'a> {
    src: &'a File,
    dst: &'a File,
    start: u64,
    end: u64,
    chunk_size: usize,
    source: &'a Path,
    destination: &'a Path,
}

fn copy_range<F>(
    job: RangeJob<'_>,
    cancel: &CancellationToken,
    on_progress: &F,
) -> Result<u64, TransferError>
where
    F: Fn(u64) + Sync,
{
    let mut buffer = vec![0u8; job.chunk_size];
    let mut offset = job.start;

    while offset < job.end {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let want = (job.end - offset).min(job.chunk_size as u64) as usize;
        let read = match read_at(job.src, &mut buffer[..want], offset) {
            Ok(0) => {
                return Err(TransferError::io(
                    job.source,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "source ended before copy completed",
                    ),
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::io(job.source, e)),
        };

        write_all_at(job.dst, &buffer[..read], offset)
            .map_err(|e| TransferError::io(job.destination, e))?;

        offset += read as u64;
        on_progress(read as u64);
    }

    Ok(offset - job.start)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write copied bytes",
                ));
            }
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Removes a destination on drop unless committed.
///
/// Declare the guard before the file handle it protects so the handle is
/// closed first when both go out of scope.
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: Cell<bool>,
}

impl PartialFile {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: Cell::new(false),
        }
    }

    /// Create or truncate the destination and arm the guard.
    pub(crate) fn create(&self) -> Result<File, TransferError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| TransferError::io(&self.path, e))?;
        self.armed.set(true);
        Ok(file)
    }

    /// Keep the destination.
    pub(crate) fn commit(&self) {
        self.armed.set(false);
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed.get() {
            discard_partial(&self.path);
        }
    }
}

/// Remove a partially written destination. A missing file counts as removed.
pub(crate) fn remove_partial(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed partial file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Best-effort [`remove_partial`]; the task reports what is left behind.
pub(crate) fn discard_partial(path: &Path) {
    if let Err(e) = remove_partial(path) {
        warn!("failed to remove partial file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_copy_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", 100_000);
        let dst = dir.path().join("dst.bin");

        let mut calls = 0;
        let copied = ChunkedCopier::new(8192)
            .copy(&src, &dst, &CancellationToken::new(), |_| calls += 1)
            .unwrap();

        assert_eq!(copied, 100_000);
        assert_eq!(fs::read(&src).unwrap(), fs::read(&dst).unwrap());
        assert_eq!(calls, 13);
    }

    #[test]
    fn test_copy_cancelled_after_chunks_removes_destination() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", 64 * 4096);
        let dst = dir.path().join("dst.bin");
        let token = CancellationToken::new();

        let mut chunks = 0;
        let result = ChunkedCopier::new(4096).copy(&src, &dst, &token, |_| {
            chunks += 1;
            if chunks == 3 {
                token.cancel();
            }
        });

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(chunks, 3);
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_already_cancelled_does_not_touch_destination() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", 1000);
        let dst = dir.path().join("dst.bin");
        let token = CancellationToken::new();
        token.cancel();

        let result = ChunkedCopier::new(4096).copy(&src, &dst, &token, |_| {});
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_missing_source() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let result = ChunkedCopier::new(4096).copy(
            &dir.path().join("nope"),
            &dst,
            &CancellationToken::new(),
            |_| {},
        );
        assert!(matches!(result, Err(TransferError::NotFound { .. })));
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_empty_file() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "empty.bin", 0);
        let dst = dir.path().join("dst.bin");
        let copied = ChunkedCopier::new(4096)
            .copy(&src, &dst, &CancellationToken::new(), |_| {})
            .unwrap();
        assert_eq!(copied, 0);
        assert!(dst.exists());
    }

    #[test]
    fn test_ranged_copy_roundtrip() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", 1_000_003);
        let dst = dir.path().join("dst.bin");
        let progressed = std::sync::atomic::AtomicU64::new(0);

        let copied = ChunkedCopier::new(16 * 1024)
            .copy_ranged(&src, &dst, 4, &CancellationToken::new(), |n| {
                progressed.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(copied, 1_000_003);
        assert_eq!(progressed.into_inner(), 1_000_003);
        assert_eq!(fs::read(&src).unwrap(), fs::read(&dst).unwrap());
    }

    #[test]
    fn test_ranged_copy_cancelled_removes_destination() {
        let dir = TempDir::new().unwrap();
        let src = write_source(&dir, "src.bin", 512 * 1024);
        let dst = dir.path().join("dst.bin");
        let token = CancellationToken::new();

        let result =
            ChunkedCopier::new(4096).copy_ranged(&src, &dst, 4, &token, |_| token.cancel());
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists());
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(split_ranges(2, 8), vec![(0, 1), (1, 2)]);
        assert_eq!(split_ranges(0, 4), Vec::<(u64, u64)>::new());
        assert_eq!(split_ranges(100, 0), vec![(0, 100)]);
    }
}
