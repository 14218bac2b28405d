//! Append-only file persistence.
//!
//! Every write command accepted by the server is appended to the file in the exact RESP encoding
//! a client would send, so the file is nothing more than a concatenation of command arrays. There
//! is no header, footer or checksum: records are delimited by their own length prefixes and the
//! regular frame decoder reads them back at startup.
//!
//! Appends only reach an in-memory buffer. A background task flushes that buffer and syncs the
//! file every [`FLUSH_INTERVAL`], so a crash loses at most that much acknowledged data.

use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{CodecError, FrameCodec};
use crate::frame::Frame;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, ThisError)]
pub enum AofError {
    #[error("failed to open AOF {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to AOF: {0}")]
    Write(#[source] io::Error),
    #[error("failed to read AOF: {0}")]
    Read(#[source] io::Error),
    #[error("AOF is corrupt at byte offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: CodecError,
    },
    #[error("AOF is closed")]
    Closed,
}

/// Handle to the append-only file. Clones share the same file and lock.
#[derive(Clone)]
pub struct Aof {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    // `None` once the log has been closed.
    file: Mutex<Option<BufWriter<File>>>,
    shutdown: CancellationToken,
}

impl Aof {
    /// Opens the file at `path` for appending, creating it if needed, and starts the background
    /// flush task.
    pub async fn open(path: impl AsRef<Path>) -> Result<Aof, AofError> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| AofError::Open {
                path: path.clone(),
                source,
            })?;

        let inner = Arc::new(Inner {
            path,
            file: Mutex::new(Some(BufWriter::new(file))),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(flush_periodically(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
        ));

        Ok(Aof { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Appends the encoding of `frame`. The bytes are buffered; they become durable with the next
    /// flush.
    pub async fn append(&self, frame: &Frame) -> Result<(), AofError> {
        self.lock().await.append(frame).await
    }

    /// Takes the log for exclusive use. Appends from other handles wait until the guard is
    /// dropped, so changes applied while holding it are logged in the order they were applied.
    pub async fn lock(&self) -> AofGuard<'_> {
        AofGuard {
            file: self.inner.file.lock().await,
        }
    }

    /// Writes out buffered appends and syncs the file to disk.
    pub async fn flush(&self) -> Result<(), AofError> {
        self.inner.flush().await
    }

    /// Reads the log from the beginning and calls `apply` with every frame in it, returning how
    /// many frames were read.
    ///
    /// Stops at the first frame that cannot be decoded. Frames before it have already been
    /// applied at that point.
    pub async fn replay<F>(&self, mut apply: F) -> Result<usize, AofError>
    where
        F: FnMut(Frame),
    {
        // Hold the lock so no append lands while the file is being read.
        let mut writer = self.inner.file.lock().await;
        if let Some(writer) = writer.as_mut() {
            writer.flush().await.map_err(AofError::Write)?;
        }

        let file = File::open(&self.inner.path)
            .await
            .map_err(AofError::Read)?;
        let mut frames = FramedRead::new(file, FrameCodec::default());

        let mut count = 0;
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    apply(frame);
                    count += 1;
                }
                Err(CodecError::Io(err)) => return Err(AofError::Read(err)),
                Err(source) => {
                    return Err(AofError::Corrupt {
                        offset: frames.decoder().consumed(),
                        source,
                    })
                }
            }
        }

        debug!("Replayed {} frames from {}", count, self.inner.path.display());
        Ok(count)
    }

    /// Stops the flush task, writes out anything buffered and releases the file. Appends after
    /// this fail with [`AofError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AofError> {
        self.inner.shutdown.cancel();

        let mut file = self.inner.file.lock().await;
        if let Some(mut file) = file.take() {
            file.flush().await.map_err(AofError::Write)?;
            file.get_ref().sync_all().await.map_err(AofError::Write)?;
        }

        Ok(())
    }
}

pub struct AofGuard<'a> {
    file: MutexGuard<'a, Option<BufWriter<File>>>,
}

impl AofGuard<'_> {
    pub async fn append(&mut self, frame: &Frame) -> Result<(), AofError> {
        let bytes = frame.serialize();
        let file = self.file.as_mut().ok_or(AofError::Closed)?;

        file.write_all(&bytes).await.map_err(AofError::Write)
    }
}

impl Inner {
    async fn flush(&self) -> Result<(), AofError> {
        let mut file = self.file.lock().await;

        if let Some(file) = file.as_mut() {
            file.flush().await.map_err(AofError::Write)?;
            file.get_ref().sync_data().await.map_err(AofError::Write)?;
        }

        Ok(())
    }
}

async fn flush_periodically(inner: Weak<Inner>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Every handle is gone, nobody can append anymore.
        let Some(inner) = inner.upgrade() else {
            break;
        };

        if let Err(e) = inner.flush().await {
            warn!("Failed to flush AOF: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn replay_all(aof: &Aof) -> Result<Vec<Frame>, AofError> {
        let mut frames = vec![];
        aof.replay(|frame| frames.push(frame)).await?;
        Ok(frames)
    }

    #[tokio::test]
    async fn append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");

        let commands = vec![
            Frame::command(["SET", "a", "1"]),
            Frame::command(["HSET", "user:1", "name", "Bob"]),
            Frame::command(["DEL", "a"]),
        ];

        let aof = Aof::open(&path).await.unwrap();
        for command in &commands {
            aof.append(command).await.unwrap();
        }
        aof.close().await.unwrap();

        let aof = Aof::open(&path).await.unwrap();
        assert_eq!(replay_all(&aof).await.unwrap(), commands);
    }

    #[tokio::test]
    async fn file_holds_exact_encoding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");

        let aof = Aof::open(&path).await.unwrap();
        aof.append(&Frame::command(["SET", "name", "Alice"]))
            .await
            .unwrap();
        aof.flush().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$5\r\nAlice\r\n");
    }

    #[tokio::test]
    async fn replay_sees_unflushed_appends() {
        let dir = TempDir::new().unwrap();
        let aof = Aof::open(dir.path().join("test.aof")).await.unwrap();

        aof.append(&Frame::command(["SET", "a", "1"])).await.unwrap();

        assert_eq!(replay_all(&aof).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn appends_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");

        let aof = Aof::open(&path).await.unwrap();
        aof.append(&Frame::command(["SET", "a", "1"])).await.unwrap();
        aof.close().await.unwrap();

        let aof = Aof::open(&path).await.unwrap();
        aof.append(&Frame::command(["SET", "b", "2"])).await.unwrap();

        assert_eq!(
            replay_all(&aof).await.unwrap(),
            vec![
                Frame::command(["SET", "a", "1"]),
                Frame::command(["SET", "b", "2"])
            ]
        );
    }

    #[tokio::test]
    async fn empty_log() {
        let dir = TempDir::new().unwrap();
        let aof = Aof::open(dir.path().join("test.aof")).await.unwrap();

        assert!(replay_all(&aof).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn binary_payload_survives() {
        let dir = TempDir::new().unwrap();
        let aof = Aof::open(dir.path().join("test.aof")).await.unwrap();

        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("k")),
            Frame::Bulk(Bytes::from_static(b"\r\n*1\r\n$-1\r\n")),
        ]);
        aof.append(&frame).await.unwrap();

        assert_eq!(replay_all(&aof).await.unwrap(), vec![frame]);
    }

    #[tokio::test]
    async fn truncated_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");

        let mut contents = Frame::command(["SET", "a", "1"]).serialize();
        let valid = contents.len() as u64;
        contents.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nb");
        std::fs::write(&path, &contents).unwrap();

        let aof = Aof::open(&path).await.unwrap();
        let mut applied = vec![];
        let err = aof.replay(|frame| applied.push(frame)).await.unwrap_err();

        assert_eq!(applied, vec![Frame::command(["SET", "a", "1"])]);
        assert!(matches!(
            err,
            AofError::Corrupt {
                offset,
                source: CodecError::Truncated { .. }
            } if offset == valid
        ));
    }

    #[tokio::test]
    async fn garbage_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.aof");
        std::fs::write(&path, b"hello world\r\n").unwrap();

        let aof = Aof::open(&path).await.unwrap();
        let err = replay_all(&aof).await.unwrap_err();

        assert!(matches!(err, AofError::Corrupt { offset: 0, .. }));
    }

    #[tokio::test]
    async fn lock_holds_back_other_appends() {
        let dir = TempDir::new().unwrap();
        let aof = Aof::open(dir.path().join("test.aof")).await.unwrap();

        let mut guard = aof.lock().await;

        let other = aof.clone();
        let pending = tokio::spawn(async move {
            other.append(&Frame::command(["SET", "a", "2"])).await.unwrap();
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        guard
            .append(&Frame::command(["SET", "a", "1"]))
            .await
            .unwrap();
        drop(guard);
        pending.await.unwrap();

        assert_eq!(
            replay_all(&aof).await.unwrap(),
            vec![
                Frame::command(["SET", "a", "1"]),
                Frame::command(["SET", "a", "2"])
            ]
        );
    }

    #[tokio::test]
    async fn append_after_close() {
        let dir = TempDir::new().unwrap();
        let aof = Aof::open(dir.path().join("test.aof")).await.unwrap();

        aof.close().await.unwrap();
        aof.close().await.unwrap();

        let err = aof
            .append(&Frame::command(["SET", "a", "1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AofError::Closed));
    }

    #[tokio::test]
    async fn open_fails_for_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("test.aof");

        let err = Aof::open(&path).await.err().unwrap();

        assert!(matches!(err, AofError::Open { .. }));
    }
}
