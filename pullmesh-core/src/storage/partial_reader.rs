//! Read-after-write streaming of a layer file that a concurrent fetch may
//! still be appending to.
//!
//! The reader polls: end-of-file before the expected length means "not yet
//! available", so it sleeps and retries at the same offset. Polling bounds
//! staleness to the poll interval and needs no signaling between the writer
//! and reader tasks.

use bytes::Bytes;
use std::io::SeekFrom;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(300);
const CHUNK_SIZE: usize = 1024 * 1024;
const CHANNEL_CAPACITY: usize = 8;

/// Streams up to `length` bytes out of `file` in fixed-size chunks.
///
/// The read loop stops once the offset reaches `length - 1`: a file that
/// plateaus at exactly `length - 1` bytes ends the stream with the final
/// byte undelivered, matching the byte accounting of the proxy wire
/// contract. Reads are capped at the remaining expected bytes so a file
/// larger than `length` never over-delivers.
pub struct PartialFileReader {
    file: File,
    length: u64,
}

impl PartialFileReader {
    pub fn new(file: File, length: u64) -> Self {
        Self { file, length }
    }

    /// Spawns the read loop; chunks arrive on the returned channel, which
    /// closes when the expected length is reached or the receiver goes away.
    pub fn stream(self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx));
        rx
    }

    async fn run(mut self, chunks: mpsc::Sender<Bytes>) {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut offset: u64 = 0;

        while offset < self.length.saturating_sub(1) {
            if let Err(error) = self.file.seek(SeekFrom::Start(offset)).await {
                tracing::warn!(error = %error, "failed to seek layer file, retrying");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let want = (self.length - offset).min(CHUNK_SIZE as u64) as usize;
            let read = match self.file.read(&mut buffer[..want]).await {
                Ok(0) => {
                    // writer has not caught up yet
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                Ok(read) => read,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to read layer file, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
            };

            offset += read as u64;
            if chunks
                .send(Bytes::copy_from_slice(&buffer[..read]))
                .await
                .is_err()
            {
                // requester went away
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tokio::time::timeout;

    async fn open(path: &Path) -> File {
        File::open(path).await.unwrap()
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
    }

    async fn collect(receiver: &mut mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Some(chunk) = receiver.recv().await {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    #[tokio::test]
    async fn test_streams_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"0123456789").unwrap();

        let reader = PartialFileReader::new(open(&path).await, 10);
        let mut chunks = reader.stream();
        assert_eq!(collect(&mut chunks).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_polls_while_writer_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"01234").unwrap();

        let reader = PartialFileReader::new(open(&path).await, 10);
        let mut chunks = reader.stream();

        let first = timeout(Duration::from_secs(5), chunks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], b"01234");

        // only 5 of 10 bytes exist: the stream must keep polling, not end
        assert!(timeout(Duration::from_millis(100), chunks.recv())
            .await
            .is_err());

        append(&path, b"56789");
        let rest = timeout(Duration::from_secs(5), collect(&mut chunks))
            .await
            .unwrap();
        assert_eq!(rest, b"56789");
    }

    #[tokio::test]
    async fn test_stops_at_length_minus_one_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        // 9 of 10 expected bytes: offset reaches length - 1, so the stream
        // ends without the final byte ever being polled for
        std::fs::write(&path, b"012345678").unwrap();

        let reader = PartialFileReader::new(open(&path).await, 10);
        let mut chunks = reader.stream();
        let collected = timeout(Duration::from_secs(5), collect(&mut chunks))
            .await
            .unwrap();
        assert_eq!(collected, b"012345678");
    }

    #[tokio::test]
    async fn test_does_not_read_past_expected_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"0123456789extra").unwrap();

        let reader = PartialFileReader::new(open(&path).await, 10);
        let mut chunks = reader.stream();
        assert_eq!(collect(&mut chunks).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_zero_length_yields_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer");
        std::fs::write(&path, b"").unwrap();

        let reader = PartialFileReader::new(open(&path).await, 0);
        let mut chunks = reader.stream();
        assert!(chunks.recv().await.is_none());
    }
}
