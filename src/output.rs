//! Component B: Output Chunk Stream.
//!
//! Merges a child's stdout and stderr into a single ordered sequence of
//! timestamped, typed byte chunks. Line reassembly and wire-format parsing
//! happen downstream in [`crate::normalize`]; this module only owns the
//! raw-byte merge, grounded in the reader-task-per-pipe pattern used by the
//! process-manager scaffolding this crate's Process Manager builds on.

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Which pipe a chunk arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Stdout,
    Stderr,
}

/// One read's worth of raw bytes from a child process pipe.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: ChunkKind,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Read `reader` to completion in fixed-size chunks, tagging and forwarding
/// each non-empty read through `tx`. Exits silently on EOF or a closed
/// receiver (the consumer going away is not this task's problem).
async fn pump<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    kind: ChunkKind,
    tx: mpsc::Sender<OutputChunk>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        let chunk = OutputChunk {
            kind,
            data: buf[..n].to_vec(),
            timestamp: Utc::now(),
        };
        if tx.send(chunk).await.is_err() {
            return;
        }
    }
}

/// Spawn the stdout and stderr reader tasks for a single managed process and
/// return the merged stream. The two readers race freely; chunk order across
/// pipes reflects arrival time, not a fixed interleaving.
pub fn merge<O, E>(stdout: O, stderr: E) -> ReceiverStream<OutputChunk>
where
    O: tokio::io::AsyncRead + Unpin + Send + 'static,
    E: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(pump(stdout, ChunkKind::Stdout, tx.clone()));
    tokio::spawn(pump(stderr, ChunkKind::Stderr, tx));
    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_stream::StreamExt;

    async fn duplex_with(data: &'static [u8]) -> tokio::io::DuplexStream {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(data).await.unwrap();
        drop(writer);
        reader
    }

    #[tokio::test]
    async fn merges_both_pipes_and_tags_kind() {
        let stdout = duplex_with(b"hello\n").await;
        let stderr = duplex_with(b"warn\n").await;
        let mut stream = merge(stdout, stderr);

        let mut seen = Vec::new();
        while let Some(chunk) = stream.next().await {
            seen.push(chunk);
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|c| c.kind == ChunkKind::Stdout && c.data == b"hello\n"));
        assert!(seen.iter().any(|c| c.kind == ChunkKind::Stderr && c.data == b"warn\n"));
    }

    #[tokio::test]
    async fn empty_pipes_yield_no_chunks() {
        let stdout = duplex_with(b"").await;
        let stderr = duplex_with(b"").await;
        let mut stream = merge(stdout, stderr);
        assert!(stream.next().await.is_none());
    }
}
