//! PTY-mode spawning via `portable-pty`.
//!
//! `portable-pty` is a synchronous API; its reader/writer run on a blocking
//! thread and are bridged onto the same [`crate::output::OutputChunk`]
//! channel the pipe path uses, all tagged as `stdout` (§4.A PTY variant: a
//! single `onData` callback covers both streams).

use std::io::{Read, Write};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::output::{ChunkKind, OutputChunk};

use super::AcquireConfig;

const READ_BUF_SIZE: usize = 8 * 1024;

pub(crate) struct SpawnedPty {
    pub(crate) child: Box<dyn portable_pty::Child + Send + Sync>,
    pub(crate) writer: Box<dyn Write + Send>,
    pub(crate) master: Box<dyn portable_pty::MasterPty + Send>,
    pub(crate) chunks: ReceiverStream<OutputChunk>,
}

pub(crate) fn spawn(
    config: &AcquireConfig,
    env: &std::collections::HashMap<String, String>,
    cols: u16,
    rows: u16,
    term: &str,
) -> Result<SpawnedPty> {
    super::pipe::validate_cwd(&config.cwd)?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;

    let mut builder = CommandBuilder::new(&config.program);
    builder.args(&config.args);
    builder.cwd(&config.cwd);
    builder.env("TERM", term);
    for (k, v) in env {
        builder.env(k, v);
    }
    for (k, v) in &config.env {
        builder.env(k, v);
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;

    let (tx, rx) = mpsc::channel(256);
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => n,
                Err(_) => return,
            };
            let chunk = OutputChunk {
                kind: ChunkKind::Stdout,
                data: buf[..n].to_vec(),
                timestamp: chrono::Utc::now(),
            };
            if tx.blocking_send(chunk).is_err() {
                return;
            }
        }
    });

    Ok(SpawnedPty {
        child,
        writer,
        master: pair.master,
        chunks: ReceiverStream::new(rx),
    })
}
