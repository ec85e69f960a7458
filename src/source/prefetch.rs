//! Read-ahead wrapper that moves chunk reading onto a background thread.
//!
//! Chunks cross a bounded channel and are consumed by a single caller, so
//! folding stays strictly sequential; only the reading overlaps with it.

use super::{Chunk, ChunkSource, SourceError};
use crossbeam_channel::{bounded, Receiver, RecvError};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A chunk source whose reads happen on a dedicated thread.
pub struct PrefetchSource {
    receiver: Receiver<Result<Chunk, SourceError>>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchSource {
    /// Spawn a reader thread that keeps up to `depth` chunks ready.
    pub fn spawn<S>(mut source: S, depth: usize) -> Self
    where
        S: ChunkSource + Send + 'static,
    {
        let (sender, receiver) = bounded(depth.max(1));
        let handle = thread::Builder::new()
            .name("chunk-reader".into())
            .spawn(move || loop {
                match source.next_chunk() {
                    Ok(Some(chunk)) => {
                        if sender.send(Ok(chunk)).is_err() {
                            debug!("chunk consumer went away, stopping reader");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = sender.send(Err(e));
                        break;
                    }
                }
            });

        match handle {
            Ok(handle) => Self {
                receiver,
                handle: Some(handle),
            },
            Err(e) => {
                // Could not start a thread: surface it as the first read error.
                let (sender, receiver) = bounded(1);
                let _ = sender.send(Err(SourceError::Read {
                    record: 0,
                    message: format!("failed to spawn reader thread: {e}"),
                }));
                Self {
                    receiver,
                    handle: None,
                }
            }
        }
    }
}

impl ChunkSource for PrefetchSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        match self.receiver.recv() {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(e)) => Err(e),
            Err(RecvError) => match self.handle.take() {
                Some(handle) => match handle.join() {
                    Ok(()) => Ok(None),
                    Err(_) => Err(SourceError::Disconnected),
                },
                None => Ok(None),
            },
        }
    }
}
