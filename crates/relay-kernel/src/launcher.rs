//! Worker launch contract.
//!
//! A [`WorkerLauncher`] turns a domain tag into a live duplex byte channel
//! plus a handle that can terminate whatever sits on the other end. The
//! foundation crate provides the OS-process implementation; tests plug in
//! in-process doubles.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::domain::DomainType;

/// Read half of a worker channel (the worker's stdout).
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a worker channel (the worker's stdin).
pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle on the process behind a channel.
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Stop the worker and reap it. Must be idempotent.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// A freshly launched worker, before the handshake.
pub struct WorkerChannel {
    pub reader: WorkerReader,
    pub writer: WorkerWriter,
    pub process: Box<dyn WorkerProcess>,
}

impl WorkerChannel {
    pub fn new(reader: WorkerReader, writer: WorkerWriter, process: Box<dyn WorkerProcess>) -> Self {
        Self {
            reader,
            writer,
            process,
        }
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Spawns workers for a domain.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, domain: DomainType) -> io::Result<WorkerChannel>;
}
