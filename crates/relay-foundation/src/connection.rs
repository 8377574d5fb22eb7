//! One worker process and the duplex stream to it.
//!
//! A [`Connection`] owns the write half of the worker's stdin, a background
//! reader task draining its stdout, and the process handle. The reader
//! task decodes one response envelope per line and hands it to the shared
//! [`RequestCorrelator`]; it never blocks on callers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_kernel::DomainType;
use relay_kernel::config::PoolConfig;
use relay_kernel::error::{EngineError, EngineResult};
use relay_kernel::launcher::{WorkerChannel, WorkerProcess, WorkerReader, WorkerWriter};
use relay_kernel::metrics::{ConnectionInfo, ConnectionState};
use relay_kernel::wire::{Command, FRAME_DELIMITER, ProtocolError, ResponseEnvelope};

use crate::correlator::{RequestCorrelator, deadline_after};

/// A live worker connection.
pub struct Connection {
    id: String,
    domain: DomainType,
    created_at: Instant,
    last_used: Mutex<Instant>,
    usage_count: AtomicU64,
    state: Mutex<ConnectionState>,
    current_operation: Mutex<Option<String>>,
    consecutive_timeouts: AtomicU32,
    protocol_errors: AtomicU32,
    max_protocol_errors: u32,
    process_id: Option<u32>,
    /// Part of a frame reached the worker but not its delimiter.
    torn_frame: AtomicBool,
    writer: tokio::sync::Mutex<Option<WorkerWriter>>,
    process: tokio::sync::Mutex<Box<dyn WorkerProcess>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    correlator: Arc<RequestCorrelator>,
}

impl Connection {
    /// Wrap a launched worker, start its reader and perform the handshake.
    ///
    /// Any failure closes the worker and surfaces as [`EngineError::Spawn`].
    pub async fn establish(
        id: String,
        domain: DomainType,
        channel: WorkerChannel,
        correlator: Arc<RequestCorrelator>,
        config: &PoolConfig,
    ) -> EngineResult<Arc<Self>> {
        let WorkerChannel {
            reader,
            writer,
            process,
        } = channel;

        let connection = Arc::new(Self {
            id,
            domain,
            created_at: Instant::now(),
            last_used: Mutex::new(Instant::now()),
            usage_count: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Starting),
            current_operation: Mutex::new(None),
            consecutive_timeouts: AtomicU32::new(0),
            protocol_errors: AtomicU32::new(0),
            max_protocol_errors: config.max_protocol_errors.max(1),
            process_id: process.id(),
            torn_frame: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(Some(writer)),
            process: tokio::sync::Mutex::new(process),
            reader_task: Mutex::new(None),
            correlator,
        });

        let task = tokio::spawn(read_loop(
            reader,
            Arc::downgrade(&connection),
            Arc::clone(&connection.correlator),
            connection.id.clone(),
        ));
        *connection.reader_task.lock() = Some(task);

        let payload = json!({ "domain": domain.as_str() });
        let action = domain.qualify(&config.handshake_action);
        match connection
            .request(Command::new(action, payload), config.handshake_timeout())
            .await
            .and_then(|envelope| {
                envelope
                    .into_result()
                    .map_err(|message| EngineError::Connection(format!("handshake rejected: {message}")))
            }) {
            Ok(_) => {
                connection.set_state(ConnectionState::Idle);
                info!(
                    "Worker connection {} ready (domain: {}, pid: {:?})",
                    connection.id, domain, connection.process_id
                );
                Ok(connection)
            }
            Err(e) => {
                warn!("Handshake failed on {}: {}", connection.id, e);
                connection.close().await;
                Err(EngineError::Spawn {
                    domain,
                    reason: format!("handshake failed: {e}"),
                })
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain(&self) -> DomainType {
        self.domain
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        // Unhealthy only moves to Closed; Closed never moves.
        match *current {
            ConnectionState::Closed => {}
            ConnectionState::Unhealthy if state != ConnectionState::Closed => {}
            _ => *current = state,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Unhealthy | ConnectionState::Closed
        )
    }

    pub(crate) fn mark_unhealthy(&self, reason: &str) {
        let mut state = self.state.lock();
        if !matches!(*state, ConnectionState::Unhealthy | ConnectionState::Closed) {
            warn!("Connection {} marked unhealthy: {}", self.id, reason);
            *state = ConnectionState::Unhealthy;
        }
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Mark the connection busy with `operation` for one request.
    pub(crate) fn begin(&self, operation: &str) {
        self.set_state(ConnectionState::Busy);
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        *self.current_operation.lock() = Some(operation.to_string());
        *self.last_used.lock() = Instant::now();
    }

    /// Mark the connection busy with a health check, which is not counted as usage.
    pub(crate) fn begin_health_check(&self, operation: &str) {
        self.set_state(ConnectionState::Busy);
        *self.current_operation.lock() = Some(operation.to_string());
    }

    pub(crate) fn finish(&self) {
        *self.current_operation.lock() = None;
        *self.last_used.lock() = Instant::now();
    }

    /// Health checks leave `last_used` alone so they never keep a connection from
    /// idling out.
    pub(crate) fn finish_health_check(&self) {
        *self.current_operation.lock() = None;
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    /// Count a timeout; returns the new consecutive total.
    pub(crate) fn record_timeout(&self) -> u32 {
        self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Write `command` and wait up to `timeout` for its response.
    ///
    /// A worker-reported failure is still `Ok`; only transport problems are
    /// errors here.
    pub async fn request(&self, command: Command, timeout: Duration) -> EngineResult<ResponseEnvelope> {
        if matches!(self.state(), ConnectionState::Closed) {
            return Err(EngineError::Connection(format!("connection {} is closed", self.id)));
        }

        let frame = command.encode()?;
        let deadline = deadline_after(timeout);
        let pending = self.correlator.register(&self.id, &command, deadline);

        let written = tokio::time::timeout_at(deadline, async {
            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer closed"))?;
            self.write_frame(writer, &frame).await
        })
        .await;

        match written {
            Ok(Ok(())) => {
                debug!("Sent {} ({}) on {}", command.request_id, command.action, self.id);
                pending.wait().await
            }
            Ok(Err(e)) => {
                drop(pending);
                self.mark_unhealthy(&format!("write failed: {e}"));
                Err(EngineError::Connection(format!(
                    "failed to write to worker {}: {e}",
                    self.id
                )))
            }
            Err(_) if self.has_torn_frame() => {
                drop(pending);
                self.mark_unhealthy("frame write interrupted");
                Err(EngineError::Connection(format!(
                    "frame write interrupted on worker {}",
                    self.id
                )))
            }
            Err(_) => Err(pending.expire()),
        }
    }

    /// Write one encoded frame, flagging the stream while the frame is only
    /// partly written. If this future is dropped mid-frame the flag stays set.
    async fn write_frame(&self, writer: &mut WorkerWriter, frame: &[u8]) -> std::io::Result<()> {
        let mut sent = 0;
        while sent < frame.len() {
            let n = writer.write(&frame[sent..]).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            sent += n;
            if sent < frame.len() {
                self.torn_frame.store(true, Ordering::SeqCst);
            }
        }
        writer.flush().await?;
        self.torn_frame.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the worker's input ends in the middle of a frame. Such a
    /// stream cannot carry another request.
    pub fn has_torn_frame(&self) -> bool {
        self.torn_frame.load(Ordering::SeqCst)
    }

    /// Send a health check. Any answer, even a worker failure, proves the
    /// worker is reading and writing.
    pub async fn health_check(&self, action: &str, timeout: Duration) -> EngineResult<()> {
        let payload = json!({ "domain": self.domain.as_str() });
        self.request(Command::new(self.domain.qualify(action), payload), timeout)
            .await
            .map(|_| ())
    }

    /// Close stdin, stop the reader and terminate the worker. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.process.lock().await.terminate().await {
            warn!("Failed to terminate worker {}: {}", self.id, e);
        }
        self.correlator.fail_connection(
            &self.id,
            EngineError::Connection(format!("connection {} closed", self.id)),
        );
        debug!("Connection {} closed after {} requests", self.id, self.usage_count());
    }

    pub fn info(&self) -> ConnectionInfo {
        let state = self.state();
        ConnectionInfo {
            id: self.id.clone(),
            domain: self.domain,
            state,
            is_healthy: self.is_healthy(),
            usage_count: self.usage_count(),
            age_ms: millis(self.age()),
            idle_ms: millis(self.idle_time()),
            process_id: self.process_id,
            current_operation: self.current_operation.lock().clone(),
            consecutive_timeouts: self.consecutive_timeouts(),
        }
    }

    fn record_protocol_error(&self, error: &ProtocolError) -> bool {
        let count = self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Corrupt line from worker {} ({}/{}): {}",
            self.id, count, self.max_protocol_errors, error
        );
        if count >= self.max_protocol_errors {
            self.mark_unhealthy(&format!("{count} corrupt response lines"));
            true
        } else {
            false
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("state", &self.state())
            .field("pid", &self.process_id)
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    reader: WorkerReader,
    connection: Weak<Connection>,
    correlator: Arc<RequestCorrelator>,
    connection_id: String,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(1024);

    let reason = loop {
        line.clear();
        match reader.read_until(FRAME_DELIMITER, &mut line).await {
            Ok(0) => break "worker closed its output stream".to_string(),
            Ok(_) => match ResponseEnvelope::decode(&line) {
                Ok(envelope) => {
                    if let Some(conn) = connection.upgrade() {
                        conn.protocol_errors.store(0, Ordering::Relaxed);
                    }
                    correlator.resolve(&connection_id, envelope);
                }
                Err(ProtocolError::EmptyFrame) => {}
                Err(e) => {
                    let Some(conn) = connection.upgrade() else {
                        break "connection dropped".to_string();
                    };
                    if conn.record_protocol_error(&e) {
                        correlator.fail_connection(&connection_id, EngineError::Protocol(e));
                    }
                }
            },
            Err(e) => break format!("read failed: {e}"),
        }
    };

    debug!("Reader for {} stopped: {}", connection_id, reason);
    if let Some(conn) = connection.upgrade() {
        conn.mark_unhealthy(&reason);
    }
    correlator.fail_connection(&connection_id, EngineError::Connection(reason));
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
