use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_kernel::DomainType;
use relay_kernel::launcher::{WorkerChannel, WorkerLauncher, WorkerProcess};
use relay_kernel::wire::{Command, ResponseEnvelope};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// What a mock worker does with one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer `success: true` with this data.
    Success(Value),
    /// Answer `success: false` with this error.
    Failure(String),
    /// Wait, then behave like the inner reply.
    Delayed(Duration, Box<MockReply>),
    /// Write these raw lines and never answer properly.
    Garbage(Vec<String>),
    /// Write one raw line, then behave like the inner reply.
    GarbageThen(String, Box<MockReply>),
    /// Close both streams, as if the process died.
    Exit,
    /// Read the request and never answer.
    Silent,
}

impl MockReply {
    pub fn success(data: Value) -> Self {
        MockReply::Success(data)
    }

    pub fn failure(message: &str) -> Self {
        MockReply::Failure(message.to_string())
    }
}

type Handler = Arc<dyn Fn(&Command) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    launched: AtomicUsize,
    terminated: AtomicUsize,
    next_pid: AtomicU32,
    per_domain: Mutex<HashMap<DomainType, usize>>,
    /// Every request any worker received, in arrival order
    requests: Mutex<Vec<Command>>,
}

/// An in-process [`WorkerLauncher`].
///
/// Each launch starts a task that speaks the line protocol over an
/// in-memory duplex pipe. Handshakes and health checks are answered
/// automatically; every other request goes to the handler.
#[derive(Clone)]
pub struct MockLauncher {
    handler: Handler,
    failing_handshake: bool,
    silent_health_check: bool,
    failing_launch: bool,
    state: Arc<MockState>,
}

impl MockLauncher {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Command) -> MockReply + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            failing_handshake: false,
            silent_health_check: false,
            failing_launch: false,
            state: Arc::new(MockState::default()),
        }
    }

    /// Workers that answer every request with its own payload.
    pub fn echo() -> Self {
        Self::new(|cmd| MockReply::success(cmd.data.clone()))
    }

    /// Workers reject the handshake.
    pub fn with_failing_handshake(mut self) -> Self {
        self.failing_handshake = true;
        self
    }

    /// Workers never answer health checks.
    pub fn with_silent_health_check(mut self) -> Self {
        self.silent_health_check = true;
        self
    }

    /// Every launch fails as if the binary were missing.
    pub fn with_failing_launch(mut self) -> Self {
        self.failing_launch = true;
        self
    }

    /// Workers started so far
    pub fn launched(&self) -> usize {
        self.state.launched.load(Ordering::SeqCst)
    }

    pub fn launched_for(&self, domain: DomainType) -> usize {
        self.state.per_domain.lock().get(&domain).copied().unwrap_or(0)
    }

    /// Workers terminated through their process handle
    pub fn terminated(&self) -> usize {
        self.state.terminated.load(Ordering::SeqCst)
    }

    /// Requests received with exactly this (qualified) action
    pub fn requests_for(&self, action: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|c| c.action == action)
            .count()
    }

    fn reply_for(&self, domain: DomainType, cmd: &Command) -> MockReply {
        match cmd.action.rsplit('.').next() {
            Some("handshake") if self.failing_handshake => MockReply::failure("handshake refused"),
            Some("handshake") => MockReply::success(json!({ "domain": domain.as_str() })),
            Some("health_check") if self.silent_health_check => MockReply::Silent,
            Some("health_check") => MockReply::success(json!({ "healthy": true })),
            _ => (self.handler)(cmd),
        }
    }

    async fn serve(
        self,
        domain: DomainType,
        reader: ReadHalf<DuplexStream>,
        mut writer: WriteHalf<DuplexStream>,
    ) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(cmd) = Command::decode(line.as_bytes()) else {
                tracing::warn!("mock worker received an undecodable line: {}", line);
                continue;
            };
            self.state.requests.lock().push(cmd.clone());
            let reply = self.reply_for(domain, &cmd);
            if !respond(&mut writer, &cmd, reply).await {
                break;
            }
        }
    }
}

/// Carry out `reply`; `false` means the worker should stop.
async fn respond(writer: &mut WriteHalf<DuplexStream>, cmd: &Command, reply: MockReply) -> bool {
    let mut reply = reply;
    loop {
        match reply {
            MockReply::Success(data) => {
                let Ok(frame) = ResponseEnvelope::success(cmd.request_id.clone(), data).encode() else {
                    return false;
                };
                return write_frame(writer, &frame).await;
            }
            MockReply::Failure(message) => {
                let Ok(frame) = ResponseEnvelope::failure(cmd.request_id.clone(), message).encode() else {
                    return false;
                };
                return write_frame(writer, &frame).await;
            }
            MockReply::Delayed(delay, next) => {
                tokio::time::sleep(delay).await;
                reply = *next;
            }
            MockReply::Garbage(lines) => {
                for line in lines {
                    if !write_frame(writer, format!("{line}\n").as_bytes()).await {
                        return false;
                    }
                }
                return true;
            }
            MockReply::GarbageThen(line, next) => {
                if !write_frame(writer, format!("{line}\n").as_bytes()).await {
                    return false;
                }
                reply = *next;
            }
            MockReply::Exit => return false,
            MockReply::Silent => return true,
        }
    }
}

async fn write_frame(writer: &mut WriteHalf<DuplexStream>, frame: &[u8]) -> bool {
    writer.write_all(frame).await.is_ok() && writer.flush().await.is_ok()
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, domain: DomainType) -> io::Result<WorkerChannel> {
        if self.failing_launch {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "mock worker binary not found",
            ));
        }

        let (engine_side, worker_side) = tokio::io::duplex(64 * 1024);
        let (engine_reader, engine_writer) = tokio::io::split(engine_side);
        let (worker_reader, worker_writer) = tokio::io::split(worker_side);

        let task = tokio::spawn(self.clone().serve(domain, worker_reader, worker_writer));
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        *self.state.per_domain.lock().entry(domain).or_insert(0) += 1;
        let pid = 10_000 + self.state.next_pid.fetch_add(1, Ordering::SeqCst);

        Ok(WorkerChannel::new(
            Box::new(engine_reader),
            Box::new(engine_writer),
            Box::new(MockProcess {
                pid,
                task: Some(task),
                state: Arc::clone(&self.state),
            }),
        ))
    }
}

struct MockProcess {
    pid: u32,
    task: Option<JoinHandle<()>>,
    state: Arc<MockState>,
}

#[async_trait]
impl WorkerProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            self.state.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_kernel::wire::FRAME_DELIMITER;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_mock_worker_answers_over_pipe() {
        let launcher = MockLauncher::echo();
        let mut channel = launcher.launch(DomainType::Device).await.unwrap();

        let cmd = Command::new("device.list", json!({"gpu": true}));
        channel.writer.write_all(&cmd.encode().unwrap()).await.unwrap();
        channel.writer.flush().await.unwrap();

        let mut buf = vec![0u8; 1024];
        let mut read = 0;
        while !buf[..read].contains(&FRAME_DELIMITER) {
            read += channel.reader.read(&mut buf[read..]).await.unwrap();
        }
        let reply = ResponseEnvelope::decode(&buf[..read]).unwrap();
        assert_eq!(reply.request_id, cmd.request_id);
        assert_eq!(reply.data, json!({"gpu": true}));

        assert_eq!(launcher.launched(), 1);
        assert_eq!(launcher.requests_for("device.list"), 1);
        channel.process.terminate().await.unwrap();
        channel.process.terminate().await.unwrap();
        assert_eq!(launcher.terminated(), 1);
    }

    #[tokio::test]
    async fn test_failing_launch() {
        let launcher = MockLauncher::echo().with_failing_launch();
        let err = launcher.launch(DomainType::Model).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(launcher.launched(), 0);
    }
}
