//! OS-process worker launcher.
//!
//! Spawns the configured worker program with piped stdio. Stdout carries
//! responses, stdin carries commands, and stderr is forwarded line by line
//! to `tracing` under the `relay::worker` target.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use relay_kernel::DomainType;
use relay_kernel::config::{EngineConfig, WORKER_DOMAIN_ENV, WorkerCommand};
use relay_kernel::launcher::{WorkerChannel, WorkerLauncher, WorkerProcess};

/// Launches one OS process per connection.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    commands: HashMap<DomainType, WorkerCommand>,
    termination_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &EngineConfig) -> Self {
        let commands = DomainType::ALL
            .iter()
            .map(|domain| (*domain, config.worker_for(*domain)))
            .collect();
        Self {
            commands,
            termination_grace: config.pool.shutdown_grace(),
        }
    }

    /// Same command for every domain.
    pub fn with_command(command: WorkerCommand) -> Self {
        let commands = DomainType::ALL
            .iter()
            .map(|domain| (*domain, command.clone()))
            .collect();
        Self {
            commands,
            termination_grace: Duration::from_secs(5),
        }
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    fn command_for(&self, domain: DomainType) -> io::Result<&WorkerCommand> {
        self.commands
            .get(&domain)
            .filter(|c| !c.program.trim().is_empty())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no worker program configured for domain {domain}"),
                )
            })
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, domain: DomainType) -> io::Result<WorkerChannel> {
        let worker = self.command_for(domain)?;

        let mut cmd = Command::new(&worker.program);
        cmd.args(worker.args_for(domain))
            .envs(worker.env_pairs())
            .env(WORKER_DOMAIN_ENV, domain.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &worker.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            io::Error::new(e.kind(), format!("failed to start `{}`: {e}", worker.program))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(domain, pid, stderr));
        }

        info!("Spawned {} worker `{}` (pid: {:?})", domain, worker.program, pid);
        Ok(WorkerChannel::new(
            Box::new(stdout),
            Box::new(stdin),
            Box::new(ChildProcess {
                child,
                pid,
                grace: self.termination_grace,
            }),
        ))
    }
}

struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    grace: Duration,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&mut self) -> io::Result<()> {
        // Stdin is already closed at this point; give the worker a moment to
        // exit on its own before killing it.
        let polite = self.grace.min(Duration::from_millis(250));
        if let Ok(status) = tokio::time::timeout(polite, self.child.wait()).await {
            debug!("Worker {:?} exited with {}", self.pid, status?);
            return Ok(());
        }

        if let Err(e) = self.child.start_kill() {
            // Already reaped.
            if e.kind() == io::ErrorKind::InvalidInput {
                return Ok(());
            }
            return Err(e);
        }
        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(status) => {
                debug!("Worker {:?} killed ({})", self.pid, status?);
                Ok(())
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("worker {:?} did not exit within {:?}", self.pid, self.grace),
            )),
        }
    }
}

async fn forward_stderr(domain: DomainType, pid: Option<u32>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "relay::worker", domain = %domain, pid = ?pid, "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(target: "relay::worker", domain = %domain, pid = ?pid, "stderr read failed: {}", e);
                break;
            }
        }
    }
}
