//! Worker in a child process.
//!
//! The child is the `pitaya-worker` binary. Commands go to its stdin and
//! messages come back on its stdout, one JSON document per line. Its stderr
//! is inherited so worker logs end up next to ours.

use crate::launch::{Liveness, WorkerChannels, WorkerHandle, WorkerLauncher};
use crate::worker::{run_worker, WorkerConfig};
use async_trait::async_trait;
use pitaya_core::{
    BackendFactory, Command, CorrelationId, PitayaError, PitayaResult, Response, WorkerMessage,
};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Flag carrying the serialized [`WorkerConfig`] on the child command line.
pub const CONFIG_FLAG: &str = "--worker-config";

/// Launches `pitaya-worker` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    capacity: usize,
}

impl ProcessLauncher {
    /// Launcher running `program`.
    pub fn new(program: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            program: program.into(),
            capacity: capacity.max(1),
        }
    }

    /// Worker executable this launcher runs.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// `pitaya-worker` next to the current executable.
pub fn default_program() -> PitayaResult<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        PitayaError::Configuration(format!("{} has no parent directory", exe.display()))
    })?;
    Ok(dir.join(format!("pitaya-worker{}", std::env::consts::EXE_SUFFIX)))
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, config: &WorkerConfig) -> PitayaResult<WorkerChannels> {
        let encoded = serde_json::to_string(config)?;
        let mut child = tokio::process::Command::new(&self.program)
            .arg(CONFIG_FLAG)
            .arg(&encoded)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PitayaError::Backend(format!(
                    "failed to spawn worker '{}': {e}",
                    self.program.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PitayaError::Backend("worker stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PitayaError::Backend("worker stdout was not captured".into()))?;

        let pid = child.id();
        let (cmd_tx, cmd_rx) = mpsc::channel(self.capacity);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let liveness = Liveness::new();

        tokio::spawn(write_commands(stdin, cmd_rx, pid));
        tokio::spawn(read_messages(stdout, msg_tx, liveness.clone(), pid));

        info!(pid, program = %self.program.display(), address = %config.address(), "Worker process spawned");
        Ok(WorkerChannels {
            inbound: cmd_tx,
            outbound: msg_rx,
            liveness,
            handle: Box::new(ProcessWorker { child, pid }),
        })
    }
}

async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: mpsc::Receiver<Command>,
    pid: Option<u32>,
) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = write_line(&mut stdin, &command).await {
            warn!(pid, error = %e, "Failed to write command to worker");
            break;
        }
    }
    // Dropping stdin gives the worker EOF
    debug!(pid, "Worker command writer finished");
}

async fn read_messages(
    stdout: ChildStdout,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    liveness: Liveness,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(message) => {
                    if messages.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(pid, error = %e, line = %line, "Malformed worker message"),
            },
            Ok(None) => {
                debug!(pid, "Worker closed stdout");
                break;
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to read from worker");
                break;
            }
        }
    }
    liveness.mark_dead();
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> PitayaResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

struct ProcessWorker {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    async fn wait(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, %status, "Worker process exited");
                true
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "Failed to wait for worker process");
                true
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) {
        warn!(pid = self.pid, "Killing worker process");
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "Failed to kill worker process");
        }
    }

    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("process {pid}"),
            None => "process (exited)".to_string(),
        }
    }
}

/// Turn one stdin line into a command, or into an error reply when the line
/// carries a correlation id but is otherwise malformed.
fn decode_command(line: &str) -> Result<Command, Option<WorkerMessage>> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        warn!(error = %e, "Discarding unparseable command line");
        None
    })?;
    let id = value
        .get("correlation_id")
        .cloned()
        .and_then(|id| serde_json::from_value::<CorrelationId>(id).ok());
    serde_json::from_value::<Command>(value).map_err(|e| {
        warn!(error = %e, "Malformed command");
        id.map(|correlation_id| WorkerMessage::Tagged {
            correlation_id,
            response: Response::error(format!("malformed command: {e}")),
        })
    })
}

/// Serve the worker protocol on this process's stdin/stdout.
///
/// Returns once the worker loop ends: after `shutdown`, or when stdin
/// reaches EOF.
pub async fn serve_stdio(
    config: WorkerConfig,
    factory: &dyn BackendFactory,
    capacity: usize,
) -> PitayaResult<()> {
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity.max(1));
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let reply_tx = msg_tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match decode_command(&line) {
                Ok(command) => {
                    if cmd_tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(Some(reply)) => {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Err(None) => {}
            }
        }
        debug!("Worker stdin closed");
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = msg_rx.recv().await {
            write_line(&mut stdout, &message).await?;
        }
        Ok::<_, PitayaError>(())
    });

    run_worker(&config, factory, cmd_rx, msg_tx).await;

    reader.abort();
    let _ = reader.await;
    match writer.await {
        Ok(result) => result,
        Err(e) => Err(PitayaError::Backend(format!("stdout writer failed: {e}"))),
    }
}
