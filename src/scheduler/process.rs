//! Worker child processes.
//!
//! Each worker is a child process speaking the line protocol over its
//! stdin/stdout. Two tasks are attached to every child: a writer draining
//! outgoing messages into stdin, and a supervisor forwarding decoded
//! stdout lines to the coordinator and reporting the process exit.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{PoolError, ProtocolError};

use super::config::WorkerCommand;
use super::protocol::{decode_line, encode_line, CoordinatorMessage, WorkerMessage};
use super::worker::WorkerId;

/// Environment variable carrying the id assigned by the coordinator.
pub const WORKER_ID_ENV: &str = "TASK_FORGE_WORKER_ID";
/// Environment variable carrying the metrics report interval.
pub const METRICS_INTERVAL_ENV: &str = "TASK_FORGE_METRICS_INTERVAL_MS";
/// Environment variable carrying the memory limit reported by the worker.
pub const MEMORY_LIMIT_ENV: &str = "TASK_FORGE_WORKER_MEMORY_LIMIT_MB";

/// Something observed on a worker process.
#[derive(Debug)]
pub enum ProcessEvent {
    /// A decoded stdout line.
    Message(WorkerId, WorkerMessage),
    /// The process is gone.
    Exited {
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Coordinator-side handle of a running worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    sender: mpsc::UnboundedSender<CoordinatorMessage>,
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
}

impl WorkerHandle {
    /// Worker id.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queues a message for the worker's stdin.
    pub fn send(&self, message: CoordinatorMessage) -> Result<(), ProtocolError> {
        self.sender
            .send(message)
            .map_err(|_| ProtocolError::ChannelClosed)
    }

    /// Terminates the process. Later calls are no-ops.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Spawns a worker process and attaches its writer and supervisor tasks.
///
/// Every stdout message and the final exit are delivered to `events`
/// converted into the coordinator's command type.
pub fn spawn_worker<C>(
    id: WorkerId,
    command: &WorkerCommand,
    env: &[(&str, String)],
    events: mpsc::UnboundedSender<C>,
) -> Result<WorkerHandle, PoolError>
where
    C: From<ProcessEvent> + Send + 'static,
{
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env(WORKER_ID_ENV, id.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| {
        PoolError::SpawnFailed(format!("{}: {}", command.program.display(), e))
    })?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PoolError::SpawnFailed("worker stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PoolError::SpawnFailed("worker stdout not captured".to_string()))?;

    let (sender, outgoing) = mpsc::unbounded_channel();
    let (kill, kill_rx) = oneshot::channel();

    tokio::spawn(write_messages(id.clone(), stdin, outgoing));
    tokio::spawn(supervise(id.clone(), child, stdout, kill_rx, events));

    debug!(worker_id = %id, pid = ?pid, "Spawned worker process");

    Ok(WorkerHandle {
        id,
        sender,
        kill: Some(kill),
        pid,
    })
}

async fn write_messages(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<CoordinatorMessage>,
) {
    while let Some(message) = outgoing.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "Failed to encode message");
                continue;
            }
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(worker_id = %id, error = %e, "Worker stdin closed");
            break;
        }
    }
}

async fn supervise<C>(
    id: WorkerId,
    mut child: Child,
    stdout: tokio::process::ChildStdout,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<C>,
) where
    C: From<ProcessEvent> + Send + 'static,
{
    let mut lines = BufReader::new(stdout).lines();
    let mut killed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<WorkerMessage>(&line) {
                        Ok(message) => {
                            trace!(worker_id = %id, "Received worker message");
                            if events.send(ProcessEvent::Message(id.clone(), message).into()).is_err() {
                                killed = true;
                                break;
                            }
                        }
                        Err(e) => warn!(worker_id = %id, error = %e, "Ignoring malformed worker output"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Failed to read worker output");
                    break;
                }
            },
            // A dropped handle also terminates the process.
            _ = &mut kill_rx => {
                killed = true;
                break;
            }
        }
    }

    let status = if killed {
        terminate(&id, &mut child).await
    } else {
        tokio::select! {
            status = child.wait() => status.ok(),
            _ = &mut kill_rx => terminate(&id, &mut child).await,
        }
    };

    let (code, signal) = status.map(exit_parts).unwrap_or((None, None));
    debug!(worker_id = %id, code = ?code, signal = ?signal, "Worker process exited");
    let _ = events.send(
        ProcessEvent::Exited {
            worker_id: id,
            code,
            signal,
        }
        .into(),
    );
}

async fn terminate(id: &WorkerId, child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(worker_id = %id, error = %e, "Kill failed; process may have exited");
    }
    child.wait().await.ok()
}

fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}
