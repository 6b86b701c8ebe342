//! Worker side of the coordinator protocol.
//!
//! Reads coordinator messages from stdin, runs tasks through a
//! [`TaskHandler`], and writes results and periodic metrics to stdout.
//! Logging goes to stderr.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::{ConfigError, ProtocolError, WorkerError};
use crate::scheduler::process::{MEMORY_LIMIT_ENV, METRICS_INTERVAL_ENV, WORKER_ID_ENV};
use crate::scheduler::{decode_line, encode_line, CoordinatorMessage, WorkerId, WorkerMessage};

use super::handler::TaskHandler;
use super::sampler::ResourceSampler;

/// Default interval between metrics reports.
const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Settings of one worker process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub metrics_interval: Duration,
    pub memory_limit_mb: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            memory_limit_mb: None,
        }
    }
}

impl WorkerConfig {
    /// Reads the settings the coordinator passes through the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var(WORKER_ID_ENV) {
            if !id.is_empty() {
                config.worker_id = WorkerId::from(id);
            }
        }

        if let Ok(value) = std::env::var(METRICS_INTERVAL_ENV) {
            let millis: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: METRICS_INTERVAL_ENV.to_string(),
                message: format!("expected milliseconds, got '{}'", value),
            })?;
            if millis == 0 {
                return Err(ConfigError::InvalidValue {
                    key: METRICS_INTERVAL_ENV.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
            config.metrics_interval = Duration::from_millis(millis);
        }

        if let Ok(value) = std::env::var(MEMORY_LIMIT_ENV) {
            let limit: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: MEMORY_LIMIT_ENV.to_string(),
                message: format!("expected megabytes, got '{}'", value),
            })?;
            config.memory_limit_mb = Some(limit);
        }

        Ok(config)
    }
}

/// Runs tasks for the coordinator until told to stop.
pub struct WorkerRuntime<H> {
    config: WorkerConfig,
    handler: Arc<H>,
}

impl<H: TaskHandler + 'static> WorkerRuntime<H> {
    pub fn new(config: WorkerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Serves the protocol on the process's stdin and stdout.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves the protocol on arbitrary streams. Returns on `shutdown` or
    /// end of input.
    pub async fn serve<R, W>(self, input: R, output: W) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let worker_id = self.config.worker_id.clone();
        let sampler = Arc::new(Mutex::new(ResourceSampler::new(self.config.memory_limit_mb)));

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_messages(output, outgoing_rx));

        outgoing
            .send(WorkerMessage::Ready {
                worker_id: worker_id.clone(),
            })
            .map_err(|_| ProtocolError::ChannelClosed)?;
        info!(worker_id = %worker_id, "Worker ready");

        let interval = self.config.metrics_interval;
        let mut metrics = interval_at(tokio::time::Instant::now() + interval, interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut lines = BufReader::new(input).lines();
        let mut running: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!(worker_id = %worker_id, "Coordinator closed stdin");
                            break;
                        }
                        Err(e) => {
                            warn!(worker_id = %worker_id, error = %e, "Failed to read from coordinator");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<CoordinatorMessage>(&line) {
                        Ok(CoordinatorMessage::ExecuteTask { task }) => {
                            let Some(task_id) = task.id.clone() else {
                                warn!(worker_id = %worker_id, "Task without id ignored");
                                continue;
                            };
                            if running.as_ref().is_some_and(|h| !h.is_finished()) {
                                warn!(worker_id = %worker_id, task_id = %task_id, "Task received while busy");
                            }
                            let handler = Arc::clone(&self.handler);
                            let sampler = Arc::clone(&sampler);
                            let outgoing = outgoing.clone();
                            running = Some(tokio::spawn(async move {
                                debug!(task_id = %task_id, "Task started");
                                let started = Instant::now();
                                let message = match handler.handle(&task).await {
                                    Ok(report) => {
                                        let usage = report.usage.or_else(|| {
                                            sampler.lock().ok().map(|mut s| s.usage())
                                        });
                                        WorkerMessage::TaskResult {
                                            task_id,
                                            result: report.result,
                                            duration: started.elapsed().as_millis() as u64,
                                            usage,
                                        }
                                    }
                                    Err(e) => WorkerMessage::TaskError {
                                        task_id,
                                        error: e.to_string(),
                                    },
                                };
                                let _ = outgoing.send(message);
                            }));
                        }
                        Ok(CoordinatorMessage::Ping) => trace!(worker_id = %worker_id, "Ping"),
                        Ok(CoordinatorMessage::Shutdown) => {
                            info!(worker_id = %worker_id, "Shutdown requested");
                            break;
                        }
                        Err(e) => warn!(worker_id = %worker_id, error = %e, "Ignoring malformed coordinator message"),
                    }
                }
                _ = metrics.tick() => {
                    let sample = sampler.lock().ok().map(|mut s| s.sample());
                    if let Some((cpu, memory)) = sample {
                        let _ = outgoing.send(WorkerMessage::Metrics { cpu, memory });
                    }
                }
            }
        }

        if let Some(task) = running.take() {
            task.abort();
        }
        drop(outgoing);
        // Aborted tasks drop their sender, letting the writer drain and finish.
        match writer.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Writer task failed"),
        }
        info!(worker_id = %worker_id, "Worker stopped");
        Ok(())
    }
}

async fn write_messages<W>(
    mut output: W,
    mut outgoing: mpsc::UnboundedReceiver<WorkerMessage>,
) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let line = encode_line(&message)?;
        output
            .write_all(line.as_bytes())
            .await
            .map_err(ProtocolError::Io)?;
        output.flush().await.map_err(ProtocolError::Io)?;
    }
    Ok(())
}
