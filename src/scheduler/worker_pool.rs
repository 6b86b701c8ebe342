//! Worker pool backed by child processes.
//!
//! A single coordinator task owns the worker table, the backlog, the
//! in-flight tasks and the strategy manager. Everything that changes pool
//! state (API calls, worker messages, process exits, timers) arrives on
//! one command channel and is handled sequentially, so no worker can be
//! double-booked.
//!
//! # Features
//!
//! - Readiness handshake with timeout for every spawned worker
//! - Per-task timeout; a timed-out worker is always replaced
//! - Worker recycling after a configurable number of tasks
//! - Health checks: ping, idle eviction, backlog-driven scale-up
//! - Bounded, idempotent shutdown

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, StrategyError};
use crate::events::{EventBus, PoolEvent};
use crate::metrics::{MetricsCollector, WorkerCounts};
use crate::strategy::{ManagerConfig, ManagerMetrics, StrategyContext, StrategyManager, StrategyRegistry};

use super::config::{PoolConfig, WorkerCommand};
use super::process::{spawn_worker, ProcessEvent, WorkerHandle, MEMORY_LIMIT_ENV, METRICS_INTERVAL_ENV};
use super::protocol::{CoordinatorMessage, WorkerMessage};
use super::task::{ResourceUsage, Task, TaskId, TaskOutcome};
use super::worker::{available_ids, HostCapabilities, WorkerDirectory, WorkerId, WorkerInfo, WorkerState};

/// Backlog length per worker added by the health check.
const BACKLOG_PER_SCALE_STEP: usize = 10;
/// Backlog-to-capacity ratio above which the pool scales up.
const BACKLOG_PRESSURE_RATIO: f64 = 0.5;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Live workers in any state.
    pub workers: usize,
    pub initializing_workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
    pub stopping_workers: usize,
    /// Tasks waiting for a worker.
    pub backlog: usize,
    /// Tasks assigned to a worker.
    pub in_flight: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub workers_created: u64,
    pub workers_recycled: u64,
    /// Average duration of completed tasks, in milliseconds.
    pub average_task_duration_ms: f64,
    pub active_strategy: Option<String>,
}

impl PoolStats {
    /// Returns the number of tasks that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_timed_out
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

type ProvisionReply = oneshot::Sender<Result<WorkerId, PoolError>>;

/// Everything the coordinator reacts to.
#[derive(Debug)]
enum Command {
    Execute {
        task: Task,
    },
    Provision {
        reply: Option<ProvisionReply>,
    },
    SetStrategy {
        name: String,
        options: serde_json::Value,
        reply: oneshot::Sender<Result<(), StrategyError>>,
    },
    StrategyMetrics {
        reply: oneshot::Sender<ManagerMetrics>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Process(ProcessEvent),
    ReadyTimeout {
        worker_id: WorkerId,
    },
    TaskTimeout {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    ForceKill {
        worker_id: WorkerId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl From<ProcessEvent> for Command {
    fn from(event: ProcessEvent) -> Self {
        Command::Process(event)
    }
}

/// Sends `command` to the coordinator after `delay`.
fn schedule(commands: &mpsc::UnboundedSender<Command>, delay: Duration, command: Command) -> AbortHandle {
    let commands = commands.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = commands.send(command);
    })
    .abort_handle()
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}

/// Workers to add for a backlog, zero unless the backlog exceeds half of
/// `max_workers`.
fn scale_up_step(backlog: usize, max_workers: usize, live: usize) -> usize {
    if max_workers == 0 || backlog as f64 / max_workers as f64 <= BACKLOG_PRESSURE_RATIO {
        return 0;
    }
    backlog
        .div_ceil(BACKLOG_PER_SCALE_STEP)
        .min(max_workers.saturating_sub(live))
}

/// Error reported for a task whose worker exited before answering.
fn orphaned_task_error(expected: bool, reason: &str, status: &str) -> String {
    if expected {
        format!("worker stopped ({}, {})", reason, status)
    } else {
        format!("worker exited unexpectedly ({})", status)
    }
}

struct WorkerProcess {
    handle: WorkerHandle,
    ready_reply: Option<ProvisionReply>,
    ready_timer: Option<AbortHandle>,
    kill_timer: Option<AbortHandle>,
    /// Set once the worker completed its handshake and strategies know it.
    announced: bool,
    /// Start a fresh worker when this one exits.
    replace_on_exit: bool,
    /// Why the coordinator stopped the worker; `None` for unexpected exits.
    exit_reason: Option<String>,
}

struct InFlight {
    task: Task,
    worker_id: WorkerId,
    started: Instant,
    timeout: Duration,
    timer: AbortHandle,
}

enum WorkerReport {
    Result {
        result: serde_json::Value,
        duration: Duration,
        usage: Option<ResourceUsage>,
    },
    Error(String),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    workers_created: u64,
    workers_recycled: u64,
    completed_duration: Duration,
}

struct Coordinator {
    config: PoolConfig,
    command: WorkerCommand,
    commands: mpsc::UnboundedSender<Command>,
    workers: WorkerDirectory,
    processes: HashMap<WorkerId, WorkerProcess>,
    backlog: VecDeque<Task>,
    in_flight: HashMap<TaskId, InFlight>,
    manager: StrategyManager,
    events: EventBus,
    metrics: MetricsCollector,
    counters: Counters,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    fn new(
        config: PoolConfig,
        command: WorkerCommand,
        commands: mpsc::UnboundedSender<Command>,
        manager: StrategyManager,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            command,
            commands,
            workers: WorkerDirectory::new(),
            processes: HashMap::new(),
            backlog: VecDeque::new(),
            in_flight: HashMap::new(),
            manager,
            events,
            metrics: MetricsCollector::new(),
            counters: Counters::default(),
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        let now = tokio::time::Instant::now();
        let mut health = interval_at(
            now + self.config.health_check_interval,
            self.config.health_check_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = interval_at(
            now + self.config.maintenance_interval,
            self.config.maintenance_interval,
        );
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let evaluation_window = self.manager.config().evaluation_window;
        let mut evaluation = interval_at(now + evaluation_window, evaluation_window);
        evaluation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dynamic_switching = self.manager.config().enable_dynamic_switching;

        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = health.tick(), if !self.shutting_down => self.health_check(),
                _ = maintenance.tick(), if !self.shutting_down => {
                    self.manager.maintenance(Instant::now());
                }
                _ = evaluation.tick(), if dynamic_switching && !self.shutting_down => {
                    if let Some((from, to)) = self.manager.evaluate() {
                        self.metrics.record_strategy_switch();
                        info!(from = %from, to = %to, "Active strategy replaced");
                    }
                }
            }

            if self.shutting_down && self.processes.is_empty() {
                break;
            }
        }

        self.finish_shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Execute { task } => self.submit(task),
            Command::Provision { reply } => self.provision(reply),
            Command::SetStrategy {
                name,
                options,
                reply,
            } => {
                let result = self.manager.set_strategy(&name, &options, &self.workers);
                if let Err(e) = &result {
                    warn!(strategy = %name, error = %e, "Strategy change rejected");
                }
                let _ = reply.send(result);
                self.drain_backlog();
            }
            Command::StrategyMetrics { reply } => {
                let _ = reply.send(self.manager.metrics());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Process(ProcessEvent::Message(worker_id, message)) => {
                self.on_message(worker_id, message)
            }
            Command::Process(ProcessEvent::Exited {
                worker_id,
                code,
                signal,
            }) => self.on_exit(worker_id, code, signal),
            Command::ReadyTimeout { worker_id } => self.on_ready_timeout(worker_id),
            Command::TaskTimeout { worker_id, task_id } => self.on_task_timeout(worker_id, task_id),
            Command::ForceKill { worker_id } => {
                if self.processes.contains_key(&worker_id) {
                    warn!(worker_id = %worker_id, "Worker did not exit in time; forcing termination");
                    self.kill_worker(&worker_id, "forced");
                }
            }
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    /// Workers not on their way out.
    fn live_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.state != WorkerState::Stopping)
            .count()
    }

    fn worker_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![(
            METRICS_INTERVAL_ENV,
            self.config.metrics_interval.as_millis().to_string(),
        )];
        if let Some(limit) = self.config.worker_memory_limit_mb {
            env.push((MEMORY_LIMIT_ENV, limit.to_string()));
        }
        env
    }

    fn provision(&mut self, reply: Option<ProvisionReply>) {
        let refuse = if self.shutting_down {
            Some(PoolError::ShuttingDown)
        } else if self.live_workers() >= self.config.max_workers {
            Some(PoolError::AtCapacity {
                max: self.config.max_workers,
            })
        } else {
            None
        };
        if let Some(err) = refuse {
            debug!(error = %err, "Worker not provisioned");
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }

        let worker_id = WorkerId::generate();
        let env = self.worker_env();
        let handle = match spawn_worker(worker_id.clone(), &self.command, &env, self.commands.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Failed to provision worker");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        info!(worker_id = %worker_id, pid = ?handle.pid(), "Worker starting");
        let ready_timer = schedule(
            &self.commands,
            self.config.ready_timeout,
            Command::ReadyTimeout {
                worker_id: worker_id.clone(),
            },
        );
        self.workers
            .insert(worker_id.clone(), WorkerInfo::new(worker_id.clone(), Instant::now()));
        self.processes.insert(
            worker_id,
            WorkerProcess {
                handle,
                ready_reply: reply,
                ready_timer: Some(ready_timer),
                kill_timer: None,
                announced: false,
                replace_on_exit: false,
                exit_reason: None,
            },
        );
        self.counters.workers_created += 1;
        self.update_gauges();
    }

    fn on_message(&mut self, worker_id: WorkerId, message: WorkerMessage) {
        if !self.workers.contains_key(&worker_id) {
            debug!(worker_id = %worker_id, "Message from unknown worker");
            return;
        }
        match message {
            WorkerMessage::Ready { .. } => self.on_ready(worker_id),
            WorkerMessage::TaskResult {
                task_id,
                result,
                duration,
                usage,
            } => self.on_task_finished(
                worker_id,
                task_id,
                WorkerReport::Result {
                    result,
                    duration: Duration::from_millis(duration),
                    usage,
                },
            ),
            WorkerMessage::TaskError { task_id, error } => {
                self.on_task_finished(worker_id, task_id, WorkerReport::Error(error))
            }
            WorkerMessage::Metrics { cpu, memory } => {
                if let Some(info) = self.workers.get_mut(&worker_id) {
                    info.record_metrics(cpu, memory);
                    let info = info.clone();
                    self.manager.on_worker_metrics(&worker_id, &info);
                }
                // A lighter load may make a queued task placeable.
                self.drain_backlog();
            }
        }
    }

    fn on_ready(&mut self, worker_id: WorkerId) {
        let Some(info) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if info.state != WorkerState::Initializing {
            debug!(worker_id = %worker_id, "Duplicate ready message");
            return;
        }
        info.mark_ready(Instant::now());
        let info = info.clone();

        if let Some(process) = self.processes.get_mut(&worker_id) {
            if let Some(timer) = process.ready_timer.take() {
                timer.abort();
            }
            if let Some(reply) = process.ready_reply.take() {
                let _ = reply.send(Ok(worker_id.clone()));
            }
            process.announced = true;
        }

        info!(worker_id = %worker_id, "Worker ready");
        self.events.emit(PoolEvent::WorkerCreated {
            worker_id: worker_id.clone(),
        });
        self.manager.on_worker_added(&worker_id, &info);
        self.drain_backlog();
        self.update_gauges();
    }

    fn on_ready_timeout(&mut self, worker_id: WorkerId) {
        let initializing = self
            .workers
            .get(&worker_id)
            .is_some_and(|w| w.state == WorkerState::Initializing);
        if !initializing {
            return;
        }
        warn!(
            worker_id = %worker_id,
            timeout_ms = self.config.ready_timeout.as_millis() as u64,
            "Worker did not become ready"
        );
        if let Some(reply) = self
            .processes
            .get_mut(&worker_id)
            .and_then(|p| p.ready_reply.take())
        {
            let _ = reply.send(Err(PoolError::ReadyTimeout {
                worker_id: worker_id.to_string(),
                timeout: self.config.ready_timeout,
            }));
        }
        self.kill_worker(&worker_id, "ready timeout");
    }

    fn submit(&mut self, mut task: Task) {
        let task_id = task.id.get_or_insert_with(TaskId::generate).clone();
        if self.shutting_down {
            warn!(task_id = %task_id, "Pool shutting down; task dropped");
            return;
        }
        if task.queued_at.is_none() {
            task.queued_at = Some(Utc::now());
        }
        self.counters.submitted += 1;

        if let Some(task) = self.try_place(task) {
            self.backlog.push_back(task);
            let backlog = self.backlog.len();
            debug!(task_id = %task_id, backlog, "Task queued");
            self.events.emit(PoolEvent::TaskQueued { task_id, backlog });

            let starting = self
                .workers
                .values()
                .any(|w| w.state == WorkerState::Initializing);
            if !starting && self.live_workers() < self.config.max_workers {
                self.provision(None);
            }
        }
        self.update_gauges();
    }

    /// Asks the strategy for a worker and dispatches. Returns the task when
    /// it could not be placed.
    fn try_place(&mut self, task: Task) -> Option<Task> {
        let available = available_ids(&self.workers);
        if available.is_empty() {
            return Some(task);
        }
        let choice = self.manager.select_worker(&task, &available, &self.workers);
        let strategy = self.manager.active_name().unwrap_or_default();
        self.metrics.record_selection(&strategy, choice.is_some());
        match choice {
            Some(worker_id) => self.dispatch(worker_id, task),
            None => Some(task),
        }
    }

    fn dispatch(&mut self, worker_id: WorkerId, mut task: Task) -> Option<Task> {
        let task_id = task.id.get_or_insert_with(TaskId::generate).clone();
        let now = Instant::now();

        let assigned = self
            .workers
            .get_mut(&worker_id)
            .is_some_and(|info| info.assign(task_id.clone(), now));
        if !assigned {
            warn!(worker_id = %worker_id, task_id = %task_id, "Selected worker cannot take the task");
            return Some(task);
        }

        let sent = match self.processes.get(&worker_id) {
            Some(process) => process
                .handle
                .send(CoordinatorMessage::ExecuteTask { task: task.clone() })
                .is_ok(),
            None => false,
        };
        if !sent {
            warn!(worker_id = %worker_id, task_id = %task_id, "Worker unreachable during dispatch");
            self.kill_worker(&worker_id, "unreachable");
            return Some(task);
        }

        let timeout = task.timeout().unwrap_or(self.config.task_timeout);
        let timer = schedule(
            &self.commands,
            timeout,
            Command::TaskTimeout {
                worker_id: worker_id.clone(),
                task_id: task_id.clone(),
            },
        );
        debug!(task_id = %task_id, worker_id = %worker_id, "Task dispatched");
        self.in_flight.insert(
            task_id.clone(),
            InFlight {
                task,
                worker_id: worker_id.clone(),
                started: now,
                timeout,
                timer,
            },
        );
        self.events.emit(PoolEvent::TaskStarted { task_id, worker_id });
        None
    }

    fn on_task_finished(&mut self, worker_id: WorkerId, task_id: TaskId, report: WorkerReport) {
        let owned = self
            .in_flight
            .get(&task_id)
            .is_some_and(|f| f.worker_id == worker_id);
        if !owned {
            debug!(worker_id = %worker_id, task_id = %task_id, "Ignoring stale task report");
            return;
        }
        let Some(flight) = self.in_flight.remove(&task_id) else {
            return;
        };
        flight.timer.abort();

        let outcome = match report {
            WorkerReport::Result {
                result,
                duration,
                usage,
            } => TaskOutcome::Completed {
                result,
                duration,
                usage,
            },
            WorkerReport::Error(error) => TaskOutcome::Failed {
                error,
                duration: flight.started.elapsed(),
            },
        };
        self.metrics.record_task(outcome.status(), outcome.duration());
        self.manager.on_task_completed(&worker_id, &flight.task, &outcome);

        match outcome {
            TaskOutcome::Completed {
                result, duration, ..
            } => {
                self.counters.completed += 1;
                self.counters.completed_duration += duration;
                debug!(task_id = %task_id, worker_id = %worker_id, "Task completed");
                self.events.emit(PoolEvent::TaskCompleted {
                    task_id,
                    worker_id: worker_id.clone(),
                    result,
                    duration: duration.as_millis() as u64,
                });
            }
            TaskOutcome::Failed { error, .. } => {
                self.counters.failed += 1;
                info!(task_id = %task_id, worker_id = %worker_id, error = %error, "Task failed");
                self.events.emit(PoolEvent::TaskError {
                    task_id,
                    worker_id: worker_id.clone(),
                    error,
                });
            }
            TaskOutcome::TimedOut { .. } => {}
        }

        let Some(info) = self.workers.get_mut(&worker_id) else {
            return;
        };
        info.release(Instant::now());
        let processed = info.tasks_processed;
        let recycle_after = self.config.worker_recycle_after;
        if recycle_after > 0 && processed >= recycle_after && !self.shutting_down {
            info!(worker_id = %worker_id, tasks_processed = processed, "Recycling worker");
            self.events.emit(PoolEvent::WorkerRecycling {
                worker_id: worker_id.clone(),
                tasks_processed: processed,
            });
            self.counters.workers_recycled += 1;
            if let Some(process) = self.processes.get_mut(&worker_id) {
                process.replace_on_exit = true;
            }
            self.stop_worker(&worker_id, "recycled");
        }

        self.drain_backlog();
        self.update_gauges();
    }

    fn on_task_timeout(&mut self, worker_id: WorkerId, task_id: TaskId) {
        let owned = self
            .in_flight
            .get(&task_id)
            .is_some_and(|f| f.worker_id == worker_id);
        if !owned {
            return;
        }
        let Some(flight) = self.in_flight.remove(&task_id) else {
            return;
        };

        warn!(
            task_id = %task_id,
            worker_id = %worker_id,
            timeout_ms = flight.timeout.as_millis() as u64,
            "Task timed out; restarting worker"
        );
        self.counters.timed_out += 1;
        let outcome = TaskOutcome::TimedOut {
            after: flight.timeout,
        };
        self.metrics.record_task(outcome.status(), flight.timeout);
        self.manager.on_task_completed(&worker_id, &flight.task, &outcome);
        self.events.emit(PoolEvent::TaskTimeout {
            task_id,
            worker_id: worker_id.clone(),
            timeout: flight.timeout.as_millis() as u64,
        });
        self.kill_worker(&worker_id, "task timeout");
        self.update_gauges();
    }

    /// Asks a worker to exit, forcing termination after the grace period.
    fn stop_worker(&mut self, worker_id: &WorkerId, reason: &str) {
        if let Some(info) = self.workers.get_mut(worker_id) {
            info.mark_stopping();
        }
        let Some(process) = self.processes.get_mut(worker_id) else {
            return;
        };
        process.exit_reason.get_or_insert_with(|| reason.to_string());
        if process.handle.send(CoordinatorMessage::Shutdown).is_err() {
            process.handle.kill();
            return;
        }
        if process.kill_timer.is_none() {
            process.kill_timer = Some(schedule(
                &self.commands,
                self.config.shutdown_grace,
                Command::ForceKill {
                    worker_id: worker_id.clone(),
                },
            ));
        }
    }

    /// Terminates a worker immediately.
    fn kill_worker(&mut self, worker_id: &WorkerId, reason: &str) {
        if let Some(info) = self.workers.get_mut(worker_id) {
            info.mark_stopping();
        }
        if let Some(process) = self.processes.get_mut(worker_id) {
            process.exit_reason.get_or_insert_with(|| reason.to_string());
            if let Some(timer) = process.kill_timer.take() {
                timer.abort();
            }
            process.handle.kill();
        }
    }

    fn on_exit(&mut self, worker_id: WorkerId, code: Option<i32>, signal: Option<i32>) {
        let Some(mut process) = self.processes.remove(&worker_id) else {
            return;
        };
        self.workers.remove(&worker_id);
        for timer in [process.ready_timer.take(), process.kill_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }

        let status = describe_exit(code, signal);
        let expected = process.exit_reason.is_some();
        let reason = process
            .exit_reason
            .take()
            .unwrap_or_else(|| "unexpected exit".to_string());

        if let Some(reply) = process.ready_reply.take() {
            let _ = reply.send(Err(PoolError::StartupExit {
                worker_id: worker_id.to_string(),
                reason: status.clone(),
            }));
        }

        let orphan = self
            .in_flight
            .iter()
            .find(|(_, flight)| flight.worker_id == worker_id)
            .map(|(task_id, _)| task_id.clone());
        if let Some(flight) = orphan.and_then(|task_id| self.in_flight.remove(&task_id)) {
            flight.timer.abort();
            let error = orphaned_task_error(expected, &reason, &status);
            let outcome = TaskOutcome::Failed {
                error: error.clone(),
                duration: flight.started.elapsed(),
            };
            self.counters.failed += 1;
            self.metrics.record_task(outcome.status(), outcome.duration());
            self.manager.on_task_completed(&worker_id, &flight.task, &outcome);
            if let Some(task_id) = flight.task.id.clone() {
                self.events.emit(PoolEvent::TaskError {
                    task_id,
                    worker_id: worker_id.clone(),
                    error,
                });
            }
        }

        if process.announced {
            self.manager.on_worker_removed(&worker_id);
        }
        if expected {
            info!(worker_id = %worker_id, reason = %reason, status = %status, "Worker exited");
        } else {
            warn!(worker_id = %worker_id, status = %status, "Worker exited unexpectedly");
        }
        self.metrics.record_worker_restart(&reason);
        self.events.emit(PoolEvent::WorkerExit {
            worker_id,
            code,
            signal,
            reason,
        });

        if !self.shutting_down {
            if process.replace_on_exit {
                self.provision(None);
            }
            // Workers that never became ready are replenished by the health
            // check so a failing worker binary cannot spin.
            if process.announced {
                self.replenish();
            }
        }
        self.drain_backlog();
        self.update_gauges();
    }

    /// Starts workers until `min_workers` are live.
    fn replenish(&mut self) {
        let deficit = self.config.min_workers.saturating_sub(self.live_workers());
        for _ in 0..deficit {
            self.provision(None);
        }
    }

    fn health_check(&mut self) {
        let now = Instant::now();

        let unreachable: Vec<WorkerId> = self
            .processes
            .iter()
            .filter(|(id, _)| {
                self.workers
                    .get(*id)
                    .is_some_and(|w| w.state != WorkerState::Stopping)
            })
            .filter(|(_, process)| process.handle.send(CoordinatorMessage::Ping).is_err())
            .map(|(id, _)| id.clone())
            .collect();
        for worker_id in unreachable {
            warn!(worker_id = %worker_id, "Worker unreachable");
            self.kill_worker(&worker_id, "unreachable");
        }

        let surplus = self.live_workers().saturating_sub(self.config.min_workers);
        let idle: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.is_available() && w.idle_for(now) > self.config.worker_idle_timeout)
            .map(|w| w.id.clone())
            .take(surplus)
            .collect();
        for worker_id in idle {
            info!(worker_id = %worker_id, "Stopping idle worker");
            self.stop_worker(&worker_id, "idle");
        }

        self.replenish();

        let backlog = self.backlog.len();
        let step = scale_up_step(backlog, self.config.max_workers, self.live_workers());
        if step > 0 {
            info!(backlog, added = step, "Scaling up for backlog pressure");
        }
        for _ in 0..step {
            self.provision(None);
        }

        self.drain_backlog();
        self.update_gauges();
    }

    /// Places backlog tasks in FIFO order while workers are available. An
    /// unplaceable head stays in front.
    fn drain_backlog(&mut self) {
        if self.shutting_down {
            return;
        }
        while !self.backlog.is_empty() && self.workers.values().any(|w| w.is_available()) {
            let Some(task) = self.backlog.pop_front() else {
                break;
            };
            if let Some(task) = self.try_place(task) {
                self.backlog.push_front(task);
                break;
            }
        }
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.shutdown_waiters.push(reply);
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(
            workers = self.processes.len(),
            in_flight = self.in_flight.len(),
            "Shutting down worker pool"
        );

        for flight in self.in_flight.values() {
            flight.timer.abort();
        }
        for process in self.processes.values_mut() {
            if let Some(timer) = process.ready_timer.take() {
                timer.abort();
            }
            if let Some(reply) = process.ready_reply.take() {
                let _ = reply.send(Err(PoolError::ShuttingDown));
            }
        }
        let ids: Vec<WorkerId> = self.processes.keys().cloned().collect();
        for worker_id in ids {
            self.stop_worker(&worker_id, "shutdown");
        }
        self.update_gauges();
    }

    fn finish_shutdown(&mut self) {
        if !self.backlog.is_empty() {
            warn!(dropped = self.backlog.len(), "Backlog discarded at shutdown");
            self.backlog.clear();
        }
        self.update_gauges();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("Worker pool coordinator stopped");
    }

    fn stats(&self) -> PoolStats {
        let counts = WorkerCounts::tally(self.workers.values().map(|w| &w.state));
        let average_task_duration_ms = if self.counters.completed == 0 {
            0.0
        } else {
            self.counters.completed_duration.as_secs_f64() * 1000.0 / self.counters.completed as f64
        };
        PoolStats {
            workers: counts.total(),
            initializing_workers: counts.initializing,
            available_workers: counts.available,
            busy_workers: counts.busy,
            stopping_workers: counts.stopping,
            backlog: self.backlog.len(),
            in_flight: self.in_flight.len(),
            tasks_submitted: self.counters.submitted,
            tasks_completed: self.counters.completed,
            tasks_failed: self.counters.failed,
            tasks_timed_out: self.counters.timed_out,
            workers_created: self.counters.workers_created,
            workers_recycled: self.counters.workers_recycled,
            average_task_duration_ms,
            active_strategy: self.manager.active_name(),
        }
    }

    fn update_gauges(&self) {
        self.metrics
            .set_workers(WorkerCounts::tally(self.workers.values().map(|w| &w.state)));
        self.metrics.set_backlog(self.backlog.len());
        self.metrics.set_in_flight(self.in_flight.len());
    }
}

/// Pool of worker processes with pluggable assignment strategies.
///
/// # Example
///
/// ```rust,ignore
/// use task_forge::scheduler::{PoolConfig, Task, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default().with_min_workers(2))?;
/// pool.start().await?;
/// let task_id = pool.execute_task(Task::with_payload(json!({"sleepMs": 10})))?;
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    config: PoolConfig,
    registry: StrategyRegistry,
    events: EventBus,
    commands: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    coordinator: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool with the built-in strategies.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_capacity);
        Ok(Self {
            config,
            registry: StrategyRegistry::with_builtin(),
            events,
            commands,
            receiver: Mutex::new(Some(receiver)),
            coordinator: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Replaces the strategy registry. Takes effect at `start`.
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the strategy registry.
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Returns true between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribes to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Pool events as a stream.
    pub fn event_stream(&self) -> BroadcastStream<PoolEvent> {
        self.events.stream()
    }

    /// Starts the coordinator and `min_workers` workers.
    ///
    /// Fails if the initial strategy is rejected or any initial worker does
    /// not complete its handshake; the pool is shut down in that case. A
    /// pool runs once.
    pub async fn start(&self) -> Result<(), PoolError> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }

        let command = match &self.config.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe().map_err(|e| PoolError::SpawnFailed(e.to_string()))?,
        };
        let host = self
            .config
            .capabilities
            .unwrap_or_else(HostCapabilities::detect);
        let manager_config = ManagerConfig {
            enable_dynamic_switching: self.config.strategy.enable_dynamic_switching,
            evaluation_window: self.config.strategy.evaluation_window,
            switching_threshold: self.config.strategy.switching_threshold,
            ..ManagerConfig::default()
        };
        let mut manager = StrategyManager::new(
            self.registry.clone(),
            StrategyContext::new(host),
            manager_config,
            self.events.clone(),
        );
        manager.set_strategy(
            &self.config.strategy.name,
            &self.config.strategy.options,
            &WorkerDirectory::new(),
        )?;

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(PoolError::ShuttingDown)?;

        let coordinator = Coordinator::new(
            self.config.clone(),
            command,
            self.commands.clone(),
            manager,
            self.events.clone(),
        );
        *self.coordinator.lock().await = Some(tokio::spawn(coordinator.run(receiver)));
        self.running.store(true, Ordering::SeqCst);

        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            strategy = %self.config.strategy.name,
            "Starting worker pool"
        );

        let mut pending = Vec::with_capacity(self.config.min_workers);
        for _ in 0..self.config.min_workers {
            let (reply, rx) = oneshot::channel();
            self.commands
                .send(Command::Provision { reply: Some(reply) })
                .map_err(|_| PoolError::NotRunning)?;
            pending.push(rx);
        }

        let mut failure = None;
        for result in join_all(pending).await {
            match result {
                Ok(Ok(worker_id)) => debug!(worker_id = %worker_id, "Initial worker ready"),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(PoolError::NotRunning);
                }
            }
        }

        if let Some(e) = failure {
            error!(error = %e, "Worker pool failed to start");
            self.shutdown().await?;
            return Err(e);
        }

        info!(workers = self.config.min_workers, "Worker pool started");
        Ok(())
    }

    /// Submits a task and returns its id. Completion is reported through
    /// events.
    pub fn execute_task(&self, mut task: Task) -> Result<TaskId, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let task_id = task.id.get_or_insert_with(TaskId::generate).clone();
        self.commands
            .send(Command::Execute { task })
            .map_err(|_| PoolError::NotRunning)?;
        Ok(task_id)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| PoolError::NotRunning)?;
        rx.await.map_err(|_| PoolError::NotRunning)
    }

    /// Activates a strategy, or a weighted ensemble for `composite`.
    pub async fn set_strategy(
        &self,
        name: impl Into<String>,
        options: serde_json::Value,
    ) -> Result<(), PoolError> {
        let name = name.into();
        self.request(|reply| Command::SetStrategy {
            name,
            options,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Metrics of every instantiated strategy.
    pub async fn strategy_metrics(&self) -> Result<ManagerMetrics, PoolError> {
        self.request(|reply| Command::StrategyMetrics { reply }).await
    }

    /// Current pool statistics.
    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stops all workers. Safe to call more than once; bounded even when
    /// workers do not respond.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let mut guard = self.coordinator.lock().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        let (reply, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown { reply });

        let bound = self.config.shutdown_grace * 2 + Duration::from_secs(5);
        match tokio::time::timeout(bound, rx).await {
            Ok(_) => {
                let _ = handle.await;
            }
            Err(_) => {
                warn!(timeout_ms = bound.as_millis() as u64, "Shutdown timed out; aborting coordinator");
                handle.abort();
            }
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(handle) = self.coordinator.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_rates() {
        let stats = PoolStats {
            tasks_completed: 6,
            tasks_failed: 1,
            tasks_timed_out: 1,
            ..PoolStats::default()
        };
        assert_eq!(stats.total_processed(), 8);
        assert!((stats.success_rate() - 75.0).abs() < 1e-9);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_pool_stats_serializes_camel_case() {
        let value = serde_json::to_value(PoolStats::default()).unwrap();
        assert!(value.get("tasksTimedOut").is_some());
        assert!(value.get("averageTaskDurationMs").is_some());
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(describe_exit(Some(1), None), "code 1");
        assert_eq!(describe_exit(None, Some(9)), "signal 9");
        assert_eq!(describe_exit(None, None), "unknown status");
    }

    #[test]
    fn test_scale_up_step() {
        // 2/4 is not above the pressure ratio.
        assert_eq!(scale_up_step(2, 4, 1), 0);
        assert_eq!(scale_up_step(3, 4, 1), 1);
        assert_eq!(scale_up_step(25, 10, 2), 3);
        assert_eq!(scale_up_step(25, 10, 9), 1);
        assert_eq!(scale_up_step(25, 10, 10), 0);
        assert_eq!(scale_up_step(5, 0, 0), 0);
    }

    #[test]
    fn test_orphaned_task_error_names_stop_reason() {
        assert_eq!(
            orphaned_task_error(true, "shutdown", "code 0"),
            "worker stopped (shutdown, code 0)"
        );
        assert_eq!(
            orphaned_task_error(false, "unexpected exit", "signal 9"),
            "worker exited unexpectedly (signal 9)"
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PoolConfig::default().with_min_workers(5).with_max_workers(2);
        assert!(matches!(WorkerPool::new(config), Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_operations_require_running_pool() {
        let pool = WorkerPool::new(PoolConfig::default()).unwrap();
        assert!(!pool.is_running());
        assert!(matches!(pool.execute_task(Task::new()), Err(PoolError::NotRunning)));
        assert!(matches!(pool.stats().await, Err(PoolError::NotRunning)));
        assert!(pool.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_initial_strategy_fails_start() {
        let config = PoolConfig::default()
            .with_worker_command(WorkerCommand::new("true"))
            .with_strategy("fastest", serde_json::Value::Null);
        let pool = WorkerPool::new(config).unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::Strategy(StrategyError::UnknownStrategy(_))));
        assert!(!pool.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exiting_during_startup_fails_start() {
        let config = PoolConfig::default()
            .with_min_workers(1)
            .with_worker_command(WorkerCommand::new("sh").arg("-c").arg("exit 2"));
        let pool = WorkerPool::new(config).unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::StartupExit { .. }));
        assert!(!pool.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_worker_hits_ready_timeout() {
        let config = PoolConfig::default()
            .with_min_workers(1)
            .with_ready_timeout(Duration::from_millis(200))
            .with_shutdown_grace(Duration::from_millis(200))
            .with_worker_command(WorkerCommand::new("sh").arg("-c").arg("sleep 30"));
        let pool = WorkerPool::new(config).unwrap();
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, PoolError::ReadyTimeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_worker_round_trip() {
        // Answers the first execute-task line with a fixed result.
        let script = r#"echo '{"type":"ready","workerId":"w"}'
read line
id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
echo "{\"type\":\"task-result\",\"taskId\":\"$id\",\"result\":{\"ok\":true},\"duration\":5}"
read line"#;
        let config = PoolConfig::default()
            .with_min_workers(1)
            .with_max_workers(1)
            .with_shutdown_grace(Duration::from_millis(500))
            .with_worker_command(WorkerCommand::new("sh").arg("-c").arg(script));
        let pool = WorkerPool::new(config).unwrap();
        let mut events = pool.subscribe();
        pool.start().await.unwrap();

        let task_id = pool.execute_task(Task::new().with_id("task-script")).unwrap();
        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(PoolEvent::TaskCompleted {
                        task_id, duration, ..
                    }) => return (task_id, duration),
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, (task_id, 5));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.available_workers, 1);
        assert_eq!(stats.active_strategy.as_deref(), Some("round-robin"));

        pool.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }
}
