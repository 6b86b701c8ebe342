//! Integration tests for the worker pool.
//!
//! These tests start real worker processes using the `task-forge worker`
//! subcommand of the binary under test.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde_json::json;
use task_forge::error::{PoolError, StrategyError};
use task_forge::events::PoolEvent;
use task_forge::scheduler::{
    PoolConfig, ResourceRequirements, Task, TaskId, WorkerCommand, WorkerId, WorkerPool,
};
use tokio::sync::broadcast;

const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_task-forge")).arg("worker")
}

fn base_config() -> PoolConfig {
    PoolConfig::default()
        .with_worker_command(worker_command())
        .with_ready_timeout(Duration::from_secs(15))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// Waits for the first event matching `predicate`.
async fn wait_for<F>(events: &mut broadcast::Receiver<PoolEvent>, mut predicate: F) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for pool event")
}

/// Waits for the terminal event of `task_id`.
async fn wait_for_task(events: &mut broadcast::Receiver<PoolEvent>, task_id: &TaskId) -> PoolEvent {
    wait_for(events, |event| {
        event.is_terminal() && event.task_id() == Some(task_id)
    })
    .await
}

/// Collects the terminal events of every task in `task_ids`, in any order.
async fn wait_for_all(
    events: &mut broadcast::Receiver<PoolEvent>,
    task_ids: &[TaskId],
) -> Vec<PoolEvent> {
    let mut pending: HashSet<&TaskId> = task_ids.iter().collect();
    let mut finished = Vec::with_capacity(task_ids.len());
    while !pending.is_empty() {
        let event = wait_for(events, |event| {
            event.is_terminal() && event.task_id().is_some_and(|id| pending.contains(id))
        })
        .await;
        if let Some(task_id) = event.task_id() {
            pending.remove(task_id);
        }
        finished.push(event);
    }
    finished
}

#[tokio::test]
async fn test_round_robin_spreads_six_tasks_over_two_workers() {
    let config = base_config().with_min_workers(2).with_max_workers(4);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let mut per_worker: BTreeMap<WorkerId, usize> = BTreeMap::new();
    let mut completed = HashSet::new();
    for i in 0..6 {
        let task_id = pool
            .execute_task(Task::with_payload(json!({ "index": i })))
            .unwrap();
        match wait_for_task(&mut events, &task_id).await {
            PoolEvent::TaskCompleted {
                task_id: done,
                worker_id,
                result,
                ..
            } => {
                assert_eq!(done, task_id);
                assert_eq!(result, json!({ "index": i }));
                *per_worker.entry(worker_id).or_insert(0) += 1;
                completed.insert(done);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
    }

    assert_eq!(completed.len(), 6);
    assert_eq!(per_worker.len(), 2);
    assert!(per_worker.values().all(|count| *count == 3));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.tasks_completed, 6);
    assert_eq!(stats.workers_created, 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_task_timeout_replaces_worker() {
    let config = base_config().with_min_workers(1).with_max_workers(1);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let stuck = Task::with_payload(json!({ "sleepMs": 30_000 }))
        .with_timeout(Duration::from_millis(300));
    let stuck_id = pool.execute_task(stuck).unwrap();

    let mut timeouts = 0;
    let mut old_worker = None;
    let mut exit_reason = None;
    let mut replacement = None;
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while replacement.is_none() {
            match events.recv().await {
                Ok(PoolEvent::TaskTimeout {
                    task_id, worker_id, ..
                }) => {
                    assert_eq!(task_id, stuck_id);
                    timeouts += 1;
                    old_worker = Some(worker_id);
                }
                Ok(PoolEvent::WorkerExit { worker_id, reason, .. }) => {
                    assert_eq!(Some(&worker_id), old_worker.as_ref());
                    exit_reason = Some(reason);
                }
                Ok(PoolEvent::WorkerCreated { worker_id }) if exit_reason.is_some() => {
                    replacement = Some(worker_id);
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("worker was not replaced");

    assert_eq!(exit_reason.as_deref(), Some("task timeout"));
    assert_ne!(replacement, old_worker);

    let next_id = pool
        .execute_task(Task::with_payload(json!({ "after": "timeout" })))
        .unwrap();
    match wait_for_task(&mut events, &next_id).await {
        PoolEvent::TaskCompleted { worker_id, .. } => assert_eq!(Some(worker_id), replacement),
        other => panic!("unexpected terminal event {:?}", other),
    }
    assert_eq!(timeouts, 1);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.tasks_timed_out, 1);
    assert_eq!(stats.tasks_completed, 1);
    assert_eq!(stats.workers_created, 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_task_error_is_reported_and_worker_kept() {
    let config = base_config().with_min_workers(1).with_max_workers(1);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let failing = pool
        .execute_task(Task::with_payload(json!({ "fail": "boom" })))
        .unwrap();
    let failed_on = match wait_for_task(&mut events, &failing).await {
        PoolEvent::TaskError {
            worker_id, error, ..
        } => {
            assert_eq!(error, "boom");
            worker_id
        }
        other => panic!("unexpected terminal event {:?}", other),
    };

    let next = pool.execute_task(Task::new()).unwrap();
    match wait_for_task(&mut events, &next).await {
        PoolEvent::TaskCompleted { worker_id, .. } => assert_eq!(worker_id, failed_on),
        other => panic!("unexpected terminal event {:?}", other),
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.workers_created, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsatisfiable_requirements_stay_queued() {
    let config = base_config()
        .with_min_workers(1)
        .with_max_workers(1)
        .with_strategy("resource-aware", json!({ "allowOvercommit": false }));
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let heavy = Task::new().with_requirements(ResourceRequirements {
        cpu: Some(500.0),
        memory: Some(64.0),
        timeout: None,
    });
    let heavy_id = pool.execute_task(heavy).unwrap();
    match wait_for(&mut events, |e| e.task_id() == Some(&heavy_id)).await {
        PoolEvent::TaskQueued { backlog, .. } => assert_eq!(backlog, 1),
        other => panic!("unexpected event {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.backlog, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.available_workers, 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_recycled_after_task_limit() {
    let config = base_config()
        .with_min_workers(1)
        .with_max_workers(1)
        .with_worker_recycle_after(2);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let mut first_worker = None;
    for _ in 0..2 {
        let task_id = pool.execute_task(Task::new()).unwrap();
        if let PoolEvent::TaskCompleted { worker_id, .. } = wait_for_task(&mut events, &task_id).await
        {
            first_worker = Some(worker_id);
        }
    }

    match wait_for(&mut events, |e| matches!(e, PoolEvent::WorkerRecycling { .. })).await {
        PoolEvent::WorkerRecycling {
            worker_id,
            tasks_processed,
        } => {
            assert_eq!(Some(worker_id), first_worker);
            assert_eq!(tasks_processed, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let replacement = match wait_for(&mut events, |e| matches!(e, PoolEvent::WorkerCreated { .. })).await {
        PoolEvent::WorkerCreated { worker_id } => worker_id,
        other => panic!("unexpected event {:?}", other),
    };
    assert_ne!(Some(&replacement), first_worker.as_ref());

    let task_id = pool.execute_task(Task::new()).unwrap();
    match wait_for_task(&mut events, &task_id).await {
        PoolEvent::TaskCompleted { worker_id, .. } => assert_eq!(worker_id, replacement),
        other => panic!("unexpected terminal event {:?}", other),
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers_recycled, 1);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_strategy_switch() {
    let pool = WorkerPool::new(base_config().with_min_workers(1)).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let err = pool
        .set_strategy("fastest", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Strategy(StrategyError::UnknownStrategy(_))
    ));

    pool.set_strategy("load-balancing", serde_json::Value::Null)
        .await
        .unwrap();
    match wait_for(&mut events, |e| matches!(e, PoolEvent::StrategyChanged { .. })).await {
        PoolEvent::StrategyChanged { from, to } => {
            assert_eq!(from.as_deref(), Some("round-robin"));
            assert_eq!(to, "load-balancing");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let task_id = pool.execute_task(Task::new().with_type("build")).unwrap();
    assert!(matches!(
        wait_for_task(&mut events, &task_id).await,
        PoolEvent::TaskCompleted { .. }
    ));

    let metrics = pool.strategy_metrics().await.unwrap();
    assert_eq!(metrics.active.as_deref(), Some("load-balancing"));
    assert!(metrics
        .strategies
        .iter()
        .any(|s| s.name == "round-robin"));
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.yaml");
    let yaml = format!(
        "minWorkers: 1\nmaxWorkers: 2\nshutdownGrace: 2000\nworkerCommand:\n  program: {}\n  args: [worker]\nstrategy:\n  name: affinity\n  options:\n    maxWorkersPerGroup: 1\n",
        env!("CARGO_BIN_EXE_task-forge")
    );
    std::fs::write(&path, yaml).unwrap();

    let config = PoolConfig::from_yaml_file(&path).unwrap();
    assert_eq!(config.strategy.name, "affinity");
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let task_id = pool
        .execute_task(Task::new().with_project("forge"))
        .unwrap();
    assert!(matches!(
        wait_for_task(&mut events, &task_id).await,
        PoolEvent::TaskCompleted { .. }
    ));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.active_strategy.as_deref(), Some("affinity"));
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_rejects_new_tasks() {
    let pool = WorkerPool::new(base_config().with_min_workers(2)).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();
    assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

    pool.shutdown().await.unwrap();
    pool.shutdown().await.unwrap();
    assert!(matches!(
        pool.execute_task(Task::new()),
        Err(PoolError::NotRunning)
    ));

    let mut exits = 0;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::WorkerExit { reason, .. } = event {
            assert_eq!(reason, "shutdown");
            exits += 1;
        }
    }
    assert_eq!(exits, 2);
}

#[tokio::test]
async fn test_burst_of_six_tasks_never_double_books_a_worker() {
    let config = base_config().with_min_workers(2).with_max_workers(2);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let submitted: HashSet<TaskId> = (0..6)
        .map(|i| {
            pool.execute_task(Task::with_payload(json!({ "index": i, "sleepMs": 200 })))
                .unwrap()
        })
        .collect();

    let mut busy: HashSet<WorkerId> = HashSet::new();
    let mut per_worker: BTreeMap<WorkerId, usize> = BTreeMap::new();
    let mut completed = HashSet::new();
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while completed.len() < submitted.len() {
            match events.recv().await {
                Ok(PoolEvent::TaskStarted { task_id, worker_id }) => {
                    assert!(submitted.contains(&task_id));
                    assert!(
                        busy.insert(worker_id.clone()),
                        "{} started a task while busy",
                        worker_id
                    );
                }
                Ok(PoolEvent::TaskCompleted {
                    task_id, worker_id, ..
                }) => {
                    assert!(busy.remove(&worker_id));
                    *per_worker.entry(worker_id).or_insert(0) += 1;
                    completed.insert(task_id);
                }
                Ok(event @ (PoolEvent::TaskError { .. } | PoolEvent::TaskTimeout { .. })) => {
                    panic!("unexpected terminal event {:?}", event)
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("not all tasks completed");

    assert_eq!(completed, submitted);
    assert_eq!(per_worker.len(), 2);
    // Round robin keeps every worker within one task of the even share.
    assert!(per_worker.values().all(|count| (2..=4).contains(count)));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.tasks_completed, 6);
    assert_eq!(stats.backlog, 0);
    assert_eq!(stats.workers_created, 2);
    pool.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_queued_task_placed_once_worker_load_drops() {
    // Reports a hot cpu, then a cool one a second later, and answers tasks.
    let script = r#"echo '{"type":"ready","workerId":"w"}'
echo '{"type":"metrics","cpu":95,"memory":{"usedMb":10,"limitMb":1000}}'
sleep 1
echo '{"type":"metrics","cpu":5,"memory":{"usedMb":10,"limitMb":1000}}'
while read line; do
  case "$line" in
    *execute-task*)
      id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
      echo "{\"type\":\"task-result\",\"taskId\":\"$id\",\"result\":{\"ok\":true},\"duration\":1}" ;;
    *shutdown*) exit 0 ;;
  esac
done"#;
    let config = PoolConfig::default()
        .with_min_workers(1)
        .with_max_workers(1)
        .with_health_check_interval(Duration::from_millis(200))
        .with_shutdown_grace(Duration::from_millis(500))
        .with_strategy("load-balancing", serde_json::Value::Null)
        .with_worker_command(WorkerCommand::new("sh").arg("-c").arg(script));
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let task_id = pool.execute_task(Task::new().with_id("task-hot")).unwrap();
    match wait_for(&mut events, |e| e.task_id() == Some(&task_id)).await {
        PoolEvent::TaskQueued { backlog, .. } => assert_eq!(backlog, 1),
        other => panic!("unexpected event {:?}", other),
    }

    match wait_for_task(&mut events, &task_id).await {
        PoolEvent::TaskCompleted { result, .. } => assert_eq!(result, json!({ "ok": true })),
        other => panic!("unexpected terminal event {:?}", other),
    }
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.backlog, 0);
    assert_eq!(stats.tasks_completed, 1);
    pool.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_crashed_worker_fails_task_and_is_replaced() {
    let config = base_config().with_min_workers(1).with_max_workers(1);
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    // The shell's parent is the worker process.
    let crash_id = pool
        .execute_task(Task::with_payload(json!({ "command": "kill -9 $PPID" })))
        .unwrap();
    let crashed = match wait_for_task(&mut events, &crash_id).await {
        PoolEvent::TaskError {
            worker_id, error, ..
        } => {
            assert_eq!(error, "worker exited unexpectedly (signal 9)");
            worker_id
        }
        other => panic!("unexpected terminal event {:?}", other),
    };
    match wait_for(&mut events, |e| matches!(e, PoolEvent::WorkerExit { .. })).await {
        PoolEvent::WorkerExit {
            worker_id,
            signal,
            reason,
            ..
        } => {
            assert_eq!(worker_id, crashed);
            assert_eq!(signal, Some(9));
            assert_eq!(reason, "unexpected exit");
        }
        other => panic!("unexpected event {:?}", other),
    }
    let replacement = match wait_for(&mut events, |e| matches!(e, PoolEvent::WorkerCreated { .. })).await {
        PoolEvent::WorkerCreated { worker_id } => worker_id,
        other => panic!("unexpected event {:?}", other),
    };
    assert_ne!(replacement, crashed);

    let next_id = pool.execute_task(Task::new()).unwrap();
    match wait_for_task(&mut events, &next_id).await {
        PoolEvent::TaskCompleted { worker_id, .. } => assert_eq!(worker_id, replacement),
        other => panic!("unexpected terminal event {:?}", other),
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.workers_created, 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_worker_above_minimum_is_stopped() {
    let config = base_config()
        .with_min_workers(1)
        .with_max_workers(2)
        .with_health_check_interval(Duration::from_millis(200))
        .with_worker_idle_timeout(Duration::from_millis(500));
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    let mut exits = pool.subscribe();
    pool.start().await.unwrap();

    // The second task queues behind the first and brings up a second worker.
    let first = pool
        .execute_task(Task::with_payload(json!({ "sleepMs": 300 })))
        .unwrap();
    let second = pool
        .execute_task(Task::with_payload(json!({ "sleepMs": 300 })))
        .unwrap();
    for event in wait_for_all(&mut events, &[first, second]).await {
        assert!(matches!(event, PoolEvent::TaskCompleted { .. }), "{:?}", event);
    }

    match wait_for(&mut exits, |e| matches!(e, PoolEvent::WorkerExit { .. })).await {
        PoolEvent::WorkerExit { reason, .. } => assert_eq!(reason, "idle"),
        other => panic!("unexpected event {:?}", other),
    }

    // Further health checks keep the pool at its minimum.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.workers_created, 2);
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backlog_pressure_scales_up_to_max() {
    let config = base_config()
        .with_min_workers(1)
        .with_max_workers(4)
        .with_health_check_interval(Duration::from_millis(200));
    let pool = WorkerPool::new(config).unwrap();
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let submitted: Vec<TaskId> = (0..8)
        .map(|_| {
            pool.execute_task(Task::with_payload(json!({ "sleepMs": 1500 })))
                .unwrap()
        })
        .collect();

    let mut runners = HashSet::new();
    for event in wait_for_all(&mut events, &submitted).await {
        match event {
            PoolEvent::TaskCompleted { worker_id, .. } => {
                runners.insert(worker_id);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.workers_created, 4);
    assert_eq!(stats.workers, 4);
    assert_eq!(runners.len(), 4);
    assert_eq!(stats.tasks_completed, 8);
    pool.shutdown().await.unwrap();
}
