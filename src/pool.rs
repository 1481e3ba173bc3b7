//! Bounded worker pool for fan-out across hosts.
//!
//! A fixed set of workers drains a queue of [`Task`]s (channel capacity is
//! `workers * 4`, so submission backpressures once the backlog grows).
//! Tasks move through a monotone lifecycle: pending, running, then exactly
//! one of succeeded / failed / canceled. Every state change is saved to the
//! optional [`TaskStore`] and reported through the `on_task` hook.
//!
//! [`WorkerPool::exec_batch`] is the ad-hoc variant: run one command across
//! many hosts with at most `workers` in flight, returning per-host results
//! in completion order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::client::{ExecResult, Hooks, SshClient};
use crate::command::Command;
use crate::config;
use crate::error::EngineError;
use crate::host::HostDescriptor;
use crate::vault::SecretVault;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// One queued command against one host.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub host: HostDescriptor,
    pub command: Command,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub result: Option<ExecResult>,
    /// Retry bookkeeping. Declared for stores and callers that resubmit;
    /// the pool itself never retries.
    pub retry: u32,
    pub max_retry: u32,
}

impl Task {
    pub fn new(host: HostDescriptor, command: Command) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host,
            command,
            status: TaskStatus::Pending,
            created_at: SystemTime::now(),
            started_at: None,
            ended_at: None,
            result: None,
            retry: 0,
            max_retry: 0,
        }
    }
}

/// Retry schedule placeholder for callers that resubmit failed tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub backoff: Duration,
}

/// Task persistence contract.
///
/// Implementations must be concurrency-safe and must copy on read and
/// write; a store never hands out aliases of its internal records.
pub trait TaskStore: Send + Sync {
    fn save(&self, task: &Task);
    fn get(&self, id: &str) -> Option<Task>;
    fn list(&self) -> Vec<Task>;
}

/// In-memory task store.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, task: &Task) {
        self.tasks
            .write()
            .expect("task store poisoned")
            .insert(task.id.clone(), task.clone());
    }

    fn get(&self, id: &str) -> Option<Task> {
        self.tasks.read().expect("task store poisoned").get(id).cloned()
    }

    fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("task store poisoned")
            .values()
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }
}

/// Fixed-size pool of task workers.
pub struct WorkerPool {
    workers: usize,
    store: Option<Arc<dyn TaskStore>>,
    hooks: Hooks,
    vault: Arc<SecretVault>,
    tx: Option<mpsc::Sender<Task>>,
    rx: Option<mpsc::Receiver<Task>>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// A pool with `workers` workers (0 picks the configured default).
    pub fn new(workers: usize, vault: Arc<SecretVault>) -> Self {
        let workers = if workers == 0 {
            config::resolve_pool_workers(None)
        } else {
            workers
        };
        let (tx, rx) = mpsc::channel(workers * 4);
        Self {
            workers,
            store: None,
            hooks: Hooks::default(),
            vault,
            tx: Some(tx),
            rx: Some(rx),
            joins: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Spawn the workers. Idempotent.
    pub fn start(&mut self) {
        let Some(rx) = self.rx.take() else { return };
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..self.workers {
            let rx = rx.clone();
            let store = self.store.clone();
            let hooks = self.hooks.clone();
            let vault = self.vault.clone();
            self.joins.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => run_task(task, &store, &hooks, &vault).await,
                        None => {
                            debug!(worker, "queue closed, worker exiting");
                            return;
                        }
                    }
                }
            }));
        }
    }

    /// Persist and enqueue a task. Blocks once the queue is full.
    pub async fn submit(&self, task: Task) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            store.save(&task);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| EngineError::Config("worker pool is stopped".into()))?;
        tx.send(task)
            .await
            .map_err(|_| EngineError::Config("worker pool is stopped".into()))
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn stop(mut self) {
        self.tx.take();
        for join in self.joins.drain(..) {
            let _ = join.await;
        }
    }

    /// Run one command across many hosts, at most `workers` in flight.
    ///
    /// Hosts that observe cancellation before starting yield a canceled
    /// result with code -1; the call returns once the in-flight commands
    /// settle. Results arrive in completion order, not input order.
    pub async fn exec_batch(
        &self,
        cancel: &CancellationToken,
        hosts: Vec<HostDescriptor>,
        cmd: Command,
    ) -> Vec<ExecResult> {
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();

        for host in hosts {
            let sem = sem.clone();
            let cancel = cancel.clone();
            let cmd = cmd.clone();
            let vault = self.vault.clone();
            let hooks = self.hooks.clone();
            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return ExecResult {
                        host_id: host.id,
                        host: host.addr.clone(),
                        code: -1,
                        error: Some(EngineError::Canceled),
                        ..Default::default()
                    };
                };
                let client = SshClient::new(host, vault).with_hooks(hooks);
                client.exec(&cancel, cmd).await
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(res) = joined {
                results.push(res);
            }
        }
        results
    }
}

async fn run_task(
    mut task: Task,
    store: &Option<Arc<dyn TaskStore>>,
    hooks: &Hooks,
    vault: &Arc<SecretVault>,
) {
    task.status = TaskStatus::Running;
    task.started_at = Some(SystemTime::now());
    if let Some(store) = store {
        store.save(&task);
    }
    if let Some(hook) = &hooks.on_task {
        hook(&task);
    }

    let client = SshClient::new(task.host.clone(), vault.clone()).with_hooks(hooks.clone());
    let res = client
        .exec(&CancellationToken::new(), task.command.clone())
        .await;

    task.ended_at = Some(SystemTime::now());
    task.status = match &res.error {
        None => TaskStatus::Succeeded,
        Some(EngineError::Canceled) => TaskStatus::Canceled,
        Some(_) => TaskStatus::Failed,
    };
    task.result = Some(res);

    if let Some(store) = store {
        store.save(&task);
    }
    if let Some(hook) = &hooks.on_task {
        hook(&task);
    }
}
