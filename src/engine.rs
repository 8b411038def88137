//! Component G: Execution Engine.
//!
//! A FIFO queue with bounded parallelism over a single configured
//! [`AgentExecutor`]. Priority and dependency fields on [`Task`] are
//! accepted but never consulted (§4.G ordering).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};
use crate::executor::AgentExecutor;
use crate::process::ProcessManager;
use crate::task::{Task, TaskResult, TaskState};

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub max_concurrent: usize,
    pub currently_running: usize,
    pub available_slots: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_duration_ms: f64,
    pub success_rate: f64,
    pub throughput: f64,
    pub total_processes_spawned: u64,
    pub active_processes: u64,
}

struct State {
    queue: VecDeque<Task>,
    tasks: HashMap<String, TaskState>,
    currently_running: usize,
    completed_tasks: u64,
    failed_tasks: u64,
    average_duration_ms: f64,
    completion_times: VecDeque<Instant>,
    waiters: HashMap<String, Vec<oneshot::Sender<TaskState>>>,
}

/// FIFO, bounded-concurrency scheduler over one agent executor.
#[derive(Clone)]
pub struct ExecutionEngine {
    executor: Arc<dyn AgentExecutor>,
    process_manager: ProcessManager,
    max_concurrent: usize,
    state: Arc<Mutex<State>>,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<dyn AgentExecutor>, process_manager: ProcessManager, config: EngineConfig) -> Self {
        Self {
            executor,
            process_manager,
            max_concurrent: config.max_concurrent,
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                tasks: HashMap::new(),
                currently_running: 0,
                completed_tasks: 0,
                failed_tasks: 0,
                average_duration_ms: 0.0,
                completion_times: VecDeque::new(),
                waiters: HashMap::new(),
            })),
        }
    }

    pub async fn submit_task(&self, task: Task) -> Result<String> {
        task.validate()?;
        let id = task.id.clone();
        {
            let mut state = self.state.lock().await;
            let position = state.queue.len();
            state.tasks.insert(id.clone(), TaskState::Queued { position });
            state.queue.push_back(task);
        }
        self.schedule();
        Ok(id)
    }

    pub async fn submit_tasks(&self, tasks: Vec<Task>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(tasks.len());
        {
            let mut state = self.state.lock().await;
            for task in tasks {
                task.validate()?;
                let id = task.id.clone();
                let position = state.queue.len();
                state.tasks.insert(id.clone(), TaskState::Queued { position });
                state.queue.push_back(task);
                ids.push(id);
            }
        }
        self.schedule();
        Ok(ids)
    }

    pub async fn get_task_status(&self, id: &str) -> Option<TaskState> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    pub async fn wait_for_task(&self, id: &str) -> Result<TaskResult> {
        let rx = {
            let mut state = self.state.lock().await;
            match state.tasks.get(id) {
                None => return Err(Error::InvalidTask(format!("unknown task id: {id}"))),
                Some(TaskState::Completed { result }) => return Ok(result.clone()),
                Some(TaskState::Failed { error }) => return Err(Error::TaskFailed(error.clone())),
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.entry(id.to_string()).or_default().push(tx);
                    rx
                }
            }
        };
        match rx.await {
            Ok(TaskState::Completed { result }) => Ok(result),
            Ok(TaskState::Failed { error }) => Err(Error::TaskFailed(error)),
            _ => Err(Error::TaskFailed("task state channel closed unexpectedly".into())),
        }
    }

    pub async fn metrics(&self) -> EngineMetrics {
        let manager_metrics = self.process_manager.metrics().await;
        let state = self.state.lock().await;
        let now = Instant::now();
        let recent = state
            .completion_times
            .iter()
            .filter(|t| now.duration_since(**t) <= THROUGHPUT_WINDOW)
            .count();
        let total = state.completed_tasks + state.failed_tasks;
        let success_rate = if total == 0 {
            1.0
        } else {
            state.completed_tasks as f64 / total as f64
        };
        EngineMetrics {
            max_concurrent: self.max_concurrent,
            currently_running: state.currently_running,
            available_slots: self.max_concurrent.saturating_sub(state.currently_running),
            queued_tasks: state.queue.len(),
            completed_tasks: state.completed_tasks,
            failed_tasks: state.failed_tasks,
            average_duration_ms: state.average_duration_ms,
            success_rate,
            throughput: recent as f64 / THROUGHPUT_WINDOW.as_secs_f64(),
            total_processes_spawned: manager_metrics.total_spawned,
            active_processes: manager_metrics.currently_active,
        }
    }

    /// Pull as many queued tasks as the concurrency budget allows and drive
    /// each to completion in its own background task.
    fn schedule(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let task = {
                    let mut state = engine.state.lock().await;
                    if state.currently_running >= engine.max_concurrent {
                        return;
                    }
                    let Some(task) = state.queue.pop_front() else {
                        return;
                    };
                    state.currently_running += 1;
                    state.tasks.insert(
                        task.id.clone(),
                        TaskState::Running {
                            managed_process_id: String::new(),
                            started_at: chrono::Utc::now(),
                        },
                    );
                    task
                };
                let engine = engine.clone();
                tokio::spawn(async move { engine.run_task(task).await });
            }
        });
    }

    async fn run_task(&self, task: Task) {
        let started = Instant::now();
        let id = task.id.clone();
        let workdir = task.working_dir.clone();

        let outcome = async {
            let handle = self.executor.execute_task(&task).await?;
            {
                let mut state = self.state.lock().await;
                state.tasks.insert(
                    id.clone(),
                    TaskState::Running {
                        managed_process_id: handle.process_id.clone(),
                        started_at: chrono::Utc::now(),
                    },
                );
            }
            let normalizer = self.executor.create_normalizer(workdir);
            let entries = handle.collect_normalized(normalizer).await;
            let session_id = entries.iter().find_map(|e| {
                e.metadata.as_ref().and_then(|m| m.session_id.clone())
            });
            Ok::<TaskResult, Error>(TaskResult { entries, session_id })
        }
        .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let final_state = match outcome {
            Ok(result) => TaskState::Completed { result },
            Err(e) => TaskState::Failed { error: e.to_string() },
        };

        let mut state = self.state.lock().await;
        state.currently_running -= 1;
        match &final_state {
            TaskState::Completed { .. } => state.completed_tasks += 1,
            TaskState::Failed { .. } => state.failed_tasks += 1,
            _ => {}
        }
        let n = state.completed_tasks + state.failed_tasks;
        state.average_duration_ms += (elapsed_ms - state.average_duration_ms) / n as f64;
        state.completion_times.push_back(Instant::now());
        while state
            .completion_times
            .front()
            .is_some_and(|t| Instant::now().duration_since(*t) > THROUGHPUT_WINDOW)
        {
            state.completion_times.pop_front();
        }
        state.tasks.insert(id.clone(), final_state.clone());
        if let Some(waiters) = state.waiters.remove(&id) {
            for tx in waiters {
                let _ = tx.send(final_state.clone());
            }
        }
        drop(state);

        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Capabilities, ExecutionHandle, WireProtocol};
    use crate::normalize::{ChunkSource, NormalizedEntry, Normalizer};
    use async_trait::async_trait;

    struct NoopNormalizer;
    impl Normalizer for NoopNormalizer {
        fn process_line(&mut self, _line: &str, _source: ChunkSource) -> Vec<NormalizedEntry> {
            Vec::new()
        }
    }

    /// An executor that sleeps for a fixed delay and then records its task
    /// id in submission... er, completion order, so tests can assert on
    /// both timing and FIFO admission.
    struct SleepExecutor {
        delay: Duration,
        completion_order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl AgentExecutor for SleepExecutor {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn execute_task(&self, task: &Task) -> Result<ExecutionHandle> {
            tokio::time::sleep(self.delay).await;
            self.completion_order.lock().await.push(task.id.clone());
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(ExecutionHandle {
                process_id: "mock-process".to_string(),
                control: None,
                output: tokio_stream::wrappers::ReceiverStream::new(rx),
            })
        }

        fn create_normalizer(&self, _workdir: std::path::PathBuf) -> Box<dyn Normalizer> {
            Box::new(NoopNormalizer)
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_session_resume: false,
                requires_setup: false,
                supports_approvals: false,
                supports_mcp: false,
                wire_protocol: WireProtocol::Jsonl,
                supports_mid_execution_messaging: false,
            }
        }

        async fn check_availability(&self) -> bool {
            true
        }
    }

    fn task_in_tmp() -> Task {
        Task::new("do something", std::env::temp_dir())
    }

    #[tokio::test]
    async fn s4_fifo_admission_with_capacity_one() {
        let completion_order = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(SleepExecutor {
            delay: Duration::from_millis(50),
            completion_order: completion_order.clone(),
        });
        let engine = ExecutionEngine::new(
            executor,
            ProcessManager::new(),
            EngineConfig { max_concurrent: 1 },
        );

        let t1 = task_in_tmp();
        let t2 = task_in_tmp();
        let t3 = task_in_tmp();
        let (id1, id2, id3) = (t1.id.clone(), t2.id.clone(), t3.id.clone());

        engine.submit_task(t1).await.unwrap();
        engine.submit_task(t2).await.unwrap();
        engine.submit_task(t3).await.unwrap();

        // Poll metrics while tasks are in flight: currently_running must
        // never exceed max_concurrent (invariant 1/2 of §8).
        for _ in 0..40 {
            let metrics = engine.metrics().await;
            assert!(metrics.currently_running <= 1);
            assert_eq!(metrics.available_slots + metrics.currently_running, 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.wait_for_task(&id3).await.unwrap();

        let order = completion_order.lock().await.clone();
        assert_eq!(order, vec![id1, id2, id3]);
    }

    #[tokio::test]
    async fn completed_task_updates_metrics() {
        let executor = Arc::new(SleepExecutor {
            delay: Duration::from_millis(5),
            completion_order: Arc::new(Mutex::new(Vec::new())),
        });
        let engine = ExecutionEngine::new(
            executor,
            ProcessManager::new(),
            EngineConfig { max_concurrent: 2 },
        );

        let task = task_in_tmp();
        let id = task.id.clone();
        engine.submit_task(task).await.unwrap();
        let result = engine.wait_for_task(&id).await.unwrap();
        assert!(result.entries.is_empty());

        let metrics = engine.metrics().await;
        assert_eq!(metrics.completed_tasks, 1);
        assert_eq!(metrics.failed_tasks, 0);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.currently_running, 0);
    }

    #[tokio::test]
    async fn unknown_task_id_status_is_none() {
        let executor = Arc::new(SleepExecutor {
            delay: Duration::from_millis(1),
            completion_order: Arc::new(Mutex::new(Vec::new())),
        });
        let engine = ExecutionEngine::new(executor, ProcessManager::new(), EngineConfig::default());
        assert!(engine.get_task_status("nope").await.is_none());
    }
}
