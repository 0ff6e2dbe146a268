#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batch_scheduler::*;

/// Shared counters an executor updates while it runs.
#[derive(Default)]
pub struct Probe {
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Probe {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// How many times `execute` ran for one task.
    pub fn attempts_for(&self, task_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, task_id: &str) -> u32 {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let mut attempts = self.attempts.lock().unwrap();
        let n = attempts.entry(task_id.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
pub enum Mode {
    Succeed,
    Fail,
    /// Fail the first N attempts of every task, then succeed.
    FailTimes(u32),
    /// Fail tasks whose input path contains the marker, succeed otherwise.
    FailInputsContaining(&'static str),
    Panic,
}

/// Instrumented executor used across the integration tests.
pub struct TestExecutor {
    pub mode: Mode,
    pub delay: Duration,
    pub probe: Arc<Probe>,
}

impl TestExecutor {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }
}

// Decrements `running` even when the attempt future is dropped on timeout.
struct RunningGuard<'a>(&'a Probe);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

impl TaskExecutor for TestExecutor {
    async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        let attempt = self.probe.enter(&task.id);
        let _guard = RunningGuard(&self.probe);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.mode {
            Mode::Succeed => Ok(TaskOutcome::success().with_output_size(128)),
            Mode::Fail => Err(TaskError::new("simulated failure")
                .with_details(serde_json::json!({ "attempt": attempt }))),
            Mode::FailTimes(n) if attempt <= n => Err(TaskError::new("transient failure")),
            Mode::FailTimes(_) => Ok(TaskOutcome::success()),
            Mode::FailInputsContaining(marker) if task.input_path.contains(marker) => {
                Err(TaskError::new("unsupported input"))
            }
            Mode::FailInputsContaining(_) => Ok(TaskOutcome::success().with_output_size(64)),
            Mode::Panic => panic!("executor bug"),
        }
    }
}

pub fn make_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(format!("input/{}.wav", i), format!("output/{}.flac", i)).unwrap())
        .collect()
}

pub fn batch_config(max_concurrent: usize, max_retries: u32) -> BatchConfig {
    BatchConfig::builder()
        .with_max_concurrent_tasks(max_concurrent)
        .with_max_retries(max_retries)
        .with_retry_delay(Duration::from_millis(5))
        .build()
}

pub fn scheduler(executor: TestExecutor, batch: BatchConfig) -> BatchScheduler<TestExecutor> {
    let config = SchedulerConfig::builder().with_default_batch(batch).build();
    BatchScheduler::new(config, executor).unwrap()
}
