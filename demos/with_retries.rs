use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use batch_scheduler::*;

/// Fails every task's first attempt, and always fails inputs marked corrupt.
#[derive(Default)]
struct FlakyConverter {
    attempts: Mutex<HashMap<String, u32>>,
}

impl TaskExecutor for FlakyConverter {
    async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        let attempt = {
            let mut attempts = self
                .attempts
                .lock()
                .map_err(|e| TaskError::new(e.to_string()))?;
            let n = attempts.entry(task.id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        tokio::time::sleep(Duration::from_millis(50)).await;

        if task.input_path.contains("corrupt") {
            return Err(TaskError::new("corrupt header")
                .with_details(serde_json::json!({ "offset": 44 })));
        }
        if attempt == 1 {
            return Err(TaskError::new("device busy"));
        }
        Ok(TaskOutcome::success())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(&LoggingConfig::default().with_level("batch_scheduler=debug")).ok();

    let dir = std::env::temp_dir().join("batch-scheduler-demo");
    std::fs::create_dir_all(&dir)?;
    let config = SchedulerConfig::builder()
        .with_db_path(dir.join("batches.db"))
        .build();
    let scheduler = BatchScheduler::new(config, FlakyConverter::default())?;

    scheduler.on_task_failed(|event| {
        println!(
            "  {} failed ({}), retry: {}",
            event.task.input_path, event.error, event.will_retry
        );
    });

    let batch = BatchConfig::builder()
        .with_max_concurrent_tasks(2)
        .with_max_retries(2)
        .with_retry_delay(Duration::from_millis(250))
        .with_timeout_per_task(Duration::from_secs(5))
        .build();
    let tasks = build_tasks(vec![
        ("scans/page-1.tiff", "ocr/page-1.txt"),
        ("scans/page-2.tiff", "ocr/page-2.txt"),
        ("scans/corrupt-3.tiff", "ocr/page-3.txt"),
    ])?;
    let batch_id = scheduler.submit_with_config(tasks, None, batch)?;
    scheduler.start(&batch_id);

    let Some(result) = scheduler.wait(&batch_id).await else {
        anyhow::bail!("batch {} disappeared", batch_id);
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some(tracker) = scheduler.tracker(&batch_id) {
        for entry in tracker.recent_history(20) {
            println!(
                "  {} {} -> {}",
                &entry.task_id[..8],
                entry.old_status.as_str(),
                entry.new_status.as_str()
            );
        }
    }
    Ok(())
}
