use std::time::Duration;

use batch_scheduler::*;

/// Pretends to convert a file by sleeping for a moment.
struct FakeConverter;

impl TaskExecutor for FakeConverter {
    async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        println!("  converted {} -> {}", task.input_path, task.output_path);
        Ok(TaskOutcome::success().with_output_size(4096))
    }
}

#[tokio::main]
async fn main() -> Result<(), SchedulerError> {
    init_logging(&LoggingConfig::default().with_level("batch_scheduler=info")).ok();

    let config = SchedulerConfig::builder()
        .with_default_batch(BatchConfig::builder().with_max_concurrent_tasks(3).build())
        .build();
    let scheduler = BatchScheduler::new(config, FakeConverter)?;

    scheduler.on_batch_complete(|event| {
        println!(
            "Batch {} finished: {} completed, {} failed in {:.2}s",
            event.result.batch_id,
            event.result.completed_tasks,
            event.result.failed_tasks,
            event.result.duration_seconds()
        );
    });

    let tasks = build_tasks((0..8).map(|i| {
        (
            format!("audio/track-{:02}.wav", i),
            format!("converted/track-{:02}.flac", i),
        )
    }))?;
    let batch_id = scheduler.submit(tasks, None)?;
    scheduler.start(&batch_id);

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        let Some(view) = scheduler.status(&batch_id) else {
            break;
        };
        let p = &view.progress;
        println!(
            "[{}] {:>5.1}% ({}/{}), {:.1} tasks/s",
            view.status.as_str(),
            p.progress_percentage,
            p.processed_tasks(),
            p.total_tasks,
            p.throughput
        );
        if view.status.is_terminal() {
            break;
        }
    }

    if let Some(result) = scheduler.wait(&batch_id).await {
        println!("Success rate: {:.0}%", result.success_rate);
    }
    Ok(())
}
