//! Message analysis example
//!
//! This example runs the inspector's two workloads against a fake chat:
//! - Analyze every message in batches, with progress from the event channel
//! - Download attached media concurrently, retrying flaky transfers
//! - Look up each message's author through a rate-limited cache
//!
//! Press Ctrl+C to cancel the runs early.

use inspector_engine::{Engine, EngineConfig, Event, RunSummary, TaskFailure, run_with_shutdown};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

struct Message {
    id: u64,
    author: u64,
    text: String,
    media: Option<String>,
}

fn fake_chat(count: u64) -> Vec<Message> {
    (0..count)
        .map(|id| Message {
            id,
            author: id % 12,
            text: format!("message {id} from the inspector demo"),
            media: (id % 25 == 0).then(|| format!("photo_{id}.jpg")),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing (optional)
    // Uncomment if you add tracing-subscriber to your dependencies:
    // tracing_subscriber::fmt::init();

    let config = EngineConfig::from_json(
        r#"{
            "batch_size": 100,
            "max_concurrent_tasks": 10,
            "max_concurrent_downloads": 5,
            "rate_limit_delay": 0.05,
            "retry": { "max_attempts": 3, "initial_delay": 0.1, "jitter": true }
        }"#,
    )?;
    let engine = Engine::new(config)?;

    // Cancel in-flight runs on Ctrl+C
    tokio::spawn(run_with_shutdown(engine.clone()));

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::Progress {
                    run,
                    completed,
                    total,
                } => println!("[run {run}] {completed}/{total}"),
                Event::RunFinished { run, summary } => println!(
                    "[run {run}] finished: {} ok, {} failed",
                    summary.succeeded,
                    summary.failed()
                ),
                Event::RunCancelled { run, .. } => println!("[run {run}] cancelled"),
                _ => {}
            }
        }
    });

    let messages = fake_chat(250);
    let authors = engine.throttled_cache::<String>();

    let analyzed = engine
        .run_batch(
            &messages,
            |message| {
                let authors = authors.clone();
                async move {
                    let author = authors
                        .call(format!("user:{}", message.author), || async {
                            Ok::<_, TaskFailure>(format!("user #{}", message.author))
                        })
                        .await?;
                    let words = message.text.split_whitespace().count();
                    Ok::<_, TaskFailure>((message.id, author, words))
                }
            },
            None,
        )
        .await?;
    if let Some((id, author, words)) = analyzed.first().and_then(|r| r.value()) {
        println!("message {id} by {author}: {words} words");
    }

    let media: Vec<&str> = messages.iter().filter_map(|m| m.media.as_deref()).collect();
    let flaky = AtomicU32::new(0);
    let downloads = engine
        .run_downloads(
            &media,
            |file| {
                let attempt = flaky.fetch_add(1, Ordering::SeqCst);
                let file = file.to_string();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if attempt % 4 == 1 {
                        Err(TaskFailure::transient("connection reset"))
                    } else {
                        Ok(file.len() * 1024)
                    }
                }
            },
            None,
        )
        .await?;

    let summary = RunSummary::from_results(&downloads);
    println!(
        "downloaded {}/{} files, {} authors cached",
        summary.succeeded,
        summary.total,
        authors.cache().len()
    );

    engine.shutdown().await;
    Ok(())
}
