//! Basic usage example for the timekeeper

use std::sync::Arc;
use timekeeper::{Duration, Outcome, Timekeeper, TimerError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let timekeeper = Arc::new(Timekeeper::new("example_timekeeper")?);

    // Set multiple timers, out of order
    let long = timekeeper.after(Duration::from_secs(3));
    let short = timekeeper.after(Duration::from_secs(1));
    let medium = timekeeper.after(Duration::from_secs(2));

    println!("Timers set! Waiting for expiration...");

    for (name, timer) in [("short", short), ("medium", medium), ("long", long)] {
        let outcome = timer.await;
        println!("Timer '{}' {}!", name, outcome);
    }

    // Continuations run on the worker thread
    let (tx, rx) = tokio::sync::oneshot::channel();
    timekeeper
        .after(Duration::from_millis(500))
        .on_complete(move |outcome| {
            println!(
                "Continuation ran on {:?} with outcome {}",
                std::thread::current().name(),
                outcome
            );
            let _ = tx.send(outcome);
        });
    rx.await?;

    // Demonstrate cancellation
    let cancelled = timekeeper.after(Duration::from_secs(10));
    println!("Set a timer that will be cancelled...");

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancelled.cancel();
    assert_eq!(cancelled.await, Outcome::Cancelled);
    println!("Timer cancelled!");

    // Guard a slow operation
    match timekeeper
        .within(
            tokio::time::sleep(Duration::from_secs(5)),
            Duration::from_millis(200),
        )
        .await
    {
        Err(TimerError::TimedOut(after)) => println!("Slow operation timed out after {:?}", after),
        other => println!("Unexpected result: {:?}", other),
    }

    // Shutdown: anything still pending resolves as stopped
    let orphan = timekeeper.after(Duration::from_secs(60));
    drop(timekeeper);
    println!("Pending timer after shutdown: {}", orphan.await);

    println!("Timekeeper shut down successfully!");
    Ok(())
}
