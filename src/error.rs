use std::time::Duration;

/// Errors surfaced by the timer service
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// The worker's runtime could not be built
    #[error("failed to build timer runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The worker thread could not be spawned
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A guarded operation did not finish before its deadline
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The service stopped before the operation completed
    #[error("timer service stopped")]
    Stopped,
}
