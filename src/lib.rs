//! # Timekeeper
//!
//! A portable deadline timer service: ask for "notify me after `d`" and get
//! back a handle that resolves once `d` has passed, without wiring anything
//! into an event loop or I/O reactor.
//!
//! Each [`Timekeeper`] owns one dedicated worker thread and a deadline-ordered
//! set of pending timers. The worker sleeps until the earliest deadline, fires
//! everything that is due, and goes back to sleep. It is meant as the fallback
//! engine behind timeouts when no full timer wheel is around, so precision is
//! bounded by thread wake-up latency.
//!
//! ## Features
//!
//! - **Awaitable handles**: a [`Timer`] is a plain `Future` and works on any executor
//! - **Continuations**: run a closure on the worker thread when a timer fires
//! - **Race-free cancellation**: exactly one of fire or cancel wins
//! - **Deterministic order**: equal deadlines fire in insertion order
//! - **Clean shutdown**: nothing is left unresolved when a timekeeper goes away
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use timekeeper::{Outcome, Timekeeper};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let timekeeper = Arc::new(Timekeeper::new("my_timekeeper")?);
//!
//!     // Wait for a timer
//!     let outcome = timekeeper.after(Duration::from_millis(10)).await;
//!     assert_eq!(outcome, Outcome::Elapsed);
//!
//!     // Cancel one before it fires
//!     let timer = timekeeper.after(Duration::from_secs(60));
//!     timer.cancel();
//!     assert_eq!(timer.await, Outcome::Cancelled);
//!
//!     // Guard a future with a deadline
//!     let value = timekeeper
//!         .within(async { 42 }, Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```

mod completion;
mod error;
mod timekeeper;

use std::sync::OnceLock;

pub use completion::{Outcome, Timer};
pub use error::TimerError;
pub use timekeeper::Timekeeper;

// Re-export commonly used types for convenience
pub use std::time::{Duration, Instant};
pub use tokio_util::sync::CancellationToken;

static GLOBAL: OnceLock<Timekeeper> = OnceLock::new();

/// Process-wide timekeeper, started on first use
///
/// Prefer constructing a [`Timekeeper`] and sharing it explicitly; this is a
/// convenience for code that has nothing to pass around. The instance is never
/// shut down.
///
/// Concurrent first calls may each start a candidate, but only one gets
/// installed and every caller receives that one. The others are dropped right
/// away.
pub fn global() -> Result<&'static Timekeeper, TimerError> {
    if let Some(timekeeper) = GLOBAL.get() {
        return Ok(timekeeper);
    }

    let candidate = Timekeeper::new("global")?;
    Ok(GLOBAL.get_or_init(move || candidate))
}
