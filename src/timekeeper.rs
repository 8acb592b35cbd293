use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use futures::future::{self, Either};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::completion::{Completion, Outcome, Timer};
use crate::error::TimerError;

/// Roughly 30 years, used when `now + duration` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Position of an entry in the pending set
///
/// Ordered by deadline, then by insertion sequence, so entries sharing a
/// deadline fire first-in-first-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TimerKey {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
}

/// State shared between a `Timekeeper`, its worker and its timers
pub(crate) struct Shared {
    /// Instance name for logging
    name: String,

    /// Pending set and stop flag
    inner: Mutex<Inner>,

    /// Wakes the worker when the earliest deadline moves closer
    notify: Notify,
}

struct Inner {
    /// Entries that have neither fired nor been cancelled
    pending: BTreeMap<TimerKey, Arc<Completion>>,

    /// Sequence number for the next entry
    next_seq: u64,

    /// Set once by the worker on its way out; nothing is inserted afterwards
    stopped: bool,
}

impl Shared {
    fn new(name: String) -> Self {
        Shared {
            name,
            inner: Mutex::new(Inner {
                pending: BTreeMap::new(),
                next_seq: 0,
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // No user code runs under this lock.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(self: &Arc<Self>, deadline: Instant) -> Timer {
        let mut inner = self.lock();
        let key = TimerKey {
            deadline,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;

        if inner.stopped {
            drop(inner);
            log::debug!(
                "Timekeeper '{}' is stopped, timer #{} resolved immediately",
                self.name,
                key.seq
            );
            return Timer::resolved(key, Outcome::Stopped);
        }

        let is_earliest = inner
            .pending
            .first_key_value()
            .map_or(true, |(first, _)| key < *first);
        let completion = Completion::new();
        inner.pending.insert(key, completion.clone());
        drop(inner);

        if is_earliest {
            self.notify.notify_one();
        }

        Timer::new(key, completion, Arc::downgrade(self))
    }

    /// Take an entry out of the pending set, if it is still there
    pub(crate) fn remove(&self, key: TimerKey) -> Option<Arc<Completion>> {
        let removed = self.lock().pending.remove(&key);
        if removed.is_some() {
            log::debug!("Timer #{} cancelled in '{}'", key.seq, self.name);
        }
        removed
    }

    /// Pop every entry due at `now`, in firing order, and report the next deadline
    fn take_due(&self, now: Instant) -> (Vec<Arc<Completion>>, Option<Instant>) {
        let mut inner = self.lock();
        let mut due = Vec::new();
        while let Some(entry) = inner.pending.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            due.push(entry.remove());
        }
        let next = inner.pending.first_key_value().map(|(key, _)| key.deadline);
        (due, next)
    }

    /// Mark the service stopped and hand back whatever was still pending
    fn stop(&self) -> Vec<Arc<Completion>> {
        let mut inner = self.lock();
        inner.stopped = true;
        mem::take(&mut inner.pending).into_values().collect()
    }
}

/// Worker loop, driven by the timekeeper's private runtime
async fn run(shared: Arc<Shared>, cancel_token: CancellationToken) {
    log::info!("Timekeeper '{}' started", shared.name);

    while !cancel_token.is_cancelled() {
        let (due, next) = shared.take_due(Instant::now());

        if !due.is_empty() {
            log::trace!("Timekeeper '{}' firing {} timer(s)", shared.name, due.len());
            // The lock is released here, continuations may schedule or cancel freely.
            for completion in due {
                completion.resolve(Outcome::Elapsed);
            }
            // Firing may have taken a while, look again before sleeping.
            continue;
        }

        let sleep = async {
            match next {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            // An earlier deadline was inserted
            _ = shared.notify.notified() => {},

            _ = sleep => {},
        }
    }

    let remaining = shared.stop();
    let count = remaining.len();
    for completion in remaining {
        completion.resolve(Outcome::Stopped);
    }

    log::info!(
        "Timekeeper '{}' stopped, {} pending timer(s) resolved as stopped",
        shared.name,
        count
    );
}

/// Deadline timer service backed by one dedicated worker thread
///
/// Timers are kept in a deadline-ordered set. The worker sleeps until the
/// earliest deadline, fires everything that is due, and goes back to sleep.
/// Scheduling and cancelling only take a short lock and never wait on the
/// worker.
///
/// Share a `Timekeeper` with `Arc`. Dropping the last owner stops the worker,
/// resolves every pending timer with [`Outcome::Stopped`] and joins the
/// thread.
pub struct Timekeeper {
    /// Pending set shared with the worker and with every `Timer`
    shared: Arc<Shared>,

    /// Cancelled on drop; also follows an external token if one was given
    cancel_token: CancellationToken,

    /// Worker thread, joined on drop
    worker: Option<thread::JoinHandle<()>>,
}

impl Timekeeper {
    /// Start a timekeeper and its worker thread
    ///
    /// `name` shows up in log lines and in the worker's thread name.
    pub fn new(name: impl Into<String>) -> Result<Self, TimerError> {
        Self::with_cancel_token(name, CancellationToken::new())
    }

    /// Start a timekeeper that also stops when `cancel_token` is cancelled
    ///
    /// Stopping through the token resolves pending timers with
    /// [`Outcome::Stopped`], exactly like dropping the timekeeper. Timers
    /// scheduled afterwards resolve with [`Outcome::Stopped`] immediately.
    pub fn with_cancel_token(
        name: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Result<Self, TimerError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(TimerError::Runtime)?;

        let shared = Arc::new(Shared::new(name.clone()));
        // A child token, so dropping this timekeeper never cancels the caller's token.
        let cancel_token = cancel_token.child_token();

        let worker = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn({
                let shared = shared.clone();
                let cancel_token = cancel_token.clone();
                move || runtime.block_on(run(shared, cancel_token))
            })
            .map_err(TimerError::Spawn)?;

        Ok(Timekeeper {
            shared,
            cancel_token,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedule a timer that fires once `duration` has passed
    ///
    /// A zero duration fires as soon as the worker gets to it. Never blocks.
    pub fn after(&self, duration: Duration) -> Timer {
        let now = Instant::now();
        let deadline = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.shared.insert(deadline)
    }

    /// Schedule a timer that fires at `deadline`
    ///
    /// A deadline in the past fires as soon as the worker gets to it.
    pub fn at(&self, deadline: Instant) -> Timer {
        self.shared.insert(deadline)
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Whether the worker has shut down
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Run `future` to completion unless `duration` passes first
    ///
    /// The guard timer is cancelled as soon as the future finishes.
    pub async fn within<F>(&self, future: F, duration: Duration) -> Result<F::Output, TimerError>
    where
        F: Future,
    {
        let timer = self.after(duration);
        let future = pin!(future);

        match future::select(future, timer).await {
            Either::Left((output, timer)) => {
                timer.cancel();
                Ok(output)
            }
            Either::Right((Outcome::Elapsed, _)) => Err(TimerError::TimedOut(duration)),
            Either::Right((Outcome::Cancelled | Outcome::Stopped, _)) => Err(TimerError::Stopped),
        }
    }
}

impl Drop for Timekeeper {
    fn drop(&mut self) {
        self.cancel_token.cancel();

        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            // Dropped from one of our own continuations; the worker exits once it returns.
            return;
        }
        if worker.join().is_err() {
            log::error!("Timekeeper '{}' worker thread panicked", self.shared.name);
        }
    }
}

impl std::fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timekeeper")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::sleep;
    use tokio_test::{assert_pending, assert_ready_eq};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn timekeeper() -> Timekeeper {
        init_logging();
        Timekeeper::new("test").unwrap()
    }

    #[tokio::test]
    async fn test_timer_elapses() {
        let tk = timekeeper();
        let start = Instant::now();

        let outcome = tk.after(Duration::from_millis(50)).await;

        assert_eq!(outcome, Outcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(tk.pending(), 0);
    }

    #[tokio::test]
    async fn test_shorter_deadline_resolves_first() {
        let tk = timekeeper();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();

        let a = tk.after(Duration::from_millis(100));
        let b = tk.after(Duration::from_millis(50));
        let tx_a = tx.clone();
        a.on_complete(move |outcome| {
            let _ = tx_a.send(("A", outcome, start.elapsed()));
        });
        b.on_complete(move |outcome| {
            let _ = tx.send(("B", outcome, start.elapsed()));
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!((first.0, first.1), ("B", Outcome::Elapsed));
        assert_eq!((second.0, second.1), ("A", Outcome::Elapsed));
        assert!(first.2 >= Duration::from_millis(50));
        assert!(second.2 >= Duration::from_millis(100));
        assert!(second.2 < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_identical_deadlines_fire_in_insertion_order() {
        let tk = timekeeper();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + Duration::from_millis(30);

        for i in 0..100 {
            let tx = tx.clone();
            tk.at(deadline).on_complete(move |_| {
                let _ = tx.send(i);
            });
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(i) = rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cancel_before_deadline() {
        let tk = timekeeper();
        let start = Instant::now();

        let timer = tk.after(Duration::from_millis(200));
        assert_eq!(tk.pending(), 1);
        timer.cancel();

        assert!(timer.is_resolved());
        assert_eq!(tk.pending(), 0);
        assert_eq!(timer.await, Outcome::Cancelled);
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_elapses() {
        let tk = timekeeper();
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = tk.after(Duration::from_millis(20));
        timer.cancel();
        let counter = fired.clone();
        timer.on_complete(move |outcome| {
            if outcome == Outcome::Elapsed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_fire_is_noop() {
        let tk = timekeeper();

        let mut timer = tk.after(Duration::ZERO);
        assert_eq!((&mut timer).await, Outcome::Elapsed);

        timer.cancel();
        timer.cancel();

        assert!(timer.is_resolved());
        assert_eq!((&mut timer).await, Outcome::Elapsed);
    }

    #[tokio::test]
    async fn test_zero_and_past_deadlines_fire_promptly() {
        let tk = timekeeper();
        // Keep a far timer around so the worker is parked on a long sleep.
        let _far = tk.after(Duration::from_secs(60));
        let start = Instant::now();

        let zero = tk.after(Duration::ZERO);
        let past_deadline = Instant::now()
            .checked_sub(Duration::from_millis(10))
            .unwrap_or_else(Instant::now);
        let past = tk.at(past_deadline);

        assert_eq!(zero.await, Outcome::Elapsed);
        assert_eq!(past.await, Outcome::Elapsed);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_drop_resolves_pending_as_stopped() {
        let tk = timekeeper();
        let timers: Vec<_> = (0..10)
            .map(|i| tk.after(Duration::from_secs(10 + i)))
            .collect();
        assert_eq!(tk.pending(), 10);

        drop(tk);

        for timer in timers {
            assert!(timer.is_resolved());
            assert_eq!(timer.await, Outcome::Stopped);
        }
    }

    #[tokio::test]
    async fn test_cancel_after_service_dropped_is_noop() {
        let tk = timekeeper();
        let timer = tk.after(Duration::from_secs(10));
        drop(tk);

        timer.cancel();
        assert_eq!(timer.await, Outcome::Stopped);
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        init_logging();
        let cancel_token = CancellationToken::new();
        let tk = Timekeeper::with_cancel_token("test", cancel_token.clone()).unwrap();

        let timer = tk.after(Duration::from_secs(10));
        cancel_token.cancel();

        assert_eq!(timer.await, Outcome::Stopped);
        assert!(tk.is_stopped());

        let late = tk.after(Duration::from_millis(10));
        assert!(late.is_resolved());
        assert_eq!(late.await, Outcome::Stopped);
    }

    #[tokio::test]
    async fn test_drop_does_not_cancel_external_token() {
        init_logging();
        let cancel_token = CancellationToken::new();
        let tk = Timekeeper::with_cancel_token("test", cancel_token.clone()).unwrap();

        drop(tk);

        assert!(!cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_panicking_continuation_does_not_stop_worker() {
        let tk = timekeeper();
        let deadline = Instant::now() + Duration::from_millis(20);

        tk.at(deadline).on_complete(|_| panic!("continuation failure"));
        let sibling = tk.at(deadline);
        let later = tk.after(Duration::from_millis(60));

        assert_eq!(sibling.await, Outcome::Elapsed);
        assert_eq!(later.await, Outcome::Elapsed);
        assert!(!tk.is_stopped());
    }

    #[tokio::test]
    async fn test_continuation_can_schedule_and_cancel() {
        init_logging();
        let tk = Arc::new(Timekeeper::new("test").unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let victim = tk.after(Duration::from_secs(10));
        let inner = tk.clone();
        tk.after(Duration::from_millis(10)).on_complete(move |_| {
            victim.cancel();
            inner.after(Duration::ZERO).on_complete(move |outcome| {
                let _ = tx.send(outcome);
            });
        });

        assert_eq!(rx.recv().await, Some(Outcome::Elapsed));
        assert_eq!(tk.pending(), 0);
    }

    #[tokio::test]
    async fn test_last_owner_dropped_on_worker_thread() {
        init_logging();
        let tk = Arc::new(Timekeeper::new("test").unwrap());

        let other = tk.after(Duration::from_secs(10));
        let first = tk.after(Duration::ZERO);
        first.on_complete(move |_| drop(tk));

        assert_eq!(other.await, Outcome::Stopped);
    }

    #[tokio::test]
    async fn test_many_timers_fire_in_deadline_order() {
        const COUNT: u32 = 1000;
        let tk = timekeeper();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let base = start + Duration::from_millis(20);
        let span = Duration::from_millis(50);

        // Insert out of order; 7919 is coprime with COUNT.
        for n in 0..COUNT {
            let i = (n * 7919) % COUNT;
            let deadline = base + span * i / COUNT;
            let tx = tx.clone();
            tk.at(deadline).on_complete(move |outcome| {
                let _ = tx.send((deadline, outcome));
            });
        }
        drop(tx);

        let mut fired = Vec::new();
        while let Some(entry) = rx.recv().await {
            fired.push(entry);
        }

        assert_eq!(fired.len(), COUNT as usize);
        assert!(fired.iter().all(|(_, outcome)| *outcome == Outcome::Elapsed));
        assert!(fired.windows(2).all(|pair| pair[0].0 <= pair[1].0));
        assert!(base.elapsed() < span + Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_earlier_timer_shortens_wait() {
        let tk = timekeeper();
        let _late = tk.after(Duration::from_secs(5));
        let start = Instant::now();

        let early = tk.after(Duration::from_millis(20));

        assert_eq!(early.await, Outcome::Elapsed);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(tk.pending(), 1);
    }

    #[tokio::test]
    async fn test_within() {
        let tk = timekeeper();

        let ok = tk.within(async { 7 }, Duration::from_secs(5)).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(tk.pending(), 0);

        let slow = tk
            .within(sleep(Duration::from_secs(5)), Duration::from_millis(20))
            .await;
        assert!(matches!(slow, Err(TimerError::TimedOut(d)) if d == Duration::from_millis(20)));
    }

    #[test]
    fn test_poll_without_runtime() {
        let tk = timekeeper();
        let mut task = tokio_test::task::spawn(tk.after(Duration::from_millis(30)));

        assert_pending!(task.poll());
        std::thread::sleep(Duration::from_millis(150));

        assert!(task.is_woken());
        assert_ready_eq!(task.poll(), Outcome::Elapsed);
    }

    #[test]
    fn test_wait_blocks_until_elapsed() {
        let tk = timekeeper();
        let start = Instant::now();

        assert_eq!(tk.after(Duration::from_millis(30)).wait(), Outcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_huge_duration_saturates() {
        let tk = timekeeper();
        let timer = tk.after(Duration::MAX);

        assert!(timer.deadline() > Instant::now());
        assert!(!timer.is_resolved());
        timer.cancel();
        assert_eq!(timer.wait(), Outcome::Cancelled);
    }

    #[test]
    fn test_concurrent_cancel_and_fire_resolve_once() {
        let tk = timekeeper();
        let elapsed = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let deadline = Instant::now() + Duration::from_millis(20);

        let timers: Vec<_> = (0..200).map(|_| tk.at(deadline)).collect();
        let (left, right) = timers.split_at(100);

        std::thread::scope(|scope| {
            for half in [left, right] {
                scope.spawn(move || {
                    while Instant::now() < deadline {
                        std::hint::spin_loop();
                    }
                    for timer in half {
                        timer.cancel();
                    }
                });
            }
        });

        for timer in timers {
            match timer.wait() {
                Outcome::Elapsed => elapsed.fetch_add(1, Ordering::SeqCst),
                Outcome::Cancelled => cancelled.fetch_add(1, Ordering::SeqCst),
                Outcome::Stopped => unreachable!(),
            };
        }

        assert_eq!(
            elapsed.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst),
            200
        );
        assert_eq!(tk.pending(), 0);
    }
}
