//! Supervised consume-loop worker.
//!
//! One [`RecoverableWorker`] per channel wraps the channel's long-running
//! consume loop: spawn, await termination, respawn unconditionally on
//! abnormal exit (error return or panic) while the channel remains open, and
//! on requested stop join with a grace period then force-cancel. The respawn
//! is internal; the channel's Open/Closed status is unaffected by it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use ticketgate_core::transport::TransportError;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

/// Errors terminating a consume-loop execution abnormally.
///
/// These never reach callers; the supervisor recovers them by respawning.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// The transport failed while subscribing or receiving.
    #[error("Transport failure in consume loop: {0}")]
    Transport(#[from] TransportError),

    /// The reply stream ended without a stop request.
    #[error("Reply stream ended unexpectedly")]
    StreamEnded,
}

/// Cooperative stop signal shared between a worker and its consume loop.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Create a signal and the sender that triggers it.
    #[must_use]
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop is requested (immediately if it already was).
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender also means shutdown.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// The consume-loop future a worker runs and re-runs.
pub type ConsumeFuture = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send>>;

/// Factory producing a fresh consume-loop execution per (re)spawn.
pub type TaskFactory = Arc<dyn Fn(StopSignal) -> ConsumeFuture + Send + Sync>;

/// Supervisor for one channel's consume loop.
///
/// At most one execution context is active at any instant. `generation`
/// counts spawns, so a superseded attempt can be told apart from the
/// current one in logs and tests.
pub struct RecoverableWorker {
    name: String,
    grace: Duration,
    running: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    forced: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stop: StopSignal,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    current_attempt: Arc<Mutex<Option<AbortHandle>>>,
}

impl RecoverableWorker {
    /// Create an idle worker. `grace` bounds how long a stop request waits
    /// for the loop to wind down before cancelling it.
    #[must_use]
    pub fn new(name: impl Into<String>, grace: Duration) -> Self {
        let (stop_tx, stop) = StopSignal::new();
        Self {
            name: name.into(),
            grace,
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            forced: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop,
            supervisor: Mutex::new(None),
            current_attempt: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the supervised consume loop. No-op (logged) when already
    /// running or already stopped.
    pub fn open(&self, factory: TaskFactory) {
        if self.stop.is_stopped() {
            tracing::warn!(worker = %self.name, "Worker already stopped; not spawning");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!(worker = %self.name, "Consume loop already running");
            return;
        }

        let name = self.name.clone();
        let grace = self.grace;
        let running = Arc::clone(&self.running);
        let generation = Arc::clone(&self.generation);
        let forced = Arc::clone(&self.forced);
        let stop = self.stop.clone();
        let current_attempt = Arc::clone(&self.current_attempt);

        let supervisor = tokio::spawn(async move {
            supervise(&name, grace, &generation, &forced, &stop, &current_attempt, factory).await;
            running.store(false, Ordering::SeqCst);
        });

        *self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(supervisor);
    }

    /// Request stop, wait up to the grace period (plus joining slack), then
    /// force-cancel whatever is left. Respawn is suppressed from the moment
    /// stop is requested. Returns `true` when the loop stopped naturally.
    pub async fn close(&self) -> bool {
        let _ = self.stop_tx.send(true);

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            // The supervisor itself bounds the loop by `grace`; the slack
            // only covers task scheduling.
            let join_budget = self.grace + Duration::from_millis(250);
            if tokio::time::timeout(join_budget, &mut handle).await.is_err() {
                tracing::warn!(worker = %self.name, "Supervisor did not stop in time, cancelling");
                handle.abort();
                let _ = handle.await;
                if let Some(attempt) = self
                    .current_attempt
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .take()
                {
                    attempt.abort();
                }
                self.forced.store(true, Ordering::SeqCst);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let forced = self.forced.load(Ordering::SeqCst);
        tracing::debug!(worker = %self.name, forced = forced, "Worker closed");
        !forced
    }

    /// Whether a consume loop is currently supervised.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of consume-loop spawns so far (respawns included).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    name: &str,
    grace: Duration,
    generation: &AtomicU64,
    forced: &AtomicBool,
    stop: &StopSignal,
    current_attempt: &Mutex<Option<AbortHandle>>,
    factory: TaskFactory,
) {
    loop {
        let attempt_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(worker = name, generation = attempt_generation, "Starting consume loop");

        let mut attempt = tokio::spawn(factory(stop.clone()));
        *current_attempt
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(attempt.abort_handle());

        tokio::select! {
            result = &mut attempt => {
                if stop.is_stopped() {
                    tracing::debug!(worker = name, "Stop requested; not respawning");
                    return;
                }
                match result {
                    Ok(Ok(())) => {
                        tracing::debug!(worker = name, generation = attempt_generation, "Consume loop ended naturally");
                        return;
                    }
                    Ok(Err(error)) => {
                        metrics::counter!("gate.worker.respawns", "worker" => name.to_string())
                            .increment(1);
                        tracing::warn!(
                            worker = name,
                            generation = attempt_generation,
                            error = %error,
                            "Consume loop failed, respawning"
                        );
                    }
                    Err(join_error) if join_error.is_panic() => {
                        metrics::counter!("gate.worker.respawns", "worker" => name.to_string())
                            .increment(1);
                        tracing::error!(
                            worker = name,
                            generation = attempt_generation,
                            "Consume loop panicked, respawning"
                        );
                    }
                    Err(_) => {
                        // Cancelled from outside; nothing to recover.
                        return;
                    }
                }
            }
            () = stop.stopped() => {
                // Give the loop its chance to observe the signal and exit.
                if tokio::time::timeout(grace, &mut attempt).await.is_err() {
                    tracing::warn!(
                        worker = name,
                        generation = attempt_generation,
                        "Consume loop ignored stop signal, cancelling"
                    );
                    attempt.abort();
                    let _ = attempt.await;
                    forced.store(true, Ordering::SeqCst);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code can use unwrap

    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn worker(grace: Duration) -> RecoverableWorker {
        RecoverableWorker::new("test-consumer", grace)
    }

    /// Factory whose first `failures` executions return an error, after
    /// which the loop idles until stopped.
    fn flaky_factory(failures: usize) -> (TaskFactory, Arc<AtomicUsize>) {
        let spawns = Arc::new(AtomicUsize::new(0));
        let spawn_counter = Arc::clone(&spawns);
        let factory: TaskFactory = Arc::new(move |stop: StopSignal| {
            let attempt = spawn_counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt < failures {
                    return Err(WorkerError::StreamEnded);
                }
                stop.stopped().await;
                Ok(())
            })
        });
        (factory, spawns)
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failure_respawns_with_one_generation_step() {
        let worker = worker(Duration::from_millis(200));
        let (factory, spawns) = flaky_factory(1);

        worker.open(factory);
        wait_until(|| spawns.load(Ordering::SeqCst) == 2).await;

        assert!(worker.is_running());
        assert_eq!(worker.generation(), 2);
        assert!(worker.close().await);
    }

    #[tokio::test]
    async fn panic_also_respawns() {
        let worker = worker(Duration::from_millis(200));
        let spawns = Arc::new(AtomicUsize::new(0));
        let spawn_counter = Arc::clone(&spawns);
        let factory: TaskFactory = Arc::new(move |stop: StopSignal| {
            let attempt = spawn_counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                #[allow(clippy::panic)]
                if attempt == 0 {
                    panic!("boom");
                }
                stop.stopped().await;
                Ok(())
            })
        });

        worker.open(factory);
        wait_until(|| spawns.load(Ordering::SeqCst) == 2).await;
        assert!(worker.is_running());
        assert!(worker.close().await);
    }

    #[tokio::test]
    async fn open_twice_spawns_once() {
        let worker = worker(Duration::from_millis(200));
        let (factory, spawns) = flaky_factory(0);

        worker.open(Arc::clone(&factory));
        worker.open(factory);
        wait_until(|| spawns.load(Ordering::SeqCst) >= 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert!(worker.close().await);
    }

    #[tokio::test]
    async fn close_suppresses_respawn() {
        let worker = worker(Duration::from_millis(200));
        let (factory, spawns) = flaky_factory(0);

        worker.open(factory);
        wait_until(|| spawns.load(Ordering::SeqCst) == 1).await;
        assert!(worker.close().await);
        assert!(!worker.is_running());
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stubborn_loop_is_force_cancelled() {
        let worker = worker(Duration::from_millis(50));
        let factory: TaskFactory = Arc::new(|_stop: StopSignal| {
            Box::pin(async move {
                // Ignores the stop signal entirely.
                Notify::new().notified().await;
                Ok(())
            })
        });

        worker.open(factory);
        wait_until(|| worker.generation() == 1).await;

        // The loop never observes the signal, so close reports a forced stop.
        assert!(!worker.close().await);
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn open_after_close_is_suppressed() {
        let worker = worker(Duration::from_millis(50));
        let (factory, spawns) = flaky_factory(0);

        worker.open(Arc::clone(&factory));
        wait_until(|| spawns.load(Ordering::SeqCst) == 1).await;
        worker.close().await;

        worker.open(factory);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }
}
