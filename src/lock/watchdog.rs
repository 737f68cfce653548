use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::lock::ManagedLock;

enum Probe {
    Acquired,
    TimedOut,
    Shutdown,
}

/// Background liveness check for a [`ManagedLock`].
///
/// Every `probe_interval` the watchdog tries a non-blocking read. If that
/// fails, it waits up to `grace` for a read lock. If the lock is still held, it
/// logs the writer's acquisition backtrace and interrupts the writer. If the
/// writer ignores that for another `grace`, the `escalation` token is cancelled
/// so the host can restart the instance.
///
/// The logged backtrace is the stack captured when the writer acquired the
/// lock, not a live view of where the writer is now. It names the job and
/// call site that took the lock; the point where that writer is stuck may be
/// further along.
///
/// The watchdog stops when [`stop`](Watchdog::stop) is called or when the
/// `shutdown` token it was spawned with is cancelled.
pub struct Watchdog {
    shutdown: CancellationToken,
    interruptions: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn spawn<T>(
        lock: Arc<ManagedLock<T>>,
        config: WatchdogConfig,
        shutdown: &CancellationToken,
        escalation: CancellationToken,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        let shutdown = shutdown.child_token();
        let interruptions = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run(
            lock,
            config,
            shutdown.clone(),
            escalation,
            interruptions.clone(),
        ));
        Self {
            shutdown,
            interruptions,
            handle,
        }
    }

    /// How many times a writer has been interrupted so far.
    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::Relaxed)
    }

    /// Stop probing; any writer still registered is interrupted on the way out.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Watchdog task ended abnormally");
        }
    }
}

async fn run<T>(
    lock: Arc<ManagedLock<T>>,
    config: WatchdogConfig,
    shutdown: CancellationToken,
    escalation: CancellationToken,
    interruptions: Arc<AtomicU64>,
) where
    T: Send + Sync + 'static,
{
    tracing::debug!(
        lock = %lock.name(),
        probe_ms = config.probe_interval.as_millis() as u64,
        grace_ms = config.grace.as_millis() as u64,
        "Watchdog started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.probe_interval) => {}
        }

        if lock.try_read().is_some() {
            continue;
        }

        match wait_for_read(&lock, config.grace, &shutdown).await {
            Probe::Acquired => {
                tracing::debug!(lock = %lock.name(), "Read lock obtained within grace period");
                continue;
            }
            Probe::Shutdown => break,
            Probe::TimedOut => {}
        }

        let Some(owner) = lock.interrupt_owner() else {
            tracing::warn!(
                lock = %lock.name(),
                "Read lock unavailable but no writer is registered"
            );
            continue;
        };
        interruptions.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            lock = %lock.name(),
            owner = %owner.label,
            held_ms = owner.held_for.as_millis() as u64,
            backtrace = %owner.backtrace,
            "Write lock held past watchdog grace period, interrupting owner"
        );

        match wait_for_read(&lock, config.grace, &shutdown).await {
            Probe::Acquired => {
                tracing::info!(lock = %lock.name(), owner = %owner.label, "Interrupted writer released the lock");
            }
            Probe::Shutdown => break,
            Probe::TimedOut => {
                tracing::error!(
                    lock = %lock.name(),
                    owner = %owner.label,
                    "Interrupted writer did not release the lock, escalating to supervisor"
                );
                escalation.cancel();
            }
        }
    }

    if let Some(owner) = lock.interrupt_owner() {
        tracing::info!(lock = %lock.name(), owner = %owner.label, "Interrupted remaining writer on shutdown");
    }
    tracing::debug!(lock = %lock.name(), "Watchdog stopped");
}

async fn wait_for_read<T>(
    lock: &ManagedLock<T>,
    grace: Duration,
    shutdown: &CancellationToken,
) -> Probe {
    tokio::select! {
        _ = shutdown.cancelled() => Probe::Shutdown,
        acquired = tokio::time::timeout(grace, lock.read()) => match acquired {
            Ok(_guard) => Probe::Acquired,
            Err(_) => Probe::TimedOut,
        },
    }
}
