use std::sync::Arc;
use std::time::Duration;

use reco_lite::config::WatchdogConfig;
use reco_lite::lock::{ManagedLock, Watchdog};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        enabled: true,
        probe_interval: Duration::from_millis(20),
        grace: Duration::from_millis(50),
    }
}

/// Spawn a writer that holds the lock until it is interrupted, then releases.
fn cooperative_writer(lock: Arc<ManagedLock<u32>>) -> (oneshot::Receiver<()>, tokio::task::JoinHandle<bool>) {
    let (acquired_tx, acquired_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let token = CancellationToken::new();
        let mut guard = lock.write("stuck-writer", &token).await.unwrap();
        *guard += 1;
        let _ = acquired_tx.send(());
        guard.interrupted().await;
        guard.is_interrupted()
    });
    (acquired_rx, handle)
}

#[tokio::test]
async fn test_watchdog_interrupts_stuck_writer() {
    let lock = Arc::new(ManagedLock::new("test", 0u32));
    let shutdown = CancellationToken::new();
    let escalation = CancellationToken::new();
    let watchdog = Watchdog::spawn(lock.clone(), fast_watchdog(), &shutdown, escalation.clone());

    let (acquired, writer) = cooperative_writer(lock.clone());
    acquired.await.unwrap();
    assert_eq!(lock.owner().unwrap().label, "stuck-writer");

    let value = tokio::time::timeout(Duration::from_secs(5), lock.read())
        .await
        .expect("reader should get the lock once the writer is interrupted");
    assert_eq!(*value, 1);
    drop(value);

    assert!(writer.await.unwrap());
    assert!(watchdog.interruptions() >= 1);
    assert!(!escalation.is_cancelled());
    assert!(!lock.is_write_locked());
    watchdog.stop().await;
}

#[tokio::test]
async fn test_watchdog_escalates_when_writer_ignores_interrupt() {
    let lock = Arc::new(ManagedLock::new("test", 0u32));
    let shutdown = CancellationToken::new();
    let escalation = CancellationToken::new();
    let watchdog = Watchdog::spawn(lock.clone(), fast_watchdog(), &shutdown, escalation.clone());

    let (acquired_tx, acquired_rx) = oneshot::channel();
    let holder = lock.clone();
    let writer = tokio::spawn(async move {
        let token = CancellationToken::new();
        let _guard = holder.write("deaf-writer", &token).await.unwrap();
        let _ = acquired_tx.send(());
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    acquired_rx.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), escalation.cancelled())
        .await
        .expect("watchdog should escalate");
    assert!(watchdog.interruptions() >= 1);

    writer.abort();
    let _ = writer.await;
    assert!(!lock.is_write_locked());
    watchdog.stop().await;
}

#[tokio::test]
async fn test_watchdog_leaves_short_writers_alone() {
    let lock = Arc::new(ManagedLock::new("test", 0u32));
    let shutdown = CancellationToken::new();
    let escalation = CancellationToken::new();
    let watchdog = Watchdog::spawn(lock.clone(), fast_watchdog(), &shutdown, escalation.clone());

    let token = CancellationToken::new();
    for _ in 0..10 {
        let mut guard = lock.write("quick-writer", &token).await.unwrap();
        *guard += 1;
        drop(guard);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(watchdog.interruptions(), 0);
    assert!(!token.is_cancelled());
    assert_eq!(*lock.read().await, 10);
    watchdog.stop().await;
}

#[tokio::test]
async fn test_watchdog_stop_interrupts_remaining_owner() {
    let lock = Arc::new(ManagedLock::new("test", 0u32));
    let shutdown = CancellationToken::new();
    let config = WatchdogConfig {
        enabled: true,
        probe_interval: Duration::from_secs(60),
        grace: Duration::from_secs(60),
    };
    let watchdog = Watchdog::spawn(lock.clone(), config, &shutdown, CancellationToken::new());

    let (acquired, writer) = cooperative_writer(lock.clone());
    acquired.await.unwrap();
    watchdog.stop().await;

    let interrupted = tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("writer should be released on watchdog stop")
        .unwrap();
    assert!(interrupted);
}

#[tokio::test]
async fn test_parent_shutdown_stops_watchdog() {
    let lock = Arc::new(ManagedLock::new("test", 0u32));
    let shutdown = CancellationToken::new();
    let config = WatchdogConfig {
        enabled: true,
        probe_interval: Duration::from_secs(60),
        grace: Duration::from_secs(60),
    };
    let watchdog = Watchdog::spawn(lock.clone(), config, &shutdown, CancellationToken::new());

    let (acquired, writer) = cooperative_writer(lock.clone());
    acquired.await.unwrap();
    shutdown.cancel();

    assert!(tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("parent shutdown should release the writer")
        .unwrap());
    watchdog.stop().await;
}
