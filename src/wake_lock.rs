/// Something that keeps the process schedulable while a broadcast runs.
pub trait WakeLock: Send {
    fn acquire(&self) -> anyhow::Result<WakeLockGuard>;
}

/// Holds the lock until dropped.
pub struct WakeLockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeLockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// For hosts where the process is never suspended. Only logs.
pub struct LogWakeLock;

impl WakeLock for LogWakeLock {
    fn acquire(&self) -> anyhow::Result<WakeLockGuard> {
        log::debug!("Wake lock acquired");
        Ok(WakeLockGuard::new(|| log::debug!("Wake lock released")))
    }
}

#[test]
fn test_guard_releases_once_on_drop() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let guard = WakeLockGuard::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(guard);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}
