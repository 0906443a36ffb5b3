//! Runs mutating operations one at a time, off the async runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8Path;

use crate::error::Error;
use crate::lock::PidLock;

/// Serializes mutating operations: at most one runs per process, guarded
/// by the `running` flag, and at most one per system, guarded by the PID
/// lock.
#[derive(Debug, Clone, Default)]
pub struct Worker {
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the operation ends, however it ends.
struct Running(Arc<AtomicBool>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Worker {
    /// A worker with nothing running.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an operation is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `f` on the blocking thread pool while holding the lock at
    /// `lock_path`. Fails with [`Error::AlreadyRunning`] if another
    /// operation is in progress.
    pub async fn run<T, F>(&self, lock_path: &Utf8Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning(std::process::id()).into());
        }
        let _running = Running(self.running.clone());
        let lock = PidLock::acquire(lock_path)?;
        tokio::task::spawn_blocking(move || {
            let _lock = lock;
            f()
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[tokio::test]
    async fn test_single_operation() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path: Utf8PathBuf = Utf8Path::from_path(td.path()).unwrap().join("w.pid");
        let w = Worker::new();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let h = {
            let w = w.clone();
            let path = path.clone();
            tokio::spawn(async move {
                w.run(&path, move || {
                    rx.recv()?;
                    Ok(1)
                })
                .await
            })
        };
        while !w.is_running() {
            tokio::task::yield_now().await;
        }
        let e = w.run(&path, || Ok(2)).await.unwrap_err();
        assert!(matches!(
            crate::error::classify(&e),
            Some(Error::AlreadyRunning(_))
        ));
        tx.send(())?;
        assert_eq!(h.await??, 1);
        assert!(!w.is_running());
        assert_eq!(std::fs::read_to_string(&path)?, "");

        // A failing operation releases everything too
        let r = w.run(&path, || -> Result<()> { anyhow::bail!("nope") }).await;
        assert!(r.is_err());
        assert!(!w.is_running());
        assert_eq!(w.run(&path, || Ok(3)).await?, 3);
        Ok(())
    }
}
