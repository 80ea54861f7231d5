//! The runner: sole holder of cluster access, serialised per deployment target.
//!
//! Cluster-affecting stages never see the control plane directly. They get a
//! [`RunnerLease`] from [`Runner::acquire`], which holds the target's mutation
//! lock until it is dropped. A second run asking for the same target queues
//! behind the first; runs against other targets proceed independently.
//!
//! With a lock directory configured the lease also holds an advisory file
//! lock per target, so separate `drydock` processes sharing a state
//! directory serialise the same way.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drydock_core::obs::{emit_lock_acquired, emit_lock_queued, emit_lock_released};
use drydock_core::{ClusterControlPlane, DrydockError, Result, TargetKey};
use fs2::FileExt;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

const FILE_LOCK_POLL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

/// Operator-side switch that aborts a run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Run-side view of an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run is aborted. Pending forever if the handle is
    /// dropped without aborting.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|aborted| *aborted).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Execution agent for one cluster endpoint.
pub struct Runner {
    cluster: Arc<dyn ClusterControlPlane>,
    locks: Mutex<HashMap<TargetKey, Arc<Mutex<()>>>>,
    lock_dir: Option<PathBuf>,
}

impl Runner {
    pub fn new(cluster: Arc<dyn ClusterControlPlane>) -> Self {
        Self {
            cluster,
            locks: Mutex::new(HashMap::new()),
            lock_dir: None,
        }
    }

    /// Also take a per-target file lock under `dir` for every lease.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    async fn target_lock(&self, target: &TargetKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(target.clone()).or_default())
    }

    /// Take the mutation lock for `target`, waiting behind any current holder.
    ///
    /// Returns `DrydockError::Aborted` if `abort` fires while queued.
    pub async fn acquire(
        &self,
        target: &TargetKey,
        holder: &str,
        abort: &AbortSignal,
    ) -> Result<RunnerLease> {
        if abort.is_aborted() {
            return Err(DrydockError::Aborted);
        }
        let lock = self.target_lock(target).await;
        let started = Instant::now();

        let guard = match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                emit_lock_queued(target, holder);
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => return Err(DrydockError::Aborted),
                    guard = lock.lock_owned() => guard,
                }
            }
        };

        let file = match &self.lock_dir {
            Some(dir) => Some(lock_file(dir, target, holder, abort).await?),
            None => None,
        };

        emit_lock_acquired(target, holder, started.elapsed().as_millis() as u64);
        Ok(RunnerLease {
            _guard: guard,
            file,
            cluster: Arc::clone(&self.cluster),
            target: target.clone(),
            holder: holder.to_string(),
        })
    }

    /// Whether some run currently holds `target`.
    pub async fn is_locked(&self, target: &TargetKey) -> bool {
        let lock = self.target_lock(target).await;
        let locked = lock.try_lock().is_err();
        locked
    }
}

/// Lock file path for `target` under `dir`.
pub fn lock_path(dir: &Path, target: &TargetKey) -> PathBuf {
    let name: String = target
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{name}.lock"))
}

/// Poll the advisory lock for `target` until it is free or `abort` fires.
async fn lock_file(
    dir: &Path,
    target: &TargetKey,
    holder: &str,
    abort: &AbortSignal,
) -> Result<File> {
    fs::create_dir_all(dir)?;
    let path = lock_path(dir, target);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    let mut queued = false;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => break,
            Err(e) if is_contended(&e) => {
                if !queued {
                    emit_lock_queued(target, holder);
                    queued = true;
                }
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => return Err(DrydockError::Aborted),
                    _ = tokio::time::sleep(FILE_LOCK_POLL) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Holder id, for operators inspecting a stuck lock.
    file.set_len(0)?;
    file.write_all(holder.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Exclusive access to one target's cluster. Dropping it releases the lock.
pub struct RunnerLease {
    _guard: OwnedMutexGuard<()>,
    file: Option<File>,
    cluster: Arc<dyn ClusterControlPlane>,
    target: TargetKey,
    holder: String,
}

impl RunnerLease {
    pub fn cluster(&self) -> &dyn ClusterControlPlane {
        self.cluster.as_ref()
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for RunnerLease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        emit_lock_released(&self.target, &self.holder);
    }
}

impl std::fmt::Debug for RunnerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerLease")
            .field("target", &self.target)
            .field("holder", &self.holder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::fakes::FakeCluster;
    use std::time::Duration;

    fn key(ns: &str) -> TargetKey {
        TargetKey {
            endpoint: "https://k8s.local".to_string(),
            namespace: ns.to_string(),
        }
    }

    fn runner() -> Runner {
        Runner::new(Arc::new(FakeCluster::new()))
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_per_target() {
        let runner = runner();
        let never = AbortSignal::never();
        let lease = runner.acquire(&key("vote"), "run-a", &never).await.unwrap();
        assert!(runner.is_locked(&key("vote")).await);
        assert!(!runner.is_locked(&key("other")).await);

        drop(lease);
        assert!(!runner.is_locked(&key("vote")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_holder_waits_for_release() {
        let runner = Arc::new(runner());
        let never = AbortSignal::never();
        let first = runner.acquire(&key("vote"), "run-a", &never).await.unwrap();

        let waiter = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let lease = runner
                    .acquire(&key("vote"), "run-b", &AbortSignal::never())
                    .await
                    .unwrap();
                lease.holder().to_string()
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), "run-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_queued() {
        let runner = Arc::new(runner());
        let _held = runner
            .acquire(&key("vote"), "run-a", &AbortSignal::never())
            .await
            .unwrap();

        let handle = AbortHandle::new();
        let signal = handle.signal();
        let waiter = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.acquire(&key("vote"), "run-b", &signal).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DrydockError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_lock_serialises_separate_runners() {
        let dir = tempfile::tempdir().unwrap();
        let locks = dir.path().join("locks");
        // two runners stand in for two drydock processes
        let first = runner().with_lock_dir(&locks);
        let second = Arc::new(runner().with_lock_dir(&locks));

        let held = first
            .acquire(&key("vote"), "run-a", &AbortSignal::never())
            .await
            .unwrap();
        let path = lock_path(&locks, &key("vote"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "run-a");

        let waiter = {
            let second = Arc::clone(&second);
            tokio::spawn(async move {
                let lease = second
                    .acquire(&key("vote"), "run-b", &AbortSignal::never())
                    .await
                    .unwrap();
                lease.holder().to_string()
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        // other targets are not blocked
        second
            .acquire(&key("other"), "run-c", &AbortSignal::never())
            .await
            .unwrap();

        drop(held);
        assert_eq!(waiter.await.unwrap(), "run-b");
        assert_eq!(fs::read_to_string(&path).unwrap(), "run-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_waiting_on_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let first = runner().with_lock_dir(dir.path());
        let second = Arc::new(runner().with_lock_dir(dir.path()));
        let _held = first
            .acquire(&key("vote"), "run-a", &AbortSignal::never())
            .await
            .unwrap();

        let handle = AbortHandle::new();
        let signal = handle.signal();
        let waiter = {
            let second = Arc::clone(&second);
            tokio::spawn(async move { second.acquire(&key("vote"), "run-b", &signal).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.abort();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DrydockError::Aborted));
        assert!(!second.is_locked(&key("vote")).await);
    }

    #[test]
    fn test_lock_path_is_filesystem_safe() {
        let path = lock_path(Path::new("/state/locks"), &key("vote"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".lock"));
        assert!(!name.contains('/') && !name.contains(':'));
    }

    #[tokio::test]
    async fn test_aborted_signal_refuses_acquire() {
        let handle = AbortHandle::new();
        handle.abort();
        let err = runner()
            .acquire(&key("vote"), "run-a", &handle.signal())
            .await
            .unwrap_err();
        assert!(matches!(err, DrydockError::Aborted));
        assert!(handle.is_aborted());
    }
}
