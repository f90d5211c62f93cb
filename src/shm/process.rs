//! Producer liveness.
//!
//! A live process holds an exclusive advisory lock on `<dir>/<id>.lock`. The kernel drops the
//! lock when the process exits for any reason, so a peer can tell "alive" from "gone" by probing
//! the lock without any cooperation from the (possibly crashed) holder.

use crate::foundation::error::{StreamError, StreamResult};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

fn lock_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.lock"))
}

/// Held for as long as the owning process is alive.
#[derive(Debug)]
pub struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl ProcessLock {
    /// Take the liveness lock for `id`. Fails if another live process already holds it.
    pub fn acquire(dir: &Path, id: &str) -> StreamResult<Self> {
        let path = lock_path(dir, id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StreamError::shm(format!("failed to open lock '{}': {e}", path.display()))
            })?;
        match file.try_lock() {
            Ok(()) => Ok(Self { file, path }),
            Err(TryLockError::WouldBlock) => Err(StreamError::validation(format!(
                "process '{id}' is already running"
            ))),
            Err(TryLockError::Error(e)) => Err(StreamError::shm(format!(
                "failed to lock '{}': {e}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Probe whether some process currently holds the lock for `id`.
    pub fn is_alive(dir: &Path, id: &str) -> StreamResult<bool> {
        let path = lock_path(dir, id);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(StreamError::shm(format!(
                    "failed to open lock '{}': {e}",
                    path.display()
                )));
            }
        };
        match file.try_lock_shared() {
            Ok(()) => {
                let _ = file.unlock();
                Ok(false)
            }
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(e)) => Err(StreamError::shm(format!(
                "failed to probe '{}': {e}",
                path.display()
            ))),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Background watcher: waits for the partner process to appear, then for it to disappear, then
/// runs `on_death` once.
pub struct LivenessMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    pub fn spawn(
        dir: PathBuf,
        id: String,
        poll: Duration,
        on_death: impl FnOnce() + Send + 'static,
    ) -> StreamResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name(format!("liveness-{id}"))
            .spawn({
                let stop = stop.clone();
                move || {
                    if !wait_for(&stop, poll, || alive(&dir, &id)) {
                        return;
                    }
                    tracing::debug!(id, "partner process is alive");
                    if !wait_for(&stop, poll, || !alive(&dir, &id)) {
                        return;
                    }
                    tracing::warn!(id, "partner process died");
                    on_death();
                }
            })
            .map_err(|e| StreamError::shm(format!("failed to spawn liveness thread: {e}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn alive(dir: &Path, id: &str) -> bool {
    ProcessLock::is_alive(dir, id).unwrap_or(false)
}

/// Poll until `cond` holds; false if stopped first.
fn wait_for(stop: &AtomicBool, poll: Duration, mut cond: impl FnMut() -> bool) -> bool {
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        if cond() {
            return true;
        }
        std::thread::sleep(poll);
    }
}
