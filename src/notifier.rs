//! Cross-process wake signal over a shared file.
//!
//! Writers overwrite a nonce file after each durable commit; readers —
//! possibly in other processes sharing only the filesystem — watch the
//! file for changes. The signal carries no payload: a wake means "at
//! least one write happened, re-pull the durable store". Writes that land
//! between two observations coalesce into a single wake.

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Wake-signal writer/watcher bound to one shared file.
pub struct Notifier {
    path: PathBuf,
    tx: watch::Sender<u64>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Notifier {
    /// Bind to the shared wake file, creating it if absent.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(nonce().as_bytes())
                    .with_context(|| format!("Failed to seed wake file at {:?}", path))?;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to create wake file at {:?}", path));
            }
        }

        let (tx, _rx) = watch::channel(0u64);
        let sender = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                // Any non-access event on the file counts as a wake; spurious
                // wakes are harmless because readers re-pull the store.
                Ok(event) if !event.kind.is_access() => {
                    sender.send_modify(|generation| *generation = generation.wrapping_add(1));
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("wake file watcher error: {}", err),
            }
        })
        .context("Failed to start wake file watcher")?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch wake file at {:?}", path))?;

        Ok(Self {
            path,
            tx,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Overwrite the wake file with a fresh nonce.
    ///
    /// Best-effort: a failed write delays live delivery until the next
    /// successful one but must never fail the commit path, so errors are
    /// only logged.
    pub fn update(&self) {
        if let Err(err) = fs::write(&self.path, nonce()) {
            tracing::warn!("failed to write wake file {:?}: {}", self.path, err);
        }
    }

    /// Subscribe to wake events occurring after this call.
    pub fn watch(&self) -> WakeStream {
        WakeStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Stop the background watcher and release its resources. Idempotent.
    pub fn destroy(&self) {
        if self.watcher.lock().unwrap().take().is_some() {
            tracing::debug!("stopped wake file watcher for {:?}", self.path);
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Unbounded sequence of wake events for one subscriber.
pub struct WakeStream {
    rx: watch::Receiver<u64>,
}

impl WakeStream {
    /// Wait for the next wake.
    ///
    /// Returns None on cancellation or once the notifier is gone. A wake
    /// stands for one *or more* writes; callers must re-pull fully.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<()> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            changed = self.rx.changed() => changed.ok().map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_construction_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wake");
        let first = Notifier::new(&path).unwrap();
        // Binding a second notifier to an existing file must not fail.
        let second = Notifier::new(&path).unwrap();
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn test_update_wakes_watcher() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wake");
        let notifier = Notifier::new(&path).unwrap();
        let mut stream = notifier.watch();
        let cancel = CancellationToken::new();

        notifier.update();
        let woke = timeout(Duration::from_secs(5), stream.recv(&cancel)).await;
        assert_eq!(woke.unwrap(), Some(()));
    }

    #[tokio::test]
    async fn test_external_write_wakes_watcher() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wake");
        let notifier = Notifier::new(&path).unwrap();
        let mut stream = notifier.watch();
        let cancel = CancellationToken::new();

        // Simulate another process touching the shared file directly.
        fs::write(&path, b"somewhere else").unwrap();
        let woke = timeout(Duration::from_secs(5), stream.recv(&cancel)).await;
        assert_eq!(woke.unwrap(), Some(()));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_recv() {
        let tmp = TempDir::new().unwrap();
        let notifier = Notifier::new(tmp.path().join("wake")).unwrap();
        let mut stream = notifier.watch();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(stream.recv(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_recv_ends_when_notifier_dropped() {
        let tmp = TempDir::new().unwrap();
        let notifier = Notifier::new(tmp.path().join("wake")).unwrap();
        let mut stream = notifier.watch();
        let cancel = CancellationToken::new();
        drop(notifier);
        let ended = timeout(Duration::from_secs(5), stream.recv(&cancel)).await;
        assert_eq!(ended.unwrap(), None);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let notifier = Notifier::new(tmp.path().join("wake")).unwrap();
        notifier.destroy();
        notifier.destroy();
        // update() stays harmless after destroy; only live delivery stops.
        notifier.update();
    }
}
