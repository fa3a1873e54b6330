//! Cooperative shutdown signalling.
//!
//! The flag is monotonic: it goes from false to true at most once and is
//! never reset. Every blocking loop in the server selects on [`Shutdown::wait`]
//! next to its own suspension point.

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Process-wide shutdown flag.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag. Returns `true` only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn SIGINT/SIGTERM into a shutdown trigger.
///
/// Must be called from within the tokio runtime. The returned task also
/// exits quietly if shutdown is triggered some other way.
pub fn spawn_signal_listener(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!(signal = "SIGINT", "Caught signal, exiting"),
            _ = sigterm.recv() => info!(signal = "SIGTERM", "Caught signal, exiting"),
            _ = shutdown.wait() => return,
        }
        shutdown.trigger();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_is_monotonic() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(shutdown.is_triggered());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_clones_share_flag() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        other.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_wakes_on_trigger() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_triggers_flip_once() {
        let shutdown = Shutdown::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.trigger() })
            })
            .collect();

        let mut flipped = 0;
        for handle in handles {
            if handle.await.unwrap() {
                flipped += 1;
            }
        }
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn test_signal_listener_exits_on_trigger() {
        let shutdown = Shutdown::new();
        let listener = spawn_signal_listener(shutdown.clone()).unwrap();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let shutdown = Shutdown::new();
        let listener = spawn_signal_listener(shutdown.clone()).unwrap();

        // SAFETY: the handler installed above keeps SIGTERM from killing the
        // test process.
        assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGTERM) }, 0);

        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .unwrap();
        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .unwrap()
            .unwrap();
    }
}
