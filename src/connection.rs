//! Registry of live connection handlers.
//!
//! Each accepted connection runs in its own task. The registry keeps one
//! entry per task holding its join handle and a close signal, so shutdown
//! can force every handler off its socket and then wait for it to finish.
//!
//! Registration and spawning happen under the registry lock, which means a
//! handler can never deregister before its entry exists. Handlers deregister
//! by posting their key on a channel that the registry drains whenever it
//! takes its lock, so dropping a guard never blocks.

use slab::Slab;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A single registered handler.
#[derive(Debug)]
struct Entry {
    peer: SocketAddr,
    handle: JoinHandle<()>,
    /// Firing or dropping this tells the handler to drop its socket.
    close: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Inner {
    entries: Slab<Entry>,
    /// Keys of handlers that have exited.
    finished: mpsc::UnboundedReceiver<usize>,
    /// Set by `join_all`; no new handlers are admitted afterwards.
    closed: bool,
}

impl Inner {
    fn reap(&mut self) {
        while let Ok(key) = self.finished.try_recv() {
            if self.entries.contains(key) {
                let entry = self.entries.remove(key);
                debug!(key, peer = %entry.peer, "Unregistered connection handler");
            }
        }
    }
}

/// Registry of active connection handlers using slab allocation.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    finished: mpsc::UnboundedSender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        let (finished, finished_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: Slab::new(),
                finished: finished_rx,
                closed: false,
            }),
            finished,
        })
    }

    // Registry mutations never panic while holding the lock, so a poisoned
    // lock still guards a consistent slab.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.reap();
        inner
    }

    /// Register a handler for `peer` and spawn it.
    ///
    /// `handler` receives the [`ConnectionGuard`] that deregisters the entry
    /// when dropped. Returns the entry key, or `None` if the registry has
    /// already been joined.
    pub fn spawn<F, Fut>(&self, peer: SocketAddr, handler: F) -> Option<usize>
    where
        F: FnOnce(ConnectionGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }

        let (close, close_rx) = oneshot::channel();
        let slot = inner.entries.vacant_entry();
        let key = slot.key();
        let guard = ConnectionGuard {
            key,
            peer,
            close_rx,
            closed: false,
            finished: self.finished.clone(),
        };

        let handle = tokio::spawn(handler(guard));
        slot.insert(Entry {
            peer,
            handle,
            close,
        });
        debug!(key, peer = %peer, "Registered connection handler");
        Some(key)
    }

    /// Close every registered connection and wait for its handler to exit.
    ///
    /// Afterwards the registry refuses new handlers. Calling this again
    /// finds nothing to join. Returns the number of handlers joined.
    pub async fn join_all(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.entries.drain().collect()
        };

        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            // Send fails only if the handler already finished.
            let _ = entry.close.send(());
            handles.push((entry.peer, entry.handle));
        }

        let count = handles.len();
        for (peer, handle) in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(peer = %peer, "Connection handler panicked");
                }
            }
        }
        count
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Owned by a running handler; deregisters it on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    key: usize,
    peer: SocketAddr,
    close_rx: oneshot::Receiver<()>,
    closed: bool,
    finished: mpsc::UnboundedSender<usize>,
}

impl ConnectionGuard {
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Resolve once the registry asks this connection to close.
    ///
    /// Cancel safe, and keeps resolving immediately once it has fired.
    pub async fn closed(&mut self) {
        if self.closed {
            return;
        }
        let _ = (&mut self.close_rx).await;
        self.closed = true;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // The registry may already have been dropped during teardown.
        let _ = self.finished.send(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn wait_until_empty(registry: &ConnectionRegistry) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_finished_handler_deregisters() {
        let registry = ConnectionRegistry::new();
        let key = registry.spawn(peer(1), |_guard| async {}).unwrap();
        assert_eq!(key, 0);
        wait_until_empty(&registry).await;
    }

    #[tokio::test]
    async fn test_join_all_closes_blocked_handlers() {
        let registry = ConnectionRegistry::new();
        let exited = Arc::new(AtomicUsize::new(0));

        for port in 0..3 {
            let exited = Arc::clone(&exited);
            registry
                .spawn(peer(port), move |mut guard| async move {
                    guard.closed().await;
                    exited.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(registry.len(), 3);

        let joined = tokio::time::timeout(Duration::from_secs(1), registry.join_all())
            .await
            .unwrap();
        assert_eq!(joined, 3);
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_join_all_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry
            .spawn(peer(1), |mut guard| async move { guard.closed().await })
            .unwrap();

        assert_eq!(registry.join_all().await, 1);
        assert_eq!(registry.join_all().await, 0);
        assert!(registry.is_closed());
    }

    #[tokio::test]
    async fn test_spawn_refused_after_join() {
        let registry = ConnectionRegistry::new();
        registry.join_all().await;
        assert!(registry.spawn(peer(1), |_guard| async {}).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_guard_reports_peer_and_key() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = oneshot::channel();
        let key = registry
            .spawn(peer(4242), move |guard| async move {
                let _ = tx.send((guard.key(), guard.peer()));
            })
            .unwrap();
        let (seen_key, seen_peer) = rx.await.unwrap();
        assert_eq!(seen_key, key);
        assert_eq!(seen_peer, peer(4242));
    }

    #[tokio::test]
    async fn test_closed_resolves_repeatedly() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry
            .spawn(peer(1), move |mut guard| async move {
                guard.closed().await;
                guard.closed().await;
                let _ = tx.send(());
            })
            .unwrap();
        registry.join_all().await;
        rx.await.unwrap();
    }
}
