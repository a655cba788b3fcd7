//! Lifecycle shell: signal handling and exit-code mapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use log::info;
use tokio::sync::Notify;

/// A shutdown flag plus a wakeup, so a signal that arrives before anyone is
/// waiting isn't lost — `tokio::sync::Notify::notify_waiters` alone only
/// wakes tasks already parked in `.notified()` at the moment it's called,
/// which would race a signal against engine startup or the client's
/// between-attempts backoff sleep.
#[derive(Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `true` once a signal has been requested, forever after.
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once a signal has been requested, including one that
    /// happened before this call — the `Notified` future is constructed
    /// before the flag is checked, so a `signal()` racing the check can't
    /// slip between the two.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        if self.requested() {
            return;
        }
        notified.await;
    }
}

/// Installs SIGINT/SIGTERM handlers that mark `shutdown` requested exactly
/// once. Spawned as a background task; the caller's event loop selects on
/// [`Shutdown::wait`].
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        shutdown.signal();
    });

    Ok(())
}

/// Process exit codes: 0 clean shutdown, 1 runtime error, 2 usage error.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const RUNTIME_ERROR: i32 = 1;
    pub const USAGE_ERROR: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_resolves_immediately_if_already_signaled() {
        let shutdown = Shutdown::default();
        shutdown.signal();
        assert!(shutdown.requested());
        // Must not hang: `signal()` already happened before `wait()`.
        tokio::time::timeout(std::time::Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait() should return immediately once already signaled");
    }

    #[tokio::test]
    async fn wait_wakes_on_later_signal() {
        let shutdown = Arc::new(Shutdown::default());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        // Give the spawned task a chance to start waiting before signaling.
        tokio::task::yield_now().await;
        shutdown.signal();

        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("waiter task should complete")
            .expect("waiter task should not panic");
    }

    #[tokio::test]
    async fn not_requested_before_any_signal() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.requested());
    }
}
