//! Process-wide shutdown flag
//!
//! A [`Shutdown`] flips once from running to stopping. Every worker and the
//! stats ticker hold a [`ShutdownListener`] and check it at each loop
//! iteration and around every blocking wait.

use std::sync::Arc;

use tokio::sync::watch;

/// One-shot stop flag shared by everything in a run
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// New flag in the running state
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Flip the flag to stopping
    ///
    /// Returns `true` only for the call that performed the transition;
    /// later calls are no-ops.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        })
    }

    /// True once [`trigger`](Self::trigger) has been called
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// New listener; sees the current state even if the flag already flipped
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of [`Shutdown`]
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Non-blocking check
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the flag is (or already was) flipped
    ///
    /// Cancel-safe. Also resolves if every [`Shutdown`] handle was dropped.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for SIGINT/SIGTERM and trigger `shutdown`
///
/// Keeps listening after the first signal so repeated signals are reported
/// but never trigger a second teardown.
pub async fn listen_for_signals(shutdown: Shutdown) {
    loop {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Failed to listen for termination signals");
            return;
        }
        if shutdown.trigger() {
            tracing::info!("Received termination signal, initiating graceful shutdown...");
        } else {
            tracing::warn!("Shutdown already in progress, ignoring repeated signal");
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
