//! Shutdown Coordination
//!
//! A single shutdown request fans out to every monitoring loop through a
//! watch channel. Graceful requests may be escalated to emergency, never the
//! other way round.

use crate::error::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownSignal {
    /// Stop loops, terminate processes with bounded waits, persist final state
    Graceful,
    /// Kill processes immediately, persist an emergency marker, force exit
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub signal: ShutdownSignal,
    pub reason: String,
}

/// Owner side of the shutdown channel
pub struct ShutdownController {
    tx: watch::Sender<Option<ShutdownRequest>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Request shutdown. Returns false when an equal or stronger request is
    /// already pending.
    pub fn request(&self, signal: ShutdownSignal, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let accepted = self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.signal >= signal => false,
            _ => {
                *current = Some(ShutdownRequest {
                    signal,
                    reason: reason.clone(),
                });
                true
            }
        });

        if accepted {
            match signal {
                ShutdownSignal::Graceful => info!("Shutdown requested ({}): {}", signal, reason),
                ShutdownSignal::Emergency => warn!("Shutdown requested ({}): {}", signal, reason),
            }
        } else {
            warn!("Shutdown already requested, ignoring {} signal: {}", signal, reason);
        }
        accepted
    }

    pub fn is_requested(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn current(&self) -> Option<ShutdownRequest> {
        self.tx.borrow().clone()
    }

    /// Token for a loop to observe shutdown
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Loop-side view of the shutdown channel
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<Option<ShutdownRequest>>,
}

impl ShutdownToken {
    pub fn is_requested(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn current(&self) -> Option<ShutdownRequest> {
        self.rx.borrow().clone()
    }

    /// Resolve once any shutdown has been requested
    pub async fn wait(&mut self) -> ShutdownRequest {
        self.wait_for(ShutdownSignal::Graceful).await
    }

    /// Resolve once a request at least as strong as `signal` is pending
    pub async fn wait_for(&mut self, signal: ShutdownSignal) -> ShutdownRequest {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(request) = current.filter(|r| r.signal >= signal) {
                return request;
            }
            if self.rx.changed().await.is_err() {
                // Controller dropped without a request
                return ShutdownRequest {
                    signal: ShutdownSignal::Emergency,
                    reason: "shutdown controller dropped".to_string(),
                };
            }
        }
    }
}

/// Route OS signals into the controller.
///
/// SIGINT and SIGTERM request graceful shutdown, SIGQUIT requests emergency.
pub fn install_signal_handlers(shutdown: Arc<ShutdownController>) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Emergency),
        ];

        for (kind, name, shutdown_signal) in handlers {
            let mut stream = signal(kind)?;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    info!("Received {}", name);
                    shutdown.request(shutdown_signal, format!("received {}", name));
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                shutdown.request(ShutdownSignal::Graceful, "received Ctrl+C");
            }
        });
    }

    Ok(())
}
