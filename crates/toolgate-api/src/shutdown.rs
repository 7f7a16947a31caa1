//! Graceful shutdown coordinator (C11): waits for a signal, runs every
//! registered handler in turn with a per-handler deadline, then forces the
//! process down if the whole drain hasn't finished by `force_timeout_ms`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A named shutdown step plus the future that runs it.
pub type ShutdownHandler = (&'static str, Pin<Box<dyn Future<Output = ()> + Send>>);

/// Shared flag checked by request handlers so new invocations are rejected
/// with `service_unavailable` once the drain window has started.
#[derive(Default)]
pub struct ShutdownState {
    draining: AtomicBool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self { draining: AtomicBool::new(false) }
    }

    fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Resolves once SIGINT or (on Unix) SIGTERM is received.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Runs to completion once a shutdown signal arrives: cancels `token` (which
/// axum's graceful-shutdown future is waiting on), flags `state` as draining
/// so in-flight handlers reject new invocations, then runs `handlers`
/// sequentially, each bounded by `drain_timeout_ms`. If the whole sequence
/// hasn't finished by `force_timeout_ms`, the process exits immediately.
pub async fn coordinate(
    token: CancellationToken,
    drain_timeout_ms: u64,
    force_timeout_ms: u64,
    state: Arc<ShutdownState>,
    handlers: Vec<ShutdownHandler>,
) {
    wait_for_signal().await;
    info!("starting graceful shutdown");
    state.begin_draining();
    token.cancel();

    let per_handler_timeout = Duration::from_millis(drain_timeout_ms);
    let run_handlers = async {
        for (name, handler) in handlers {
            match tokio::time::timeout(per_handler_timeout, handler).await {
                Ok(()) => info!(handler = name, "shutdown handler completed"),
                Err(_) => warn!(handler = name, "shutdown handler timed out"),
            }
        }
    };

    tokio::select! {
        _ = run_handlers => info!("all shutdown handlers completed"),
        _ = tokio::time::sleep(Duration::from_millis(force_timeout_ms)) => {
            warn!(force_timeout_ms, "force shutdown deadline reached before handlers finished");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_created_state_is_not_draining() {
        let state = ShutdownState::new();
        assert!(!state.is_draining());
    }

    #[test]
    fn begin_draining_flips_the_flag() {
        let state = ShutdownState::new();
        state.begin_draining();
        assert!(state.is_draining());
    }
}
