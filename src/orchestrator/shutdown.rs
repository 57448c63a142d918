//! Two-stage Ctrl-C / SIGTERM handling.
//!
//! The first signal cancels the run token: in-flight workers finish and
//! nothing new is dispatched. A second signal kills every tracked agent
//! process group and exits immediately.

use std::sync::Arc;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::agent::ProcessRegistry;

/// Conventional exit status for a run stopped by SIGINT.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Spawn the signal listener. Must be called from within a tokio runtime;
/// the SIGTERM handler is registered before this returns.
pub fn install_signal_handlers(token: CancellationToken, registry: Arc<ProcessRegistry>) -> JoinHandle<()> {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler");
            None
        }
    };

    tokio::spawn(async move {
        let Some(name) = wait_for_signal(&mut sigterm).await else {
            return;
        };
        warn!("received {}; finishing in-flight work (send again to force quit)", name);
        token.cancel();

        let Some(name) = wait_for_signal(&mut sigterm).await else {
            return;
        };
        error!(processes = registry.len(), "received {} again; killing agent processes", name);
        registry.kill_all_now();
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
}

async fn wait_for_signal(sigterm: &mut Option<Signal>) -> Option<&'static str> {
    match sigterm {
        Some(term) => tokio::select! {
            res = tokio::signal::ctrl_c() => res.ok().map(|_| "SIGINT"),
            res = term.recv() => res.map(|_| "SIGTERM"),
        },
        None => tokio::signal::ctrl_c().await.ok().map(|_| "SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_sigterm_cancels_token() {
        let token = CancellationToken::new();
        let handle = install_signal_handlers(token.clone(), Arc::new(ProcessRegistry::new()));

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token was not cancelled");
        handle.abort();
    }
}
