//! Ctrl+C / SIGTERM handling.
//!
//! A signal only raises the engine's cancellation flag; the apply loop
//! notices it before the next checkpoint and stops there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use vcsmirror_core::CancelFlag;

/// Create a cancellation flag and register OS signal handlers that set it.
pub fn setup_signal_handlers() -> CancelFlag {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_clone = flag.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("received SIGINT (Ctrl+C), stopping before next checkpoint"),
                        _ = sigterm.recv() => info!("received SIGTERM, stopping before next checkpoint"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to register SIGTERM handler");
                    if ctrl_c.await.is_err() {
                        return;
                    }
                    info!("received SIGINT (Ctrl+C), stopping before next checkpoint");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_err() {
                warn!("failed to listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C, stopping before next checkpoint");
        }

        flag_clone.store(true, Ordering::SeqCst);
    });

    flag
}
