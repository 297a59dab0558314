//! Signal handling for graceful shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM both flip the shutdown flag once. The
//! orchestrator then stops the running program and returns; later signals
//! are only logged, since the stop is already bounded by the grace period.
use tokio::sync::watch;

/// Install the handlers and return a receiver that turns `true` on the
/// first interrupt.
pub fn listen() -> std::io::Result<watch::Receiver<bool>> {
    let mut interrupts = Interrupts::install()?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            match interrupts.recv().await {
                Ok(signal) => {
                    if tx.send_replace(true) {
                        tracing::warn!(signal, "already shutting down");
                    } else {
                        tracing::info!(signal, "shutdown requested");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "cannot listen for interrupts");
                    // Keep the sender so receivers don't see a closed channel.
                    std::future::pending::<()>().await;
                }
            }
        }
    });

    Ok(rx)
}

struct Interrupts {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Interrupts {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> std::io::Result<&'static str> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = self.terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> std::io::Result<&'static str> {
        tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
    }
}
