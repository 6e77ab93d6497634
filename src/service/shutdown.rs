use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::EntrypointError;

/// Stop requests for the entrypoint. Installed once at start so a signal
/// arriving during bootstrap is seen as well as one aimed at the final engine.
pub struct Shutdown {
    rx: mpsc::UnboundedReceiver<&'static str>,
}

impl Shutdown {
    /// Listen for SIGTERM and SIGINT.
    pub fn install() -> Result<Self, EntrypointError> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = term.recv() => "SIGTERM",
                    Some(()) = int.recv() => "SIGINT",
                    else => break,
                };
                debug!(signal = name, "stop requested");
                if tx.send(name).is_err() {
                    break;
                }
            }
        });
        Ok(Self { rx })
    }

    /// Stop requests fed by hand instead of by the OS.
    pub fn channel() -> (mpsc::UnboundedSender<&'static str>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Resolve with the name of the next stop request. Never resolves once
    /// every sender is gone.
    pub async fn recv(&mut self) -> &'static str {
        match self.rx.recv().await {
            Some(name) => name,
            None => std::future::pending().await,
        }
    }
}
