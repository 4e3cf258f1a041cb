//! Termination signal wiring.

use std::io;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal as unix_signal};

/// SIGINT/SIGTERM streams (Ctrl+C elsewhere).
///
/// On unix the handlers are registered when this is constructed, so a signal
/// delivered before the first `recv` is queued instead of killing the process.
pub struct Termination {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
}

impl Termination {
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                interrupt: unix_signal(SignalKind::interrupt())?,
                terminate: unix_signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Resolve on the next termination signal.
    pub async fn recv(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => info!("SIGINT received"),
                _ = self.terminate.recv() => info!("SIGTERM received"),
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Ctrl+C received");
            Ok(())
        }
    }
}

/// Install the signal handlers now and cancel `token` when one fires.
///
/// The listener exits quietly if the token is cancelled first.
pub fn cancel_on_termination(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut termination = Termination::install()?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            res = termination.recv() => {
                if let Err(e) = res {
                    warn!(error = %e, "signal listener failed; stopping");
                }
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    }))
}
