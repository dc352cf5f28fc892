use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Process-wide stop request, set once and polled at loop boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the call that actually flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` in short slices. Returns false when woken early
    /// by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

/// Waits for the first termination signal and sets `flag`.
///
/// SIGINT, SIGTERM and SIGHUP announce the shutdown; SIGQUIT stops silently.
#[cfg(unix)]
pub async fn watch_signals(flag: CancellationFlag) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    let announce = tokio::select! {
        _ = interrupt.recv() => true,
        _ = terminate.recv() => true,
        _ = hangup.recv() => true,
        _ = quit.recv() => false,
    };
    if announce {
        tracing::warn!("Please wait while finishing up...");
    }
    flag.cancel();
    Ok(())
}

#[cfg(not(unix))]
pub async fn watch_signals(flag: CancellationFlag) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::warn!("Please wait while finishing up...");
    flag.cancel();
    Ok(())
}
