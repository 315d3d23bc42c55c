//! Cooperative cancellation.
//!
//! An [`InterruptToken`] is a cheap clonable flag. Blocking waits in the
//! crate poll it, so triggering it from any thread (or from SIGINT/SIGTERM
//! via [`SignalForwarder`]) wakes them without tearing the process down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    interrupted: AtomicBool,
    count: AtomicU64,
}

impl InterruptToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Number of interrupts received since creation.
    #[must_use]
    pub fn interrupt_count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for the next wait.
    pub fn reset(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
    }
}

/// Forwards SIGINT/SIGTERM to an [`InterruptToken`] from a helper thread.
#[cfg(unix)]
pub struct SignalForwarder {
    handle: signal_hook::iterator::Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[cfg(unix)]
impl SignalForwarder {
    pub fn install(token: InterruptToken) -> std::io::Result<Self> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let thread = std::thread::Builder::new()
            .name("runsync-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    tracing::info!(signal, "interrupt requested");
                    token.interrupt();
                }
            })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(unix)]
impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = InterruptToken::new();
        let clone = token.clone();
        assert!(!clone.is_interrupted());
        token.interrupt();
        assert!(clone.is_interrupted());
        assert_eq!(clone.interrupt_count(), 1);
    }

    #[test]
    fn reset_clears_flag_but_not_count() {
        let token = InterruptToken::new();
        token.interrupt();
        token.interrupt();
        token.reset();
        assert!(!token.is_interrupted());
        assert_eq!(token.interrupt_count(), 2);
    }

    #[test]
    fn interrupt_from_another_thread() {
        let token = InterruptToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.interrupt()).join().unwrap();
        assert!(token.is_interrupted());
    }
}
