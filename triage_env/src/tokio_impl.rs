//! Wall-clock context for running the triage engine outside the harness.

use crate::TriageContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the engine in real time on the ambient Tokio runtime.
///
/// `now()` counts from the moment the context was opened, so clock timers
/// and discharge timestamps start near zero. Seeds are drawn fresh on
/// every call, which makes runs on this context non-reproducible.
pub struct TokioContext {
    opened_at: Instant,
}

impl TokioContext {
    pub fn new() -> Self {
        Self {
            opened_at: Instant::now(),
        }
    }

    /// Convenience for `Arc::new(TokioContext::new())`, the form the engine
    /// takes.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TriageContext for TokioContext {
    fn now(&self) -> Duration {
        self.opened_at.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Ticks and sessions go straight onto the runtime. The task name is
    /// only used by the simulated context.
    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn derive_seed(&self, _seed_extension: u64) -> u64 {
        rand::random()
    }

    /// Always 0: a live run has no master seed.
    fn seed(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_moves_with_wall_time() {
        let ctx = TokioContext::new();
        let opened = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let later = ctx.now();

        assert!(later >= opened + Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_spawned_session_runs_on_runtime() {
        let ctx = TokioContext::shared();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        ctx.spawn("handler-session", async move {
            let _ = done_tx.send(3usize);
        });

        assert_eq!(done_rx.await.unwrap(), 3);
    }

    #[test]
    fn test_live_context_is_unseeded() {
        let ctx = TokioContext::default();
        assert_eq!(ctx.seed(), 0);
        // Fresh entropy per subsystem, not a function of the extension
        assert_ne!(ctx.derive_seed(1), ctx.derive_seed(1));
    }
}
