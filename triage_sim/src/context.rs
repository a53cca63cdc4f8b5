//! Simulation context implementing TriageContext for deterministic testing.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use triage_env::TriageContext;

/// Simulation context backed by virtual time and seeded entropy.
///
/// This implements `TriageContext` using:
/// - A virtual clock that only moves when `advance_time` is called
/// - Sleeps that resolve once virtual time reaches their deadline
/// - Seeds derived from a single master seed through ChaCha8
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time; sleepers watch it
    time: Arc<watch::Sender<Duration>>,
}

impl SimContext {
    /// Creates a new SimContext at virtual time zero.
    pub fn new(seed: u64) -> Self {
        let (time, _) = watch::channel(Duration::ZERO);
        Self {
            seed,
            time: Arc::new(time),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time and wakes every sleeper whose deadline passed.
    pub fn advance_time(&self, duration: Duration) {
        self.time
            .send_modify(|now| *now = now.saturating_add(duration));
    }

    /// Sets the virtual time. Moving backwards is ignored.
    pub fn set_time(&self, time: Duration) {
        self.time.send_if_modified(|now| {
            if time > *now {
                *now = time;
                true
            } else {
                false
            }
        });
    }

    /// Returns the current virtual time in milliseconds.
    pub fn time_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            time: Arc::clone(&self.time),
        }
    }
}

#[async_trait]
impl TriageContext for SimContext {
    fn now(&self) -> Duration {
        *self.time.borrow()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now().saturating_add(duration);
        let mut rx = self.time.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "spawning simulated task");
        tokio::spawn(future);
    }

    fn derive_seed(&self, seed_extension: u64) -> u64 {
        // Combine master seed with extension for a deterministic sub-seed
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ seed_extension;
        ChaCha8Rng::seed_from_u64(combined_seed).gen()
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
