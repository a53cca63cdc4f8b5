//! Core environment context trait for the triage engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the triage engine can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, thread RNG
/// - **Simulation**: `SimContext` - manually advanced virtual clock, seeded RNG
///
/// # Determinism
///
/// For reproducible runs, all methods that would normally introduce
/// non-determinism (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait TriageContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// The engine's clock measures elapsed time against this value.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: resolves once the virtual clock has been advanced past
    /// the deadline
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    ///
    /// Used to run admission, routing and handler sessions without blocking
    /// the tick that scheduled them.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a seed for a subsystem RNG from a seed extension.
    ///
    /// The implementation combines the global seed with `seed_extension`
    /// so every subsystem gets a unique but reproducible stream.
    fn derive_seed(&self, seed_extension: u64) -> u64;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
