//! TerminologyOracle - simulated classification backend with fault injection.
//!
//! Answers rule expressions against an in-memory `CodeHierarchy`. Latency,
//! failures and stalls are injected deterministically from a seeded RNG so
//! that the engine's timeout and stale-answer paths can be exercised.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;
use triage_env::{ClassificationOracle, Code, EnvError, OracleController, RuleExpression, TriageContext};

use crate::terminology::{CodeHierarchy, Expression};

/// Fault profile applied to every call.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleFaults {
    /// Mean response latency
    pub latency: Duration,

    /// Standard deviation of the latency as a fraction of the mean
    pub jitter: f64,

    /// Probability that a call fails after its latency
    pub failure_rate: f64,

    /// Calls made while stalled never answer
    pub stalled: bool,
}

impl Default for OracleFaults {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter: 0.2,
            failure_rate: 0.0,
            stalled: false,
        }
    }
}

impl OracleFaults {
    /// No latency, no failures.
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate;
        self
    }
}

/// Simulated terminology server.
pub struct TerminologyOracle<Ctx: TriageContext> {
    ctx: Arc<Ctx>,
    hierarchy: CodeHierarchy,
    faults: Mutex<OracleFaults>,
    rng: Mutex<ChaCha8Rng>,
    calls: AtomicU64,
    injected_failures: AtomicU64,
}

impl<Ctx: TriageContext> TerminologyOracle<Ctx> {
    pub fn new(ctx: Arc<Ctx>, hierarchy: CodeHierarchy, seed: u64) -> Self {
        Self {
            ctx,
            hierarchy,
            faults: Mutex::new(OracleFaults::default()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            injected_failures: AtomicU64::new(0),
        }
    }

    pub fn with_faults(self, faults: OracleFaults) -> Self {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner) = faults;
        self
    }

    pub fn hierarchy(&self) -> &CodeHierarchy {
        &self.hierarchy
    }

    pub fn faults(&self) -> OracleFaults {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Total calls received.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Calls that failed on purpose.
    pub fn injected_failures(&self) -> u64 {
        self.injected_failures.load(Ordering::Relaxed)
    }

    /// Draws this call's fate: `None` if it stalls, else its delay and
    /// whether it fails.
    fn draw(&self) -> Option<(Duration, bool)> {
        let faults = self.faults();
        if faults.stalled {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let mean = faults.latency.as_secs_f64();
        let delay = if mean > 0.0 && faults.jitter > 0.0 {
            match Normal::new(mean, mean * faults.jitter) {
                Ok(normal) => normal.sample(&mut *rng).max(0.0),
                Err(_) => mean,
            }
        } else {
            mean
        };
        let fail = faults.failure_rate > 0.0 && rng.gen_bool(faults.failure_rate.min(1.0));
        Some((Duration::from_secs_f64(delay), fail))
    }
}

#[async_trait]
impl<Ctx: TriageContext> ClassificationOracle for TerminologyOracle<Ctx> {
    async fn evaluate(&self, rule: &RuleExpression) -> Result<BTreeSet<Code>, EnvError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let Some((delay, fail)) = self.draw() else {
            trace!(rule = %rule, "oracle stalled");
            return std::future::pending().await;
        };

        if !delay.is_zero() {
            self.ctx.sleep(delay).await;
        }
        if fail {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::oracle("injected failure"));
        }

        let expression = Expression::parse(rule.as_str())
            .map_err(|e| EnvError::invalid_rule(format!("{rule}: {e}")))?;
        Ok(expression.evaluate(&self.hierarchy))
    }

    fn name(&self) -> &str {
        "terminology"
    }
}

impl<Ctx: TriageContext> OracleController for TerminologyOracle<Ctx> {
    fn set_latency(&self, latency: Duration) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latency = latency;
    }

    fn set_failure_rate(&self, rate: f64) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failure_rate = rate.clamp(0.0, 1.0);
    }

    fn set_stalled(&self, stalled: bool) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stalled = stalled;
    }
}
