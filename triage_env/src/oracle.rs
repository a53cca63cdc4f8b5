//! Classification oracle abstraction for the triage engine.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::EnvError;
use crate::types::{Code, RuleExpression};

/// Abstraction over the terminology expansion service.
///
/// # Implementations
///
/// - **Production**: a terminology server expanding the rule as an implicit
///   value set
/// - **Simulation**: an in-memory code hierarchy with configurable
///   latency/failures
///
/// # Call Flow
///
/// ```text
/// Engine                      Oracle
///   |                           |
///   |-- evaluate(rule) -------->|
///   |   (suspends)              |-- [latency] --
///   |<------- matching codes ---|
/// ```
///
/// Callers must treat `evaluate` as a long-latency operation. Two calls
/// issued back-to-back may resolve in either order.
#[async_trait]
pub trait ClassificationOracle: Send + Sync + 'static {
    /// Evaluates a boolean subsumption rule.
    ///
    /// # Returns
    /// * `Ok(codes)` - Every code named in the rule that satisfies it
    /// * `Err(EnvError::OracleError)` - The backend failed
    /// * `Err(EnvError::MalformedResponse)` - The backend answered garbage
    async fn evaluate(&self, rule: &RuleExpression) -> Result<BTreeSet<Code>, EnvError>;

    /// Returns a short name for logging.
    fn name(&self) -> &str {
        "oracle"
    }
}

/// Marker trait for oracle controllers in simulation.
///
/// Allows injecting latency, failures and stalls.
pub trait OracleController: Send + Sync {
    /// Sets the mean response latency.
    fn set_latency(&self, latency: Duration);

    /// Sets the probability (0.0 - 1.0) that a call fails.
    fn set_failure_rate(&self, rate: f64);

    /// When stalled, calls never resolve.
    fn set_stalled(&self, stalled: bool);
}
