//! Triage Metrics
//! ==============
//!
//! Running counters for a simulation run:
//! - **Flow**: spawned, admitted, rejected, assigned, re-queued, discharged
//! - **Care**: diagnoses treated, escalations, unhelped patients
//! - **Oracle health**: calls, failures, timeouts, stale responses discarded
//!
//! Counters are reset on `restart()`.

use serde::{Deserialize, Serialize};

use crate::events::DischargeReason;

/// Counters for one simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageMetrics {
    /// Patients created
    pub spawned: u64,
    /// Patients that passed the admission rule
    pub admitted: u64,
    /// Patients sent home by the gatekeeper
    pub rejected: u64,
    /// Routing decisions that ended with a handler
    pub assigned: u64,
    /// Routing decisions that ended at the back of the inner queue
    pub requeued: u64,
    /// Individual diagnoses marked treated
    pub diagnoses_treated: u64,
    /// Patients discharged with every diagnosis treated
    pub recovered: u64,
    /// Patients discharged with untreated diagnoses
    pub unhelped: u64,
    /// Patients sent back to the inner queue by a session
    pub escalated: u64,
    /// Sessions dropped before concluding
    pub sessions_interrupted: u64,

    /// Oracle requests issued
    pub oracle_calls: u64,
    /// Oracle requests that returned an error
    pub oracle_failures: u64,
    /// Oracle requests that exceeded the timeout
    pub oracle_timeouts: u64,
    /// Responses that arrived after their run was torn down
    pub stale_responses: u64,
}

impl TriageMetrics {
    /// Counts a discharge.
    pub fn record_discharge(&mut self, reason: DischargeReason) {
        match reason {
            DischargeReason::Rejected => self.rejected += 1,
            DischargeReason::Recovered => self.recovered += 1,
            DischargeReason::Unhelped => self.unhelped += 1,
        }
    }

    /// Patients that have left the simulation.
    pub fn discharged(&self) -> u64 {
        self.rejected + self.recovered + self.unhelped
    }

    /// Fraction of oracle calls that failed or timed out.
    pub fn oracle_error_rate(&self) -> f64 {
        if self.oracle_calls == 0 {
            return 0.0;
        }
        (self.oracle_failures + self.oracle_timeouts) as f64 / self.oracle_calls as f64
    }

    /// Fraction of admitted patients that left fully treated.
    pub fn recovery_rate(&self) -> f64 {
        if self.admitted == 0 {
            return 0.0;
        }
        self.recovered as f64 / self.admitted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discharge_counts() {
        let mut m = TriageMetrics::default();
        m.record_discharge(DischargeReason::Rejected);
        m.record_discharge(DischargeReason::Recovered);
        m.record_discharge(DischargeReason::Recovered);
        m.record_discharge(DischargeReason::Unhelped);

        assert_eq!(m.rejected, 1);
        assert_eq!(m.recovered, 2);
        assert_eq!(m.unhelped, 1);
        assert_eq!(m.discharged(), 4);
    }

    #[test]
    fn test_rates_handle_zero() {
        let m = TriageMetrics::default();
        assert_eq!(m.oracle_error_rate(), 0.0);
        assert_eq!(m.recovery_rate(), 0.0);
    }

    #[test]
    fn test_oracle_error_rate() {
        let m = TriageMetrics {
            oracle_calls: 10,
            oracle_failures: 1,
            oracle_timeouts: 1,
            ..Default::default()
        };
        assert!((m.oracle_error_rate() - 0.2).abs() < 1e-9);
    }
}
