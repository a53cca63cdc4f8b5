//! The admission gate ("gatekeeper").
//!
//! Single-flight state machine: at most one patient is being tested at any
//! time, and patients are tested in strict arrival order.
//!
//! ```text
//!            outer non-empty                 oracle resolved
//!   Idle ─────────────────────► Testing(p) ───────────────────► Idle
//!    ▲  (pop front)                │  non-empty match → inner queue (Admitted)
//!    │                             │  empty / error   → discharge   (Rejected)
//!    └─────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use triage_env::{Code, EnvError, PatientId, RuleExpression};

use crate::matching::MatchQuery;
use crate::model::Patient;
use crate::queue::PatientQueue;

/// Gate state. `Testing` owns the patient under evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionState {
    Idle,
    Testing(Patient),
}

/// Why a patient was turned away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RejectReason {
    /// No untreated diagnosis satisfies the base admission rule
    NoMatch,
    /// The oracle failed or timed out; treated as no match
    OracleFailure(String),
}

/// Terminal per-patient outcome of one admission test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AdmissionOutcome {
    Admitted {
        patient: PatientId,
        matched: Vec<Code>,
        position: usize,
    },
    Rejected {
        patient: PatientId,
        reason: RejectReason,
    },
}

impl AdmissionOutcome {
    /// Patient the outcome is about.
    pub fn patient(&self) -> PatientId {
        match self {
            AdmissionOutcome::Admitted { patient, .. } => *patient,
            AdmissionOutcome::Rejected { patient, .. } => *patient,
        }
    }

    /// What the gatekeeper tells the patient.
    pub fn message(&self) -> &'static str {
        match self {
            AdmissionOutcome::Admitted { .. } => "go in",
            AdmissionOutcome::Rejected { .. } => "go home",
        }
    }
}

/// Result of `finish`: the outcome plus, for rejections, the patient to
/// discharge.
#[derive(Debug)]
pub struct AdmissionResolution {
    pub outcome: AdmissionOutcome,
    pub rejected: Option<Patient>,
}

/// The admission gate.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    rule: RuleExpression,
    state: AdmissionState,
}

impl AdmissionController {
    /// Creates an idle gate testing against `rule`.
    pub fn new(rule: RuleExpression) -> Self {
        Self {
            rule,
            state: AdmissionState::Idle,
        }
    }

    /// The base admission rule.
    pub fn rule(&self) -> &RuleExpression {
        &self.rule
    }

    /// Current state.
    pub fn state(&self) -> &AdmissionState {
        &self.state
    }

    /// Returns true if no test is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, AdmissionState::Idle)
    }

    /// The patient under test, if any.
    pub fn testing(&self) -> Option<&Patient> {
        match &self.state {
            AdmissionState::Testing(patient) => Some(patient),
            AdmissionState::Idle => None,
        }
    }

    pub(crate) fn testing_mut(&mut self) -> Option<&mut Patient> {
        match &mut self.state {
            AdmissionState::Testing(patient) => Some(patient),
            AdmissionState::Idle => None,
        }
    }

    /// `Idle` + non-empty outer queue: pops the front patient, enters
    /// `Testing` and returns the question to ask the oracle.
    ///
    /// Returns `None` while a test is in flight or when nobody is waiting.
    pub fn begin(&mut self, outer: &mut PatientQueue) -> Option<MatchQuery> {
        if !self.is_idle() {
            return None;
        }
        let patient = outer.dequeue_front()?;
        let query = MatchQuery::new(&patient, &self.rule);
        self.state = AdmissionState::Testing(patient);
        Some(query)
    }

    /// Applies the oracle's answer and returns to `Idle`.
    ///
    /// A non-empty match moves the patient onto the inner queue; an empty
    /// match or an error rejects it. Returns `None` if no test was in flight.
    pub fn finish(
        &mut self,
        result: Result<Vec<Code>, EnvError>,
        inner: &mut PatientQueue,
    ) -> Option<AdmissionResolution> {
        let patient = match std::mem::replace(&mut self.state, AdmissionState::Idle) {
            AdmissionState::Testing(patient) => patient,
            AdmissionState::Idle => return None,
        };
        let id = patient.id;

        let resolution = match result {
            Ok(matched) if !matched.is_empty() => {
                let position = inner.enqueue(patient);
                AdmissionResolution {
                    outcome: AdmissionOutcome::Admitted {
                        patient: id,
                        matched,
                        position,
                    },
                    rejected: None,
                }
            }
            Ok(_) => AdmissionResolution {
                outcome: AdmissionOutcome::Rejected {
                    patient: id,
                    reason: RejectReason::NoMatch,
                },
                rejected: Some(patient),
            },
            Err(err) => AdmissionResolution {
                outcome: AdmissionOutcome::Rejected {
                    patient: id,
                    reason: RejectReason::OracleFailure(err.to_string()),
                },
                rejected: Some(patient),
            },
        };
        Some(resolution)
    }

    /// Drops any in-flight test (used on teardown).
    pub fn reset(&mut self) -> Option<Patient> {
        match std::mem::replace(&mut self.state, AdmissionState::Idle) {
            AdmissionState::Testing(patient) => Some(patient),
            AdmissionState::Idle => None,
        }
    }
}
