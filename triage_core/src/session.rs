//! Handler sessions - one specialist attending one patient.
//!
//! ```text
//!   specialty match ──► mark treated ──► escalation match ──► mark admitted
//!                                                                │
//!          ┌─────────────────────────────────────────────────────┘
//!          ▼
//!   any `admitted` left     → back to inner queue (Escalated)
//!   all treated             → discharge "have a nice day"
//!   some treated, rest none → back to inner queue (Referred)
//!   nothing matched         → discharge "we can't help you"
//! ```
//!
//! The handler's busy flag is cleared on every exit path. The normal path
//! releases explicitly; `HandlerLease` covers the session future being
//! dropped mid-flight.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;
use triage_env::{Code, PatientId, RuleExpression};

use crate::events::{DischargeReason, ReturnReason, TriageEvent};
use crate::matching::MatchQuery;
use crate::model::Patient;
use crate::simulation::SimulationState;

/// An open session, captured under the simulation lock.
#[derive(Debug, Clone)]
pub struct HandlerSession {
    pub handler: usize,
    pub patient: PatientId,

    /// Run the session belongs to
    pub generation: u64,

    /// Specialty question for the attending patient
    pub specialty: MatchQuery,

    pub escalation_rule: Option<RuleExpression>,
}

/// What a session decided for its patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum SessionVerdict {
    Discharge(DischargeReason),
    Return(ReturnReason),
}

impl SessionVerdict {
    /// Outcome text for discharges.
    pub fn message(&self) -> Option<&'static str> {
        match self {
            SessionVerdict::Discharge(reason) => Some(reason.message()),
            SessionVerdict::Return(_) => None,
        }
    }
}

/// Summary of a concluded session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub handler: usize,
    pub patient: PatientId,
    pub treated: Vec<Code>,
    pub escalated: Vec<Code>,
    pub verdict: SessionVerdict,

    /// Inner-queue position for returned patients
    pub position: Option<usize>,
}

/// Decides where the patient goes after treatment.
///
/// `matched` is the number of diagnoses the specialty rule matched in this
/// session. Returns past `max_escalations` turn into an unhelped discharge.
pub fn conclude(patient: &Patient, matched: usize, max_escalations: u32) -> SessionVerdict {
    let wants_return = if patient.has_admitted() {
        Some(ReturnReason::Escalated)
    } else if patient.all_treated() {
        return SessionVerdict::Discharge(DischargeReason::Recovered);
    } else if matched > 0 {
        Some(ReturnReason::Referred)
    } else {
        None
    };

    match wants_return {
        Some(reason) if patient.escalation_count < max_escalations => {
            SessionVerdict::Return(reason)
        }
        _ => SessionVerdict::Discharge(DischargeReason::Unhelped),
    }
}

/// Releases a handler if its session future is dropped before concluding.
///
/// The attending patient goes back to the inner queue. Nothing happens when
/// the run was torn down in the meantime (generation changed) or after
/// `disarm`.
pub(crate) struct HandlerLease {
    state: Arc<Mutex<SimulationState>>,
    handler: usize,
    generation: u64,
    armed: bool,
}

impl HandlerLease {
    pub(crate) fn new(state: Arc<Mutex<SimulationState>>, handler: usize, generation: u64) -> Self {
        Self {
            state,
            handler,
            generation,
            armed: true,
        }
    }

    /// Must be called before the simulation lock is taken for the final
    /// release, or whenever the session ends on its own.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation() != self.generation {
            return;
        }
        warn!(handler = self.handler, "session dropped before concluding");
        state.interrupt_session(self.handler);
    }
}

impl SimulationState {
    /// Frees a handler whose session never concluded and puts its patient
    /// back on the inner queue.
    pub(crate) fn interrupt_session(&mut self, handler: usize) {
        self.end_session(handler);
        let Some(patient) = self.handler_mut(handler).and_then(|h| h.release()) else {
            return;
        };
        let id = patient.id;
        let position = self.inner_mut().requeue(patient);
        self.metrics_mut().sessions_interrupted += 1;
        self.record(TriageEvent::Returned {
            patient: id,
            handler,
            reason: ReturnReason::Interrupted,
            position,
        });
    }
}
