//! Event log - every state transition as plain data.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use triage_env::{Code, PatientId};

use crate::admission::AdmissionOutcome;
use crate::model::Patient;
use crate::routing::RoutingOutcome;

/// Why a patient left the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DischargeReason {
    /// Failed the admission rule
    Rejected,
    /// Every diagnosis treated
    Recovered,
    /// Untreated diagnoses left and nobody could help
    Unhelped,
}

impl DischargeReason {
    /// What the patient is told on the way out.
    pub fn message(&self) -> &'static str {
        match self {
            DischargeReason::Rejected => "go home",
            DischargeReason::Recovered => "have a nice day",
            DischargeReason::Unhelped => "we can't help you",
        }
    }
}

/// A discharged patient and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DischargeRecord {
    pub patient: Patient,
    pub reason: DischargeReason,

    /// Simulated time of discharge (ms)
    pub at_ms: u64,
}

/// Which decision an oracle call belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Admission,
    Routing,
    Session,
    Escalation,
}

impl std::fmt::Display for DecisionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DecisionStage::Admission => "admission",
            DecisionStage::Routing => "routing",
            DecisionStage::Session => "session",
            DecisionStage::Escalation => "escalation",
        };
        f.write_str(name)
    }
}

/// Why a patient went back onto the inner queue after a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnReason {
    /// Diagnoses flagged `admitted` remain
    Escalated,
    /// Some diagnoses treated, others still untouched
    Referred,
    /// The session future was dropped before it concluded
    Interrupted,
}

/// A state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriageEvent {
    Started {
        generation: u64,
    },
    Stopped {
        generation: u64,
    },
    SpeedChanged {
        speed: f64,
    },
    Spawned {
        patient: PatientId,
        diagnoses: Vec<Code>,
        position: usize,
    },
    Admission(AdmissionOutcome),
    Routing(RoutingOutcome),
    Treated {
        patient: PatientId,
        handler: usize,
        codes: Vec<Code>,
    },
    Escalated {
        patient: PatientId,
        codes: Vec<Code>,
    },
    Returned {
        patient: PatientId,
        handler: usize,
        reason: ReturnReason,
        position: usize,
    },
    Discharged {
        patient: PatientId,
        reason: DischargeReason,
    },
    OracleFailure {
        patient: PatientId,
        stage: DecisionStage,
        error: String,
    },
    StaleResponse {
        patient: PatientId,
        stage: DecisionStage,
    },
}

/// An event stamped with simulated time and run generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub at_ms: u64,
    pub generation: u64,
    pub event: TriageEvent,
}

/// Bounded FIFO of events; the oldest are dropped past `capacity`.
#[derive(Debug, Clone)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<TimedEvent>,
    dropped: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: TimedEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    /// Takes every buffered event, oldest first.
    pub fn drain(&mut self) -> Vec<TimedEvent> {
        self.events.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimedEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events lost to the capacity limit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
