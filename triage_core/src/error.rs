//! Error types for the triage engine.

use thiserror::Error;
use triage_env::{Code, EnvError, PatientId};

/// Errors surfaced by the triage engine's public operations.
///
/// Oracle failures during admission, routing or sessions are *not* reported
/// through this type; they are recovered locally as "no match" outcomes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TriageError {
    /// Speed multiplier must be positive and finite
    #[error("Invalid speed multiplier: {0}")]
    InvalidSpeed(f64),

    /// No patient with this id is held by the simulation
    #[error("Unknown patient: {0}")]
    UnknownPatient(PatientId),

    /// Handler index out of range
    #[error("Unknown handler: {0}")]
    UnknownHandler(usize),

    /// The patient has no diagnosis with this code
    #[error("Patient {patient} has no diagnosis {code}")]
    UnknownDiagnosis { patient: PatientId, code: Code },

    /// Handler is already attending a patient
    #[error("Handler {0} is busy")]
    HandlerBusy(usize),

    /// The diagnosis catalog has no entries to draw from
    #[error("Diagnosis catalog is empty")]
    EmptyCatalog,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(String),

    /// Environment-layer error (validation of codes/rules, context)
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl TriageError {
    /// Creates an invalid-configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
