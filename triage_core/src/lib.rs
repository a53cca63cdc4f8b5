//! Triage Core - discrete-event triage queueing engine
//!
//! Moves simulated patients through an admission gate and a pool of
//! specialist handlers. Every decision asks an external classification
//! oracle, and the engine keeps three guarantees while those calls are
//! pending:
//! 1. **No double admission**: one patient under admission test at a time, in arrival order
//! 2. **No double assignment**: a handler's busy flag spans assignment to release
//! 3. **No stale writes**: answers from a stopped or restarted run are discarded

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod matching;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod routing;
pub mod session;
pub mod simulation;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use admission::{AdmissionController, AdmissionOutcome, AdmissionState, RejectReason};
pub use clock::{Clock, TimerHandle};
pub use config::{HandlerConfig, SimulationConfig};
pub use error::TriageError;
pub use events::{DecisionStage, DischargeReason, DischargeRecord, ReturnReason, TimedEvent, TriageEvent};
pub use matching::{diagnoses_matching, MatchQuery};
pub use metrics::TriageMetrics;
pub use model::{CatalogEntry, Diagnosis, DiagnosisCatalog, DiagnosisStatus, Handler, Patient};
pub use queue::{PatientQueue, QueueKind};
pub use routing::{RoutingBinding, RoutingController, RoutingOutcome};
pub use session::{conclude, HandlerSession, SessionReport, SessionVerdict};
pub use simulation::{SimAction, SimulationSnapshot, SimulationState, TriageSimulation};
