//! Simulation orchestrator - owns all queues, flags and handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     TriageSimulation                           │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │  Arc<Mutex<SimulationState>>                              │  │
//! │  │   clock ─ outer queue ─ admission ─ inner queue           │  │
//! │  │   routing ─ handlers ─ discharged ─ events ─ metrics      │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │        ▲ lock, mutate, unlock            │ MatchQuery          │
//! │        │                                 ▼                     │
//! │  ┌───────────────┐              ┌────────────────────────┐     │
//! │  │ TriageContext │◄── timeout ──│ ClassificationOracle   │     │
//! │  └───────────────┘              └────────────────────────┘     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every decision follows the same shape: lock, take the exclusion flag and
//! build the oracle question, unlock, await the oracle, lock again and apply
//! the answer. The state lock is never held across an `.await`.
//!
//! Each decision captures the run's `generation` before its oracle call. If
//! the run was stopped or restarted meanwhile, the answer is discarded.
//!
//! # Usage
//!
//! ```ignore
//! use triage_core::{SimulationConfig, TriageSimulation};
//! use triage_env::TokioContext;
//!
//! let sim = TriageSimulation::new(TokioContext::shared(), oracle, SimulationConfig::default())?;
//! sim.run(Duration::from_secs(60), Duration::from_millis(50)).await;
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use triage_env::{ClassificationOracle, Code, EnvError, PatientId, TriageContext};

use crate::admission::{AdmissionController, AdmissionOutcome, RejectReason};
use crate::clock::Clock;
use crate::config::SimulationConfig;
use crate::error::TriageError;
use crate::events::{
    DecisionStage, DischargeReason, DischargeRecord, EventLog, TimedEvent, TriageEvent,
};
use crate::matching::MatchQuery;
use crate::metrics::TriageMetrics;
use crate::model::{Diagnosis, DiagnosisCatalog, DiagnosisStatus, Handler, Patient};
use crate::queue::{PatientQueue, QueueKind};
use crate::routing::{RoutingController, RoutingOutcome};
use crate::session::{conclude, HandlerLease, HandlerSession, SessionReport, SessionVerdict};

/// Work a clock timer can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimAction {
    SpawnPatient,
    AdmissionTick,
    RoutingTick,
    /// Start the session for `patient` on the handler at this index.
    /// Ignored once the handler has moved on to someone else.
    Attend { handler: usize, patient: PatientId },
}

// =============================================================================
// STATE
// =============================================================================

/// Everything a run mutates. Only reachable through `TriageSimulation`.
#[derive(Debug)]
pub struct SimulationState {
    generation: u64,
    running: bool,

    /// Environment time at the last lock
    now: Duration,

    clock: Clock<SimAction>,
    outer: PatientQueue,
    inner: PatientQueue,
    admission: AdmissionController,
    routing: RoutingController,
    handlers: Vec<Handler>,

    /// Handlers with a session in progress
    sessions: BTreeSet<usize>,

    discharged: VecDeque<DischargeRecord>,
    discharge_capacity: usize,
    events: EventLog,
    metrics: TriageMetrics,

    rng: StdRng,
    next_arrival: u64,

    /// Arrivals triggered by the spawn timer (for `max_patients`)
    timed_arrivals: u64,
}

impl SimulationState {
    fn fresh(
        config: &SimulationConfig,
        now: Duration,
        seed: u64,
        generation: u64,
    ) -> Result<Self, TriageError> {
        let mut clock = Clock::starting_at(now);
        clock.set_speed(config.speed)?;

        Ok(Self {
            generation,
            running: false,
            now,
            clock,
            outer: PatientQueue::new(QueueKind::Outer),
            inner: PatientQueue::new(QueueKind::Inner),
            admission: AdmissionController::new(config.admission_rule.clone()),
            routing: RoutingController::new(config.routing_bindings(), config.max_requeues),
            handlers: config.build_handlers(),
            sessions: BTreeSet::new(),
            discharged: VecDeque::new(),
            discharge_capacity: config.event_capacity,
            events: EventLog::new(config.event_capacity),
            metrics: TriageMetrics::default(),
            rng: StdRng::seed_from_u64(seed),
            next_arrival: 0,
            timed_arrivals: 0,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn handler_mut(&mut self, index: usize) -> Option<&mut Handler> {
        self.handlers.get_mut(index)
    }

    pub(crate) fn inner_mut(&mut self) -> &mut PatientQueue {
        &mut self.inner
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut TriageMetrics {
        &mut self.metrics
    }

    pub(crate) fn end_session(&mut self, handler: usize) {
        self.sessions.remove(&handler);
    }

    pub(crate) fn record(&mut self, event: TriageEvent) {
        self.events.push(TimedEvent {
            at_ms: self.now.as_millis() as u64,
            generation: self.generation,
            event,
        });
    }

    fn arrive(&mut self, diagnoses: Vec<Diagnosis>) -> PatientId {
        let id = PatientId::from_seed(self.rng.gen());
        let codes: Vec<Code> = diagnoses.iter().map(|d| d.code.clone()).collect();
        let patient = Patient::new(id, self.next_arrival, diagnoses);
        self.next_arrival += 1;

        let position = self.outer.enqueue(patient);
        self.metrics.spawned += 1;
        debug!(patient = %id, position, diagnoses = codes.len(), "patient arrived");
        self.record(TriageEvent::Spawned {
            patient: id,
            diagnoses: codes,
            position,
        });
        id
    }

    fn discharge(&mut self, patient: Patient, reason: DischargeReason) {
        info!(patient = %patient.id, ?reason, message = reason.message(), "patient discharged");
        self.metrics.record_discharge(reason);
        self.record(TriageEvent::Discharged {
            patient: patient.id,
            reason,
        });
        if self.discharged.len() == self.discharge_capacity {
            self.discharged.pop_front();
        }
        self.discharged.push_back(DischargeRecord {
            patient,
            reason,
            at_ms: self.now.as_millis() as u64,
        });
    }

    /// Cancels timers, drops in-flight work and invalidates pending oracle
    /// answers. Metrics, events and discharge records are kept.
    fn teardown(&mut self, config: &SimulationConfig) {
        self.clock.cancel_all();
        self.admission.reset();
        self.routing.reset();
        self.outer.clear();
        self.inner.clear();
        self.handlers = config.build_handlers();
        self.sessions.clear();
        self.running = false;
        self.generation += 1;
    }

    /// Finds a patient wherever it currently lives.
    fn patient_mut(&mut self, id: PatientId) -> Option<&mut Patient> {
        if self.outer.contains(id) {
            return self.outer.get_mut(id);
        }
        if self.inner.contains(id) {
            return self.inner.get_mut(id);
        }
        if self.admission.testing().is_some_and(|p| p.id == id) {
            return self.admission.testing_mut();
        }
        if self.routing.in_flight().is_some_and(|p| p.id == id) {
            return self.routing.in_flight_mut();
        }
        self.handlers
            .iter_mut()
            .filter_map(Handler::attending_mut)
            .find(|p| p.id == id)
    }

    fn open_session(
        &mut self,
        handler: usize,
        expected: Option<PatientId>,
    ) -> Result<Option<HandlerSession>, TriageError> {
        let h = self
            .handlers
            .get(handler)
            .ok_or(TriageError::UnknownHandler(handler))?;
        let Some(patient) = h.attending() else {
            return Ok(None);
        };
        if expected.is_some_and(|id| id != patient.id) {
            debug!(handler, attending = %patient.id, "attend timer outlived its patient");
            return Ok(None);
        }
        if self.sessions.contains(&handler) {
            return Ok(None);
        }

        let session = HandlerSession {
            handler,
            patient: patient.id,
            generation: self.generation,
            specialty: MatchQuery::new(patient, &h.specialty_rule),
            escalation_rule: h.escalation_rule.clone(),
        };
        self.sessions.insert(handler);
        Ok(Some(session))
    }

    /// Marks matched diagnoses treated and, if the handler escalates, builds
    /// the escalation question for what is left.
    fn treat(&mut self, session: &HandlerSession, matched: &[Code]) -> Option<MatchQuery> {
        let patient = self
            .handlers
            .get_mut(session.handler)
            .and_then(Handler::attending_mut)?;
        let treated = patient.mark_treated(matched);
        let escalation = match &session.escalation_rule {
            Some(rule) if patient.has_pending() => Some(MatchQuery::new(patient, rule)),
            _ => None,
        };

        self.metrics.diagnoses_treated += treated as u64;
        if treated > 0 {
            self.record(TriageEvent::Treated {
                patient: session.patient,
                handler: session.handler,
                codes: matched.to_vec(),
            });
        }
        escalation
    }

    /// Flags untouched diagnoses as admitted. Returns the codes flagged.
    fn flag_admitted(&mut self, session: &HandlerSession, flagged: &[Code]) -> Vec<Code> {
        let Some(patient) = self
            .handlers
            .get_mut(session.handler)
            .and_then(Handler::attending_mut)
        else {
            return Vec::new();
        };
        let codes: Vec<Code> = flagged
            .iter()
            .filter(|code| {
                patient
                    .diagnosis(code)
                    .is_some_and(|d| d.status == DiagnosisStatus::None)
            })
            .cloned()
            .collect();
        patient.mark_admitted(&codes);

        if !codes.is_empty() {
            self.record(TriageEvent::Escalated {
                patient: session.patient,
                codes: codes.clone(),
            });
        }
        codes
    }

    fn close_session(
        &mut self,
        session: &HandlerSession,
        treated: Vec<Code>,
        escalated: Vec<Code>,
        max_escalations: u32,
    ) -> Option<SessionReport> {
        self.end_session(session.handler);
        let mut patient = self.handlers.get_mut(session.handler)?.release()?;
        let verdict = conclude(&patient, treated.len(), max_escalations);
        let id = patient.id;

        let position = match verdict {
            SessionVerdict::Return(reason) => {
                patient.escalation_count += 1;
                let position = self.inner.requeue(patient);
                self.metrics.escalated += 1;
                info!(patient = %id, handler = session.handler, ?reason, position, "patient returned to inner queue");
                self.record(TriageEvent::Returned {
                    patient: id,
                    handler: session.handler,
                    reason,
                    position,
                });
                Some(position)
            }
            SessionVerdict::Discharge(reason) => {
                self.discharge(patient, reason);
                None
            }
        };

        Some(SessionReport {
            handler: session.handler,
            patient: id,
            treated,
            escalated,
            verdict,
            position,
        })
    }

    fn snapshot(&self) -> SimulationSnapshot {
        SimulationSnapshot {
            at_ms: self.now.as_millis() as u64,
            generation: self.generation,
            running: self.running,
            speed: self.clock.speed(),
            outer: self.outer.iter().cloned().collect(),
            inner: self.inner.iter().cloned().collect(),
            admitting: self.admission.testing().cloned(),
            routing: self.routing.in_flight().cloned(),
            handlers: self.handlers.clone(),
            discharged: self.discharged.iter().cloned().collect(),
            pending_timers: self.clock.pending(),
            metrics: self.metrics.clone(),
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Plain-data view of a run for presentation and export.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSnapshot {
    pub at_ms: u64,
    pub generation: u64,
    pub running: bool,
    pub speed: f64,
    pub outer: Vec<Patient>,
    pub inner: Vec<Patient>,

    /// Patient under admission test
    pub admitting: Option<Patient>,

    /// Patient being routed
    pub routing: Option<Patient>,

    pub handlers: Vec<Handler>,

    /// Most recent discharges, oldest first
    pub discharged: Vec<DischargeRecord>,

    pub pending_timers: usize,
    pub metrics: TriageMetrics,
}

impl SimulationSnapshot {
    /// Patients currently inside the clinic.
    pub fn census(&self) -> usize {
        self.outer.len()
            + self.inner.len()
            + usize::from(self.admitting.is_some())
            + usize::from(self.routing.is_some())
            + self.handlers.iter().filter(|h| h.attending().is_some()).count()
    }

    /// Checks the structural invariants: contiguous queue positions, busy
    /// flags matching attendance, and no patient held in two places.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (name, queue) in [("outer", &self.outer), ("inner", &self.inner)] {
            for (i, patient) in queue.iter().enumerate() {
                if patient.queue_position != Some(i + 1) {
                    return Err(format!(
                        "{name} queue: patient {} at index {i} has position {:?}",
                        patient.id, patient.queue_position
                    ));
                }
            }
        }

        for (index, handler) in self.handlers.iter().enumerate() {
            if handler.is_busy() != handler.attending().is_some() {
                return Err(format!(
                    "handler {index} ({}) busy={} but attending={}",
                    handler.title,
                    handler.is_busy(),
                    handler.attending().is_some()
                ));
            }
        }

        let mut seen = BTreeSet::new();
        let held = self
            .outer
            .iter()
            .chain(self.inner.iter())
            .chain(self.admitting.iter())
            .chain(self.routing.iter())
            .chain(self.handlers.iter().filter_map(Handler::attending));
        for patient in held {
            if !seen.insert(patient.id) {
                return Err(format!("patient {} held in two places", patient.id));
            }
        }
        Ok(())
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// The triage simulation.
///
/// Generic over the environment context and the classification oracle so the
/// same engine runs under tokio or the deterministic simulator. Cloning is
/// cheap and shares state.
pub struct TriageSimulation<Ctx, O>
where
    Ctx: TriageContext,
    O: ClassificationOracle,
{
    ctx: Arc<Ctx>,
    oracle: Arc<O>,
    config: Arc<SimulationConfig>,
    catalog: Arc<DiagnosisCatalog>,
    state: Arc<Mutex<SimulationState>>,
}

impl<Ctx, O> Clone for TriageSimulation<Ctx, O>
where
    Ctx: TriageContext,
    O: ClassificationOracle,
{
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            oracle: Arc::clone(&self.oracle),
            config: Arc::clone(&self.config),
            catalog: Arc::clone(&self.catalog),
            state: Arc::clone(&self.state),
        }
    }
}

impl<Ctx, O> TriageSimulation<Ctx, O>
where
    Ctx: TriageContext,
    O: ClassificationOracle,
{
    /// Creates a stopped simulation. Call `start()` to install the timers,
    /// or drive the ticks by hand.
    pub fn new(ctx: Arc<Ctx>, oracle: Arc<O>, config: SimulationConfig) -> Result<Self, TriageError> {
        config.validate()?;
        let catalog = config.build_catalog();
        let state = SimulationState::fresh(&config, ctx.now(), config.seed, 0)?;

        info!(
            oracle = oracle.name(),
            handlers = config.handlers.len(),
            seed = config.seed,
            "triage simulation created"
        );

        Ok(Self {
            ctx,
            oracle,
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    pub fn oracle(&self) -> &Arc<O> {
        &self.oracle
    }

    fn lock(&self) -> MutexGuard<'_, SimulationState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now = self.ctx.now();
        state
    }

    /// Locks the state if the run is still `generation`; otherwise counts
    /// the discarded answer and returns `None`.
    fn lock_current(
        &self,
        generation: u64,
        patient: PatientId,
        stage: DecisionStage,
    ) -> Option<MutexGuard<'_, SimulationState>> {
        let mut state = self.lock();
        if state.generation == generation {
            return Some(state);
        }
        debug!(%patient, %stage, generation, current = state.generation, "discarding stale oracle response");
        state.metrics.stale_responses += 1;
        state.record(TriageEvent::StaleResponse { patient, stage });
        None
    }

    /// Asks the oracle one question, bounded by the configured timeout.
    /// Failures are logged and counted; callers treat them as no match.
    async fn ask(
        &self,
        query: &MatchQuery,
        stage: DecisionStage,
        generation: u64,
    ) -> Result<Vec<Code>, EnvError> {
        if query.is_trivially_empty() {
            return Ok(Vec::new());
        }
        {
            let mut state = self.lock();
            if state.generation == generation {
                state.metrics.oracle_calls += 1;
            }
        }

        let result = query
            .resolve(self.ctx.as_ref(), self.oracle.as_ref(), self.config.oracle_timeout())
            .await;

        if let Err(err) = &result {
            warn!(patient = %query.patient, %stage, error = %err, "oracle call failed, treating as no match");
            let mut state = self.lock();
            if state.generation == generation {
                match err {
                    EnvError::Timeout(_) => state.metrics.oracle_timeouts += 1,
                    _ => state.metrics.oracle_failures += 1,
                }
                state.record(TriageEvent::OracleFailure {
                    patient: query.patient,
                    stage,
                    error: err.to_string(),
                });
            }
        }
        result
    }

    // =========================================================================
    // SPAWNING
    // =========================================================================

    /// Adds a patient with 1..=`max_diagnoses` distinct catalog diagnoses to
    /// the back of the outer queue.
    pub fn spawn_patient(&self) -> Result<PatientId, TriageError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let diagnoses = self
            .catalog
            .sample(&mut state.rng, self.config.max_diagnoses)?;
        Ok(state.arrive(diagnoses))
    }

    /// Adds a patient with the given diagnoses.
    pub fn spawn_patient_with(&self, diagnoses: Vec<Diagnosis>) -> PatientId {
        self.lock().arrive(diagnoses)
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// One admission step: tests the front of the outer queue against the
    /// base admission rule.
    ///
    /// Returns `None` if a test is already in flight, nobody is waiting, or
    /// the run was torn down while the oracle was answering.
    pub async fn admission_tick(&self) -> Option<AdmissionOutcome> {
        let (generation, query) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let query = state.admission.begin(&mut state.outer)?;
            (state.generation, query)
        };
        debug!(patient = %query.patient, "admission test started");

        let result = self.ask(&query, DecisionStage::Admission, generation).await;

        let mut guard = self.lock_current(generation, query.patient, DecisionStage::Admission)?;
        let state = &mut *guard;
        let resolution = state.admission.finish(result, &mut state.inner)?;

        match &resolution.outcome {
            AdmissionOutcome::Admitted {
                patient, position, ..
            } => {
                state.metrics.admitted += 1;
                info!(%patient, position, message = resolution.outcome.message(), "patient admitted");
            }
            AdmissionOutcome::Rejected { patient, reason } => {
                if let RejectReason::OracleFailure(error) = reason {
                    debug!(%patient, %error, "rejected after oracle failure");
                }
            }
        }
        state.record(TriageEvent::Admission(resolution.outcome.clone()));
        if let Some(patient) = resolution.rejected {
            state.discharge(patient, DischargeReason::Rejected);
        }
        Some(resolution.outcome)
    }

    // =========================================================================
    // ROUTING
    // =========================================================================

    /// One routing step: tries the front of the inner queue against every
    /// binding in order and assigns the first free matching handler.
    pub async fn routing_tick(&self) -> Option<RoutingOutcome> {
        let (generation, patient, bindings) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let patient = state.routing.begin(&mut state.inner)?;
            (state.generation, patient, state.routing.bindings().len())
        };
        debug!(%patient, "routing started");

        for index in 0..bindings {
            let query = {
                let guard = self.lock_current(generation, patient, DecisionStage::Routing)?;
                guard.routing.query(index, &guard.handlers)
            };
            let Some(query) = query else {
                continue;
            };

            let matched = match self.ask(&query, DecisionStage::Routing, generation).await {
                Ok(matched) if !matched.is_empty() => matched,
                _ => continue,
            };

            let assigned = {
                let mut guard = self.lock_current(generation, patient, DecisionStage::Routing)?;
                let state = &mut *guard;
                let outcome = state.routing.assign(index, &mut state.handlers, matched);
                if let Some(RoutingOutcome::Assigned { handler, .. }) = &outcome {
                    let handler = *handler;
                    state.metrics.assigned += 1;
                    info!(%patient, handler, title = %state.handlers[handler].title, "patient assigned");
                    if state.running {
                        state.clock.after(
                            self.config.treatment_time(),
                            SimAction::Attend { handler, patient },
                        );
                    }
                }
                if let Some(outcome) = &outcome {
                    state.record(TriageEvent::Routing(outcome.clone()));
                }
                outcome
            };
            if assigned.is_some() {
                return assigned;
            }
            debug!(%patient, binding = index, "handler taken while oracle was answering");
        }

        let mut guard = self.lock_current(generation, patient, DecisionStage::Routing)?;
        let state = &mut *guard;
        let (outcome, gave_up) = state.routing.finish_unmatched(&mut state.inner)?;
        match &outcome {
            RoutingOutcome::Requeued {
                position,
                requeue_count,
                ..
            } => {
                state.metrics.requeued += 1;
                debug!(%patient, position, requeue_count, "no handler available, re-queued");
            }
            RoutingOutcome::GaveUp { requeue_count, .. } => {
                warn!(%patient, requeue_count, "re-queue limit reached");
            }
            RoutingOutcome::Assigned { .. } => {}
        }
        state.record(TriageEvent::Routing(outcome.clone()));
        if let Some(patient) = gave_up {
            state.discharge(patient, DischargeReason::Unhelped);
        }
        Some(outcome)
    }

    // =========================================================================
    // HANDLER SESSIONS
    // =========================================================================

    /// Runs the session for the patient attended by `handler`.
    ///
    /// Returns `Ok(None)` if the handler is free, a session is already
    /// running on it, or the run was torn down meanwhile. The handler is
    /// released on every path, including an oracle failure and the future
    /// being dropped.
    pub async fn attend(&self, handler: usize) -> Result<Option<SessionReport>, TriageError> {
        self.attend_patient(handler, None).await
    }

    async fn attend_patient(
        &self,
        handler: usize,
        expected: Option<PatientId>,
    ) -> Result<Option<SessionReport>, TriageError> {
        let session = self.lock().open_session(handler, expected)?;
        let Some(session) = session else {
            return Ok(None);
        };
        let generation = session.generation;
        let patient = session.patient;
        let mut lease = HandlerLease::new(Arc::clone(&self.state), handler, generation);
        debug!(%patient, handler, "session started");

        let treated = self
            .ask(&session.specialty, DecisionStage::Session, generation)
            .await
            .unwrap_or_default();

        let escalation = {
            let Some(mut guard) = self.lock_current(generation, patient, DecisionStage::Session)
            else {
                lease.disarm();
                return Ok(None);
            };
            guard.treat(&session, &treated)
        };

        let mut escalated = Vec::new();
        if let Some(query) = escalation {
            let flagged = self
                .ask(&query, DecisionStage::Escalation, generation)
                .await
                .unwrap_or_default();
            let Some(mut guard) = self.lock_current(generation, patient, DecisionStage::Escalation)
            else {
                lease.disarm();
                return Ok(None);
            };
            escalated = guard.flag_admitted(&session, &flagged);
        }

        lease.disarm();
        let Some(mut guard) = self.lock_current(generation, patient, DecisionStage::Session) else {
            return Ok(None);
        };
        let report = guard.close_session(&session, treated, escalated, self.config.max_escalations);
        if let Some(report) = &report {
            debug!(%patient, handler, verdict = ?report.verdict, "session concluded");
        }
        Ok(report)
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Marks a held patient's diagnosis `admitted` so a later session sends
    /// it back for further care. Returns false if it was already treated or
    /// already admitted.
    pub fn escalate(&self, patient: PatientId, code: &Code) -> Result<bool, TriageError> {
        let mut state = self.lock();
        let held = state
            .patient_mut(patient)
            .ok_or(TriageError::UnknownPatient(patient))?;
        if held.diagnosis(code).is_none() {
            return Err(TriageError::UnknownDiagnosis {
                patient,
                code: code.clone(),
            });
        }
        let changed = held.mark_admitted(std::slice::from_ref(code)) > 0;
        if changed {
            info!(%patient, %code, "diagnosis escalated");
            state.record(TriageEvent::Escalated {
                patient,
                codes: vec![code.clone()],
            });
        }
        Ok(changed)
    }

    /// Changes the speed multiplier for delays scheduled from now on.
    pub fn set_speed(&self, multiplier: f64) -> Result<(), TriageError> {
        let mut state = self.lock();
        state.clock.set_speed(multiplier)?;
        info!(speed = multiplier, "speed changed");
        state.record(TriageEvent::SpeedChanged { speed: multiplier });
        Ok(())
    }

    /// Installs the recurring spawn, admission and routing timers, plus a
    /// treatment timer for every handler assigned while stopped.
    /// Does nothing if already running.
    pub fn start(&self) {
        let mut state = self.lock();
        if state.running {
            return;
        }
        let now = state.now;
        let stale = state.clock.advance_to(now);
        debug_assert!(stale.is_empty(), "timers pending while stopped");

        let config = &self.config;
        state.clock.every(
            Duration::from_millis(config.spawn_interval_ms),
            SimAction::SpawnPatient,
        );
        state.clock.every(
            Duration::from_millis(config.admission_interval_ms),
            SimAction::AdmissionTick,
        );
        state.clock.every(
            Duration::from_millis(config.routing_interval_ms),
            SimAction::RoutingTick,
        );
        let waiting: Vec<(usize, PatientId)> = state
            .handlers
            .iter()
            .enumerate()
            .filter(|(index, _)| !state.sessions.contains(index))
            .filter_map(|(index, h)| h.attending().map(|p| (index, p.id)))
            .collect();
        for (handler, patient) in waiting {
            debug!(%patient, handler, "scheduling treatment for earlier assignment");
            state.clock.after(
                config.treatment_time(),
                SimAction::Attend { handler, patient },
            );
        }
        state.running = true;

        let generation = state.generation;
        info!(generation, speed = state.clock.speed(), "simulation started");
        state.record(TriageEvent::Started { generation });
    }

    /// Cancels every timer, drops queued and in-flight patients and
    /// invalidates pending oracle answers. Returns the state as it was just
    /// before teardown.
    pub fn stop(&self) -> SimulationSnapshot {
        let mut state = self.lock();
        let snapshot = state.snapshot();
        let generation = state.generation;
        state.teardown(&self.config);
        info!(generation, "simulation stopped");
        state.record(TriageEvent::Stopped { generation });
        snapshot
    }

    /// Stops, resets everything (clock, speed, metrics and events included)
    /// and starts again with a fresh seed.
    pub fn restart(&self) -> Result<(), TriageError> {
        {
            let mut state = self.lock();
            let generation = state.generation + 1;
            let seed = self
                .ctx
                .derive_seed(self.config.seed.wrapping_add(generation));
            *state = SimulationState::fresh(&self.config, self.ctx.now(), seed, generation)?;
            info!(generation, seed, "simulation restarted");
        }
        self.start();
        Ok(())
    }

    /// Fires due timers and dispatches their actions. Ticks and sessions are
    /// spawned on the context. Returns the number of actions dispatched.
    pub fn pump(&self) -> usize {
        let actions = {
            let mut state = self.lock();
            let now = state.now;
            state.clock.advance_to(now)
        };
        for action in &actions {
            self.dispatch(*action);
        }
        actions.len()
    }

    fn dispatch(&self, action: SimAction) {
        match action {
            SimAction::SpawnPatient => {
                let allowed = {
                    let mut state = self.lock();
                    match self.config.max_patients {
                        Some(max) if state.timed_arrivals >= max => false,
                        _ => {
                            state.timed_arrivals += 1;
                            true
                        }
                    }
                };
                if allowed {
                    if let Err(err) = self.spawn_patient() {
                        warn!(error = %err, "failed to spawn patient");
                    }
                }
            }
            SimAction::AdmissionTick => {
                let sim = self.clone();
                self.ctx.spawn("admission-tick", async move {
                    sim.admission_tick().await;
                });
            }
            SimAction::RoutingTick => {
                let sim = self.clone();
                self.ctx.spawn("routing-tick", async move {
                    sim.routing_tick().await;
                });
            }
            SimAction::Attend { handler, patient } => {
                let sim = self.clone();
                self.ctx.spawn("handler-session", async move {
                    if let Err(err) = sim.attend_patient(handler, Some(patient)).await {
                        warn!(handler, error = %err, "session failed to start");
                    }
                });
            }
        }
    }

    /// Starts and pumps every `tick` until `duration` of context time has
    /// passed.
    pub async fn run(&self, duration: Duration, tick: Duration) {
        let tick = tick.max(Duration::from_millis(1));
        let deadline = self.ctx.now().saturating_add(duration);
        self.start();
        while self.ctx.now() < deadline {
            self.pump();
            self.ctx.sleep(tick).await;
        }
        self.pump();
    }

    // =========================================================================
    // OBSERVATION
    // =========================================================================

    pub fn snapshot(&self) -> SimulationSnapshot {
        self.lock().snapshot()
    }

    pub fn metrics(&self) -> TriageMetrics {
        self.lock().metrics.clone()
    }

    /// Takes every buffered event, oldest first.
    pub fn drain_events(&self) -> Vec<TimedEvent> {
        self.lock().events.drain()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn speed(&self) -> f64 {
        self.lock().clock.speed()
    }

    /// Whether a handler currently has a session in progress.
    pub fn in_session(&self, handler: usize) -> bool {
        self.lock().sessions.contains(&handler)
    }

    /// Retained discharge records with this reason, most recent first.
    pub fn discharges(&self, reason: DischargeReason) -> Vec<DischargeRecord> {
        self.lock()
            .discharged
            .iter()
            .rev()
            .filter(|r| r.reason == reason)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerConfig;
    use crate::model::CatalogEntry;
    use crate::routing::RoutingBinding;
    use crate::testing::{code, rule, RuleTableOracle};
    use tokio::task::JoinSet;
    use triage_env::TokioContext;

    type Sim = TriageSimulation<TokioContext, RuleTableOracle>;

    fn config(admission: &str, handlers: &[(&str, &str)]) -> SimulationConfig {
        SimulationConfig {
            admission_rule: rule(admission),
            handlers: handlers
                .iter()
                .map(|(title, specialty)| HandlerConfig::new(*title, rule(specialty)))
                .collect(),
            bindings: Vec::new(),
            catalog: vec![
                CatalogEntry::new("10", "X").unwrap(),
                CatalogEntry::new("20", "Y").unwrap(),
            ],
            ..Default::default()
        }
    }

    fn sim(config: SimulationConfig, oracle: RuleTableOracle) -> (Sim, Arc<RuleTableOracle>) {
        let oracle = Arc::new(oracle);
        let sim = TriageSimulation::new(TokioContext::shared(), Arc::clone(&oracle), config).unwrap();
        (sim, oracle)
    }

    fn dx(codes: &[&str]) -> Vec<Diagnosis> {
        codes.iter().map(|c| Diagnosis::new(code(c), "dx")).collect()
    }

    /// Spawns a patient and runs it through admission.
    async fn admitted(sim: &Sim, codes: &[&str]) -> PatientId {
        let id = sim.spawn_patient_with(dx(codes));
        let outcome = sim.admission_tick().await.unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Admitted { .. }));
        id
    }

    #[tokio::test]
    async fn test_admission_admits_match_and_rejects_rest() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        let p1 = sim.spawn_patient_with(dx(&["10"]));
        let p2 = sim.spawn_patient_with(dx(&["20"]));

        let first = sim.admission_tick().await.unwrap();
        let second = sim.admission_tick().await.unwrap();
        assert_eq!(first.message(), "go in");
        assert_eq!(second.message(), "go home");

        let snap = sim.snapshot();
        assert_eq!(snap.inner.iter().map(|p| p.id).collect::<Vec<_>>(), vec![p1]);
        assert_eq!(snap.inner[0].diagnoses[0].status, DiagnosisStatus::None);
        assert_eq!(snap.discharged.len(), 1);
        assert_eq!(snap.discharged[0].patient.id, p2);
        assert_eq!(snap.discharged[0].reason, DischargeReason::Rejected);
        assert!(snap.outer.is_empty());
        assert!(snap.admitting.is_none());

        // Idle with an empty outer queue stays idle
        assert!(sim.admission_tick().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_admission_ticks_are_single_flight() {
        let (sim, oracle) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new()
                .with_rule("<< 1", &["10"])
                .with_yields(3),
        );
        let spawned: Vec<PatientId> = (0..5).map(|_| sim.spawn_patient_with(dx(&["10"]))).collect();

        loop {
            let snap = sim.snapshot();
            if snap.outer.is_empty() && snap.admitting.is_none() {
                break;
            }
            let mut ticks = JoinSet::new();
            for _ in 0..4 {
                let sim = sim.clone();
                ticks.spawn(async move { sim.admission_tick().await });
            }
            while ticks.join_next().await.is_some() {}
        }

        assert_eq!(oracle.calls(), 5);
        assert_eq!(oracle.max_in_flight(), 1);
        // Tested in arrival order
        let inner: Vec<PatientId> = sim.snapshot().inner.iter().map(|p| p.id).collect();
        assert_eq!(inner, spawned);
    }

    #[tokio::test]
    async fn test_handler_treats_and_discharges() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        let p1 = admitted(&sim, &["10"]).await;

        let routed = sim.routing_tick().await.unwrap();
        assert!(matches!(routed, RoutingOutcome::Assigned { handler: 0, .. }));
        assert!(sim.snapshot().handlers[0].is_busy());

        let report = sim.attend(0).await.unwrap().unwrap();
        assert_eq!(report.patient, p1);
        assert_eq!(report.treated, vec![code("10")]);
        assert_eq!(report.verdict.message(), Some("have a nice day"));

        let snap = sim.snapshot();
        assert!(!snap.handlers[0].is_busy());
        assert!(snap.handlers[0].attending().is_none());
        let record = snap.discharged.last().unwrap();
        assert_eq!(record.patient.id, p1);
        assert_eq!(record.patient.diagnoses[0].status, DiagnosisStatus::Treated);
        assert_eq!(sim.metrics().recovered, 1);
        snap.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_first_matching_binding_wins() {
        let mut cfg = config("<< 9", &[("A", "<< 1"), ("B", "<< 2")]);
        cfg.bindings = vec![
            RoutingBinding::new(rule("<< 1"), 0),
            RoutingBinding::new(rule("<< 2"), 1),
        ];
        let (sim, oracle) = sim(
            cfg,
            RuleTableOracle::new()
                .with_rule("<< 9", &["10"])
                .with_rule("<< 1", &["10"])
                .with_rule("<< 2", &["10"]),
        );
        admitted(&sim, &["10"]).await;
        admitted(&sim, &["10"]).await;

        let first = sim.routing_tick().await.unwrap();
        assert!(matches!(first, RoutingOutcome::Assigned { handler: 0, .. }));
        assert_eq!(oracle.asked(), vec!["<< 9", "<< 9", "<< 1"]);

        // A is busy now, so B gets the next patient without A being asked
        let second = sim.routing_tick().await.unwrap();
        assert!(matches!(second, RoutingOutcome::Assigned { handler: 1, .. }));
        assert_eq!(oracle.asked(), vec!["<< 9", "<< 9", "<< 1", "<< 2"]);
    }

    #[tokio::test]
    async fn test_busy_handler_is_never_double_assigned() {
        let (sim, oracle) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        let p1 = admitted(&sim, &["10"]).await;
        let p2 = admitted(&sim, &["10"]).await;

        sim.routing_tick().await.unwrap();
        let calls = oracle.calls();
        let second = sim.routing_tick().await.unwrap();

        assert!(matches!(second, RoutingOutcome::Requeued { position: 1, .. }));
        // Busy handler skipped without asking the oracle
        assert_eq!(oracle.calls(), calls);
        let snap = sim.snapshot();
        assert_eq!(snap.handlers[0].attending().unwrap().id, p1);
        assert_eq!(snap.inner[0].id, p2);

        // Two concurrent attends on one handler run one session
        let (a, b) = tokio::join!(sim.attend(0), sim.attend(0));
        let reports = [a.unwrap(), b.unwrap()];
        assert_eq!(reports.iter().filter(|r| r.is_some()).count(), 1);
        assert!(!sim.in_session(0));
    }

    #[tokio::test]
    async fn test_unmatched_patient_requeued_once_per_tick() {
        let (sim, _) = sim(
            config("<< 9", &[("H", "<< 1")]),
            RuleTableOracle::new()
                .with_rule("<< 9", &["10", "30"])
                .with_rule("<< 1", &["10"]),
        );
        let p1 = admitted(&sim, &["30"]).await;
        let p2 = admitted(&sim, &["10"]).await;

        let outcome = sim.routing_tick().await.unwrap();
        assert_eq!(
            outcome,
            RoutingOutcome::Requeued {
                patient: p1,
                position: 2,
                requeue_count: 1,
            }
        );
        let snap = sim.snapshot();
        assert_eq!(snap.inner.iter().map(|p| p.id).collect::<Vec<_>>(), vec![p2, p1]);
        snap.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_requeue_limit_discharges_unhelped() {
        let mut cfg = config("<< 9", &[("H", "<< 1")]);
        cfg.max_requeues = 0;
        let (sim, _) = sim(cfg, RuleTableOracle::new().with_rule("<< 9", &["30"]));
        let p1 = admitted(&sim, &["30"]).await;

        let outcome = sim.routing_tick().await.unwrap();
        assert!(matches!(outcome, RoutingOutcome::GaveUp { .. }));
        let unhelped = sim.discharges(DischargeReason::Unhelped);
        assert_eq!(unhelped[0].patient.id, p1);
        assert_eq!(unhelped[0].reason.message(), "we can't help you");
    }

    #[tokio::test]
    async fn test_session_oracle_failure_releases_handler() {
        let mut cfg = config("<< 9", &[("H", "<< 1")]);
        cfg.bindings = vec![RoutingBinding::new(rule("<< 5"), 0)];
        let (sim, _) = sim(
            cfg,
            RuleTableOracle::new()
                .with_rule("<< 9", &["10"])
                .with_rule("<< 5", &["10"])
                .failing_rule("<< 1"),
        );
        admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();

        let report = sim.attend(0).await.unwrap().unwrap();

        assert_eq!(report.verdict, SessionVerdict::Discharge(DischargeReason::Unhelped));
        assert!(!sim.snapshot().handlers[0].is_busy());
        assert_eq!(sim.metrics().oracle_failures, 1);
    }

    #[tokio::test]
    async fn test_admission_oracle_failure_rejects() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new().failing());
        sim.spawn_patient_with(dx(&["10"]));

        let outcome = sim.admission_tick().await.unwrap();
        assert!(matches!(
            outcome,
            AdmissionOutcome::Rejected {
                reason: RejectReason::OracleFailure(_),
                ..
            }
        ));
        // Gate is free for the next patient
        sim.spawn_patient_with(dx(&["10"]));
        assert!(sim.admission_tick().await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_session_releases_handler() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        let p1 = admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();

        // Same state, stalled oracle: the session never concludes on its own
        let stalled = TriageSimulation {
            oracle: Arc::new(RuleTableOracle::new().stalled()),
            ..sim.clone()
        };
        let handle = tokio::spawn(async move { stalled.attend(0).await });
        tokio::task::yield_now().await;
        assert!(sim.in_session(0));
        handle.abort();
        assert!(handle.await.is_err());

        let snap = sim.snapshot();
        assert!(!snap.handlers[0].is_busy());
        assert_eq!(snap.inner[0].id, p1);
        assert!(!sim.in_session(0));
        assert_eq!(sim.metrics().sessions_interrupted, 1);
        snap.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_stale_response_discarded_after_stop() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new()
                .with_rule("<< 1", &["10"])
                .with_yields(4),
        );
        sim.spawn_patient_with(dx(&["10"]));

        let tick = {
            let sim = sim.clone();
            tokio::spawn(async move { sim.admission_tick().await })
        };
        tokio::task::yield_now().await;
        let before = sim.stop();
        assert!(before.admitting.is_some());

        assert!(tick.await.unwrap().is_none());
        let snap = sim.snapshot();
        assert!(snap.inner.is_empty());
        assert!(snap.admitting.is_none());
        assert_eq!(sim.metrics().stale_responses, 1);
        assert_eq!(sim.generation(), 1);
    }

    #[tokio::test]
    async fn test_stale_session_discarded_after_stop() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();

        let slow = TriageSimulation {
            oracle: Arc::new(
                RuleTableOracle::new()
                    .with_rule("<< 1", &["10"])
                    .with_yields(4),
            ),
            ..sim.clone()
        };
        let session = tokio::spawn(async move { slow.attend(0).await });
        tokio::task::yield_now().await;
        assert!(sim.in_session(0));
        sim.stop();

        assert!(session.await.unwrap().unwrap().is_none());
        let snap = sim.snapshot();
        assert!(!snap.handlers[0].is_busy());
        assert!(!sim.in_session(0));
        assert!(snap.discharged.is_empty());
        let metrics = sim.metrics();
        assert_eq!(metrics.stale_responses, 1);
        assert_eq!(metrics.sessions_interrupted, 0);
        assert_eq!(metrics.recovered, 0);
    }

    #[tokio::test]
    async fn test_stale_routing_discarded_after_stop() {
        let (sim, _) = sim(
            config("<< 1", &[("H", "<< 1")]),
            RuleTableOracle::new()
                .with_rule("<< 1", &["10"])
                .with_yields(4),
        );
        admitted(&sim, &["10"]).await;

        let tick = {
            let sim = sim.clone();
            tokio::spawn(async move { sim.routing_tick().await })
        };
        tokio::task::yield_now().await;
        assert!(sim.stop().routing.is_some());

        assert!(tick.await.unwrap().is_none());
        let snap = sim.snapshot();
        assert!(!snap.handlers[0].is_busy());
        assert!(snap.inner.is_empty());
        assert_eq!(sim.metrics().stale_responses, 1);
        assert_eq!(sim.metrics().assigned, 0);
    }

    /// Config whose recurring ticks stay out of the way of a short test.
    fn quiet_config(treatment_ms: u64) -> SimulationConfig {
        SimulationConfig {
            spawn_interval_ms: 60_000,
            admission_interval_ms: 60_000,
            routing_interval_ms: 60_000,
            treatment_ms,
            ..config("<< 1", &[("H", "<< 1")])
        }
    }

    #[tokio::test]
    async fn test_start_schedules_treatment_for_earlier_assignment() {
        let (sim, _) = sim(
            quiet_config(20),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        let p1 = admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();

        sim.start();
        assert_eq!(sim.snapshot().pending_timers, 4);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sim.pump(), 1);
        for _ in 0..50 {
            if !sim.snapshot().handlers[0].is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(!sim.snapshot().handlers[0].is_busy());
        let recovered = sim.discharges(DischargeReason::Recovered);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].patient.id, p1);
    }

    #[tokio::test]
    async fn test_manual_attend_retires_its_treatment_timer() {
        let (sim, _) = sim(
            quiet_config(20),
            RuleTableOracle::new().with_rule("<< 1", &["10"]),
        );
        sim.start();
        admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();
        sim.attend(0).await.unwrap().unwrap();

        // Push the next treatment timer far past the first one
        sim.set_speed(0.001).unwrap();
        let second = admitted(&sim, &["10"]).await;
        sim.routing_tick().await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(sim.pump(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snap = sim.snapshot();
        assert_eq!(snap.handlers[0].attending().map(|p| p.id), Some(second));
        assert!(!sim.in_session(0));
        assert_eq!(sim.metrics().recovered, 1);
        assert_eq!(snap.pending_timers, 4);
    }

    #[tokio::test]
    async fn test_escalation_returns_patient_for_specialist() {
        let mut cfg = config("<< 9", &[("Cardiologist", "<< 3"), ("GP", "<< 2")]);
        cfg.handlers[1].escalation_rule = Some(rule("<< 3"));
        cfg.bindings = vec![
            RoutingBinding::new(rule("<< 2"), 1),
            RoutingBinding::new(rule("<< 3"), 0),
        ];
        let (sim, _) = sim(
            cfg,
            RuleTableOracle::new()
                .with_rule("<< 9", &["20", "30"])
                .with_rule("<< 2", &["20"])
                .with_rule("<< 3", &["30"]),
        );
        let p1 = admitted(&sim, &["20", "30"]).await;

        let to_gp = sim.routing_tick().await.unwrap();
        assert!(matches!(to_gp, RoutingOutcome::Assigned { handler: 1, .. }));
        let gp = sim.attend(1).await.unwrap().unwrap();
        assert_eq!(gp.escalated, vec![code("30")]);
        assert_eq!(gp.verdict, SessionVerdict::Return(crate::events::ReturnReason::Escalated));

        let snap = sim.snapshot();
        assert_eq!(snap.inner[0].id, p1);
        assert_eq!(snap.inner[0].escalation_count, 1);
        assert_eq!(snap.inner[0].diagnoses[1].status, DiagnosisStatus::Admitted);

        let to_cardio = sim.routing_tick().await.unwrap();
        assert!(matches!(to_cardio, RoutingOutcome::Assigned { handler: 0, .. }));
        let cardio = sim.attend(0).await.unwrap().unwrap();
        assert_eq!(cardio.verdict.message(), Some("have a nice day"));
    }

    #[tokio::test]
    async fn test_partial_treatment_is_referred_back() {
        let (sim, _) = sim(
            config("<< 9", &[("H", "<< 1")]),
            RuleTableOracle::new()
                .with_rule("<< 9", &["10", "20"])
                .with_rule("<< 1", &["10"]),
        );
        admitted(&sim, &["10", "20"]).await;
        sim.routing_tick().await.unwrap();

        let report = sim.attend(0).await.unwrap().unwrap();
        assert_eq!(
            report.verdict,
            SessionVerdict::Return(crate::events::ReturnReason::Referred)
        );
        assert_eq!(report.position, Some(1));
        assert_eq!(sim.metrics().escalated, 1);
    }

    #[tokio::test]
    async fn test_escalate_marks_held_patient() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new());
        let p1 = sim.spawn_patient_with(dx(&["10"]));

        assert_eq!(sim.escalate(p1, &code("10")), Ok(true));
        assert_eq!(sim.escalate(p1, &code("10")), Ok(false));
        assert_eq!(
            sim.snapshot().outer[0].diagnoses[0].status,
            DiagnosisStatus::Admitted
        );
        assert!(matches!(
            sim.escalate(p1, &code("99")),
            Err(TriageError::UnknownDiagnosis { .. })
        ));
        let stranger = PatientId::from_seed(12345);
        assert_eq!(
            sim.escalate(stranger, &code("10")),
            Err(TriageError::UnknownPatient(stranger))
        );
    }

    #[tokio::test]
    async fn test_attend_unknown_or_free_handler() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new());
        assert_eq!(sim.attend(7).await, Err(TriageError::UnknownHandler(7)));
        assert_eq!(sim.attend(0).await, Ok(None));
    }

    #[tokio::test]
    async fn test_set_speed_validates() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new());
        assert_eq!(sim.set_speed(0.0), Err(TriageError::InvalidSpeed(0.0)));
        assert!(sim.set_speed(f64::NAN).is_err());
        sim.set_speed(4.0).unwrap();
        assert_eq!(sim.speed(), 4.0);
    }

    #[tokio::test]
    async fn test_start_stop_restart_lifecycle() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new());
        sim.start();
        sim.start();
        assert!(sim.is_running());
        assert_eq!(sim.snapshot().pending_timers, 3);

        sim.spawn_patient().unwrap();
        sim.set_speed(2.0).unwrap();
        let stopped = sim.stop();
        assert_eq!(stopped.outer.len(), 1);
        assert!(!sim.is_running());
        assert_eq!(sim.snapshot().pending_timers, 0);
        assert!(sim.snapshot().outer.is_empty());

        sim.restart().unwrap();
        let snap = sim.snapshot();
        assert!(snap.running);
        assert_eq!(snap.generation, 2);
        assert_eq!(snap.speed, 1.0);
        assert_eq!(snap.metrics, TriageMetrics::default());
        assert_eq!(snap.pending_timers, 3);
    }

    #[tokio::test]
    async fn test_spawn_patient_draws_from_catalog() {
        let (sim, _) = sim(config("<< 1", &[("H", "<< 1")]), RuleTableOracle::new());
        for _ in 0..20 {
            sim.spawn_patient().unwrap();
        }
        let snap = sim.snapshot();
        assert_eq!(snap.outer.len(), 20);
        assert!(snap
            .outer
            .iter()
            .all(|p| (1..=2).contains(&p.diagnoses.len())));
        let orders: Vec<u64> = snap.outer.iter().map(|p| p.arrival_order).collect();
        assert_eq!(orders, (0..20).collect::<Vec<u64>>());
        assert_eq!(sim.metrics().spawned, 20);
        snap.check_invariants().unwrap();

        let events = sim.drain_events();
        assert_eq!(events.len(), 20);
        assert!(sim.drain_events().is_empty());
    }
}
