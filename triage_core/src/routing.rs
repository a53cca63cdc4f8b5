//! Internal triage: route an admitted patient to the first free specialist
//! whose rule matches one of its untreated diagnoses.
//!
//! ```text
//!  inner queue ──pop──► in_flight ──► binding 0 (busy? skip) ─ oracle ─┐
//!                                      binding 1 ─────────── oracle ──┤
//!                                      ...                            │
//!        first non-empty match + handler still free ◄─────────────────┘
//!            │                                   │ no binding matched
//!            ▼                                   ▼
//!      handler.attending                 back of inner queue
//!                                        (or discharged once max_requeues is hit)
//! ```
//!
//! The controller holds no async code. The orchestrator pops, asks the oracle
//! with the lock released, then calls `assign` (which re-checks the busy flag
//! under the lock) or `finish_unmatched`.

use serde::{Deserialize, Serialize};
use triage_env::{Code, PatientId, RuleExpression};

use crate::matching::MatchQuery;
use crate::model::{Handler, Patient};
use crate::queue::PatientQueue;

/// A `(rule, handler)` pair. Order in the binding list is the tie-break.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingBinding {
    pub rule: RuleExpression,

    /// Index into the simulation's handler list
    pub handler: usize,
}

impl RoutingBinding {
    pub fn new(rule: RuleExpression, handler: usize) -> Self {
        Self { rule, handler }
    }
}

/// Terminal outcome of one routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RoutingOutcome {
    Assigned {
        patient: PatientId,
        handler: usize,
        matched: Vec<Code>,
    },
    Requeued {
        patient: PatientId,
        position: usize,
        requeue_count: u32,
    },
    /// Re-queued too many times; the patient is discharged unhelped
    GaveUp {
        patient: PatientId,
        requeue_count: u32,
    },
}

/// Routing controller with a single in-flight slot.
#[derive(Debug, Clone)]
pub struct RoutingController {
    bindings: Vec<RoutingBinding>,
    in_flight: Option<Patient>,
    max_requeues: u32,
}

impl RoutingController {
    pub fn new(bindings: Vec<RoutingBinding>, max_requeues: u32) -> Self {
        Self {
            bindings,
            in_flight: None,
            max_requeues,
        }
    }

    pub fn bindings(&self) -> &[RoutingBinding] {
        &self.bindings
    }

    pub fn max_requeues(&self) -> u32 {
        self.max_requeues
    }

    /// The patient currently being routed.
    pub fn in_flight(&self) -> Option<&Patient> {
        self.in_flight.as_ref()
    }

    pub(crate) fn in_flight_mut(&mut self) -> Option<&mut Patient> {
        self.in_flight.as_mut()
    }

    /// Returns true if no decision is in progress.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Pops the front of the inner queue into the in-flight slot.
    ///
    /// Returns `None` while another decision is in progress or the queue is
    /// empty.
    pub fn begin(&mut self, inner: &mut PatientQueue) -> Option<PatientId> {
        if self.in_flight.is_some() {
            return None;
        }
        let patient = inner.dequeue_front()?;
        let id = patient.id;
        self.in_flight = Some(patient);
        Some(id)
    }

    /// Builds the oracle question for binding `index`, or `None` if the
    /// binding's handler is busy (or there is nothing in flight).
    pub fn query(&self, index: usize, handlers: &[Handler]) -> Option<MatchQuery> {
        let patient = self.in_flight.as_ref()?;
        let binding = self.bindings.get(index)?;
        let handler = handlers.get(binding.handler)?;
        if handler.is_busy() {
            return None;
        }
        Some(MatchQuery::new(patient, &binding.rule))
    }

    /// Hands the in-flight patient to the handler of binding `index`.
    ///
    /// The busy flag is checked again here; if the handler was taken while
    /// the oracle call was pending the patient stays in flight and `None` is
    /// returned so the caller tries the next binding.
    pub fn assign(
        &mut self,
        index: usize,
        handlers: &mut [Handler],
        matched: Vec<Code>,
    ) -> Option<RoutingOutcome> {
        let handler_index = self.bindings.get(index)?.handler;
        let handler = handlers.get_mut(handler_index)?;
        let patient = self.in_flight.take()?;
        let id = patient.id;

        match handler.try_assign(patient) {
            Ok(()) => Some(RoutingOutcome::Assigned {
                patient: id,
                handler: handler_index,
                matched,
            }),
            Err(patient) => {
                self.in_flight = Some(patient);
                None
            }
        }
    }

    /// No binding matched: moves the patient to the back of the inner queue
    /// exactly once, or gives up when the re-queue bound is exceeded.
    ///
    /// For `GaveUp` the patient is returned for discharge.
    pub fn finish_unmatched(
        &mut self,
        inner: &mut PatientQueue,
    ) -> Option<(RoutingOutcome, Option<Patient>)> {
        let mut patient = self.in_flight.take()?;
        patient.requeue_count += 1;
        let id = patient.id;
        let requeue_count = patient.requeue_count;

        if requeue_count > self.max_requeues {
            return Some((
                RoutingOutcome::GaveUp {
                    patient: id,
                    requeue_count,
                },
                Some(patient),
            ));
        }

        let position = inner.requeue(patient);
        Some((
            RoutingOutcome::Requeued {
                patient: id,
                position,
                requeue_count,
            },
            None,
        ))
    }

    /// Drops the in-flight patient (teardown).
    pub fn reset(&mut self) -> Option<Patient> {
        self.in_flight.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Diagnosis;
    use crate::queue::QueueKind;
    use crate::testing::{code, rule};

    fn patient(n: u64) -> Patient {
        Patient::new(
            PatientId::from_seed(n),
            n,
            vec![Diagnosis::new(code("10"), "dx")],
        )
    }

    fn setup() -> (RoutingController, Vec<Handler>, PatientQueue) {
        let handlers = vec![
            Handler::new("A", rule("<< 1")),
            Handler::new("B", rule("<< 2")),
        ];
        let bindings = vec![
            RoutingBinding::new(rule("<< 1"), 0),
            RoutingBinding::new(rule("<< 2"), 1),
        ];
        let mut inner = PatientQueue::new(QueueKind::Inner);
        inner.enqueue(patient(1));
        inner.enqueue(patient(2));
        (RoutingController::new(bindings, 2), handlers, inner)
    }

    #[test]
    fn test_begin_single_flight() {
        let (mut routing, _, mut inner) = setup();

        assert_eq!(routing.begin(&mut inner), Some(PatientId::from_seed(1)));
        assert_eq!(routing.begin(&mut inner), None);
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn test_query_skips_busy_handler() {
        let (mut routing, mut handlers, mut inner) = setup();
        handlers[0].try_assign(patient(9)).unwrap();
        routing.begin(&mut inner);

        assert!(routing.query(0, &handlers).is_none());
        let q = routing.query(1, &handlers).unwrap();
        assert_eq!(q.expression.unwrap().as_str(), "(<< 2) AND (10)");
    }

    #[test]
    fn test_assign_sets_busy() {
        let (mut routing, mut handlers, mut inner) = setup();
        routing.begin(&mut inner);

        let outcome = routing.assign(1, &mut handlers, vec![code("10")]).unwrap();

        assert!(matches!(outcome, RoutingOutcome::Assigned { handler: 1, .. }));
        assert!(handlers[1].is_busy());
        assert_eq!(handlers[1].attending().unwrap().id, PatientId::from_seed(1));
        assert!(routing.is_idle());
    }

    #[test]
    fn test_assign_rechecks_busy() {
        let (mut routing, mut handlers, mut inner) = setup();
        routing.begin(&mut inner);
        // Taken while the oracle call was pending
        handlers[0].try_assign(patient(9)).unwrap();

        assert!(routing.assign(0, &mut handlers, vec![code("10")]).is_none());
        assert_eq!(routing.in_flight().unwrap().id, PatientId::from_seed(1));
        assert_eq!(handlers[0].attending().unwrap().id, PatientId::from_seed(9));
    }

    #[test]
    fn test_unmatched_requeues_once() {
        let (mut routing, _, mut inner) = setup();
        routing.begin(&mut inner);

        let (outcome, discharged) = routing.finish_unmatched(&mut inner).unwrap();

        assert_eq!(
            outcome,
            RoutingOutcome::Requeued {
                patient: PatientId::from_seed(1),
                position: 2,
                requeue_count: 1,
            }
        );
        assert!(discharged.is_none());
        assert_eq!(
            inner.ids(),
            vec![PatientId::from_seed(2), PatientId::from_seed(1)]
        );
    }

    #[test]
    fn test_requeue_bound_gives_up() {
        let (mut routing, _, mut inner) = setup();
        inner.get_mut(PatientId::from_seed(1)).unwrap().requeue_count = 2;
        routing.begin(&mut inner);

        let (outcome, discharged) = routing.finish_unmatched(&mut inner).unwrap();

        assert!(matches!(outcome, RoutingOutcome::GaveUp { requeue_count: 3, .. }));
        assert_eq!(discharged.unwrap().id, PatientId::from_seed(1));
        assert_eq!(inner.ids(), vec![PatientId::from_seed(2)]);
    }
}
