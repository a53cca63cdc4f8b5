//! Patient waiting lines with contiguous 1-based positions.
//!
//! Every mutation renumbers the members so that positions are exactly
//! `1..=len` in sequence order. Drift is a programming error and trips a
//! debug assertion.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use triage_env::PatientId;

use crate::model::Patient;

/// Which of the two waiting lines a queue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Arrived, not yet admission-tested
    Outer,
    /// Admitted, awaiting a specialist
    Inner,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Outer => write!(f, "outer"),
            QueueKind::Inner => write!(f, "inner"),
        }
    }
}

/// Ordered waiting line owning its patients.
#[derive(Debug, Clone)]
pub struct PatientQueue {
    kind: QueueKind,
    members: VecDeque<Patient>,
}

impl PatientQueue {
    /// Creates an empty queue.
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            members: VecDeque::new(),
        }
    }

    /// Which line this is.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Appends a patient; its position becomes the new length.
    ///
    /// Returns the assigned position.
    pub fn enqueue(&mut self, mut patient: Patient) -> usize {
        debug_assert!(
            !self.contains(patient.id),
            "patient {} enqueued twice on {} queue",
            patient.id,
            self.kind
        );
        let position = self.members.len() + 1;
        patient.queue_position = Some(position);
        self.members.push_back(patient);
        self.debug_check();
        position
    }

    /// Removes and returns the front patient.
    pub fn dequeue_front(&mut self) -> Option<Patient> {
        let mut patient = self.members.pop_front()?;
        patient.queue_position = None;
        self.renumber_from(0);
        Some(patient)
    }

    /// Removes a patient wherever it sits; later members move up by one.
    pub fn remove(&mut self, id: PatientId) -> Option<Patient> {
        let index = self.index_of(id)?;
        let mut patient = self.members.remove(index)?;
        patient.queue_position = None;
        self.renumber_from(index);
        Some(patient)
    }

    /// Moves a queued patient to the back with a fresh, maximal position.
    ///
    /// Returns the new position, or `None` if the patient is not queued here.
    pub fn requeue_at_back(&mut self, id: PatientId) -> Option<usize> {
        let patient = self.remove(id)?;
        Some(self.enqueue(patient))
    }

    /// Puts a patient that is currently out of the line back at the end.
    ///
    /// If the same patient is somehow still queued, that entry is dropped
    /// first so the patient never appears twice.
    pub fn requeue(&mut self, patient: Patient) -> usize {
        if self.contains(patient.id) {
            self.remove(patient.id);
        }
        self.enqueue(patient)
    }

    /// Front patient without removing it.
    pub fn front(&self) -> Option<&Patient> {
        self.members.front()
    }

    /// Looks up a queued patient.
    pub fn get(&self, id: PatientId) -> Option<&Patient> {
        self.members.iter().find(|p| p.id == id)
    }

    /// Looks up a queued patient mutably. Positions are not editable through
    /// this; callers may only touch diagnoses and counters.
    pub fn get_mut(&mut self, id: PatientId) -> Option<&mut Patient> {
        self.members.iter_mut().find(|p| p.id == id)
    }

    /// Returns true if the patient is queued here.
    pub fn contains(&self, id: PatientId) -> bool {
        self.index_of(id).is_some()
    }

    /// Number of queued patients.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if nobody is waiting.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Patients in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &Patient> {
        self.members.iter()
    }

    /// Patient ids in queue order.
    pub fn ids(&self) -> Vec<PatientId> {
        self.members.iter().map(|p| p.id).collect()
    }

    /// Removes everyone.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Checks that positions are exactly `1..=len` in sequence order.
    pub fn positions_are_contiguous(&self) -> bool {
        self.members
            .iter()
            .enumerate()
            .all(|(i, p)| p.queue_position == Some(i + 1))
    }

    fn index_of(&self, id: PatientId) -> Option<usize> {
        self.members.iter().position(|p| p.id == id)
    }

    fn renumber_from(&mut self, start: usize) {
        for (i, patient) in self.members.iter_mut().enumerate().skip(start) {
            patient.queue_position = Some(i + 1);
        }
        self.debug_check();
    }

    fn debug_check(&self) {
        debug_assert!(
            self.positions_are_contiguous(),
            "{} queue positions drifted",
            self.kind
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patient(n: u64) -> Patient {
        Patient::new(PatientId::from_seed(n), n, Vec::new())
    }

    fn positions(queue: &PatientQueue) -> Vec<Option<usize>> {
        queue.iter().map(|p| p.queue_position).collect()
    }

    #[test]
    fn test_enqueue_assigns_length() {
        let mut q = PatientQueue::new(QueueKind::Outer);
        assert_eq!(q.enqueue(patient(1)), 1);
        assert_eq!(q.enqueue(patient(2)), 2);
        assert_eq!(q.enqueue(patient(3)), 3);
        assert_eq!(positions(&q), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_dequeue_front_renumbers() {
        let mut q = PatientQueue::new(QueueKind::Outer);
        for n in 1..=3 {
            q.enqueue(patient(n));
        }

        let front = q.dequeue_front().unwrap();
        assert_eq!(front.arrival_order, 1);
        assert_eq!(front.queue_position, None);
        assert_eq!(positions(&q), vec![Some(1), Some(2)]);
        assert_eq!(q.front().unwrap().arrival_order, 2);
    }

    #[test]
    fn test_remove_middle_compacts() {
        let mut q = PatientQueue::new(QueueKind::Inner);
        for n in 1..=4 {
            q.enqueue(patient(n));
        }

        let removed = q.remove(PatientId::from_seed(2)).unwrap();
        assert_eq!(removed.arrival_order, 2);
        assert_eq!(positions(&q), vec![Some(1), Some(2), Some(3)]);
        assert_eq!(q.get(PatientId::from_seed(4)).unwrap().queue_position, Some(3));
        assert!(q.remove(PatientId::from_seed(2)).is_none());
    }

    #[test]
    fn test_requeue_at_back() {
        let mut q = PatientQueue::new(QueueKind::Inner);
        for n in 1..=3 {
            q.enqueue(patient(n));
        }

        assert_eq!(q.requeue_at_back(PatientId::from_seed(1)), Some(3));
        let order: Vec<u64> = q.iter().map(|p| p.arrival_order).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert!(q.positions_are_contiguous());

        assert_eq!(q.requeue_at_back(PatientId::from_seed(99)), None);
    }

    #[test]
    fn test_requeue_never_duplicates() {
        let mut q = PatientQueue::new(QueueKind::Inner);
        q.enqueue(patient(1));
        q.enqueue(patient(2));

        let copy = q.get(PatientId::from_seed(1)).unwrap().clone();
        q.requeue(copy);

        assert_eq!(q.len(), 2);
        assert_eq!(q.ids(), vec![PatientId::from_seed(2), PatientId::from_seed(1)]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue,
        Dequeue,
        Remove(usize),
        Requeue(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Enqueue),
            1 => Just(Op::Dequeue),
            1 => (0usize..16).prop_map(Op::Remove),
            1 => (0usize..16).prop_map(Op::Requeue),
        ]
    }

    proptest! {
        #[test]
        fn prop_positions_stay_contiguous(ops in prop::collection::vec(op_strategy(), 1..64)) {
            let mut q = PatientQueue::new(QueueKind::Outer);
            let mut next = 0u64;
            let mut model: Vec<u64> = Vec::new();

            for op in ops {
                match op {
                    Op::Enqueue => {
                        q.enqueue(patient(next));
                        model.push(next);
                        next += 1;
                    }
                    Op::Dequeue => {
                        let got = q.dequeue_front().map(|p| p.arrival_order);
                        let expected = if model.is_empty() { None } else { Some(model.remove(0)) };
                        prop_assert_eq!(got, expected);
                    }
                    Op::Remove(i) => {
                        if !model.is_empty() {
                            let n = model.remove(i % model.len());
                            prop_assert!(q.remove(PatientId::from_seed(n)).is_some());
                        }
                    }
                    Op::Requeue(i) => {
                        if !model.is_empty() {
                            let n = model.remove(i % model.len());
                            model.push(n);
                            prop_assert_eq!(
                                q.requeue_at_back(PatientId::from_seed(n)),
                                Some(model.len())
                            );
                        }
                    }
                }

                prop_assert!(q.positions_are_contiguous());
                let order: Vec<u64> = q.iter().map(|p| p.arrival_order).collect();
                prop_assert_eq!(&order, &model);
            }
        }
    }
}
