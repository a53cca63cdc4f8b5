//! Entity model - patients, diagnoses, handlers and the diagnosis catalog.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use triage_env::{Code, PatientId, RuleExpression};

use crate::error::TriageError;

// =============================================================================
// DIAGNOSES
// =============================================================================

/// Treatment status of a single diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosisStatus {
    /// Not yet seen by a matching handler
    #[default]
    None,
    /// A handler whose specialty covers it has treated it
    Treated,
    /// Flagged for further specialist attention (escalation)
    Admitted,
}

/// One diagnosis carried by a patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub code: Code,
    pub display: String,
    pub status: DiagnosisStatus,
}

impl Diagnosis {
    /// Creates an untreated diagnosis.
    pub fn new(code: Code, display: impl Into<String>) -> Self {
        Self {
            code,
            display: display.into(),
            status: DiagnosisStatus::None,
        }
    }

    /// Anything not yet treated is still a candidate for matching.
    pub fn is_untreated(&self) -> bool {
        self.status != DiagnosisStatus::Treated
    }
}

// =============================================================================
// PATIENT
// =============================================================================

/// A simulated patient.
///
/// Owned by exactly one place at a time: a queue, an in-flight decision
/// slot, a handler, or the discharge log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Unique patient ID
    pub id: PatientId,

    /// Monotonic spawn counter
    pub arrival_order: u64,

    /// 1-based position while queued, `None` otherwise
    pub queue_position: Option<usize>,

    /// Diagnoses in the order they were drawn
    pub diagnoses: Vec<Diagnosis>,

    /// Times routing failed to place this patient
    pub requeue_count: u32,

    /// Times a session sent this patient back to the inner queue
    pub escalation_count: u32,
}

impl Patient {
    /// Creates a patient with the given diagnoses.
    pub fn new(id: PatientId, arrival_order: u64, diagnoses: Vec<Diagnosis>) -> Self {
        Self {
            id,
            arrival_order,
            queue_position: None,
            diagnoses,
            requeue_count: 0,
            escalation_count: 0,
        }
    }

    /// Codes of diagnoses that are not yet treated, in diagnosis order.
    pub fn untreated_codes(&self) -> Vec<Code> {
        self.diagnoses
            .iter()
            .filter(|d| d.is_untreated())
            .map(|d| d.code.clone())
            .collect()
    }

    /// Returns the diagnosis with the given code.
    pub fn diagnosis(&self, code: &Code) -> Option<&Diagnosis> {
        self.diagnoses.iter().find(|d| &d.code == code)
    }

    /// Marks every listed code as treated. Returns how many changed.
    pub fn mark_treated(&mut self, codes: &[Code]) -> usize {
        self.mark(codes, DiagnosisStatus::Treated, |_| true)
    }

    /// Flags listed, still-untouched diagnoses as admitted. Returns how many
    /// changed.
    pub fn mark_admitted(&mut self, codes: &[Code]) -> usize {
        self.mark(codes, DiagnosisStatus::Admitted, |d| {
            d.status == DiagnosisStatus::None
        })
    }

    fn mark(
        &mut self,
        codes: &[Code],
        status: DiagnosisStatus,
        eligible: impl Fn(&Diagnosis) -> bool,
    ) -> usize {
        let mut changed = 0;
        for diagnosis in self.diagnoses.iter_mut() {
            if codes.contains(&diagnosis.code) && eligible(diagnosis) && diagnosis.status != status {
                diagnosis.status = status;
                changed += 1;
            }
        }
        changed
    }

    /// True once every diagnosis is treated.
    pub fn all_treated(&self) -> bool {
        self.diagnoses
            .iter()
            .all(|d| d.status == DiagnosisStatus::Treated)
    }

    /// True if any diagnosis is flagged for escalation.
    pub fn has_admitted(&self) -> bool {
        self.diagnoses
            .iter()
            .any(|d| d.status == DiagnosisStatus::Admitted)
    }

    /// True if any diagnosis has not been touched yet.
    pub fn has_pending(&self) -> bool {
        self.diagnoses
            .iter()
            .any(|d| d.status == DiagnosisStatus::None)
    }
}

// =============================================================================
// HANDLER
// =============================================================================

/// A specialist who attends one patient at a time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Handler {
    /// Display title (e.g. "Cardiologist")
    pub title: String,

    /// Diagnoses this handler can treat
    pub specialty_rule: RuleExpression,

    /// Remaining diagnoses matching this rule are flagged `admitted`
    pub escalation_rule: Option<RuleExpression>,

    /// Mutual-exclusion flag: true while a session is active
    busy: bool,

    /// The patient currently being attended
    attending: Option<Patient>,
}

impl Handler {
    /// Creates a free handler.
    pub fn new(title: impl Into<String>, specialty_rule: RuleExpression) -> Self {
        Self {
            title: title.into(),
            specialty_rule,
            escalation_rule: None,
            busy: false,
            attending: None,
        }
    }

    /// Sets the escalation rule.
    pub fn with_escalation(mut self, rule: RuleExpression) -> Self {
        self.escalation_rule = Some(rule);
        self
    }

    /// Returns true while a session is active.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// The patient under care, if any.
    pub fn attending(&self) -> Option<&Patient> {
        self.attending.as_ref()
    }

    pub(crate) fn attending_mut(&mut self) -> Option<&mut Patient> {
        self.attending.as_mut()
    }

    /// Check-and-set: takes the patient if free, hands it back if busy.
    pub(crate) fn try_assign(&mut self, patient: Patient) -> Result<(), Patient> {
        if self.busy {
            return Err(patient);
        }
        self.busy = true;
        self.attending = Some(patient);
        Ok(())
    }

    /// Clears the busy flag and returns the patient under care.
    pub(crate) fn release(&mut self) -> Option<Patient> {
        self.busy = false;
        self.attending.take()
    }
}

// =============================================================================
// DIAGNOSIS CATALOG
// =============================================================================

/// One `{code, display}` pair patients are seeded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub code: Code,
    pub display: String,
}

impl CatalogEntry {
    /// Creates a validated entry.
    pub fn new(code: &str, display: &str) -> Result<Self, TriageError> {
        Ok(Self {
            code: Code::new(code)?,
            display: display.to_string(),
        })
    }
}

/// Pre-loaded list of diagnoses used at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosisCatalog {
    entries: Vec<CatalogEntry>,
}

impl DiagnosisCatalog {
    /// Creates a catalog from entries.
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Draws between 1 and `max` distinct diagnoses.
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        max: usize,
    ) -> Result<Vec<Diagnosis>, TriageError> {
        if self.entries.is_empty() {
            return Err(TriageError::EmptyCatalog);
        }
        let upper = max.clamp(1, self.entries.len());
        let count = rng.gen_range(1..=upper);

        Ok(self
            .entries
            .choose_multiple(rng, count)
            .map(|entry| Diagnosis::new(entry.code.clone(), entry.display.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn code(c: &str) -> Code {
        Code::new(c).unwrap()
    }

    fn patient(codes: &[&str]) -> Patient {
        Patient::new(
            PatientId::from_seed(1),
            0,
            codes.iter().map(|c| Diagnosis::new(code(c), "dx")).collect(),
        )
    }

    #[test]
    fn test_untreated_codes_skip_treated() {
        let mut p = patient(&["1", "2", "3"]);
        assert_eq!(p.mark_treated(&[code("2")]), 1);

        assert_eq!(p.untreated_codes(), vec![code("1"), code("3")]);
        assert!(!p.all_treated());
    }

    #[test]
    fn test_admitted_counts_as_untreated() {
        let mut p = patient(&["1", "2"]);
        assert_eq!(p.mark_admitted(&[code("1")]), 1);

        assert!(p.has_admitted());
        assert_eq!(p.untreated_codes(), vec![code("1"), code("2")]);

        // Treating an admitted diagnosis clears the escalation
        p.mark_treated(&[code("1"), code("2")]);
        assert!(!p.has_admitted());
        assert!(p.all_treated());
    }

    #[test]
    fn test_treated_diagnosis_cannot_be_admitted() {
        let mut p = patient(&["1"]);
        p.mark_treated(&[code("1")]);
        assert_eq!(p.mark_admitted(&[code("1")]), 0);
        assert_eq!(p.diagnoses[0].status, DiagnosisStatus::Treated);
    }

    #[test]
    fn test_handler_check_and_set() {
        let mut h = Handler::new("Cardiologist", RuleExpression::new("<< 1").unwrap());
        assert!(h.try_assign(patient(&["1"])).is_ok());
        assert!(h.is_busy());

        // Second assignment bounces back
        let bounced = h.try_assign(patient(&["2"])).unwrap_err();
        assert_eq!(bounced.diagnoses[0].code, code("2"));

        let released = h.release().unwrap();
        assert_eq!(released.diagnoses[0].code, code("1"));
        assert!(!h.is_busy());
        assert!(h.attending().is_none());
    }

    #[test]
    fn test_catalog_sample_bounds() {
        let catalog = DiagnosisCatalog::new(vec![
            CatalogEntry::new("1", "a").unwrap(),
            CatalogEntry::new("2", "b").unwrap(),
            CatalogEntry::new("3", "c").unwrap(),
        ]);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let drawn = catalog.sample(&mut rng, 2).unwrap();
            assert!((1..=2).contains(&drawn.len()));
            if drawn.len() == 2 {
                assert_ne!(drawn[0].code, drawn[1].code);
            }
        }
    }

    #[test]
    fn test_empty_catalog_errors() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            DiagnosisCatalog::default().sample(&mut rng, 2),
            Err(TriageError::EmptyCatalog)
        );
    }
}
