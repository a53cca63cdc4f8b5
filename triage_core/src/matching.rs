//! `diagnoses_matching` - the one suspension point every decision goes through.
//!
//! A query is built synchronously from the patient's untreated diagnoses
//! (while the caller holds the simulation lock), then resolved against the
//! oracle with no lock held.
//!
//! ```text
//! (rule) AND (code1 OR code2 OR ...)
//!        │
//!        ▼
//! ClassificationOracle::evaluate ──► codes ──► ∩ untreated diagnoses
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::debug;
use triage_env::{ClassificationOracle, Code, EnvError, PatientId, RuleExpression, TriageContext};

use crate::model::Patient;

/// A pending "which of this patient's diagnoses satisfy `rule`" question.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    /// Patient the question is about
    pub patient: PatientId,

    /// Untreated codes at the time the query was built
    pub candidates: Vec<Code>,

    /// Full expression sent to the oracle; `None` when there is nothing to ask
    pub expression: Option<RuleExpression>,
}

impl MatchQuery {
    /// Builds the query for `patient` against `rule`.
    pub fn new(patient: &Patient, rule: &RuleExpression) -> Self {
        let candidates = patient.untreated_codes();
        let expression = RuleExpression::any_of(&candidates).map(|codes| rule.and(&codes));
        Self {
            patient: patient.id,
            candidates,
            expression,
        }
    }

    /// Returns true when the query short-circuits without an oracle call.
    pub fn is_trivially_empty(&self) -> bool {
        self.expression.is_none()
    }

    /// Asks the oracle, bounded by `timeout`, and intersects the answer with
    /// the candidate codes (diagnosis order preserved).
    pub async fn resolve<Ctx, O>(
        &self,
        ctx: &Ctx,
        oracle: &O,
        timeout: Duration,
    ) -> Result<Vec<Code>, EnvError>
    where
        Ctx: TriageContext,
        O: ClassificationOracle,
    {
        let Some(expression) = &self.expression else {
            return Ok(Vec::new());
        };

        let returned = evaluate_with_timeout(ctx, oracle, expression, timeout).await?;
        Ok(self.intersect(&returned))
    }

    /// Keeps only candidate codes present in the oracle's answer.
    pub fn intersect(&self, returned: &BTreeSet<Code>) -> Vec<Code> {
        let matched: Vec<Code> = self
            .candidates
            .iter()
            .filter(|code| returned.contains(*code))
            .cloned()
            .collect();

        if matched.len() < returned.len() {
            debug!(
                patient = %self.patient,
                extra = returned.len() - matched.len(),
                "oracle returned codes outside the candidate set"
            );
        }
        matched
    }
}

/// Races `oracle.evaluate` against the context's clock.
pub async fn evaluate_with_timeout<Ctx, O>(
    ctx: &Ctx,
    oracle: &O,
    expression: &RuleExpression,
    timeout: Duration,
) -> Result<BTreeSet<Code>, EnvError>
where
    Ctx: TriageContext,
    O: ClassificationOracle,
{
    tokio::select! {
        biased;
        result = oracle.evaluate(expression) => result,
        _ = ctx.sleep(timeout) => Err(EnvError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Convenience wrapper: build and resolve in one call.
pub async fn diagnoses_matching<Ctx, O>(
    ctx: &Ctx,
    oracle: &O,
    patient: &Patient,
    rule: &RuleExpression,
    timeout: Duration,
) -> Result<Vec<Code>, EnvError>
where
    Ctx: TriageContext,
    O: ClassificationOracle,
{
    MatchQuery::new(patient, rule).resolve(ctx, oracle, timeout).await
}
