//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use triage_env::{ClassificationOracle, Code, EnvError, RuleExpression};

pub fn code(c: &str) -> Code {
    Code::new(c).unwrap()
}

pub fn rule(r: &str) -> RuleExpression {
    RuleExpression::new(r).unwrap()
}

/// Oracle answering from a table keyed by the base rule text.
///
/// Understands exactly the shape `(base) AND (c1 OR c2 ...)` produced by
/// `MatchQuery`.
#[derive(Default)]
pub struct RuleTableOracle {
    table: HashMap<String, BTreeSet<Code>>,
    failing_rules: HashSet<String>,
    fail_all: bool,
    stalled: bool,
    leak_extra: bool,
    yields: usize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl RuleTableOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, base: &str, codes: &[&str]) -> Self {
        self.table
            .insert(base.to_string(), codes.iter().map(|c| code(c)).collect());
        self
    }

    pub fn failing_rule(mut self, base: &str) -> Self {
        self.failing_rules.insert(base.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn leaking_extra_codes(mut self) -> Self {
        self.leak_extra = true;
        self
    }

    /// Yields to the scheduler this many times before answering.
    pub fn with_yields(mut self, yields: usize) -> Self {
        self.yields = yields;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Base rules asked, in call order.
    pub fn asked(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn split(expression: &str) -> (String, Vec<Code>) {
        let inner = expression
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(expression);
        match inner.split_once(") AND (") {
            Some((base, codes)) => (
                base.to_string(),
                codes.split(" OR ").map(code).collect(),
            ),
            None => (inner.to_string(), Vec::new()),
        }
    }
}

#[async_trait]
impl ClassificationOracle for RuleTableOracle {
    async fn evaluate(&self, rule: &RuleExpression) -> Result<BTreeSet<Code>, EnvError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (base, candidates) = Self::split(rule.as_str());
        self.log.lock().unwrap().push(base.clone());

        for _ in 0..self.yields {
            tokio::task::yield_now().await;
        }
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_all || self.failing_rules.contains(&base) {
            return Err(EnvError::oracle(format!("rule {base} failed")));
        }

        let allowed = self.table.get(&base).cloned().unwrap_or_default();
        if self.leak_extra {
            return Ok(allowed);
        }
        Ok(candidates
            .into_iter()
            .filter(|c| allowed.contains(c))
            .collect())
    }

    fn name(&self) -> &str {
        "rule-table"
    }
}
