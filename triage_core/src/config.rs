//! Simulation configuration.
//!
//! Every field has a default, so a JSON file only needs the values it
//! overrides:
//!
//! ```json
//! { "seed": 7, "speed": 2.0, "max_requeues": 5 }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use triage_env::RuleExpression;

use crate::error::TriageError;
use crate::model::{CatalogEntry, DiagnosisCatalog, Handler};
use crate::routing::RoutingBinding;

/// One specialist in the clinic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub title: String,
    pub specialty_rule: RuleExpression,
    #[serde(default)]
    pub escalation_rule: Option<RuleExpression>,
}

impl HandlerConfig {
    pub fn new(title: impl Into<String>, specialty_rule: RuleExpression) -> Self {
        Self {
            title: title.into(),
            specialty_rule,
            escalation_rule: None,
        }
    }

    pub fn with_escalation(mut self, rule: RuleExpression) -> Self {
        self.escalation_rule = Some(rule);
        self
    }

    /// Builds a free handler from this entry.
    pub fn build(&self) -> Handler {
        let handler = Handler::new(self.title.clone(), self.specialty_rule.clone());
        match &self.escalation_rule {
            Some(rule) => handler.with_escalation(rule.clone()),
            None => handler,
        }
    }
}

/// Configuration for a triage simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for patient generation
    pub seed: u64,

    /// Base rule the gatekeeper tests every arriving patient against
    pub admission_rule: RuleExpression,

    /// Specialists, in index order
    pub handlers: Vec<HandlerConfig>,

    /// Ordered routing bindings; empty means one binding per handler using
    /// its specialty rule, in handler order
    pub bindings: Vec<RoutingBinding>,

    /// Diagnoses patients are drawn from
    pub catalog: Vec<CatalogEntry>,

    /// Maximum diagnoses per spawned patient (at least 1)
    pub max_diagnoses: usize,

    /// Interval between patient arrivals (ms, before speed scaling)
    pub spawn_interval_ms: u64,

    /// Interval between admission ticks (ms, before speed scaling)
    pub admission_interval_ms: u64,

    /// Interval between routing ticks (ms, before speed scaling)
    pub routing_interval_ms: u64,

    /// Delay between assignment and the handler session (ms, before speed
    /// scaling)
    pub treatment_ms: u64,

    /// Initial speed multiplier
    pub speed: f64,

    /// Upper bound on every oracle call (ms); a timeout counts as no match
    pub oracle_timeout_ms: u64,

    /// Routing failures tolerated before a patient is discharged unhelped
    pub max_requeues: u32,

    /// Session returns tolerated before a patient is discharged unhelped
    pub max_escalations: u32,

    /// Stop spawning after this many timer-driven arrivals
    pub max_patients: Option<u64>,

    /// Events and discharge records retained
    pub event_capacity: usize,
}

/// Parses a rule literal that is known to be valid.
fn static_rule(rule: &'static str) -> RuleExpression {
    RuleExpression::new(rule).expect("built-in rule literal is valid")
}

fn static_entry(code: &'static str, display: &'static str) -> CatalogEntry {
    CatalogEntry::new(code, display).expect("built-in catalog entry is valid")
}

impl Default for SimulationConfig {
    /// A small emergency department on SNOMED CT codes.
    fn default() -> Self {
        Self {
            seed: 42,
            admission_rule: static_rule("<< 49601007 OR << 50043002 OR << 928000 OR << 95320005"),
            handlers: vec![
                HandlerConfig::new("Cardiologist", static_rule("<< 49601007")),
                HandlerConfig::new("Pulmonologist", static_rule("<< 50043002")),
                HandlerConfig::new("Orthopedist", static_rule("<< 125605004")),
                HandlerConfig::new("Dermatologist", static_rule("<< 95320005")),
                HandlerConfig::new(
                    "General practitioner",
                    static_rule("<< 38341003 OR << 195967001"),
                )
                .with_escalation(static_rule("<< 22298006")),
            ],
            bindings: Vec::new(),
            catalog: vec![
                static_entry("22298006", "Myocardial infarction"),
                static_entry("49436004", "Atrial fibrillation"),
                static_entry("38341003", "Hypertensive disorder"),
                static_entry("195967001", "Asthma"),
                static_entry("233604007", "Pneumonia"),
                static_entry("13645005", "Chronic obstructive lung disease"),
                static_entry("71620000", "Fracture of femur"),
                static_entry("65966004", "Fracture of forearm"),
                static_entry("43116000", "Eczema"),
                static_entry("9014002", "Psoriasis"),
                static_entry("44054006", "Diabetes mellitus type 2"),
                static_entry("68566005", "Urinary tract infectious disease"),
                static_entry("25064002", "Headache"),
            ],
            max_diagnoses: 2,
            spawn_interval_ms: 1500,
            admission_interval_ms: 500,
            routing_interval_ms: 500,
            treatment_ms: 2000,
            speed: 1.0,
            oracle_timeout_ms: 5000,
            max_requeues: 20,
            max_escalations: 3,
            max_patients: None,
            event_capacity: 10_000,
        }
    }
}

impl SimulationConfig {
    /// Parses a (possibly partial) JSON configuration and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, TriageError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TriageError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TriageError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TriageError::ConfigLoad(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Sets the seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the initial speed multiplier.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Sets the spawn cap.
    pub fn with_max_patients(mut self, max: u64) -> Self {
        self.max_patients = Some(max);
        self
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), TriageError> {
        if self.handlers.is_empty() {
            return Err(TriageError::config("at least one handler is required"));
        }
        if let Some(binding) = self
            .bindings
            .iter()
            .find(|b| b.handler >= self.handlers.len())
        {
            return Err(TriageError::config(format!(
                "binding `{}` refers to handler {} but only {} exist",
                binding.rule,
                binding.handler,
                self.handlers.len()
            )));
        }
        if self.catalog.is_empty() {
            return Err(TriageError::EmptyCatalog);
        }
        if self.max_diagnoses == 0 {
            return Err(TriageError::config("max_diagnoses must be at least 1"));
        }
        for (name, value) in [
            ("spawn_interval_ms", self.spawn_interval_ms),
            ("admission_interval_ms", self.admission_interval_ms),
            ("routing_interval_ms", self.routing_interval_ms),
            ("oracle_timeout_ms", self.oracle_timeout_ms),
        ] {
            if value == 0 {
                return Err(TriageError::config(format!("{name} must be positive")));
            }
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(TriageError::InvalidSpeed(self.speed));
        }
        if self.event_capacity == 0 {
            return Err(TriageError::config("event_capacity must be positive"));
        }
        Ok(())
    }

    /// Effective routing bindings.
    pub fn routing_bindings(&self) -> Vec<RoutingBinding> {
        if !self.bindings.is_empty() {
            return self.bindings.clone();
        }
        self.handlers
            .iter()
            .enumerate()
            .map(|(index, h)| RoutingBinding::new(h.specialty_rule.clone(), index))
            .collect()
    }

    /// Fresh handlers for a new run.
    pub fn build_handlers(&self) -> Vec<Handler> {
        self.handlers.iter().map(HandlerConfig::build).collect()
    }

    pub fn build_catalog(&self) -> DiagnosisCatalog {
        DiagnosisCatalog::new(self.catalog.clone())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }

    pub fn treatment_time(&self) -> Duration {
        Duration::from_millis(self.treatment_ms)
    }
}
