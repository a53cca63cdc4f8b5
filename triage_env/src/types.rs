//! Common types for the triage environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EnvError;

/// Unique identifier for a simulated patient.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatientId(pub Uuid);

impl PatientId {
    /// Creates a new random PatientId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic PatientId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PatientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PatientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A hierarchical terminology code (e.g. a SNOMED CT concept id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Code(String);

impl Code {
    /// Creates a validated code.
    ///
    /// Codes are single tokens: ASCII alphanumerics plus `-`, `.` and `_`.
    pub fn new(code: impl Into<String>) -> Result<Self, EnvError> {
        let code = code.into();
        let trimmed = code.trim();
        if trimmed.is_empty() {
            return Err(EnvError::InvalidCode("empty code".to_string()));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
        {
            return Err(EnvError::InvalidCode(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Code {
    type Error = EnvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Code> for String {
    fn from(code: Code) -> Self {
        code.0
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque boolean rule over hierarchical codes.
///
/// The engine never interprets the expression; it only checks that it is
/// well-formed (non-empty, balanced parentheses, paired `|display|` terms)
/// and composes it with other expressions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleExpression(String);

impl RuleExpression {
    /// Creates a validated rule expression.
    pub fn new(expression: impl Into<String>) -> Result<Self, EnvError> {
        let expression = expression.into();
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(EnvError::invalid_rule("empty expression"));
        }

        let mut depth: i64 = 0;
        let mut in_term = false;
        for c in trimmed.chars() {
            match c {
                '|' => in_term = !in_term,
                '(' if !in_term => depth += 1,
                ')' if !in_term => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(EnvError::invalid_rule(format!(
                            "unbalanced ')' in {trimmed}"
                        )));
                    }
                }
                _ => {}
            }
        }
        if in_term {
            return Err(EnvError::invalid_rule(format!("unterminated |term| in {trimmed}")));
        }
        if depth != 0 {
            return Err(EnvError::invalid_rule(format!("unbalanced '(' in {trimmed}")));
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Builds `code1 OR code2 OR ...`.
    ///
    /// Returns `None` for an empty code list.
    pub fn any_of<'a>(codes: impl IntoIterator<Item = &'a Code>) -> Option<Self> {
        let joined = codes
            .into_iter()
            .map(Code::as_str)
            .collect::<Vec<_>>()
            .join(" OR ");
        if joined.is_empty() {
            None
        } else {
            Some(Self(joined))
        }
    }

    /// Builds `(self) AND (other)`.
    pub fn and(&self, other: &RuleExpression) -> RuleExpression {
        Self(format!("({}) AND ({})", self.0, other.0))
    }

    /// Returns the expression as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RuleExpression {
    type Error = EnvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RuleExpression> for String {
    fn from(rule: RuleExpression) -> Self {
        rule.0
    }
}

impl std::fmt::Display for RuleExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
