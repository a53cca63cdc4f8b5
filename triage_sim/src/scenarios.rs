//! Fault-injection scenarios for the triage engine.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// TRI-001: Default clinic with a healthy oracle
    Steady,

    /// TRI-002: Arrivals every 200ms saturate the handlers
    Rush,

    /// TRI-003: Every oracle call outlives the decision timeout
    SlowOracle,

    /// TRI-004: Half of all oracle calls fail
    FlakyOracle,

    /// TRI-005: Oracle stalls for the middle third of the run
    StalledOracle,

    /// TRI-006: Speed multiplier raised to 4x halfway through
    SpeedShift,

    /// TRI-007: Restart halfway through with answers still pending
    Restart,

    /// TRI-008: General practitioner sees patients first and escalates
    Referral,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Steady,
            ScenarioId::Rush,
            ScenarioId::SlowOracle,
            ScenarioId::FlakyOracle,
            ScenarioId::StalledOracle,
            ScenarioId::SpeedShift,
            ScenarioId::Restart,
            ScenarioId::Referral,
        ]
    }

    /// Returns scenarios that inject oracle faults.
    pub fn faulty() -> Vec<ScenarioId> {
        Self::all()
            .into_iter()
            .filter(|s| s.injects_faults())
            .collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "steady",
            ScenarioId::Rush => "rush",
            ScenarioId::SlowOracle => "slow_oracle",
            ScenarioId::FlakyOracle => "flaky_oracle",
            ScenarioId::StalledOracle => "stalled_oracle",
            ScenarioId::SpeedShift => "speed_shift",
            ScenarioId::Restart => "restart",
            ScenarioId::Referral => "referral",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Steady => "Default clinic, 50ms oracle, patients recover",
            ScenarioId::Rush => "Arrivals every 200ms, handlers saturate and patients re-queue",
            ScenarioId::SlowOracle => "3s oracle against a 1s timeout, every decision times out",
            ScenarioId::FlakyOracle => "50% oracle failures treated as non-matches",
            ScenarioId::StalledOracle => "Oracle hangs for the middle third, then recovers",
            ScenarioId::SpeedShift => "Speed raised from 1x to 4x halfway, arrivals accelerate",
            ScenarioId::Restart => "Restart halfway, stale answers discarded, state rebuilt",
            ScenarioId::Referral => "General practitioner first, partial treatment escalates",
        }
    }

    /// Whether the scenario degrades the oracle.
    pub fn injects_faults(&self) -> bool {
        matches!(
            self,
            ScenarioId::SlowOracle | ScenarioId::FlakyOracle | ScenarioId::StalledOracle
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "steady" | "tri_001" => Ok(ScenarioId::Steady),
            "rush" | "tri_002" => Ok(ScenarioId::Rush),
            "slow_oracle" | "tri_003" => Ok(ScenarioId::SlowOracle),
            "flaky_oracle" | "tri_004" => Ok(ScenarioId::FlakyOracle),
            "stalled_oracle" | "tri_005" => Ok(ScenarioId::StalledOracle),
            "speed_shift" | "tri_006" => Ok(ScenarioId::SpeedShift),
            "restart" | "tri_007" => Ok(ScenarioId::Restart),
            "referral" | "tri_008" => Ok(ScenarioId::Referral),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("TRI-003".parse::<ScenarioId>(), Ok(ScenarioId::SlowOracle));
        assert_eq!("Speed-Shift".parse::<ScenarioId>(), Ok(ScenarioId::SpeedShift));
        assert!("chaos".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_faulty_subset() {
        assert_eq!(
            ScenarioId::faulty(),
            vec![
                ScenarioId::SlowOracle,
                ScenarioId::FlakyOracle,
                ScenarioId::StalledOracle
            ]
        );
    }
}
