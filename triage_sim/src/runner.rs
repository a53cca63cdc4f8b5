//! Scenario runner - executes fault-injection scenarios against the engine.
//!
//! Each scenario builds a `SimWorld`, applies its interventions at fixed
//! ticks and, after every tick, checks:
//! - the snapshot's structural invariants (queue positions, busy flags,
//!   no patient held twice)
//! - patient conservation: `spawned == census + discharged` while running
//!
//! A scenario then passes or fails on its own outcome criterion.

use crate::exporter::{SimExport, SimFrame};
use crate::oracle::OracleFaults;
use crate::scenarios::ScenarioId;
use crate::world::{SimWorld, WorldConfig};

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use triage_core::{Diagnosis, SimulationConfig, SimulationSnapshot, TriageMetrics};
use triage_env::{Code, OracleController};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn aborted(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Engine counters at the end of the run
    pub triage: TriageMetrics,

    /// Engine counters just before the last intervention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<TriageMetrics>,

    /// Ticks whose snapshot passed every check
    pub invariant_checks: u64,

    /// Longest observed outer queue
    pub max_outer: usize,

    /// Longest observed inner queue
    pub max_inner: usize,

    /// Most handlers busy at once
    pub max_busy_handlers: usize,

    /// Run generation at the end
    pub generation: u64,
}

impl ScenarioMetrics {
    fn observe(&mut self, snapshot: &SimulationSnapshot) {
        self.invariant_checks += 1;
        self.max_outer = self.max_outer.max(snapshot.outer.len());
        self.max_inner = self.max_inner.max(snapshot.inner.len());
        let busy = snapshot.handlers.iter().filter(|h| h.is_busy()).count();
        self.max_busy_handlers = self.max_busy_handlers.max(busy);
    }
}

/// A change applied to a running world.
#[derive(Debug, Clone)]
enum Intervention {
    SetSpeed(f64),
    Stall(bool),
    Restart,
    Admit(Vec<Diagnosis>),
}

/// How a scenario sets up its world.
struct ScenarioPlan {
    faults: OracleFaults,
    config: SimulationConfig,

    /// `(tick, intervention)`, in tick order
    interventions: Vec<(u64, Intervention)>,
}

/// Runs triage scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Virtual milliseconds per tick
    tick_ms: u64,

    /// Scheduler yields per tick
    yields_per_tick: usize,

    /// Duration in seconds
    duration_secs: f64,

    /// Base engine configuration the scenarios modify
    config: SimulationConfig,

    /// Export a frame every N ticks (0 = final frame only)
    export_every: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_ms: 50,
            yields_per_tick: 16,
            duration_secs: 60.0,
            config: SimulationConfig::default(),
            export_every: 20,
        }
    }

    /// Sets the tick length.
    pub fn with_tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms.max(1);
        self
    }

    /// Sets the duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Sets the base engine configuration.
    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the export frame interval in ticks.
    pub fn with_export_every(mut self, ticks: u64) -> Self {
        self.export_every = ticks;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and records frames for export.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut export = SimExport::new(scenario.name(), self.seed);
        let result = self.execute(scenario, Some(&mut export));
        export.finalize(
            result.passed,
            result.failure_reason.clone(),
            result.metrics.triage.clone(),
        );
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, export: Option<&mut SimExport>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                return ScenarioResult::aborted(scenario, self.seed, format!("runtime: {e}"))
            }
        };
        let result = runtime.block_on(self.drive(scenario, export));

        if result.passed {
            info!(
                "✓ {} passed in {} ticks ({:.1}s simulated)",
                scenario.name(),
                result.total_ticks,
                result.final_time_secs
            );
        } else {
            warn!(
                "✗ {} failed: {}",
                scenario.name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
        result
    }

    fn total_ticks(&self) -> u64 {
        (self.duration_secs.max(0.0) * 1000.0 / self.tick_ms as f64).ceil() as u64
    }

    async fn drive(&self, scenario: ScenarioId, mut export: Option<&mut SimExport>) -> ScenarioResult {
        let total_ticks = self.total_ticks();
        let plan = match self.plan(scenario, total_ticks) {
            Ok(plan) => plan,
            Err(reason) => return ScenarioResult::aborted(scenario, self.seed, reason),
        };

        let mut world = match SimWorld::new(WorldConfig {
            seed: self.seed,
            tick_ms: self.tick_ms,
            yields_per_tick: self.yields_per_tick,
            faults: plan.faults,
            simulation: plan.config,
        }) {
            Ok(world) => world,
            Err(e) => return ScenarioResult::aborted(scenario, self.seed, e.to_string()),
        };
        world.sim.start();

        let mut metrics = ScenarioMetrics::default();
        let mut failure = None;
        let mut interventions = plan.interventions.into_iter().peekable();

        for tick in 0..total_ticks {
            while let Some((_, intervention)) = interventions.next_if(|(at, _)| *at <= tick) {
                metrics.checkpoint = Some(world.sim.metrics());
                debug!(tick, ?intervention, "applying intervention");
                if let Err(reason) = apply(&world, intervention) {
                    failure = Some(reason);
                }
            }
            if failure.is_some() {
                break;
            }

            world.tick().await;

            let snapshot = world.sim.snapshot();
            if let Err(reason) = verify(&snapshot) {
                failure = Some(format!("tick {tick}: {reason}"));
                record(&mut export, &world, snapshot);
                break;
            }
            metrics.observe(&snapshot);

            let exporting = self.export_every > 0 && (tick + 1) % self.export_every == 0;
            if exporting || tick + 1 == total_ticks {
                record(&mut export, &world, snapshot);
            }
        }

        metrics.triage = world.sim.metrics();
        metrics.generation = world.sim.generation();

        let failure = failure.or_else(|| judge(scenario, &metrics).err());
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure.is_none(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            failure_reason: failure,
            metrics,
        }
    }

    fn plan(&self, scenario: ScenarioId, total_ticks: u64) -> Result<ScenarioPlan, String> {
        let mut config = self.config.clone();
        let mut faults = OracleFaults::default();
        let mut interventions = Vec::new();
        let half = total_ticks / 2;
        let third = total_ticks / 3;

        match scenario {
            ScenarioId::Steady => {}
            ScenarioId::Rush => {
                config.spawn_interval_ms = 200;
            }
            ScenarioId::SlowOracle => {
                faults = OracleFaults::instant().with_latency(Duration::from_secs(3));
                config.oracle_timeout_ms = 1000;
            }
            ScenarioId::FlakyOracle => {
                faults = faults.with_failure_rate(0.5);
            }
            ScenarioId::StalledOracle => {
                interventions.push((third, Intervention::Stall(true)));
                interventions.push((2 * third, Intervention::Stall(false)));
            }
            ScenarioId::SpeedShift => {
                interventions.push((half, Intervention::SetSpeed(4.0)));
            }
            ScenarioId::Restart => {
                faults = faults.with_latency(Duration::from_millis(400));
                interventions.push((half, Intervention::Restart));
            }
            ScenarioId::Referral => {
                // General practitioner is the last handler; route to it first
                let mut bindings = config.routing_bindings();
                bindings.rotate_right(1);
                config.bindings = bindings;

                let walk_in = vec![
                    diagnosis("195967001", "Asthma")?,
                    diagnosis("22298006", "Myocardial infarction")?,
                ];
                for _ in 0..3 {
                    interventions.push((0, Intervention::Admit(walk_in.clone())));
                }
            }
        }

        Ok(ScenarioPlan {
            faults,
            config,
            interventions,
        })
    }
}

fn diagnosis(code: &str, display: &str) -> Result<Diagnosis, String> {
    let code = Code::new(code).map_err(|e| e.to_string())?;
    Ok(Diagnosis::new(code, display))
}

fn apply(world: &SimWorld, intervention: Intervention) -> Result<(), String> {
    match intervention {
        Intervention::SetSpeed(speed) => world.sim.set_speed(speed).map_err(|e| e.to_string()),
        Intervention::Stall(stalled) => {
            world.oracle.set_stalled(stalled);
            Ok(())
        }
        Intervention::Restart => world.sim.restart().map_err(|e| e.to_string()),
        Intervention::Admit(diagnoses) => {
            world.sim.spawn_patient_with(diagnoses);
            Ok(())
        }
    }
}

/// Per-tick checks shared by every scenario.
fn verify(snapshot: &SimulationSnapshot) -> Result<(), String> {
    snapshot.check_invariants()?;

    if snapshot.running {
        let accounted = snapshot.census() as u64 + snapshot.metrics.discharged();
        if accounted != snapshot.metrics.spawned {
            return Err(format!(
                "patient conservation: spawned {} but {} in clinic + {} discharged",
                snapshot.metrics.spawned,
                snapshot.census(),
                snapshot.metrics.discharged()
            ));
        }
    }
    Ok(())
}

fn record(export: &mut Option<&mut SimExport>, world: &SimWorld, snapshot: SimulationSnapshot) {
    if let Some(export) = export.as_deref_mut() {
        export.add_frame(SimFrame {
            time_sec: world.time(),
            snapshot,
            events: world.sim.drain_events(),
        });
    }
}

/// Scenario-specific pass criterion.
fn judge(scenario: ScenarioId, metrics: &ScenarioMetrics) -> Result<(), String> {
    let m = &metrics.triage;
    let before = metrics.checkpoint.clone().unwrap_or_default();

    let check = |ok: bool, reason: String| if ok { Ok(()) } else { Err(reason) };

    match scenario {
        ScenarioId::Steady => {
            check(m.admitted > 0, "no patient admitted".into())?;
            check(m.recovered > 0, "no patient recovered".into())
        }
        ScenarioId::Rush => {
            check(m.requeued > 0, "handlers never saturated".into())?;
            check(
                metrics.max_outer > 5,
                format!("outer queue peaked at {}", metrics.max_outer),
            )
        }
        ScenarioId::SlowOracle => {
            check(m.oracle_timeouts > 0, "no oracle timeout observed".into())?;
            check(m.admitted == 0, format!("{} admitted past timeouts", m.admitted))?;
            check(m.rejected > 0, "timed-out admissions were not rejected".into())
        }
        ScenarioId::FlakyOracle => {
            check(m.oracle_failures > 0, "no oracle failure observed".into())?;
            check(m.admitted + m.rejected > 0, "admission made no progress".into())
        }
        ScenarioId::StalledOracle => {
            check(m.oracle_timeouts > 0, "stall produced no timeouts".into())?;
            check(
                m.admitted > before.admitted,
                format!("no admission after recovery (stuck at {})", m.admitted),
            )
        }
        ScenarioId::SpeedShift => {
            let first = before.spawned;
            let second = m.spawned.saturating_sub(first);
            check(first > 0, "no arrivals before the shift".into())?;
            check(
                second >= 2 * first,
                format!("arrivals {first} before vs {second} after 4x shift"),
            )
        }
        ScenarioId::Restart => {
            check(metrics.generation == 1, format!("generation {}", metrics.generation))?;
            check(m.spawned > 0, "no arrivals after restart".into())?;
            check(
                m.spawned <= before.spawned + 1,
                format!(
                    "metrics not reset: {} after restart vs {} before",
                    m.spawned, before.spawned
                ),
            )
        }
        ScenarioId::Referral => check(m.escalated > 0, "no patient escalated".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(42).with_duration(30.0)
    }

    #[test]
    fn test_steady_scenario() {
        let result = runner().run(ScenarioId::Steady);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.total_ticks, 600);
        assert!(result.metrics.invariant_checks == 600);
        assert!(result.metrics.triage.recovered > 0);
    }

    #[test]
    fn test_rush_scenario() {
        let result = runner().run(ScenarioId::Rush);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.max_busy_handlers <= 5);
    }

    #[test]
    fn test_slow_oracle_scenario() {
        let result = runner().run(ScenarioId::SlowOracle);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.triage.recovered, 0);
    }

    #[test]
    fn test_flaky_oracle_scenario() {
        let result = runner().run(ScenarioId::FlakyOracle);

        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_stalled_oracle_scenario() {
        let result = runner().run(ScenarioId::StalledOracle);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.checkpoint.is_some());
    }

    #[test]
    fn test_speed_shift_scenario() {
        let result = runner().run(ScenarioId::SpeedShift);

        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_restart_scenario() {
        let result = runner().run(ScenarioId::Restart);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.generation, 1);
    }

    #[test]
    fn test_referral_scenario() {
        let result = runner().run(ScenarioId::Referral);

        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_flaky_oracle_deterministic() {
        // Same seed should give same history
        let result1 = runner().run(ScenarioId::FlakyOracle);
        let result2 = runner().run(ScenarioId::FlakyOracle);

        assert_eq!(result1.metrics.triage, result2.metrics.triage);
    }

    #[test]
    fn test_export_records_frames() {
        let (result, export) = ScenarioRunner::new(7)
            .with_duration(5.0)
            .with_export_every(20)
            .run_with_export(ScenarioId::Steady);

        // 100 ticks, one frame per 20
        assert_eq!(export.frames.len(), 5);
        assert_eq!(export.passed, result.passed);
        assert!(export.final_metrics.is_some());
    }

    #[test]
    fn test_invalid_config_aborts() {
        let mut config = SimulationConfig::default();
        config.catalog.clear();

        let result = runner().with_config(config).run(ScenarioId::Steady);

        assert!(!result.passed);
        assert_eq!(result.total_ticks, 0);
        assert!(result.failure_reason.is_some());
    }
}
