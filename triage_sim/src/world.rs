//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::oracle::{OracleFaults, TerminologyOracle};
use crate::terminology::CodeHierarchy;

use std::sync::Arc;
use std::time::Duration;
use triage_core::{SimulationConfig, TriageError, TriageSimulation};
use triage_env::TriageContext;

/// Simulation engine type used by the harness.
pub type SimTriage = TriageSimulation<SimContext, TerminologyOracle<SimContext>>;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Virtual time advanced per tick
    pub tick_ms: u64,

    /// Scheduler yields after each tick so spawned work can progress
    pub yields_per_tick: usize,

    /// Oracle fault profile at start
    pub faults: OracleFaults,

    /// Engine configuration; its seed is overridden by `seed`
    pub simulation: SimulationConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            tick_ms: 50,
            yields_per_tick: 16,
            faults: OracleFaults::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// The SimWorld - virtual clock, simulated oracle and the engine under test.
pub struct SimWorld {
    /// Configuration
    pub config: WorldConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Simulated terminology server
    pub oracle: Arc<TerminologyOracle<SimContext>>,

    /// Engine under test
    pub sim: SimTriage,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: WorldConfig) -> Result<Self, TriageError> {
        // Derive separate seeds for different subsystems
        let context_seed = config.seed;
        let oracle_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::shared(context_seed);
        let oracle = Arc::new(
            TerminologyOracle::new(
                Arc::clone(&context),
                CodeHierarchy::clinical_findings(),
                oracle_seed,
            )
            .with_faults(config.faults.clone()),
        );
        let sim = TriageSimulation::new(
            Arc::clone(&context),
            Arc::clone(&oracle),
            config.simulation.clone().with_seed(config.seed),
        )?;

        Ok(Self {
            config,
            context,
            oracle,
            sim,
            tick_count: 0,
        })
    }

    /// Advances virtual time by one tick, fires due timers and lets the
    /// spawned decisions run.
    pub async fn tick(&mut self) -> usize {
        self.context
            .advance_time(Duration::from_millis(self.config.tick_ms));
        let dispatched = self.sim.pump();
        for _ in 0..self.config.yields_per_tick {
            tokio::task::yield_now().await;
        }
        self.tick_count += 1;
        dispatched
    }

    /// Runs `ticks` ticks.
    pub async fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick().await;
        }
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Ticks per simulated second.
    pub fn ticks_per_sec(&self) -> u64 {
        (1000 / self.config.tick_ms.max(1)).max(1)
    }
}
