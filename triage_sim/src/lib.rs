//! Triage Deterministic Simulation Testing (DST) Harness
//!
//! Runs the triage engine against a simulated terminology server in
//! virtual time, so that every run is reproducible from one seed.
//!
//! # Core Principle: Controlled Non-Determinism
//!
//! - **Time**: Virtual clock advances only when the harness ticks it
//! - **Oracle**: In-memory hierarchy with seeded latency, failures and stalls
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock, watch-driven sleepers)     │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │ tick: advance ─► pump ─► yield                      │
//! │  ┌────▼───────────────────┐        ┌────────────────────┐   │
//! │  │   TriageSimulation     │◄──────►│ TerminologyOracle  │   │
//! │  │ (queues, handlers)     │ rules  │ (CodeHierarchy +   │   │
//! │  └────────────────────────┘        │  fault injection)  │   │
//! │                                    └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use triage_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(30.0).run(ScenarioId::Rush);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;
pub mod terminology;
mod world;

pub use context::SimContext;
pub use exporter::{SimExport, SimFrame};
pub use oracle::{OracleFaults, TerminologyOracle};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use terminology::{CodeHierarchy, Expression, ExpressionError};
pub use world::{SimTriage, SimWorld, WorldConfig};
