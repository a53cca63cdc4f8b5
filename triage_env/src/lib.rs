//! Triage Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the triage engine
//! to run both against a **Production** runtime (tokio, wall-clock time) and
//! inside the **Simulation** harness (virtual time, seeded entropy).
//!
//! # Core Concept
//!
//! The engine never talks to the outside world directly. Everything that
//! would introduce non-determinism or latency is behind a trait:
//! - Time and task spawning (`TriageContext`)
//! - Rule evaluation against the terminology backend (`ClassificationOracle`)
//! - Entropy (`TriageContext::derive_seed`)
//!
//! # Example
//!
//! ```ignore
//! use triage_env::{ClassificationOracle, RuleExpression, TriageContext};
//!
//! async fn probe<Ctx: TriageContext, O: ClassificationOracle>(ctx: &Ctx, oracle: &O) {
//!     let rule = RuleExpression::new("<< 404684003 |Clinical finding|").unwrap();
//!     let matches = oracle.evaluate(&rule).await;
//!     ctx.sleep(std::time::Duration::from_millis(100)).await;
//! }
//! ```

mod context;
mod error;
mod oracle;
mod tokio_impl;
mod types;

pub use context::TriageContext;
pub use error::EnvError;
pub use oracle::{ClassificationOracle, OracleController};
pub use tokio_impl::TokioContext;
pub use types::{Code, PatientId, RuleExpression};
