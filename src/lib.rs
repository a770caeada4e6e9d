//! Safe Automation Decision Engine
//!
//! Decides, per assessment, whether a damage report may be automated or must
//! be escalated to a human:
//!
//! - `fusion`: correlation-aware fusion of detector outputs
//! - `conformal`: Mondrian conformal prediction with SSBC
//! - `context`: the validated 12-dimensional context vector
//! - `seed_set`: per-stratum unlock check
//! - `critic`: Safe-LUCB bandit with a hard safety gate
//! - `assignment`: deterministic experiment arms and shadow mode
//! - `coverage`: periodic coverage monitoring
//! - `orchestrator`: the decision path tying these together

pub mod assignment;
pub mod checkpoint;
pub mod config;
pub mod conformal;
pub mod context;
pub mod coverage;
pub mod critic;
pub mod error;
pub mod evidence;
pub mod feedback;
pub mod fusion;
pub mod orchestrator;
pub mod records;
pub mod report;
pub mod seed_set;
pub mod stats;
pub mod store;
pub mod stratum;
pub mod writer;

pub use config::EngineConfig;
pub use context::{CONTEXT_DIM, ContextFeatureBuilder, ContextVector, FeatureInputs};
pub use error::EngineError;
pub use orchestrator::{DecisionOrchestrator, DecisionRequest, DecisionResponse};
pub use records::{Action, Decision, EscalationReason, Outcome};
pub use store::{DecisionStore, InMemoryStore};
