//! # Eval Coordinator
//!
//! Evaluation coordinator for neuro-evolution runs: a batch of agents (genomes) is played on
//! a pool of emulator workers, each agent exactly once, and every agent gets back a fitness.
//!
//! It provides:
//! - Batch execution over parallel worker connections ([`Coordinator`](crate::server::Coordinator))
//! - Worker processes launched in their own process group and torn down as a whole
//! - A length-prefixed ASCII frame protocol ([`frame_codec`])
//! - State snapshot vectorization ([`state_vectorizer`]) and screenshot preprocessing
//!   ([`image_preprocessor`]) feeding the engine's decision functions
//!
//! Any failure inside a batch fails the whole batch: all workers are terminated and the caller
//! retries it, see [`Coordinator::evaluate_until_success`](crate::server::Coordinator::evaluate_until_success).
//!
//! # Documentation Overview
//!
//! - For the batch lifecycle, see the [`server`] module.
//! - For the worker conversation, see [`session`].
//! - For configuring workers, timeouts and logging, see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For plugging networks in, check out the [`DecisionFactory`](crate::decision::DecisionFactory)
//!   and [`DecisionFunction`](crate::decision::DecisionFunction) traits.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use eval_coordinator::prelude::*;
//!
//! struct Weights(Vec<f64>);
//!
//! struct Linear(Vec<f64>);
//!
//! impl DecisionFunction for Linear {
//!     fn activate(&mut self, inputs: &[f64]) -> anyhow::Result<Vec<f64>> {
//!         Ok(self.0.iter().zip(inputs).map(|(w, x)| w * x).collect())
//!     }
//! }
//!
//! struct LinearFactory;
//!
//! impl DecisionFactory<Weights> for LinearFactory {
//!     type Function = Linear;
//!
//!     fn create(&self, genome: &Weights) -> anyhow::Result<Linear> {
//!         Ok(Linear(genome.0.clone()))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env()
//!         .with_workers(4)
//!         .with_game_mode(GameMode::BattleFactory);
//!     let coordinator = Coordinator::with_emulator(config)?;
//!
//!     let agents: Vec<_> = (0..20)
//!         .map(|id| Arc::new(Agent::new(id, Weights(vec![0.5; 64]))))
//!         .collect();
//!     let report = coordinator.evaluate_until_success(&agents, &LinearFactory, 0)?;
//!     println!("{}/{} agents evaluated", report.evaluated, report.total);
//!
//!     for agent in &agents {
//!         println!("{}: {:?}", agent.id, agent.fitness());
//!     }
//!     Ok(())
//! }
//! ```

pub use anyhow;
pub mod agent;
pub mod cancellation;
pub mod configuration;
pub mod decision;
pub mod error;
pub mod frame_codec;
pub mod game_mode;
pub mod image_preprocessor;
mod logger;
pub mod server;
pub mod session;
pub mod state_vectorizer;
mod supervisor;
pub mod work_dispenser;
pub mod worker_process;

pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use eval_coordinator::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{Agent, AgentId};
    pub use crate::configuration::Configuration;
    pub use crate::decision::{DecisionFactory, DecisionFunction};
    pub use crate::error::EvalError;
    pub use crate::game_mode::GameMode;
    pub use crate::server::{BatchOutcome, BatchReport, Coordinator};
    pub use crate::worker_process::{Worker, WorkerLauncher};
}
