pub mod accuracy;
pub mod cache;
pub mod cli;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod leaderboard;
pub mod metrics;
pub mod outcome;
pub mod points;
pub mod resolution;
pub mod scheduler;
pub mod store;
pub mod sweeper;

pub use engine::{EngineSettings, ScoringEngine};
pub use error::{EngineError, EngineResult};
