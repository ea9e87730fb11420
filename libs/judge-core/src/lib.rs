//! Sandboxed judge for single-function code submissions.
//!
//! A submission is normalized, run once per test case inside a fresh
//! interpreter process, and scored by deep structural comparison.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod harness;
pub mod isolation;
pub mod normalizer;


pub use backend::{BackendRegistry, LanguageBackend};
pub use config::{JudgeConfig, LanguageConfigManager};
pub use error::JudgeError;
pub use evaluator::compare;
pub use executor::Judge;
pub use normalizer::normalize;
pub use tokio_util::sync::CancellationToken;
