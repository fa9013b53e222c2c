//! Query memory for a natural-language SQL assistant: answer caching keyed by
//! question and context, an append-only execution log, keyword-matched query
//! templates with bound parameters, and feedback-driven quality statistics.

pub mod assistant;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod feedback;
pub mod llm;
pub mod maintenance;
pub mod templates;
pub mod util;
pub mod web;

pub use error::{QueryError, Result};
