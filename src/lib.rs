//! Core of an automated program-judging pipeline.
//!
//! Untrusted submissions are compiled and executed inside isolate sandboxes
//! under strict resource limits, graded against testcases, and aggregated
//! into per-submission and per-contest scores. The crate ships two daemons:
//! a task worker (`worker`) and a result aggregator (`result-handler`).

pub mod aggregator;
pub mod broker;
pub mod error;
pub mod languages;
pub mod messages;
pub mod ranklist;
pub mod sandbox;
pub mod storage;
pub mod store;
pub mod types;
pub mod worker;

pub use error::{JudgeError, Result};
