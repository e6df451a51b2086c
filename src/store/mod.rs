//! Persistence seams for submissions and problems.
//!
//! Components receive store handles at construction so tests can substitute
//! in-memory doubles. All submission mutations are field-scoped, conditionally
//! guarded updates: each operation checks the status it is valid from and
//! applies atomically, so concurrent result consumers can never clobber each
//! other or double-finalize a submission.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::GradingResult;
use crate::types::{Problem, Submission, SubmissionTestcase};

/// Outcome of recording one grading result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedResult {
    /// Whether this call was the first to record the index. Duplicate
    /// deliveries observe `false` and must not trigger finalization.
    pub recorded: bool,
    /// Graded-case count after this call.
    pub graded: u32,
    /// Length of the submission's testcase sequence.
    pub total: u32,
}

impl RecordedResult {
    /// True when this call supplied the last missing result.
    pub fn is_complete(&self) -> bool {
        self.recorded && self.graded == self.total
    }
}

/// Submission persistence with atomic conditional transitions.
///
/// Every method that mutates returns whether the transition applied; a
/// `false` return means the submission was not in the required state and
/// nothing changed.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create(&self, submission: Submission) -> Result<()>;

    /// Point lookup by id. `NotFound` if the submission does not exist.
    async fn fetch(&self, id: &str) -> Result<Submission>;

    /// Pending -> Compiling, applied by the intake side at dispatch time.
    async fn begin_compiling(&self, id: &str) -> Result<bool>;

    /// Compiling -> Grading: attaches the fixed-length testcase sequence and
    /// zeroes the graded-case counter.
    async fn begin_grading(&self, id: &str, testcases: Vec<SubmissionTestcase>) -> Result<bool>;

    /// Compiling -> CompileFailed with the compiler log.
    async fn mark_compile_failed(&self, id: &str, log: &str) -> Result<bool>;

    /// Record `{result, score}` at `index` and increment the graded-case
    /// counter, as one atomic operation guarded on `status == Grading`.
    /// Recording the same index twice is a no-op that reports the current
    /// counters.
    async fn record_testcase_result(
        &self,
        id: &str,
        index: usize,
        result: &GradingResult,
        score: u32,
    ) -> Result<RecordedResult>;

    /// Grading (with full coverage) -> Graded: sets `score` to the sum of
    /// per-testcase scores and drops the graded-case counter.
    async fn finalize(&self, id: &str) -> Result<bool>;

    /// Explicit termination. Pending/Compiling and incompletely graded
    /// submissions become Terminated with the given log; a fully graded
    /// submission finalizes as Graded instead. Terminal states are no-ops.
    async fn terminate(&self, id: &str, log: Option<&str>) -> Result<bool>;
}

/// Read-only access to the slice of problem documents the aggregator needs.
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn fetch_problem(&self, domain_id: &str, problem_id: &str) -> Result<Problem>;
}
