//! In-memory store implementations.
//!
//! A single mutex serializes every transition, which trivially satisfies the
//! atomicity contract of `SubmissionStore`. Used by tests and by embedders
//! that do not need a shared persistent store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{JudgeError, Result};
use crate::messages::GradingResult;
use crate::store::{ProblemStore, RecordedResult, SubmissionStore};
use crate::types::{Problem, Submission, SubmissionStatus, SubmissionTestcase};

#[derive(Default)]
pub struct MemorySubmissionStore {
    inner: Mutex<HashMap<String, Submission>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &str) -> JudgeError {
    JudgeError::NotFound(format!("No submission found with the given ID: {}", id))
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn create(&self, submission: Submission) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.insert(submission.id.clone(), submission);
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Submission> {
        let inner = self.inner.lock().await;
        inner.get(id).cloned().ok_or_else(|| not_found(id))
    }

    async fn begin_compiling(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;
        if submission.status != SubmissionStatus::Pending {
            return Ok(false);
        }
        submission.status = SubmissionStatus::Compiling;
        Ok(true)
    }

    async fn begin_grading(&self, id: &str, testcases: Vec<SubmissionTestcase>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;
        if submission.status != SubmissionStatus::Compiling {
            return Ok(false);
        }
        submission.status = SubmissionStatus::Grading;
        submission.graded_cases = Some(0);
        submission.testcases = Some(testcases);
        Ok(true)
    }

    async fn mark_compile_failed(&self, id: &str, log: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;
        if submission.status != SubmissionStatus::Compiling {
            return Ok(false);
        }
        submission.status = SubmissionStatus::CompileFailed;
        submission.log = Some(log.to_string());
        Ok(true)
    }

    async fn record_testcase_result(
        &self,
        id: &str,
        index: usize,
        result: &GradingResult,
        score: u32,
    ) -> Result<RecordedResult> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;

        if submission.status != SubmissionStatus::Grading {
            return Ok(RecordedResult {
                recorded: false,
                graded: 0,
                total: 0,
            });
        }

        let testcases = submission.testcases.as_mut().ok_or_else(|| {
            JudgeError::Infra(anyhow::anyhow!("Grading submission without testcases"))
        })?;
        let total = testcases.len() as u32;
        let testcase = testcases.get_mut(index).ok_or_else(|| {
            JudgeError::NotFound(format!("No testcase found at the given index: {}", index))
        })?;

        if testcase.result.is_some() {
            // Duplicate delivery of the same index
            return Ok(RecordedResult {
                recorded: false,
                graded: submission.graded_cases.unwrap_or(0),
                total,
            });
        }

        testcase.result = Some(result.clone());
        testcase.score = Some(score);
        let graded = submission.graded_cases.unwrap_or(0) + 1;
        submission.graded_cases = Some(graded);

        Ok(RecordedResult {
            recorded: true,
            graded,
            total,
        })
    }

    async fn finalize(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(finalize_locked(submission))
    }

    async fn terminate(&self, id: &str, log: Option<&str>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let submission = inner.get_mut(id).ok_or_else(|| not_found(id))?;

        match submission.status {
            SubmissionStatus::Pending | SubmissionStatus::Compiling => {
                submission.status = SubmissionStatus::Terminated;
                submission.log = log.map(|l| l.to_string());
                Ok(true)
            }
            SubmissionStatus::Grading => {
                let total = submission.testcases.as_ref().map(|t| t.len() as u32);
                if submission.graded_cases != total {
                    submission.status = SubmissionStatus::Terminated;
                    submission.log = log.map(|l| l.to_string());
                    Ok(true)
                } else {
                    Ok(finalize_locked(submission))
                }
            }
            _ => Ok(false),
        }
    }
}

fn finalize_locked(submission: &mut Submission) -> bool {
    if submission.status != SubmissionStatus::Grading {
        return false;
    }
    let Some(testcases) = &submission.testcases else {
        return false;
    };
    if submission.graded_cases != Some(testcases.len() as u32) {
        return false;
    }

    submission.score = Some(testcases.iter().map(|t| t.score.unwrap_or(0)).sum());
    submission.status = SubmissionStatus::Graded;
    submission.graded_cases = None;
    true
}

#[derive(Default)]
pub struct MemoryProblemStore {
    inner: Mutex<HashMap<(String, String), Problem>>,
}

impl MemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, problem: Problem) {
        let mut inner = self.inner.lock().await;
        inner.insert((problem.domain_id.clone(), problem.id.clone()), problem);
    }
}

#[async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn fetch_problem(&self, domain_id: &str, problem_id: &str) -> Result<Problem> {
        let inner = self.inner.lock().await;
        inner
            .get(&(domain_id.to_string(), problem_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                JudgeError::NotFound(format!(
                    "No problem found with the given ID: {}/{}",
                    domain_id, problem_id
                ))
            })
    }
}
