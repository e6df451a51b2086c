//! Persisted data model: submissions, problems, constraints, team scores.
//!
//! Field names serialize in camelCase to match the documents the rest of the
//! platform reads and writes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::messages::GradingResult;

/// Resource limits attached to a problem and copied into each task.
///
/// `time` is CPU milliseconds, `memory` is KB, `total_storage` is bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    pub time: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<u32>,
    pub memory: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_storage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<u32>,
}

/// Reference to a testcase blob as stored alongside the problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    pub version_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionType {
    Testing,
    Contest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Pending,
    Compiling,
    CompileFailed,
    Grading,
    Graded,
    Terminated,
}

impl SubmissionStatus {
    /// Terminal states absorb all further result messages.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::CompileFailed
                | SubmissionStatus::Graded
                | SubmissionStatus::Terminated
        )
    }
}

/// One slot in a submission's fixed-length testcase sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionTestcase {
    pub points: u32,
    pub input: FileRef,
    pub output: FileRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GradingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
}

/// The unit of grading work.
///
/// Created Pending by the submission intake; mutated exclusively by the
/// result aggregator afterwards. `testcases`, once set, never changes length.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub domain_id: String,
    pub problem_id: String,
    #[serde(rename = "type")]
    pub submission_type: SubmissionType,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcases: Option<Vec<SubmissionTestcase>>,
    /// Count of graded testcases; present only while `status == Grading`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graded_cases: Option<u32>,
    /// Total score; present only once `status == Graded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    /// Diagnostic text on CompileFailed/Terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl Submission {
    /// A fresh Pending submission as created by the intake collaborator.
    pub fn new_pending(
        id: impl Into<String>,
        domain_id: impl Into<String>,
        problem_id: impl Into<String>,
        submission_type: SubmissionType,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            domain_id: domain_id.into(),
            problem_id: problem_id.into(),
            submission_type,
            language: language.into(),
            contest_id: None,
            team_id: None,
            status: SubmissionStatus::Pending,
            testcases: None,
            graded_cases: None,
            score: None,
            log: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemTestcase {
    pub points: u32,
    pub input: FileRef,
    pub output: FileRef,
}

/// The slice of a problem document the judging core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub domain_id: String,
    pub constraints: Constraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testcases: Option<Vec<ProblemTestcase>>,
}

/// A team's aggregated contest score, owned by the scoring collaborator.
/// The ranklist cache only reads a per-contest sorted projection of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamScore {
    pub id: String,
    pub contest_id: String,
    pub scores: HashMap<String, u32>,
    pub time: HashMap<String, u64>,
    pub total_score: u32,
    pub last_time: u64,
}
