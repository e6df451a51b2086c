//! Broker wire schemas for judging tasks and results.
//!
//! Tasks flow from the dispatcher to workers, results flow back to the
//! aggregator. Delivery is at-least-once with no ordering guarantee, so every
//! message carries the correlation keys (`submission_id`, `testcase_index`)
//! the aggregator needs to apply it idempotently.

use serde::{Deserialize, Serialize};

use crate::types::Constraints;

/// Object-store address of a testcase blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseObject {
    pub object_name: String,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestcaseObjects {
    pub input: TestcaseObject,
    pub output: TestcaseObject,
}

/// Task consumed by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JudgerTask {
    Compile(CompileTask),
    Grading(GradingTask),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileTask {
    pub submission_id: String,
    pub source: String,
    pub language: String,
    pub constraints: Constraints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingTask {
    pub submission_id: String,
    pub testcase_index: usize,
    pub testcase: TestcaseObjects,
    pub constraints: Constraints,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileStatus {
    Succeeded,
    Failed,
}

/// Outcome of a compile task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub status: CompileStatus,
    pub submission_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Outcome of one grading task.
///
/// `Accepted`/`WrongAnswer` carry the resource usage of a completed
/// comparison; the remaining variants pass the sandbox outcome through
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum GradingResult {
    Accepted {
        message: String,
        time: u32,
        wall_time: u32,
        memory: u32,
    },
    WrongAnswer {
        message: String,
        time: u32,
        wall_time: u32,
        memory: u32,
    },
    TimeExceeded {
        time: u32,
        wall_time: u32,
    },
    MemoryExceeded {
        memory: u32,
    },
    RuntimeError {
        message: String,
    },
    SystemError {
        message: String,
    },
}

impl GradingResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GradingResult::Accepted { .. })
    }
}

/// Result message consumed by the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResultMessage {
    Compile(CompileResult),
    #[serde(rename_all = "camelCase")]
    Grading {
        submission_id: String,
        testcase_index: usize,
        result: GradingResult,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_tagged_by_type() {
        let task = JudgerTask::Grading(GradingTask {
            submission_id: "s1".into(),
            testcase_index: 2,
            testcase: TestcaseObjects {
                input: TestcaseObject {
                    object_name: "d/p/1.in".into(),
                    version_id: "v1".into(),
                },
                output: TestcaseObject {
                    object_name: "d/p/1.out".into(),
                    version_id: "v2".into(),
                },
            },
            constraints: Constraints {
                time: 1000,
                wall_time: None,
                memory: 262144,
                total_storage: None,
                processes: None,
            },
            language: "cpp".into(),
        });

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"type\":\"Grading\""));
        assert!(json.contains("\"testcaseIndex\":2"));

        match serde_json::from_str::<JudgerTask>(&json).unwrap() {
            JudgerTask::Grading(t) => assert_eq!(t.testcase_index, 2),
            _ => panic!("wrong task variant"),
        }
    }

    #[test]
    fn test_grading_result_status_tag() {
        let result = GradingResult::MemoryExceeded { memory: 524288 };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"status\":\"memoryExceeded\""));

        let back: GradingResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
