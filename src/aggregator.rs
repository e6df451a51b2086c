//! Result Aggregator: the submission state machine.
//!
//! Consumes compile and grading results and applies them as idempotent,
//! field-scoped updates through the `SubmissionStore`. Results may arrive
//! out of order, concurrently, and more than once; correctness rests on the
//! store's guarded transitions and on the atomic record-and-increment, so a
//! submission converges to exactly one terminal state no matter how results
//! interleave. On a successful compile it also fans the submission out into
//! one grading task per testcase.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::TaskPublisher;
use crate::error::{JudgeError, Result};
use crate::messages::{
    CompileResult, CompileStatus, GradingResult, GradingTask, ResultMessage, TestcaseObject,
    TestcaseObjects,
};
use crate::store::{ProblemStore, SubmissionStore};
use crate::types::{FileRef, Problem, Submission, SubmissionStatus, SubmissionTestcase};

const NO_TESTCASES_LOG: &str = "Problem does not have testcases.";

pub struct ResultAggregator {
    submissions: Arc<dyn SubmissionStore>,
    problems: Arc<dyn ProblemStore>,
    publisher: Arc<dyn TaskPublisher>,
}

impl ResultAggregator {
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        problems: Arc<dyn ProblemStore>,
        publisher: Arc<dyn TaskPublisher>,
    ) -> Self {
        Self {
            submissions,
            problems,
            publisher,
        }
    }

    /// Apply one result message. Returns the submission when this call
    /// finalized it (reached Graded), which is the trigger for contest score
    /// recalculation.
    pub async fn handle_result(&self, message: ResultMessage) -> Result<Option<Submission>> {
        match message {
            ResultMessage::Compile(result) => {
                self.handle_compile_result(&result).await?;
                Ok(None)
            }
            ResultMessage::Grading {
                submission_id,
                testcase_index,
                result,
            } => {
                self.handle_grading_result(&submission_id, testcase_index, result)
                    .await
            }
        }
    }

    /// Compile results drive the Compiling transitions. A redelivered success
    /// while the submission is already Grading repairs a fan-out that failed
    /// partway by publishing the ungraded indices again; everything else
    /// outside Compiling is a no-op.
    pub async fn handle_compile_result(&self, result: &CompileResult) -> Result<()> {
        let submission = self.submissions.fetch(&result.submission_id).await?;

        match (submission.status, result.status) {
            (SubmissionStatus::Compiling, CompileStatus::Failed) => {
                self.submissions
                    .mark_compile_failed(
                        &submission.id,
                        result.log.as_deref().unwrap_or_default(),
                    )
                    .await?;
                info!("Submission {} failed to compile", submission.id);
                Ok(())
            }
            (SubmissionStatus::Compiling, CompileStatus::Succeeded) => {
                self.dispatch_grading(&submission).await
            }
            (SubmissionStatus::Grading, CompileStatus::Succeeded) => {
                self.republish_ungraded(&submission).await
            }
            _ => Ok(()),
        }
    }

    /// Compiling -> Grading: attach the testcase sequence and publish one
    /// grading task per testcase, in testcase order, tagged with its index.
    async fn dispatch_grading(&self, submission: &Submission) -> Result<()> {
        let problem = self
            .problems
            .fetch_problem(&submission.domain_id, &submission.problem_id)
            .await?;

        let testcases = match &problem.testcases {
            Some(testcases) if !testcases.is_empty() => testcases,
            _ => {
                self.terminate(&submission.id, Some(NO_TESTCASES_LOG))
                    .await?;
                return Ok(());
            }
        };

        let submission_testcases: Vec<SubmissionTestcase> = testcases
            .iter()
            .map(|testcase| SubmissionTestcase {
                points: testcase.points,
                input: testcase.input.clone(),
                output: testcase.output.clone(),
                result: None,
                score: None,
            })
            .collect();

        // Only the transition winner publishes, so a duplicate compile
        // result cannot dispatch the fan-out twice.
        if !self
            .submissions
            .begin_grading(&submission.id, submission_testcases)
            .await?
        {
            return Ok(());
        }

        for (index, testcase) in testcases.iter().enumerate() {
            self.publisher
                .publish_grading(grading_task(
                    submission,
                    &problem,
                    index,
                    &testcase.input,
                    &testcase.output,
                ))
                .await?;
        }

        info!(
            "Submission {} dispatched for grading ({} testcases)",
            submission.id,
            testcases.len()
        );
        Ok(())
    }

    /// Publish grading tasks again for every index that has no recorded
    /// result. Duplicate deliveries are absorbed by the idempotent record, so
    /// republishing an in-flight index is harmless.
    async fn republish_ungraded(&self, submission: &Submission) -> Result<()> {
        let Some(testcases) = &submission.testcases else {
            return Ok(());
        };

        let problem = self
            .problems
            .fetch_problem(&submission.domain_id, &submission.problem_id)
            .await?;

        let mut republished = 0;
        for (index, testcase) in testcases.iter().enumerate() {
            if testcase.result.is_none() {
                self.publisher
                    .publish_grading(grading_task(
                        submission,
                        &problem,
                        index,
                        &testcase.input,
                        &testcase.output,
                    ))
                    .await?;
                republished += 1;
            }
        }

        if republished > 0 {
            info!(
                "Submission {} re-dispatched {} ungraded testcases",
                submission.id, republished
            );
        }
        Ok(())
    }

    /// Record one grading result. `testcase_index` is the only correlation
    /// key; the score is the testcase's points iff the result is Accepted.
    pub async fn handle_grading_result(
        &self,
        submission_id: &str,
        testcase_index: usize,
        result: GradingResult,
    ) -> Result<Option<Submission>> {
        let submission = self.submissions.fetch(submission_id).await?;

        if submission.status != SubmissionStatus::Grading {
            // Terminal states absorb redelivered results.
            return Ok(None);
        }

        let testcases = submission.testcases.as_deref().unwrap_or_default();
        let testcase = testcases.get(testcase_index).ok_or_else(|| {
            JudgeError::NotFound(format!(
                "No testcase found at the given index: {}",
                testcase_index
            ))
        })?;

        let score = if result.is_accepted() {
            testcase.points
        } else {
            0
        };

        let recorded = self
            .submissions
            .record_testcase_result(submission_id, testcase_index, &result, score)
            .await?;

        if recorded.is_complete() && self.submissions.finalize(submission_id).await? {
            let finalized = self.submissions.fetch(submission_id).await?;
            info!(
                "Submission {} graded with score {:?}",
                submission_id, finalized.score
            );
            return Ok(Some(finalized));
        }

        Ok(None)
    }

    /// Explicit termination, used when grading cannot proceed or an operator
    /// force-stops a submission. A fully graded submission finalizes as
    /// Graded instead.
    pub async fn terminate(&self, submission_id: &str, log: Option<&str>) -> Result<()> {
        if self.submissions.terminate(submission_id, log).await? {
            warn!(
                "Submission {} terminated: {}",
                submission_id,
                log.unwrap_or("(no log)")
            );
        }
        Ok(())
    }
}

fn grading_task(
    submission: &Submission,
    problem: &Problem,
    index: usize,
    input: &FileRef,
    output: &FileRef,
) -> GradingTask {
    let object = |file: &FileRef| TestcaseObject {
        object_name: format!("{}/{}/{}", problem.domain_id, problem.id, file.name),
        version_id: file.version_id.clone(),
    };
    GradingTask {
        submission_id: submission.id.clone(),
        testcase_index: index,
        testcase: TestcaseObjects {
            input: object(input),
            output: object(output),
        },
        constraints: problem.constraints.clone(),
        language: submission.language.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::store::memory::{MemoryProblemStore, MemorySubmissionStore};
    use crate::types::{Constraints, FileRef, ProblemTestcase, SubmissionType};

    #[derive(Default)]
    struct RecordingPublisher {
        tasks: Mutex<Vec<GradingTask>>,
    }

    #[async_trait]
    impl TaskPublisher for RecordingPublisher {
        async fn publish_grading(&self, task: GradingTask) -> Result<()> {
            self.tasks.lock().await.push(task);
            Ok(())
        }
    }

    /// Publisher that accepts the first task, then fails the next
    /// `failures` publishes before recovering.
    struct FlakyPublisher {
        tasks: Mutex<Vec<GradingTask>>,
        failures: Mutex<u32>,
    }

    impl FlakyPublisher {
        fn failing_after_first(failures: u32) -> Self {
            Self {
                tasks: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl TaskPublisher for FlakyPublisher {
        async fn publish_grading(&self, task: GradingTask) -> Result<()> {
            let mut tasks = self.tasks.lock().await;
            if !tasks.is_empty() {
                let mut failures = self.failures.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(JudgeError::Infra(anyhow::anyhow!("queue unavailable")));
                }
            }
            tasks.push(task);
            Ok(())
        }
    }

    fn constraints() -> Constraints {
        Constraints {
            time: 1000,
            wall_time: None,
            memory: 262144,
            total_storage: None,
            processes: None,
        }
    }

    fn file_ref(name: &str) -> FileRef {
        FileRef {
            name: name.to_string(),
            version_id: format!("v-{}", name),
        }
    }

    fn problem_with_points(points: &[u32]) -> Problem {
        Problem {
            id: "p1".to_string(),
            domain_id: "d1".to_string(),
            constraints: constraints(),
            testcases: Some(
                points
                    .iter()
                    .enumerate()
                    .map(|(i, &points)| ProblemTestcase {
                        points,
                        input: file_ref(&format!("{}.in", i)),
                        output: file_ref(&format!("{}.out", i)),
                    })
                    .collect(),
            ),
        }
    }

    struct Fixture {
        aggregator: ResultAggregator,
        submissions: Arc<MemorySubmissionStore>,
        publisher: Arc<RecordingPublisher>,
    }

    async fn fixture(problem: Problem) -> Fixture {
        let submissions = Arc::new(MemorySubmissionStore::new());
        let problems = Arc::new(MemoryProblemStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        problems.insert(problem).await;

        let mut submission =
            Submission::new_pending("s1", "d1", "p1", SubmissionType::Testing, "cpp");
        submission.status = SubmissionStatus::Compiling;
        submissions.create(submission).await.unwrap();

        Fixture {
            aggregator: ResultAggregator::new(
                submissions.clone(),
                problems,
                publisher.clone(),
            ),
            submissions,
            publisher,
        }
    }

    fn accepted() -> GradingResult {
        GradingResult::Accepted {
            message: "Looks good".to_string(),
            time: 10,
            wall_time: 12,
            memory: 1024,
        }
    }

    fn wrong_answer() -> GradingResult {
        GradingResult::WrongAnswer {
            message: "Mismatch on line 1".to_string(),
            time: 10,
            wall_time: 12,
            memory: 1024,
        }
    }

    fn compile_succeeded() -> CompileResult {
        CompileResult {
            status: CompileStatus::Succeeded,
            submission_id: "s1".to_string(),
            log: None,
        }
    }

    #[tokio::test]
    async fn test_compile_failure_scenario() {
        let f = fixture(problem_with_points(&[10, 10, 5])).await;

        f.aggregator
            .handle_compile_result(&CompileResult {
                status: CompileStatus::Failed,
                submission_id: "s1".to_string(),
                log: Some("main.cpp:1: error".to_string()),
            })
            .await
            .unwrap();

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::CompileFailed);
        assert_eq!(submission.log.as_deref(), Some("main.cpp:1: error"));
        assert!(submission.testcases.is_none());
        assert!(f.publisher.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_compile_success_dispatches_in_testcase_order() {
        let f = fixture(problem_with_points(&[10, 10, 5])).await;

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Grading);
        assert_eq!(submission.graded_cases, Some(0));
        let testcases = submission.testcases.unwrap();
        assert_eq!(testcases.len(), 3);
        assert!(testcases.iter().all(|t| t.result.is_none() && t.score.is_none()));

        let tasks = f.publisher.tasks.lock().await;
        assert_eq!(tasks.len(), 3);
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.testcase_index, i);
            assert_eq!(task.testcase.input.object_name, format!("d1/p1/{}.in", i));
        }
    }

    #[tokio::test]
    async fn test_compile_success_without_testcases_terminates() {
        let f = fixture(Problem {
            id: "p1".to_string(),
            domain_id: "d1".to_string(),
            constraints: constraints(),
            testcases: None,
        })
        .await;

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Terminated);
        assert_eq!(submission.log.as_deref(), Some(NO_TESTCASES_LOG));
        assert!(f.publisher.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_compile_success_republishes_only_ungraded() {
        let f = fixture(problem_with_points(&[10, 10])).await;

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();
        f.aggregator
            .handle_grading_result("s1", 0, accepted())
            .await
            .unwrap();

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        // Initial fan-out published 0 and 1; the redelivery republishes only
        // the still-ungraded index 1 and never re-runs the transition.
        let tasks = f.publisher.tasks.lock().await;
        let indices: Vec<usize> = tasks.iter().map(|t| t.testcase_index).collect();
        assert_eq!(indices, vec![0, 1, 1]);
        drop(tasks);

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Grading);
        assert_eq!(submission.graded_cases, Some(1));
    }

    #[tokio::test]
    async fn test_redelivered_compile_result_after_terminal_state_is_noop() {
        let f = fixture(problem_with_points(&[10])).await;

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();
        f.aggregator
            .handle_grading_result("s1", 0, accepted())
            .await
            .unwrap();

        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        assert_eq!(f.publisher.tasks.lock().await.len(), 1);
        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Graded);
    }

    #[tokio::test]
    async fn test_compile_redelivery_repairs_partial_fanout() {
        let submissions = Arc::new(MemorySubmissionStore::new());
        let problems = Arc::new(MemoryProblemStore::new());
        let publisher = Arc::new(FlakyPublisher::failing_after_first(1));
        problems.insert(problem_with_points(&[10, 10, 5])).await;

        let mut submission =
            Submission::new_pending("s1", "d1", "p1", SubmissionType::Testing, "cpp");
        submission.status = SubmissionStatus::Compiling;
        submissions.create(submission).await.unwrap();

        let aggregator =
            ResultAggregator::new(submissions.clone(), problems, publisher.clone());

        // The fan-out dies after the first publish: the transition is won
        // but only task 0 made it onto the queue.
        let err = aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Infra(_)));
        assert_eq!(publisher.tasks.lock().await.len(), 1);
        let stuck = submissions.fetch("s1").await.unwrap();
        assert_eq!(stuck.status, SubmissionStatus::Grading);

        // Redelivering the compile result publishes every ungraded index.
        aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();
        let tasks = publisher.tasks.lock().await;
        for index in 0..3 {
            assert!(tasks.iter().any(|t| t.testcase_index == index));
        }
        drop(tasks);

        // Grading can now run to a terminal state.
        for index in 0..3 {
            aggregator
                .handle_grading_result("s1", index, accepted())
                .await
                .unwrap();
        }
        let submission = submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Graded);
        assert_eq!(submission.score, Some(25));
    }

    #[tokio::test]
    async fn test_completion_determinism_out_of_order() {
        let f = fixture(problem_with_points(&[10, 10, 5])).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        // Results arrive in index order 2, 0, 1.
        assert!(f
            .aggregator
            .handle_grading_result("s1", 2, accepted())
            .await
            .unwrap()
            .is_none());
        assert!(f
            .aggregator
            .handle_grading_result("s1", 0, wrong_answer())
            .await
            .unwrap()
            .is_none());
        let finalized = f
            .aggregator
            .handle_grading_result("s1", 1, accepted())
            .await
            .unwrap()
            .expect("last result finalizes");

        assert_eq!(finalized.status, SubmissionStatus::Graded);
        assert_eq!(finalized.score, Some(15));
        assert!(finalized.graded_cases.is_none());

        let testcases = finalized.testcases.unwrap();
        assert_eq!(testcases[0].score, Some(0));
        assert_eq!(testcases[1].score, Some(10));
        assert_eq!(testcases[2].score, Some(5));
    }

    #[tokio::test]
    async fn test_graded_cases_counts_distinct_indices() {
        let f = fixture(problem_with_points(&[5, 5, 5, 5])).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        for index in [3, 1] {
            f.aggregator
                .handle_grading_result("s1", index, accepted())
                .await
                .unwrap();
        }
        // Duplicate delivery of index 1 must not re-increment.
        f.aggregator
            .handle_grading_result("s1", 1, wrong_answer())
            .await
            .unwrap();

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.graded_cases, Some(2));
        // The first result for index 1 wins.
        assert!(submission.testcases.unwrap()[1]
            .result
            .as_ref()
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn test_replay_after_terminal_state_is_noop() {
        let f = fixture(problem_with_points(&[10])).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();
        f.aggregator
            .handle_grading_result("s1", 0, accepted())
            .await
            .unwrap();

        let graded = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(graded.status, SubmissionStatus::Graded);

        // Redelivery of both message kinds leaves persisted state unchanged.
        let replay = f
            .aggregator
            .handle_grading_result("s1", 0, wrong_answer())
            .await
            .unwrap();
        assert!(replay.is_none());
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        let after = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(after.status, SubmissionStatus::Graded);
        assert_eq!(after.score, graded.score);
        assert!(after.testcases.unwrap()[0]
            .result
            .as_ref()
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_not_found() {
        let f = fixture(problem_with_points(&[10])).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        let err = f
            .aggregator
            .handle_grading_result("s1", 7, accepted())
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::NotFound(_)));

        // Submission left untouched.
        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.graded_cases, Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_delivery_finalizes_exactly_once() {
        let points: Vec<u32> = (0..16).map(|_| 1).collect();
        let f = fixture(problem_with_points(&points)).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();

        let aggregator = Arc::new(f.aggregator);
        let mut handles = Vec::new();
        for index in 0..16 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                aggregator
                    .handle_grading_result("s1", index, accepted())
                    .await
                    .unwrap()
            }));
        }

        let mut finalized = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                finalized += 1;
            }
        }
        assert_eq!(finalized, 1);

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Graded);
        assert_eq!(submission.score, Some(16));
    }

    #[tokio::test]
    async fn test_terminate_during_grading() {
        let f = fixture(problem_with_points(&[10, 10])).await;
        f.aggregator
            .handle_compile_result(&compile_succeeded())
            .await
            .unwrap();
        f.aggregator
            .handle_grading_result("s1", 0, accepted())
            .await
            .unwrap();

        f.aggregator
            .terminate("s1", Some("operator stop"))
            .await
            .unwrap();

        let submission = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Terminated);
        assert_eq!(submission.log.as_deref(), Some("operator stop"));

        // Late result for the remaining testcase is absorbed.
        let late = f
            .aggregator
            .handle_grading_result("s1", 1, accepted())
            .await
            .unwrap();
        assert!(late.is_none());
        let after = f.submissions.fetch("s1").await.unwrap();
        assert_eq!(after.status, SubmissionStatus::Terminated);
    }
}
