//! Worker task executor.
//!
//! Consumes compile and grading tasks and turns them into result messages.
//! Each worker process owns a disjoint range of isolate box ids derived from
//! its leased worker id, so concurrent workers on one host never contend for
//! a box. Compiled artifacts travel between the compile and grading stages
//! through the object store under `binaries/{submission_id}`.

use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{JudgeError, Result};
use crate::languages::{get_language_config, LanguageConfig};
use crate::messages::{
    CompileResult, CompileStatus, CompileTask, GradingResult, GradingTask, JudgerTask,
    ResultMessage,
};
use crate::sandbox::{Sandbox, SandboxController, SandboxOutcome, SandboxTask};
use crate::storage::{binary_key, StorageClient};
use crate::types::Constraints;

/// Box ids per worker; worker `w` owns `[w * 100, w * 100 + 99]`.
const BOXES_PER_WORKER: u32 = 100;

/// Compilers fork preprocessors and assemblers, so compile runs get a wider
/// process limit than the single-process default used for grading.
const COMPILE_PROCESSES: u32 = 16;

const COMPILE_LOG_FILE: &str = "compile.log";
const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";

fn sandbox_env() -> Vec<String> {
    vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()]
}

pub struct Worker {
    sandbox: SandboxController,
    storage: StorageClient,
    worker_id: u32,
    box_counter: u32,
}

impl Worker {
    pub fn new(sandbox: SandboxController, storage: StorageClient, worker_id: u32) -> Self {
        Self {
            sandbox,
            storage,
            worker_id,
            box_counter: 0,
        }
    }

    /// Execute one task to completion and build the result message for it.
    /// An `Err` here is an infrastructure failure; the caller must not
    /// publish a result and should requeue the task for another attempt.
    pub async fn process_task(&mut self, task: JudgerTask) -> Result<ResultMessage> {
        match task {
            JudgerTask::Compile(task) => {
                info!("Compiling submission {}", task.submission_id);
                let submission_id = task.submission_id.clone();
                let language = task.language.clone();

                let result = match get_language_config(&language) {
                    Some(config) => self.compile(&task, &config).await?,
                    None => CompileResult {
                        status: CompileStatus::Failed,
                        submission_id,
                        log: Some(format!("Unsupported language: {}", language)),
                    },
                };
                Ok(ResultMessage::Compile(result))
            }
            JudgerTask::Grading(task) => {
                info!(
                    "Grading submission {} testcase {}",
                    task.submission_id, task.testcase_index
                );

                let result = match get_language_config(&task.language) {
                    Some(config) => self.grade(&task, &config).await?,
                    None => GradingResult::SystemError {
                        message: format!("Unsupported language: {}", task.language),
                    },
                };
                Ok(ResultMessage::Grading {
                    submission_id: task.submission_id,
                    testcase_index: task.testcase_index,
                    result,
                })
            }
        }
    }

    async fn compile(
        &mut self,
        task: &CompileTask,
        language: &LanguageConfig,
    ) -> Result<CompileResult> {
        let box_id = self.next_box_id();
        let box_path = self.acquire_box(box_id).await?;

        let result = self.compile_in_box(task, language, box_id, &box_path).await;
        self.sandbox.release(box_id).await;
        result
    }

    async fn compile_in_box(
        &self,
        task: &CompileTask,
        language: &LanguageConfig,
        box_id: u32,
        box_path: &str,
    ) -> Result<CompileResult> {
        fs::write(format!("{}/{}", box_path, language.source_file), &task.source)
            .await
            .context("Failed to write source file into box")?;

        // Interpreted languages: the source itself is the artifact.
        let Some(compile_command) = &language.compile_command else {
            self.storage
                .upload(
                    &binary_key(&task.submission_id),
                    task.source.clone().into_bytes(),
                )
                .await?;
            return Ok(CompileResult {
                status: CompileStatus::Succeeded,
                submission_id: task.submission_id.clone(),
                log: None,
            });
        };

        let sandbox_task = SandboxTask {
            command: compile_command.clone(),
            input_path: None,
            output_path: None,
            stderr_path: Some(COMPILE_LOG_FILE.to_string()),
            env: sandbox_env(),
            constraints: compile_constraints(&task.constraints),
        };
        let outcome = self.sandbox.run(box_id, &sandbox_task).await?;

        let compiler_log = fs::read_to_string(format!("{}/{}", box_path, COMPILE_LOG_FILE))
            .await
            .unwrap_or_default();

        match outcome {
            SandboxOutcome::Succeeded { .. } => {
                let artifact = fs::read(format!("{}/{}", box_path, language.artifact_file))
                    .await
                    .context("Compiler succeeded but produced no artifact")?;
                self.storage
                    .upload(&binary_key(&task.submission_id), artifact)
                    .await?;
                Ok(CompileResult {
                    status: CompileStatus::Succeeded,
                    submission_id: task.submission_id.clone(),
                    log: None,
                })
            }
            SandboxOutcome::SystemError { message } => Err(JudgeError::Infra(anyhow::anyhow!(
                "Sandbox system error while compiling {}: {}",
                task.submission_id,
                message
            ))),
            outcome => Ok(CompileResult {
                status: CompileStatus::Failed,
                submission_id: task.submission_id.clone(),
                log: Some(compile_failure_log(&outcome, &compiler_log)),
            }),
        }
    }

    async fn grade(
        &mut self,
        task: &GradingTask,
        language: &LanguageConfig,
    ) -> Result<GradingResult> {
        let box_id = self.next_box_id();
        let box_path = self.acquire_box(box_id).await?;

        let result = self.grade_in_box(task, language, box_id, &box_path).await;
        self.sandbox.release(box_id).await;
        result
    }

    async fn grade_in_box(
        &self,
        task: &GradingTask,
        language: &LanguageConfig,
        box_id: u32,
        box_path: &str,
    ) -> Result<GradingResult> {
        let artifact = self
            .storage
            .download(&binary_key(&task.submission_id))
            .await?;
        let artifact_path = format!("{}/{}", box_path, language.artifact_file);
        fs::write(&artifact_path, &artifact)
            .await
            .context("Failed to write artifact into box")?;
        fs::set_permissions(&artifact_path, std::fs::Permissions::from_mode(0o755))
            .await
            .context("Failed to mark artifact executable")?;

        let input = self.storage.download_versioned(&task.testcase.input).await?;
        fs::write(format!("{}/{}", box_path, INPUT_FILE), &input)
            .await
            .context("Failed to write testcase input into box")?;
        let expected = self
            .storage
            .download_versioned_string(&task.testcase.output)
            .await?;

        let sandbox_task = SandboxTask {
            command: language.run_command.clone(),
            input_path: Some(INPUT_FILE.to_string()),
            output_path: Some(OUTPUT_FILE.to_string()),
            stderr_path: None,
            env: sandbox_env(),
            constraints: task.constraints.clone(),
        };
        let outcome = self.sandbox.run(box_id, &sandbox_task).await?;

        match outcome {
            SandboxOutcome::Succeeded {
                time,
                wall_time,
                memory,
                ..
            } => {
                let actual = fs::read_to_string(format!("{}/{}", box_path, OUTPUT_FILE))
                    .await
                    .unwrap_or_default();
                if outputs_match(&actual, &expected) {
                    Ok(GradingResult::Accepted {
                        message: "Output matches the expected output".to_string(),
                        time,
                        wall_time,
                        memory,
                    })
                } else {
                    Ok(GradingResult::WrongAnswer {
                        message: "Output differs from the expected output".to_string(),
                        time,
                        wall_time,
                        memory,
                    })
                }
            }
            outcome => Ok(failure_result(outcome)),
        }
    }

    async fn acquire_box(&self, box_id: u32) -> Result<String> {
        acquire_with_recovery(&self.sandbox, box_id).await
    }

    fn next_box_id(&mut self) -> u32 {
        let box_id = self.worker_id * BOXES_PER_WORKER + self.box_counter;
        self.box_counter = (self.box_counter + 1) % BOXES_PER_WORKER;
        box_id
    }
}

/// Acquire a box, recovering once from stale state left by a crashed worker
/// that previously owned this id range. A conflict that survives the cleanup
/// propagates.
async fn acquire_with_recovery(sandbox: &dyn Sandbox, box_id: u32) -> Result<String> {
    match sandbox.acquire(box_id).await {
        Err(JudgeError::ResourceConflict(_)) => {
            warn!("Box {} left over from a previous run, cleaning up", box_id);
            sandbox.release(box_id).await;
            sandbox.acquire(box_id).await
        }
        other => other,
    }
}

fn compile_constraints(base: &Constraints) -> Constraints {
    Constraints {
        processes: Some(base.processes.unwrap_or(COMPILE_PROCESSES).max(COMPILE_PROCESSES)),
        ..base.clone()
    }
}

fn compile_failure_log(outcome: &SandboxOutcome, compiler_log: &str) -> String {
    let reason = match outcome {
        SandboxOutcome::TimeExceeded { .. } => "Compilation timed out".to_string(),
        SandboxOutcome::MemoryExceeded { .. } => {
            "Compiler exceeded the memory limit".to_string()
        }
        SandboxOutcome::RuntimeError { message } => format!("Compilation failed: {}", message),
        _ => "Compilation failed".to_string(),
    };
    if compiler_log.is_empty() {
        reason
    } else {
        format!("{}\n{}", reason, compiler_log)
    }
}

/// Map a non-success sandbox outcome to the grading result reported for it.
fn failure_result(outcome: SandboxOutcome) -> GradingResult {
    match outcome {
        SandboxOutcome::TimeExceeded { time, wall_time } => {
            GradingResult::TimeExceeded { time, wall_time }
        }
        SandboxOutcome::MemoryExceeded { memory } => GradingResult::MemoryExceeded { memory },
        SandboxOutcome::RuntimeError { message } => GradingResult::RuntimeError { message },
        SandboxOutcome::SystemError { message } => GradingResult::SystemError { message },
        SandboxOutcome::Succeeded { message, .. } => GradingResult::SystemError { message },
    }
}

/// Line-based comparison ignoring trailing whitespace on each line and
/// trailing blank lines.
fn outputs_match(actual: &str, expected: &str) -> bool {
    fn normalize(s: &str) -> Vec<&str> {
        let mut lines: Vec<&str> = s.lines().map(|l| l.trim_end()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }
    normalize(actual) == normalize(expected)
}
