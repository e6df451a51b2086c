//! Sandbox Controller built on the isolate sandbox.
//!
//! Owns a pool of numbered boxes (filesystem + cgroup scope). `acquire`
//! initializes a clean box, `run` executes one resource-limited command
//! inside it, `release` tears it down. Outcomes are derived purely from
//! isolate's own post-run metadata, never from the process exit code of the
//! judged program: a user program's intentional non-zero exit must not be
//! conflated with a sandbox-detected violation.
//!
//! See: https://github.com/ioi/isolate

pub mod meta;

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{JudgeError, Result};
use crate::types::Constraints;
use meta::{parse_meta, SandboxMeta};

/// One sandbox invocation: a command plus the files and limits it runs with.
/// Paths are relative to the box working directory.
#[derive(Debug, Clone)]
pub struct SandboxTask {
    pub command: Vec<String>,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub stderr_path: Option<String>,
    pub env: Vec<String>,
    pub constraints: Constraints,
}

/// Typed classification of a sandboxed run. Exactly one variant per
/// invocation; the controller never retries on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Succeeded {
        time: u32,
        wall_time: u32,
        memory: u32,
        message: String,
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

/// Box lifecycle seam. Executors depend on this instead of the concrete
/// controller so their recovery paths can be exercised without isolate.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn acquire(&self, box_id: u32) -> Result<String>;
    async fn release(&self, box_id: u32);
    async fn run(&self, box_id: u32, task: &SandboxTask) -> Result<SandboxOutcome>;
}

/// Controller for the isolate box pool.
#[derive(Debug, Clone)]
pub struct SandboxController {
    meta_dir: PathBuf,
}

impl SandboxController {
    pub fn new(meta_dir: impl Into<PathBuf>) -> Self {
        Self {
            meta_dir: meta_dir.into(),
        }
    }

    /// Create a controller from the `BOX_META_DIR` environment variable.
    pub fn from_env() -> Self {
        let meta_dir = std::env::var("BOX_META_DIR").unwrap_or_else(|_| "/tmp".into());
        Self::new(meta_dir)
    }

    fn meta_path(&self, box_id: u32) -> PathBuf {
        self.meta_dir.join(format!("meta-{}.txt", box_id))
    }

    /// Initialize a clean box and return its working directory.
    ///
    /// Fails with `ResourceConflict` if the box is already initialized
    /// (stale state from a crashed worker); the caller must `release` and
    /// retry.
    pub async fn acquire(&self, box_id: u32) -> Result<String> {
        let output = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cg", "--init"])
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            return Err(init_failure(
                box_id,
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Initialized isolate box {} at {}", box_id, box_path);

        Ok(format!("{}/box", box_path))
    }

    /// Tear down a box. Idempotent; failures are logged, never propagated,
    /// since correctness does not depend on cleanup succeeding before the
    /// next acquire attempt.
    pub async fn release(&self, box_id: u32) {
        match Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cleanup", "--cg"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!("Cleaned up isolate box {}", box_id);
            }
            Ok(output) => {
                warn!(
                    "isolate cleanup for box {} failed: {}",
                    box_id,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Err(e) => {
                warn!("Failed to run isolate cleanup for box {}: {}", box_id, e);
            }
        }
    }

    /// Run a command inside an acquired box, blocking for at most the task's
    /// wall time (default: 3x the CPU time limit). The outcome is read from
    /// isolate's meta file regardless of exit status.
    pub async fn run(&self, box_id: u32, task: &SandboxTask) -> Result<SandboxOutcome> {
        let meta_path = self.meta_path(box_id);
        let args = self.build_run_args(box_id, task, &meta_path);

        debug!("Running isolate with args: {:?}", args);

        let output = Command::new("isolate")
            .args(&args)
            .output()
            .await
            .context("Failed to run isolate")?;

        // Meta absence is an outcome, any other read failure is fatal.
        let meta = match fs::read_to_string(&meta_path).await {
            Ok(content) => Some(parse_meta(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(JudgeError::Infra(anyhow::Error::new(e).context(format!(
                    "Failed to read sandbox meta file {:?}",
                    meta_path
                ))))
            }
        };

        let _ = fs::remove_file(&meta_path).await;

        Ok(derive_outcome(
            output.status.success(),
            meta.as_ref(),
            &task.constraints,
        ))
    }

    fn build_run_args(&self, box_id: u32, task: &SandboxTask, meta_path: &PathBuf) -> Vec<String> {
        let mut args = vec![
            "--run".to_string(),
            "--cg".to_string(),
            format!("--box-id={}", box_id),
            format!("--meta={}", meta_path.display()),
            format!("--cg-mem={}", task.constraints.memory),
            format!("--time={}", task.constraints.time as f64 / 1000.0),
        ];

        let wall_time = task
            .constraints
            .wall_time
            .map(|w| w as f64 / 1000.0)
            .unwrap_or(task.constraints.time as f64 / 1000.0 * 3.0);
        args.push(format!("--wall-time={}", wall_time));

        if let Some(total_storage) = task.constraints.total_storage {
            args.push(format!("--fsize={}", total_storage));
        }
        if let Some(processes) = task.constraints.processes {
            args.push(format!("--processes={}", processes));
        }
        for env in &task.env {
            args.push(format!("--env={}", env));
        }
        if let Some(input) = &task.input_path {
            args.push(format!("--stdin={}", input));
        }
        if let Some(output) = &task.output_path {
            args.push(format!("--stdout={}", output));
        }
        if let Some(stderr) = &task.stderr_path {
            args.push(format!("--stderr={}", stderr));
        }

        args.push("--".to_string());
        args.extend(task.command.iter().cloned());
        args
    }
}

#[async_trait]
impl Sandbox for SandboxController {
    async fn acquire(&self, box_id: u32) -> Result<String> {
        SandboxController::acquire(self, box_id).await
    }

    async fn release(&self, box_id: u32) {
        SandboxController::release(self, box_id).await
    }

    async fn run(&self, box_id: u32, task: &SandboxTask) -> Result<SandboxOutcome> {
        SandboxController::run(self, box_id, task).await
    }
}

/// Classify a failed `isolate --init`. A box that is already initialized is
/// a conflict the caller recovers from by releasing and retrying; anything
/// else is an infrastructure failure.
fn init_failure(box_id: u32, stderr: &str) -> JudgeError {
    if stderr.contains("Box already exists") {
        JudgeError::ResourceConflict(format!("box {} already exists", box_id))
    } else {
        JudgeError::Infra(anyhow::anyhow!(
            "Failed to initialize isolate box {}: {}",
            box_id,
            stderr
        ))
    }
}

/// The signal the memory cgroup uses to kill an over-limit process.
const CGROUP_KILL_SIGNAL: i32 = 9;

/// Derive the typed outcome from isolate's exit state and parsed metadata.
///
/// A `CG` status only becomes `MemoryExceeded` when the kill signal is the
/// memory-cgroup kill signal and the reported peak memory actually exceeds
/// the configured limit; a process killed by the same signal for another
/// reason is a `RuntimeError`.
pub fn derive_outcome(
    exec_ok: bool,
    meta: Option<&SandboxMeta>,
    constraints: &Constraints,
) -> SandboxOutcome {
    let Some(meta) = meta else {
        return SandboxOutcome::SystemError {
            message: "Meta file does not exist on abnormal termination".to_string(),
        };
    };

    if exec_ok {
        return match (meta.time_ms, meta.wall_time_ms, meta.memory_kb) {
            (Some(time), Some(wall_time), Some(memory)) => SandboxOutcome::Succeeded {
                time,
                wall_time,
                memory,
                message: "Task completed successfully".to_string(),
            },
            _ => SandboxOutcome::SystemError {
                message: "Isolate reported OK but no time or memory info found in meta"
                    .to_string(),
            },
        };
    }

    match meta.status.as_deref() {
        Some("XX") => SandboxOutcome::SystemError {
            message: meta
                .message
                .clone()
                .unwrap_or_else(|| "Isolate threw system error".to_string()),
        },
        Some("RE") => SandboxOutcome::RuntimeError {
            message: meta
                .message
                .clone()
                .unwrap_or_else(|| "Isolate threw runtime error".to_string()),
        },
        Some("CG") => match meta.memory_kb {
            Some(memory)
                if meta.exit_signal == Some(CGROUP_KILL_SIGNAL)
                    && memory > constraints.memory =>
            {
                SandboxOutcome::MemoryExceeded { memory }
            }
            _ => SandboxOutcome::RuntimeError {
                message: meta
                    .message
                    .clone()
                    .unwrap_or_else(|| "Program exit on signal".to_string()),
            },
        },
        Some("TO") => match (meta.time_ms, meta.wall_time_ms) {
            (Some(time), Some(wall_time)) => SandboxOutcome::TimeExceeded { time, wall_time },
            _ => SandboxOutcome::SystemError {
                message: "Isolate reported timeout but no time info found in meta".to_string(),
            },
        },
        _ => SandboxOutcome::SystemError {
            message: "Unknown status on abnormal termination".to_string(),
        },
    }
}
