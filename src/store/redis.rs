//! Redis-backed store implementations.
//!
//! Each submission lives in one hash (`submission:{id}`): identity fields in
//! a `base` JSON blob, dynamic fields (`status`, `log`, `score`, `graded`,
//! `total`) as their own hash entries, and per-testcase data under
//! `tc:{i}` / `tcres:{i}` / `tcscore:{i}`. Every transition runs as a small
//! Lua script so the status guard, the field writes, and the counter
//! increment happen as one server-side atomic operation.

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::error::{JudgeError, Result};
use crate::messages::GradingResult;
use crate::store::{ProblemStore, RecordedResult, SubmissionStore};
use crate::types::{
    Problem, Submission, SubmissionStatus, SubmissionTestcase, SubmissionType,
};

fn submission_key(id: &str) -> String {
    format!("submission:{}", id)
}

fn problem_key(domain_id: &str, problem_id: &str) -> String {
    format!("problem:{}:{}", domain_id, problem_id)
}

const BEGIN_COMPILING: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'Pending' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'Compiling')
return 1
"#;

const BEGIN_GRADING: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'Compiling' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'Grading', 'graded', 0, 'total', ARGV[1])
for i = 2, #ARGV do
  redis.call('HSET', KEYS[1], 'tc:' .. (i - 2), ARGV[i])
end
return 1
"#;

const MARK_COMPILE_FAILED: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'Compiling' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'CompileFailed', 'log', ARGV[1])
return 1
"#;

const RECORD_RESULT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'Grading' then return {0, 0, 0} end
local total = tonumber(redis.call('HGET', KEYS[1], 'total'))
if tonumber(ARGV[1]) >= total then return {-1, 0, total} end
if redis.call('HEXISTS', KEYS[1], 'tcres:' .. ARGV[1]) == 1 then
  return {0, tonumber(redis.call('HGET', KEYS[1], 'graded')), total}
end
redis.call('HSET', KEYS[1], 'tcres:' .. ARGV[1], ARGV[2], 'tcscore:' .. ARGV[1], ARGV[3])
local graded = redis.call('HINCRBY', KEYS[1], 'graded', 1)
return {1, graded, total}
"#;

const FINALIZE: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'Grading' then return 0 end
local total = tonumber(redis.call('HGET', KEYS[1], 'total'))
if tonumber(redis.call('HGET', KEYS[1], 'graded')) ~= total then return 0 end
local score = 0
for i = 0, total - 1 do
  local s = redis.call('HGET', KEYS[1], 'tcscore:' .. i)
  if s then score = score + tonumber(s) end
end
redis.call('HSET', KEYS[1], 'status', 'Graded', 'score', score)
redis.call('HDEL', KEYS[1], 'graded')
return 1
"#;

const TERMINATE: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'Pending' or status == 'Compiling' then
  redis.call('HSET', KEYS[1], 'status', 'Terminated', 'log', ARGV[1])
  return 1
end
if status ~= 'Grading' then return 0 end
local total = tonumber(redis.call('HGET', KEYS[1], 'total'))
if tonumber(redis.call('HGET', KEYS[1], 'graded')) ~= total then
  redis.call('HSET', KEYS[1], 'status', 'Terminated', 'log', ARGV[1])
  return 1
end
local score = 0
for i = 0, total - 1 do
  local s = redis.call('HGET', KEYS[1], 'tcscore:' .. i)
  if s then score = score + tonumber(s) end
end
redis.call('HSET', KEYS[1], 'status', 'Graded', 'score', score)
redis.call('HDEL', KEYS[1], 'graded')
return 1
"#;

/// Identity fields frozen at creation time.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseDoc {
    id: String,
    domain_id: String,
    problem_id: String,
    #[serde(rename = "type")]
    submission_type: SubmissionType,
    language: String,
    contest_id: Option<String>,
    team_id: Option<String>,
}

pub struct RedisSubmissionStore {
    conn: MultiplexedConnection,
    begin_compiling: Script,
    begin_grading: Script,
    mark_compile_failed: Script,
    record_result: Script,
    finalize: Script,
    terminate: Script,
}

impl RedisSubmissionStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            begin_compiling: Script::new(BEGIN_COMPILING),
            begin_grading: Script::new(BEGIN_GRADING),
            mark_compile_failed: Script::new(MARK_COMPILE_FAILED),
            record_result: Script::new(RECORD_RESULT),
            finalize: Script::new(FINALIZE),
            terminate: Script::new(TERMINATE),
        }
    }

    async fn run_guarded(&self, script: &Script, id: &str, args: &[String]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = script.key(submission_key(id));
        for arg in args {
            invocation.arg(arg);
        }
        let applied: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }
}

#[async_trait]
impl SubmissionStore for RedisSubmissionStore {
    async fn create(&self, submission: Submission) -> Result<()> {
        let base = BaseDoc {
            id: submission.id.clone(),
            domain_id: submission.domain_id.clone(),
            problem_id: submission.problem_id.clone(),
            submission_type: submission.submission_type,
            language: submission.language.clone(),
            contest_id: submission.contest_id.clone(),
            team_id: submission.team_id.clone(),
        };

        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(
            submission_key(&submission.id),
            &[
                ("base", serde_json::to_string(&base)?),
                ("status", status_str(submission.status).to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Submission> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(submission_key(id)).await?;

        if fields.is_empty() {
            return Err(JudgeError::NotFound(format!(
                "No submission found with the given ID: {}",
                id
            )));
        }

        let base: BaseDoc = serde_json::from_str(
            fields
                .get("base")
                .ok_or_else(|| JudgeError::Infra(anyhow::anyhow!("Submission missing base doc")))?,
        )?;
        let status = parse_status(
            fields
                .get("status")
                .map(String::as_str)
                .unwrap_or("Pending"),
        )?;

        let testcases = match fields.get("total") {
            Some(total) => {
                let total: usize = total.parse().context("Invalid testcase total")?;
                let mut testcases = Vec::with_capacity(total);
                for i in 0..total {
                    let tc = fields.get(&format!("tc:{}", i)).ok_or_else(|| {
                        JudgeError::Infra(anyhow::anyhow!("Submission missing testcase {}", i))
                    })?;
                    let mut testcase: SubmissionTestcase = serde_json::from_str(tc)?;
                    if let Some(result) = fields.get(&format!("tcres:{}", i)) {
                        testcase.result = Some(serde_json::from_str::<GradingResult>(result)?);
                        testcase.score = fields
                            .get(&format!("tcscore:{}", i))
                            .and_then(|s| s.parse().ok());
                    }
                    testcases.push(testcase);
                }
                Some(testcases)
            }
            None => None,
        };

        Ok(Submission {
            id: base.id,
            domain_id: base.domain_id,
            problem_id: base.problem_id,
            submission_type: base.submission_type,
            language: base.language,
            contest_id: base.contest_id,
            team_id: base.team_id,
            status,
            testcases,
            graded_cases: fields.get("graded").and_then(|g| g.parse().ok()),
            score: fields.get("score").and_then(|s| s.parse().ok()),
            log: fields.get("log").cloned(),
        })
    }

    async fn begin_compiling(&self, id: &str) -> Result<bool> {
        self.run_guarded(&self.begin_compiling, id, &[]).await
    }

    async fn begin_grading(&self, id: &str, testcases: Vec<SubmissionTestcase>) -> Result<bool> {
        let mut args = vec![testcases.len().to_string()];
        for testcase in &testcases {
            args.push(serde_json::to_string(testcase)?);
        }
        self.run_guarded(&self.begin_grading, id, &args).await
    }

    async fn mark_compile_failed(&self, id: &str, log: &str) -> Result<bool> {
        self.run_guarded(&self.mark_compile_failed, id, &[log.to_string()])
            .await
    }

    async fn record_testcase_result(
        &self,
        id: &str,
        index: usize,
        result: &GradingResult,
        score: u32,
    ) -> Result<RecordedResult> {
        let mut conn = self.conn.clone();
        let (recorded, graded, total): (i32, u32, u32) = self
            .record_result
            .key(submission_key(id))
            .arg(index)
            .arg(serde_json::to_string(result)?)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        if recorded == -1 {
            return Err(JudgeError::NotFound(format!(
                "No testcase found at the given index: {}",
                index
            )));
        }

        Ok(RecordedResult {
            recorded: recorded == 1,
            graded,
            total,
        })
    }

    async fn finalize(&self, id: &str) -> Result<bool> {
        self.run_guarded(&self.finalize, id, &[]).await
    }

    async fn terminate(&self, id: &str, log: Option<&str>) -> Result<bool> {
        self.run_guarded(&self.terminate, id, &[log.unwrap_or_default().to_string()])
            .await
    }
}

fn status_str(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Pending => "Pending",
        SubmissionStatus::Compiling => "Compiling",
        SubmissionStatus::CompileFailed => "CompileFailed",
        SubmissionStatus::Grading => "Grading",
        SubmissionStatus::Graded => "Graded",
        SubmissionStatus::Terminated => "Terminated",
    }
}

fn parse_status(value: &str) -> Result<SubmissionStatus> {
    match value {
        "Pending" => Ok(SubmissionStatus::Pending),
        "Compiling" => Ok(SubmissionStatus::Compiling),
        "CompileFailed" => Ok(SubmissionStatus::CompileFailed),
        "Grading" => Ok(SubmissionStatus::Grading),
        "Graded" => Ok(SubmissionStatus::Graded),
        "Terminated" => Ok(SubmissionStatus::Terminated),
        other => Err(JudgeError::Infra(anyhow::anyhow!(
            "Unknown submission status: {}",
            other
        ))),
    }
}

/// Problem documents stored as JSON values under `problem:{domain}:{id}`.
pub struct RedisProblemStore {
    conn: MultiplexedConnection,
}

impl RedisProblemStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ProblemStore for RedisProblemStore {
    async fn fetch_problem(&self, domain_id: &str, problem_id: &str) -> Result<Problem> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(problem_key(domain_id, problem_id)).await?;
        match value {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(JudgeError::NotFound(format!(
                "No problem found with the given ID: {}/{}",
                domain_id, problem_id
            ))),
        }
    }
}
