//! Isolate meta file parser.
//!
//! After every run, isolate writes newline-separated `key:value` pairs
//! describing what happened. This is the only place that format is known;
//! everything downstream works with the parsed struct.

/// Parsed contents of an isolate meta file. Every field is optional because
/// isolate only writes what applies to the run in question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxMeta {
    /// Two-letter status code (OK runs have no status line).
    pub status: Option<String>,
    /// Peak cgroup memory in KB.
    pub memory_kb: Option<u32>,
    /// CPU time in milliseconds.
    pub time_ms: Option<u32>,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: Option<u32>,
    /// Signal that terminated the process, if any.
    pub exit_signal: Option<i32>,
    /// Human-readable message from isolate.
    pub message: Option<String>,
}

/// Parse isolate meta file content. Unknown keys and malformed lines are
/// skipped.
pub fn parse_meta(content: &str) -> SandboxMeta {
    let mut meta = SandboxMeta::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(2, ':').collect();
        if parts.len() != 2 {
            continue;
        }

        let key = parts[0].trim();
        let value = parts[1].trim();

        match key {
            "status" => meta.status = Some(value.to_string()),
            "cg-mem" => meta.memory_kb = value.parse().ok(),
            "time" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.time_ms = Some((t * 1000.0).round() as u32);
                }
            }
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = Some((t * 1000.0).round() as u32);
                }
            }
            "exitsig" => meta.exit_signal = value.parse().ok(),
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    meta
}
