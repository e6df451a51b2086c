//! Language configuration for compilation and execution.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use serde::Deserialize;

use crate::error::Result;

/// Configuration for a supported programming language.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Name of the source file (e.g., "main.cpp").
    pub source_file: String,
    /// The file produced by compilation and executed by grading runs.
    /// Equals `source_file` for interpreted languages.
    pub artifact_file: String,
    /// Compile command (None if not needed).
    pub compile_command: Option<Vec<String>>,
    /// Run command.
    pub run_command: Vec<String>,
}

/// Raw TOML configuration for a language.
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    #[serde(default)]
    artifact_file: Option<String>,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Global language configurations.
static LANGUAGES: OnceLock<HashMap<String, LanguageConfig>> = OnceLock::new();

/// Initialize language configurations from the embedded TOML table.
pub fn init_languages() -> Result<()> {
    let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
    let languages = parse_languages(content)?;

    LANGUAGES
        .set(languages)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;

    Ok(())
}

fn parse_languages(content: &str) -> Result<HashMap<String, LanguageConfig>> {
    let raw_configs: HashMap<String, RawLanguageConfig> =
        toml::from_str(content).context("Invalid language configuration")?;

    let mut languages = HashMap::new();

    for (name, raw) in raw_configs {
        let config = LanguageConfig {
            artifact_file: raw
                .artifact_file
                .unwrap_or_else(|| raw.source_file.clone()),
            source_file: raw.source_file,
            compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
            run_command: into_command(&raw.run_command),
        };

        // Main language name plus aliases
        languages.insert(name.to_lowercase(), config.clone());
        for alias in raw.aliases {
            languages.insert(alias.to_lowercase(), config.clone());
        }
    }

    Ok(languages)
}

/// Get language configuration by language name.
pub fn get_language_config(language: &str) -> Option<LanguageConfig> {
    LANGUAGES.get()?.get(&language.to_lowercase()).cloned()
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
