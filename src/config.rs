use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{expand_home, is_local_endpoint_url, parse_bool_flag};

const DEFAULT_PERMITTED_TOOLS: [&str; 2] = ["list_files", "search_file"];
const DEFAULT_EXCLUDE_PATTERNS: [&str; 7] = [
    ".git",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "*.log",
    "*.tmp",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: String,
    pub anthropic_version: String,
    pub system_prompt: Option<String>,
    pub working_dir: PathBuf,
    /// None disables history persistence.
    pub session_dir: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    /// Tools exempt from interactive permission prompts for the whole session.
    pub permitted_tools: Vec<String>,
    /// File name patterns the tools refuse to touch.
    pub exclude_patterns: Vec<String>,
    pub max_tool_rounds: usize,
    pub tool_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_url = std::env::var("QUILL_API_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string());
        let api_key = std::env::var("QUILL_API_KEY").ok().and_then(|v| {
            if v.trim().is_empty() {
                None
            } else {
                Some(v)
            }
        });
        let model = std::env::var("QUILL_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-5-20250929".to_string());
        let anthropic_version =
            std::env::var("QUILL_ANTHROPIC_VERSION").unwrap_or_else(|_| "2023-06-01".to_string());
        let system_prompt = std::env::var("QUILL_SYSTEM_PROMPT")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let save_history = std::env::var("QUILL_SAVE_HISTORY")
            .ok()
            .and_then(parse_bool_flag)
            .unwrap_or(true);
        let session_dir = if save_history {
            let dir = std::env::var("QUILL_SESSION_DIR").unwrap_or_else(|_| "~/.quill".to_string());
            Some(PathBuf::from(expand_home(&dir)))
        } else {
            None
        };

        let plugin_dir = std::env::var("QUILL_PLUGIN_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| Some("~/.quill/plugins".to_string()))
            .map(|dir| PathBuf::from(expand_home(&dir)));

        let permitted_tools = std::env::var("QUILL_PERMITTED_TOOLS")
            .map(|v| {
                v.split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| {
                DEFAULT_PERMITTED_TOOLS
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            });

        let max_tool_rounds = std::env::var("QUILL_MAX_TOOL_ROUNDS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(8)
            .clamp(1, 64);

        let tool_timeout_secs = std::env::var("QUILL_TOOL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(60)
            .clamp(1, 600);

        Ok(Self {
            api_key,
            model,
            api_url,
            anthropic_version,
            system_prompt,
            working_dir: std::env::current_dir()?,
            session_dir,
            plugin_dir,
            permitted_tools,
            exclude_patterns: DEFAULT_EXCLUDE_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_tool_rounds,
            tool_timeout: Duration::from_secs(tool_timeout_secs),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!(
                "Invalid QUILL_API_URL '{}': expected http:// or https:// URL",
                self.api_url
            );
        }

        if !self.is_local_endpoint() && self.api_key.is_none() {
            bail!(
                "QUILL_API_KEY must be set for non-local endpoints (url: '{}')",
                self.api_url
            );
        }

        Ok(())
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }
}
