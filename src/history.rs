use crate::types::Message;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Persists the conversation transcript as one JSON file per session,
/// rewritten in full after every appended message. Disabled entirely when no
/// session directory is configured.
pub struct HistoryStore {
    dir: PathBuf,
    session_id: String,
}

impl HistoryStore {
    pub fn new(dir: PathBuf) -> Self {
        let session_id = new_session_id();
        Self { dir, session_id }
    }

    #[cfg(test)]
    pub fn with_session_id(dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            dir,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_path(&self) -> PathBuf {
        self.dir.join(format!("session-{}.json", self.session_id))
    }

    pub fn save(&self, messages: &[Message]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create session dir {}", self.dir.display()))?;
        let serialized =
            serde_json::to_string_pretty(messages).context("Failed to serialize session history")?;
        let path = self.session_path();
        fs::write(&path, serialized)
            .with_context(|| format!("Failed to write session file {}", path.display()))
    }

    pub fn load(&self) -> Result<Vec<Message>> {
        let path = self.session_path();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        serde_json::from_str(&raw).context("Failed to parse session history")
    }
}

fn new_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("{timestamp}-{}", std::process::id())
}
