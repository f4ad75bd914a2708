use std::collections::BTreeSet;

/// Session-scoped tool allow-list. Tools on the list run without asking; all
/// others need an interactive decision per call. Grants only ever widen the
/// list and last until the process exits.
#[derive(Debug, Default)]
pub struct PermissionState {
    allowed: BTreeSet<String>,
}

impl PermissionState {
    pub fn new(permitted: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: permitted.into_iter().collect(),
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        self.allowed.contains(tool_name)
    }

    pub fn grant_for_session(&mut self, tool_name: impl Into<String>) {
        self.allowed.insert(tool_name.into());
    }

    pub fn allowed_tools(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}
