use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;

/// Declaration of one invocable tool: the name the model calls it by, a
/// description for the model, and a JSON-schema parameter object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// All tools the session can dispatch: the builtins plus any discovered
/// plugin executables. Names are unique; a plugin cannot shadow a builtin.
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    plugin_paths: HashMap<String, PathBuf>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            specs: builtin_tools(),
            plugin_paths: HashMap::new(),
        }
    }

    /// Register a plugin tool. Returns false (and registers nothing) when the
    /// name collides with an existing tool.
    pub fn register_plugin(&mut self, spec: ToolSpec, path: PathBuf) -> bool {
        if self.contains(&spec.name) {
            return false;
        }
        self.plugin_paths.insert(spec.name.clone(), path);
        self.specs.push(spec);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.iter().any(|spec| spec.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|spec| spec.name.clone()).collect()
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn plugin_path(&self, name: &str) -> Option<&PathBuf> {
        self.plugin_paths.get(name)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn builtin_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_files".to_string(),
            description: "List files and directories under a path in the workspace.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "recursive": { "type": "boolean" },
                    "max_entries": { "type": "integer", "minimum": 1, "maximum": 2000 }
                }
            }),
        },
        ToolSpec {
            name: "read_file".to_string(),
            description: "Read the content of a file in the workspace.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        },
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write content to a file in the workspace, creating it if needed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        },
        ToolSpec {
            name: "search_files".to_string(),
            description:
                "Find files whose names match a glob pattern (supports * and ?), searching \
                 recursively from a path."
                    .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "max_results": { "type": "integer", "minimum": 1, "maximum": 200 }
                },
                "required": ["pattern"]
            }),
        },
        ToolSpec {
            name: "search_file".to_string(),
            description: "Search text across file contents and return matching lines.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "path": { "type": "string" },
                    "max_results": { "type": "integer", "minimum": 1, "maximum": 200 }
                },
                "required": ["query"]
            }),
        },
    ]
}
