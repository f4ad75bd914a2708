use super::executor::ToolSandbox;
use super::plugins;
use super::registry::ToolRegistry;
use crate::types::ToolCall;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The result of one tool invocation, already flattened into the text form
/// that goes back to the model. Failures become error outcomes rather than
/// session errors; the model decides how to recover.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Single dispatch point for every tool call a model issues. Builtins run in
/// the sandbox, plugins as subprocesses; both are bounded by the configured
/// timeout.
pub struct ToolGateway {
    registry: ToolRegistry,
    sandbox: ToolSandbox,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    max_entries: Option<usize>,
}

#[derive(Deserialize)]
struct ReadFileArgs {
    path: String,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct SearchFilesArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

#[derive(Deserialize)]
struct SearchFileArgs {
    query: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

impl ToolGateway {
    pub fn new(registry: ToolRegistry, sandbox: ToolSandbox, timeout: Duration) -> Self {
        Self {
            registry,
            sandbox,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn known(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        if !self.registry.contains(&call.name) {
            return ToolOutcome::error(format!(
                "Unknown tool '{}'. Valid tools: {}",
                call.name,
                self.registry.names().join(", ")
            ));
        }

        if let Some(plugin_path) = self.registry.plugin_path(&call.name).cloned() {
            return self.run_plugin_tool(call, plugin_path).await;
        }

        self.run_builtin_tool(call).await
    }

    async fn run_builtin_tool(&self, call: &ToolCall) -> ToolOutcome {
        let sandbox = self.sandbox.clone();
        let name = call.name.clone();
        let arguments = call.arguments.clone();

        let work = tokio::task::spawn_blocking(move || dispatch_builtin(&sandbox, &name, &arguments));

        self.bounded(&call.name, work).await
    }

    async fn run_plugin_tool(&self, call: &ToolCall, plugin_path: PathBuf) -> ToolOutcome {
        let arguments = call.arguments.clone();
        let cwd = self.sandbox.working_dir().to_path_buf();

        let work =
            tokio::task::spawn_blocking(move || plugins::run_plugin(&plugin_path, &arguments, &cwd));

        self.bounded(&call.name, work).await
    }

    async fn bounded(
        &self,
        tool_name: &str,
        work: tokio::task::JoinHandle<Result<String>>,
    ) -> ToolOutcome {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(Ok(content))) => ToolOutcome::ok(content),
            Ok(Ok(Err(error))) => ToolOutcome::error(format!("Tool '{tool_name}' failed: {error}")),
            Ok(Err(join_error)) => {
                ToolOutcome::error(format!("Tool '{tool_name}' panicked: {join_error}"))
            }
            Err(_) => ToolOutcome::error(format!(
                "Tool '{tool_name}' timed out after {} seconds",
                self.timeout.as_secs()
            )),
        }
    }
}

fn dispatch_builtin(sandbox: &ToolSandbox, name: &str, arguments: &str) -> Result<String> {
    match name {
        "list_files" => {
            let args: ListFilesArgs = parse_arguments(arguments)?;
            sandbox.list_files(args.path.as_deref(), args.recursive, args.max_entries)
        }
        "read_file" => {
            let args: ReadFileArgs = parse_arguments(arguments)?;
            sandbox.read_file(&args.path)
        }
        "write_file" => {
            let args: WriteFileArgs = parse_arguments(arguments)?;
            sandbox.write_file(&args.path, &args.content)
        }
        "search_files" => {
            let args: SearchFilesArgs = parse_arguments(arguments)?;
            sandbox.search_files(&args.pattern, args.path.as_deref(), args.max_results)
        }
        "search_file" => {
            let args: SearchFileArgs = parse_arguments(arguments)?;
            sandbox.search_file(&args.query, args.path.as_deref(), args.max_results)
        }
        other => anyhow::bail!("no builtin handler for '{other}'"),
    }
}

fn parse_arguments<'a, T: Deserialize<'a>>(arguments: &'a str) -> Result<T> {
    serde_json::from_str(arguments)
        .map_err(|error| anyhow::anyhow!("invalid tool arguments: {error}"))
}
