use super::registry::ToolSpec;
use crate::logging;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Scan a directory for plugin executables and collect their tool specs.
/// Each candidate is asked to describe itself via `--describe`; plugins that
/// fail to answer or return malformed JSON are skipped with a log line.
pub fn discover_plugins(dir: &Path) -> Vec<(ToolSpec, PathBuf)> {
    let mut discovered = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // A missing plugin directory is normal on first run.
        Err(_) => return discovered,
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_executable(path))
        .collect();
    paths.sort();

    for path in paths {
        match describe_plugin(&path) {
            Ok(spec) => discovered.push((spec, path)),
            Err(error) => {
                logging::emit_message(&format!(
                    "WARN plugin_describe_failed path={} error={error}",
                    path.display()
                ));
            }
        }
    }

    discovered
}

fn describe_plugin(path: &Path) -> Result<ToolSpec> {
    let output = Command::new(path)
        .arg("--describe")
        .output()
        .with_context(|| format!("Failed to execute plugin {}", path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        bail!("--describe exited with {}: {stderr}", output.status);
    }

    let described: Value = serde_json::from_slice(&output.stdout)
        .context("--describe output is not valid JSON")?;

    let name = described
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .context("--describe output is missing a 'name' field")?
        .trim()
        .to_string();
    let description = described
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let parameters = described
        .get("parameters")
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object" }));

    Ok(ToolSpec {
        name,
        description,
        parameters,
    })
}

/// Run a plugin with the model-supplied arguments. The plugin receives one
/// JSON envelope on stdin, `{"input": <arguments>, "cwd": <workspace>}`, and
/// replies with its result on stdout.
pub fn run_plugin(path: &Path, arguments: &str, cwd: &Path) -> Result<String> {
    let input: Value =
        serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()));
    let envelope = json!({
        "input": input,
        "cwd": cwd.to_string_lossy(),
    });

    let mut child = Command::new(path)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute plugin {}", path.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A plugin may exit without reading stdin; its own exit status and
        // stderr are the diagnostics worth reporting, not the broken pipe.
        if let Err(error) = stdin.write_all(envelope.to_string().as_bytes()) {
            if error.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(error).context("Failed to write plugin input");
            }
        }
    }

    let output = child
        .wait_with_output()
        .context("Failed to collect plugin output")?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let details = if stderr.is_empty() { stdout } else { stderr };
        bail!("plugin exited with {}: {details}", output.status);
    }

    Ok(stdout)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
