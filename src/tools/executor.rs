use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

const DEFAULT_MAX_ENTRIES: usize = 500;
const DEFAULT_MAX_RESULTS: usize = 50;

/// Filesystem access for the builtin tools, confined to one workspace root.
/// Every path from the model resolves through the sandbox; excluded patterns
/// are invisible to listing and search and unreadable/unwritable.
#[derive(Clone)]
pub struct ToolSandbox {
    working_dir: PathBuf,
    canonical_working_dir: PathBuf,
    exclude_patterns: Vec<String>,
}

impl ToolSandbox {
    pub fn new(working_dir: PathBuf, exclude_patterns: Vec<String>) -> Self {
        let canonical_working_dir =
            fs::canonicalize(&working_dir).unwrap_or_else(|_| working_dir.clone());
        Self {
            working_dir,
            canonical_working_dir,
            exclude_patterns,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        if path.starts_with('/') || path.contains('\\') {
            bail!("Security error: absolute or platform-specific path not allowed: {path}");
        }

        let relative_path = Path::new(path);
        for component in relative_path.components() {
            if matches!(component, Component::ParentDir) {
                bail!("Security error: path traversal detected: {path}");
            }
        }

        let requested = self.working_dir.join(relative_path);
        let normalized = self.normalize_path(&requested);
        self.ensure_path_is_within_workspace(&normalized)?;

        Ok(normalized)
    }

    fn ensure_path_is_within_workspace(&self, path: &Path) -> Result<()> {
        let guard_path = if path.exists() {
            path.to_path_buf()
        } else {
            self.nearest_existing_ancestor(path)
                .context("Security error: could not find an existing parent path")?
                .to_path_buf()
        };

        let canonical_guard = fs::canonicalize(&guard_path)
            .with_context(|| format!("Failed to canonicalize {}", guard_path.display()))?;
        if !canonical_guard.starts_with(&self.canonical_working_dir) {
            bail!(
                "Security error: path escapes working directory via symlink or traversal: {}",
                path.display()
            );
        }
        Ok(())
    }

    fn nearest_existing_ancestor<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        let mut current = path;
        while !current.exists() {
            current = current.parent()?;
        }
        Some(current)
    }

    fn normalize_path(&self, path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::Normal(seg) => out.push(seg),
                Component::ParentDir => {
                    if out.components().count() > self.working_dir.components().count() {
                        out.pop();
                    }
                }
                Component::RootDir => out.push(component.as_os_str()),
                Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            }
        }
        out
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude_patterns
            .iter()
            .any(|pattern| glob_match(pattern, name))
    }

    pub fn read_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path)?;
        if self.path_hits_exclusion(&resolved) {
            bail!("Access to '{path}' is excluded by workspace policy");
        }
        fs::read_to_string(&resolved)
            .with_context(|| format!("Failed to read file '{path}'"))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<String> {
        let resolved = self.resolve_path(path)?;
        if self.path_hits_exclusion(&resolved) {
            bail!("Access to '{path}' is excluded by workspace policy");
        }
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory for '{path}'"))?;
        }
        fs::write(&resolved, content).with_context(|| format!("Failed to write file '{path}'"))?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }

    pub fn list_files(
        &self,
        path: Option<&str>,
        recursive: bool,
        max_entries: Option<usize>,
    ) -> Result<String> {
        let root = self.resolve_optional_path(path)?;
        let limit = max_entries.unwrap_or(DEFAULT_MAX_ENTRIES).clamp(1, 2000);
        let mut entries = Vec::new();

        if root.is_file() {
            entries.push(self.describe_entry(&root)?);
        } else {
            self.collect_entries(&root, recursive, limit, &mut entries)?;
        }

        if entries.is_empty() {
            Ok("(no files found)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }

    fn collect_entries(
        &self,
        root: &Path,
        recursive: bool,
        limit: usize,
        entries: &mut Vec<String>,
    ) -> Result<()> {
        let mut children: Vec<_> = fs::read_dir(root)
            .with_context(|| format!("Failed to read directory {}", root.display()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to list entries in {}", root.display()))?;
        children.sort_by_key(|entry| entry.path());

        for child in children {
            if entries.len() >= limit {
                return Ok(());
            }

            let name = child.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || self.is_excluded(&name) {
                continue;
            }

            let path = child.path();
            entries.push(self.describe_entry(&path)?);

            if recursive && path.is_dir() {
                self.collect_entries(&path, recursive, limit, entries)?;
            }
        }
        Ok(())
    }

    fn describe_entry(&self, path: &Path) -> Result<String> {
        let display = self.to_workspace_relative_display(path);
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to inspect {}", path.display()))?;
        if metadata.is_dir() {
            Ok(format!("{display} (directory)"))
        } else {
            Ok(format!("{display} (file, {} bytes)", metadata.len()))
        }
    }

    /// Find files whose names match a glob pattern, recursively from `path`.
    pub fn search_files(
        &self,
        pattern: &str,
        path: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<String> {
        let pattern = non_empty_trimmed(pattern)
            .context("search_files requires a non-empty 'pattern' field")?;
        let root = self.resolve_optional_path(path)?;
        let limit = max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, 200);

        let mut matches = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if matches.len() >= limit {
                break;
            }

            if current.is_dir() {
                let mut children: Vec<_> = fs::read_dir(&current)
                    .with_context(|| format!("Failed to read directory {}", current.display()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .with_context(|| format!("Failed to list entries in {}", current.display()))?;
                children.sort_by_key(|entry| entry.path());
                // Stack order: reversed so traversal stays lexicographic.
                for child in children.into_iter().rev() {
                    let name = child.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with('.') || self.is_excluded(&name) {
                        continue;
                    }
                    stack.push(child.path());
                }
                continue;
            }

            let name = current
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if glob_match(pattern, &name) {
                matches.push(self.to_workspace_relative_display(&current));
            }
        }

        if matches.is_empty() {
            Ok("No matches found.".to_string())
        } else {
            Ok(matches.join("\n"))
        }
    }

    /// Search file contents for a query string. Prefers rg; falls back to a
    /// plain scan when rg is not installed.
    pub fn search_file(
        &self,
        query: &str,
        path: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<String> {
        let query =
            non_empty_trimmed(query).context("search_file requires a non-empty 'query' field")?;
        let root = self.resolve_optional_path(path)?;
        let limit = max_results.unwrap_or(DEFAULT_MAX_RESULTS).clamp(1, 200);

        match self.search_with_rg(query, &root, limit) {
            Ok(result) => Ok(result),
            Err(error) => {
                if error.to_string().contains("Failed to execute rg command") {
                    self.search_content_fallback(query, &root, limit)
                } else {
                    Err(error)
                }
            }
        }
    }

    fn search_with_rg(&self, query: &str, root: &Path, max_results: usize) -> Result<String> {
        let mut search_path = self.to_workspace_relative_display(root);
        if search_path.is_empty() {
            search_path = ".".to_string();
        }
        let mut command = Command::new("rg");
        command
            .current_dir(&self.working_dir)
            .arg("--line-number")
            .arg("--color")
            .arg("never")
            .arg("--smart-case")
            .arg("--max-count")
            .arg(max_results.to_string());
        for pattern in &self.exclude_patterns {
            command.arg("--glob").arg(format!("!{pattern}"));
        }
        let output = command
            .arg("--")
            .arg(query)
            .arg(search_path)
            .output()
            .context("Failed to execute rg command")?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout.is_empty() {
                Ok("No matches found.".to_string())
            } else {
                Ok(stdout)
            }
        } else if output.status.code() == Some(1) {
            Ok("No matches found.".to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            bail!("search_file failed: {}", stderr);
        }
    }

    fn search_content_fallback(
        &self,
        query: &str,
        root: &Path,
        max_results: usize,
    ) -> Result<String> {
        let mut results = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        let case_sensitive = query.chars().any(char::is_uppercase);
        let lowered_query = query.to_lowercase();

        while let Some(path) = stack.pop() {
            if path.is_dir() {
                let mut children: Vec<_> = fs::read_dir(&path)
                    .with_context(|| format!("Failed to read directory {}", path.display()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .with_context(|| format!("Failed to list entries in {}", path.display()))?;
                children.sort_by_key(|entry| entry.path());
                for child in children.into_iter().rev() {
                    let name = child.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with('.') || self.is_excluded(&name) {
                        continue;
                    }
                    stack.push(child.path());
                }
                continue;
            }

            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };

            for (idx, line) in content.lines().enumerate() {
                let is_match = if case_sensitive {
                    line.contains(query)
                } else {
                    line.to_lowercase().contains(&lowered_query)
                };
                if is_match {
                    results.push(format!(
                        "{}:{}:{}",
                        self.to_workspace_relative_display(&path),
                        idx + 1,
                        line
                    ));
                    if results.len() >= max_results {
                        break;
                    }
                }
            }
            if results.len() >= max_results {
                break;
            }
        }

        if results.is_empty() {
            Ok("No matches found.".to_string())
        } else {
            Ok(results.join("\n"))
        }
    }

    fn path_hits_exclusion(&self, resolved: &Path) -> bool {
        resolved
            .strip_prefix(&self.working_dir)
            .map(|relative| {
                relative.components().any(|component| {
                    let name = component.as_os_str().to_string_lossy();
                    self.is_excluded(&name)
                })
            })
            .unwrap_or(false)
    }

    fn resolve_optional_path(&self, path: Option<&str>) -> Result<PathBuf> {
        match path.and_then(non_empty_trimmed) {
            None => Ok(self.working_dir.clone()),
            Some(".") => Ok(self.working_dir.clone()),
            Some(value) => self.resolve_path(value),
        }
    }

    fn to_workspace_relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.working_dir)
            .map(|relative| relative.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string())
    }
}

fn non_empty_trimmed(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Minimal glob matcher: `*` matches any run of characters, `?` matches one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[char], name: &[char]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some('?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(n)) if p == n => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches(&pattern, &name)
}
