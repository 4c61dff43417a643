mod shell;

pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};

use pilot_core::ToolName;
use pilot_policy::PolicyError;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use walkdir::WalkDir;

const MAX_LISTED_FILES: usize = 300;
const MAX_SEARCH_MATCHES: usize = 200;
const MAX_SEARCH_FILE_BYTES: u64 = 1_048_576;
const BINARY_SNIFF_BYTES: usize = 1024;
const SHELL_OUTPUT_TAIL_CHARS: usize = 8000;

/// Everything a tool invocation can fail with. These never crash the loop;
/// the agent folds them into failed tool results so the model can
/// self-correct.
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("Path escapes workspace: {0}")]
    PathEscape(String),
    #[error("Path does not exist: {0}")]
    NotFound(String),
    #[error("Not a file: {0}")]
    NotAFile(String),
    #[error("Invalid line range.")]
    InvalidRange,
    #[error("`find` must not be empty.")]
    EmptyFind,
    #[error("No matches found for `find`.")]
    NoMatch,
    #[error("Replacement count mismatch. expected={expected}, actual={actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("{0}")]
    PolicyViolation(#[from] PolicyError),
    #[error("Shell command timed out after {seconds}s: {command}")]
    ShellTimeout { command: String, seconds: u64 },
    #[error("Failed to spawn shell: {0}")]
    Spawn(String),
    #[error("Missing required argument `{key}` for tool `{tool}`.")]
    MissingArg { tool: &'static str, key: &'static str },
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn has_rg() -> bool {
    static HAS_RG: OnceLock<bool> = OnceLock::new();
    *HAS_RG.get_or_init(|| {
        Command::new("rg")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok()
    })
}

/// Sandboxed file/shell surface. Every operation resolves its path against
/// the workspace root and refuses anything that lands outside it.
pub struct Sandbox {
    workspace: PathBuf,
    shell_timeout: Duration,
    runner: Arc<dyn ShellRunner + Send + Sync>,
    fast_search: bool,
}

impl Sandbox {
    pub fn new(workspace: &Path, shell_timeout: Duration) -> anyhow::Result<Self> {
        Self::with_runner(workspace, shell_timeout, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        shell_timeout: Duration,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            workspace: workspace.canonicalize()?,
            shell_timeout,
            runner,
            fast_search: has_rg(),
        })
    }

    /// Force the manual walk/scan path even when ripgrep is installed.
    /// Both paths must behave identically; tests exercise each.
    pub fn set_fast_search(&mut self, enabled: bool) {
        self.fast_search = enabled;
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Dispatch one validated tool call by name, pulling arguments out of the
    /// model-supplied mapping with per-tool defaults.
    pub fn dispatch(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let tool = ToolName::from_name(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        match tool {
            ToolName::ListFiles => self.list_files(&opt_string_arg(args, "path", ".")),
            ToolName::ReadFile => self.read_file(
                &string_arg(args, "path", tool.as_str())?,
                args.get("start").and_then(Value::as_i64).unwrap_or(1),
                args.get("end").and_then(Value::as_i64).unwrap_or(200),
            ),
            ToolName::WriteFile => self.write_file(
                &string_arg(args, "path", tool.as_str())?,
                &string_arg(args, "content", tool.as_str())?,
            ),
            ToolName::PatchFile => self.patch_file(
                &string_arg(args, "path", tool.as_str())?,
                &string_arg(args, "find", tool.as_str())?,
                &string_arg(args, "replace", tool.as_str())?,
                args.get("expected_replacements")
                    .and_then(Value::as_i64)
                    .map(|n| n.max(0) as usize),
            ),
            ToolName::SearchText => self.search_text(
                &string_arg(args, "pattern", tool.as_str())?,
                &opt_string_arg(args, "path", "."),
            ),
            ToolName::RunShell => self.run_shell(&string_arg(args, "command", tool.as_str())?),
        }
    }

    pub fn list_files(&self, path: &str) -> Result<Value, ToolError> {
        let target = self.resolve_path_or_workspace(path);
        if !target.exists() {
            return Err(ToolError::NotFound(path.to_string()));
        }

        let files = if self.fast_search {
            self.rg_list(&target)?
        } else {
            let mut files = Vec::new();
            for entry in WalkDir::new(&target).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    files.push(self.workspace_relative(entry.path()));
                }
            }
            files
        };

        let count = files.len();
        let capped: Vec<&String> = files.iter().take(MAX_LISTED_FILES).collect();
        Ok(json!({"count": count, "files": capped}))
    }

    pub fn read_file(&self, path: &str, start: i64, end: i64) -> Result<Value, ToolError> {
        let resolved = self.resolve_path(path)?;
        if !resolved.is_file() {
            return Err(ToolError::NotAFile(path.to_string()));
        }
        if start < 1 || end < start {
            return Err(ToolError::InvalidRange);
        }
        let content = fs::read_to_string(&resolved)?;
        let lines: Vec<&str> = content.lines().collect();
        let from = (start - 1) as usize;
        let to = (end as usize).min(lines.len());
        let snippet = if from < lines.len() {
            lines[from..to].join("\n")
        } else {
            String::new()
        };
        Ok(json!({
            "path": self.workspace_relative(&resolved),
            "start": start,
            "end": end,
            "content": snippet,
            "total_lines": lines.len(),
        }))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<Value, ToolError> {
        let resolved = self.resolve_path(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&resolved, content)?;
        Ok(json!({
            "path": self.workspace_relative(&resolved),
            "bytes_written": content.len(),
        }))
    }

    pub fn patch_file(
        &self,
        path: &str,
        find: &str,
        replace: &str,
        expected_replacements: Option<usize>,
    ) -> Result<Value, ToolError> {
        if find.is_empty() {
            return Err(ToolError::EmptyFind);
        }
        let resolved = self.resolve_path(path)?;
        if !resolved.is_file() {
            return Err(ToolError::NotAFile(path.to_string()));
        }
        let original = fs::read_to_string(&resolved)?;
        let replacements = original.matches(find).count();
        if replacements == 0 {
            return Err(ToolError::NoMatch);
        }
        if let Some(expected) = expected_replacements {
            if replacements != expected {
                // The primary guard against over/under-replacement: nothing
                // is written on mismatch.
                return Err(ToolError::CountMismatch {
                    expected,
                    actual: replacements,
                });
            }
        }
        let updated = original.replace(find, replace);
        fs::write(&resolved, &updated)?;
        Ok(json!({
            "path": self.workspace_relative(&resolved),
            "replacements": replacements,
            "bytes_written": updated.len(),
        }))
    }

    pub fn search_text(&self, pattern: &str, path: &str) -> Result<Value, ToolError> {
        let target = self.resolve_path_or_workspace(path);
        if !target.exists() {
            return Err(ToolError::NotFound(path.to_string()));
        }

        if self.fast_search {
            return self.rg_search(pattern, &target);
        }

        // Manual fallback: treat the pattern as a regex, degrading to literal
        // substring match when it does not compile.
        let (regex, search_mode) = match Regex::new(pattern) {
            Ok(re) => (Some(re), "regex"),
            Err(_) => (None, "literal"),
        };

        let files: Vec<PathBuf> = if target.is_file() {
            vec![target.clone()]
        } else {
            WalkDir::new(&target)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect()
        };

        let mut matches = Vec::new();
        for file_path in files {
            if should_skip_file_for_search(&file_path) {
                continue;
            }
            let Ok(bytes) = fs::read(&file_path) else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            let rel = self.workspace_relative(&file_path);
            for (idx, line) in text.lines().enumerate() {
                let is_match = match &regex {
                    Some(re) => re.is_match(line),
                    None => line.contains(pattern),
                };
                if is_match {
                    matches.push(format!("{rel}:{}:{line}", idx + 1));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        return Ok(json!({
                            "count": matches.len(),
                            "matches": matches,
                            "search_mode": search_mode,
                        }));
                    }
                }
            }
        }
        Ok(json!({
            "count": matches.len(),
            "matches": matches,
            "search_mode": search_mode,
        }))
    }

    pub fn run_shell(&self, command: &str) -> Result<Value, ToolError> {
        pilot_policy::validate_shell_command(command)?;
        let result = self
            .runner
            .run(command, &self.workspace, self.shell_timeout)
            .map_err(|e| ToolError::Spawn(e.to_string()))?;
        if result.timed_out {
            return Err(ToolError::ShellTimeout {
                command: command.to_string(),
                seconds: self.shell_timeout.as_secs(),
            });
        }
        Ok(json!({
            "command": command,
            "returncode": result.status.unwrap_or(-1),
            "stdout": tail_chars(&result.stdout, SHELL_OUTPUT_TAIL_CHARS),
            "stderr": tail_chars(&result.stderr, SHELL_OUTPUT_TAIL_CHARS),
        }))
    }

    fn rg_list(&self, target: &Path) -> Result<Vec<String>, ToolError> {
        let output = Command::new("rg")
            .arg("--files")
            .arg(target)
            .current_dir(&self.workspace)
            .output()?;
        let code = output.status.code().unwrap_or(-1);
        // 1 means "no files matched", which is an empty listing, not a failure
        if code != 0 && code != 1 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ToolError::Spawn(if stderr.is_empty() {
                "Failed to list files.".to_string()
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.workspace_relative(Path::new(line)))
            .collect())
    }

    fn rg_search(&self, pattern: &str, target: &Path) -> Result<Value, ToolError> {
        let output = Command::new("rg")
            .arg("-n")
            .arg("--max-count")
            .arg(MAX_SEARCH_MATCHES.to_string())
            .arg(pattern)
            .arg(target)
            .current_dir(&self.workspace)
            .output()?;
        let code = output.status.code().unwrap_or(-1);
        if code != 0 && code != 1 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ToolError::Spawn(if stderr.is_empty() {
                "Search failed.".to_string()
            } else {
                stderr
            }));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut cleaned = Vec::new();
        for line in stdout.lines().take(MAX_SEARCH_MATCHES) {
            let Some((file_part, rest)) = line.split_once(':') else {
                cleaned.push(line.to_string());
                continue;
            };
            let candidate = if Path::new(file_part).is_absolute() {
                PathBuf::from(file_part)
            } else {
                self.workspace.join(file_part)
            };
            // rg already filtered binaries, but the size/NUL policy must hold
            // on both search paths.
            if candidate.exists() && should_skip_file_for_search(&candidate) {
                continue;
            }
            let rel = self.workspace_relative(&candidate);
            cleaned.push(format!("{rel}:{rest}"));
        }
        Ok(json!({"count": cleaned.len(), "matches": cleaned}))
    }

    /// Join to the workspace root if relative, resolve `.`/`..` and symlinks,
    /// and require the result to still be a descendant of the root.
    fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.workspace.join(raw)
        };
        let resolved = resolve_with_missing_tail(&lexical_normalize(&candidate))?;
        if !resolved.starts_with(&self.workspace) {
            return Err(ToolError::PathEscape(raw.to_string()));
        }
        Ok(resolved)
    }

    /// For tools with a default `.` path: an escaping path degrades to the
    /// workspace root instead of failing the whole call.
    fn resolve_path_or_workspace(&self, raw: &str) -> PathBuf {
        self.resolve_path(raw)
            .unwrap_or_else(|_| self.workspace.clone())
    }

    fn workspace_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn opt_string_arg(args: &Map<String, Value>, key: &str, default: &str) -> String {
    match args.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => default.to_string(),
        Some(other) => other.to_string(),
    }
}

fn string_arg(
    args: &Map<String, Value>,
    key: &'static str,
    tool: &'static str,
) -> Result<String, ToolError> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(ToolError::MissingArg { tool, key }),
        Some(other) => Ok(other.to_string()),
    }
}

/// Binary/oversized heuristic shared by both search paths: skip anything over
/// 1 MiB or whose first 1 KiB contains a NUL byte.
fn should_skip_file_for_search(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return true;
    };
    if meta.len() > MAX_SEARCH_FILE_BYTES {
        return true;
    }
    let Ok(mut file) = fs::File::open(path) else {
        return true;
    };
    let mut sniff = [0u8; BINARY_SNIFF_BYTES];
    let Ok(read) = file.read(&mut sniff) else {
        return true;
    };
    sniff[..read].contains(&0)
}

/// Drop `.` segments and apply `..` lexically so no parent-dir components
/// survive into the containment check.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor (resolving symlinks), then
/// re-append the not-yet-created tail. Lets `write_file` target new paths
/// while still catching symlink escapes through existing directories.
fn resolve_with_missing_tail(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(base) => {
                let mut resolved = base;
                for part in tail.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("cannot resolve path: {}", path.display()),
                    ))
                }
            },
        }
    }
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
