use regex::Regex;
use std::sync::OnceLock;

/// Advisory defense-in-depth over shell commands. Pattern matching cannot
/// stop every destructive command; it exists to catch the known-catastrophic
/// ones before a process is ever spawned.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    #[error("shell command is empty")]
    EmptyCommand,
    #[error("blocked shell command pattern: {0}")]
    Blocked(String),
}

const BLOCKED_COMMAND_PATTERNS: &[&str] = &[
    r"(?i)\brm\s+-rf\s+/",
    r"(?i)\bsudo\b",
    r"(?i)\bshutdown\b",
    r"(?i)\breboot\b",
    r"(?i)\bmkfs\b",
    r"(?i)\bdd\s+if=",
    r"(?i)\bgit\s+reset\s+--hard\b",
    r"(?i)\bgit\s+checkout\s+--\b",
];

fn blocked_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        BLOCKED_COMMAND_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("valid policy regex"))
            .collect()
    })
}

/// Pure predicate: reject empty commands and anything matching the denylist.
pub fn validate_shell_command(command: &str) -> Result<(), PolicyError> {
    let stripped = command.trim();
    if stripped.is_empty() {
        return Err(PolicyError::EmptyCommand);
    }
    for pattern in blocked_patterns() {
        if pattern.is_match(stripped) {
            return Err(PolicyError::Blocked(pattern.as_str().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace_commands() {
        assert_eq!(validate_shell_command(""), Err(PolicyError::EmptyCommand));
        assert_eq!(
            validate_shell_command("   \t"),
            Err(PolicyError::EmptyCommand)
        );
    }

    #[test]
    fn blocks_destructive_patterns_case_insensitively() {
        for cmd in [
            "rm -rf /",
            "echo hi && sudo rm file",
            "SUDO apt install x",
            "shutdown -h now",
            "reboot",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "git reset --hard HEAD~3",
            "git checkout --theirs src/main.rs",
        ] {
            assert!(
                matches!(validate_shell_command(cmd), Err(PolicyError::Blocked(_))),
                "expected {cmd:?} to be blocked"
            );
        }
    }

    #[test]
    fn allows_ordinary_commands() {
        for cmd in [
            "ls -la",
            "cargo test",
            "git status",
            "rm -rf build", // only root-anchored rm -rf is denylisted
            "git checkout main",
        ] {
            assert_eq!(validate_shell_command(cmd), Ok(()), "expected {cmd:?} allowed");
        }
    }
}
