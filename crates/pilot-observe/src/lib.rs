use anyhow::Result;
use chrono::Utc;
use pilot_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only run log under the workspace runtime dir, plus opt-in verbose
/// stderr mirroring.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("pilot.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn info(&self, msg: &str) {
        if self.verbose {
            eprintln!("[pilot] {msg}");
        }
        let _ = self.append_log_line("INFO", msg);
    }

    /// Warnings always reach stderr, verbose or not.
    pub fn warn(&self, msg: &str) {
        eprintln!("[pilot WARN] {msg}");
        let _ = self.append_log_line("WARN", msg);
    }

    fn append_log_line(&self, level: &str, msg: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{} {level} {msg}", Utc::now().to_rfc3339())?;
        Ok(())
    }
}
