//! Test doubles for exercising the action loop without a live model or a
//! real workspace.

use anyhow::{anyhow, Result};
use pilot_llm::{CompletionRequest, LlmClient};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scripted model: hands out queued raw responses in order and records every
/// request it saw. Running past the script is a test bug, so it errors.
pub struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    cursor: AtomicUsize,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedLlm {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            cursor: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle for asserting on captured requests after the engine
    /// consumed the script.
    pub fn requests_handle(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, req: &CompletionRequest) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("request log poisoned"))?
            .push(req.clone());
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let responses = self
            .responses
            .lock()
            .map_err(|_| anyhow!("script poisoned"))?;
        responses
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("scripted model exhausted after {index} responses"))
    }
}

/// A model that always fails at transport level, for terminal-error paths.
pub struct FailingLlm;

impl LlmClient for FailingLlm {
    fn complete(&self, _req: &CompletionRequest) -> Result<String> {
        Err(anyhow!("connection refused"))
    }
}

/// Throwaway workspace with a couple of seed files, owned so it lives as
/// long as the test needs it.
pub struct WorkspaceFixture {
    dir: TempDir,
}

impl WorkspaceFixture {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.dir.path().join(rel))?)
    }

    pub fn session_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
