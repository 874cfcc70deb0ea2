//! Results tree layout
//!
//! ```text
//! <results_dir>/
//!   <recording>/
//!     screenshots/<step>.png
//!     http/<seq>.url.txt | .timing.txt | .headers.txt | .response.<ext> | .error.txt
//!     result.log          one line per step
//!     error.json          one JSON object per line
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ReplayError, ReplayResult};

/// Owner of the results root
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove every artifact of the previous batch and recreate the root
    pub fn reset(&self) -> ReplayResult<()> {
        if self.root.exists() {
            info!(root = %self.root.display(), "Clearing previous results");
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Create the artifact tree for one recording. Fails if the recording
    /// directory already exists: a tree is never shared between recordings.
    pub fn open_recording(&self, name: &str) -> ReplayResult<RecordingArtifacts> {
        std::fs::create_dir_all(&self.root)?;
        let dir = self.root.join(name);
        if let Err(e) = std::fs::create_dir(&dir) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(ReplayError::RecordingRun {
                    name: name.to_string(),
                    reason: format!("artifact directory {} already exists", dir.display()),
                });
            }
            return Err(e.into());
        }
        let artifacts = RecordingArtifacts::new(dir);
        artifacts.ensure_dirs()?;
        Ok(artifacts)
    }
}

/// Paths and writers for a single recording's artifacts
#[derive(Debug, Clone)]
pub struct RecordingArtifacts {
    dir: PathBuf,
    screenshots_dir: PathBuf,
    http_dir: PathBuf,
}

impl RecordingArtifacts {
    fn new(dir: PathBuf) -> Self {
        Self {
            screenshots_dir: dir.join("screenshots"),
            http_dir: dir.join("http"),
            dir,
        }
    }

    pub fn ensure_dirs(&self) -> ReplayResult<()> {
        std::fs::create_dir_all(&self.screenshots_dir)?;
        std::fs::create_dir_all(&self.http_dir)?;
        debug!(dir = %self.dir.display(), "Artifact directories ready");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn screenshots_dir(&self) -> &Path {
        &self.screenshots_dir
    }

    pub fn http_dir(&self) -> &Path {
        &self.http_dir
    }

    pub fn screenshot_path(&self, step: usize) -> PathBuf {
        self.screenshots_dir.join(format!("{step}.png"))
    }

    /// `http/<seq>.<suffix>`
    pub fn http_path(&self, seq: u64, suffix: &str) -> PathBuf {
        self.http_dir.join(format!("{seq}.{suffix}"))
    }

    pub fn result_log_path(&self) -> PathBuf {
        self.dir.join("result.log")
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.dir.join("error.json")
    }

    pub fn write_http(&self, seq: u64, suffix: &str, contents: impl AsRef<[u8]>) -> ReplayResult<PathBuf> {
        let path = self.http_path(seq, suffix);
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn append_result(&self, entry: &ResultLogEntry) -> ReplayResult<()> {
        append_line(&self.result_log_path(), &entry.to_string())
    }

    pub fn append_error(&self, record: &ErrorRecord) -> ReplayResult<()> {
        let line = serde_json::to_string(record)?;
        append_line(&self.error_log_path(), &line)
    }
}

fn append_line(path: &Path, line: &str) -> ReplayResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NG")]
    Ng,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => f.write_str("OK"),
            Outcome::Ng => f.write_str("NG"),
        }
    }
}

/// One `result.log` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultLogEntry {
    pub outcome: Outcome,
    pub step: usize,
    pub total: usize,
    pub primary_selector: Option<String>,
    pub waited_selector: Option<String>,
}

impl fmt::Display for ResultLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} , {}/{} , {} , {}",
            self.outcome,
            self.step,
            self.total,
            self.primary_selector.as_deref().unwrap_or("-"),
            self.waited_selector.as_deref().unwrap_or("-"),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ReadinessTimeout,
    ResponseCapture,
    Screenshot,
}

/// One `error.json` line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            recorded_at: Utc::now(),
            step: None,
            seq: None,
            selector: None,
            url: None,
            message: message.into(),
        }
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_clears_previous_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("result"));
        let stale = store.open_recording("old").unwrap();
        std::fs::write(stale.screenshot_path(1), b"png").unwrap();

        store.reset().unwrap();

        assert!(store.root().is_dir());
        assert!(!store.root().join("old").exists());
    }

    #[test]
    fn test_open_recording_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let artifacts = store.open_recording("login").unwrap();

        assert!(artifacts.screenshots_dir().is_dir());
        assert!(artifacts.http_dir().is_dir());
        assert_eq!(artifacts.screenshot_path(3), dir.path().join("login/screenshots/3.png"));
        assert_eq!(
            artifacts.http_path(12, "headers.txt"),
            dir.path().join("login/http/12.headers.txt")
        );
    }

    #[test]
    fn test_open_recording_refuses_existing_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let first = store.open_recording("flow").unwrap();
        std::fs::write(first.screenshot_path(1), b"png").unwrap();

        let err = store.open_recording("flow").unwrap_err();
        assert_eq!(err.kind(), "recording_run");
        assert!(err.to_string().contains("already exists"));
        assert!(first.screenshot_path(1).exists());
    }

    #[test]
    fn test_result_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).open_recording("r").unwrap();
        artifacts
            .append_result(&ResultLogEntry {
                outcome: Outcome::Ok,
                step: 1,
                total: 2,
                primary_selector: None,
                waited_selector: None,
            })
            .unwrap();
        artifacts
            .append_result(&ResultLogEntry {
                outcome: Outcome::Ng,
                step: 2,
                total: 2,
                primary_selector: Some("aria/Go".to_string()),
                waited_selector: Some("#go".to_string()),
            })
            .unwrap();

        let log = std::fs::read_to_string(artifacts.result_log_path()).unwrap();
        assert_eq!(log, "OK , 1/2 , - , -\nNG , 2/2 , aria/Go , #go\n");
    }

    #[test]
    fn test_error_records_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).open_recording("r").unwrap();
        artifacts
            .append_error(&ErrorRecord::new(ErrorKind::ReadinessTimeout, "late").with_step(2))
            .unwrap();
        artifacts
            .append_error(&ErrorRecord::new(ErrorKind::ResponseCapture, "gone").with_seq(9))
            .unwrap();

        let text = std::fs::read_to_string(artifacts.error_log_path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "readiness_timeout");
        assert_eq!(lines[0]["step"], 2);
        assert!(lines[0].get("seq").is_none());
        assert_eq!(lines[1]["seq"], 9);
    }
}
