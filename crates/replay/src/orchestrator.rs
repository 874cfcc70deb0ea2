//! Batch orchestration
//!
//! Runs every recording in the recordings directory, one after another, on
//! the shared page. A recording that fails to load, parse or run is logged
//! and reported; the batch moves on to the next one.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::artifacts::ArtifactStore;
use crate::config::PathsConfig;
use crate::context::RunContext;
use crate::engine::ReplayEngine;
use crate::error::{ReplayError, ReplayResult};
use crate::flow::Recording;
use crate::hooks::Instrumentation;

/// Outcome of one recording
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingReport {
    pub name: String,
    pub steps_run: usize,
    pub total_steps: usize,
    pub ok: usize,
    pub ng: usize,
    pub responses: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl RecordingReport {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Ran to the end with every step OK
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.ng == 0
    }
}

/// Outcome of a whole batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub recordings: Vec<RecordingReport>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.recordings.len()
    }

    /// Recordings that ran to completion (NG steps allowed)
    pub fn passed(&self) -> usize {
        self.recordings.iter().filter(|r| r.error.is_none()).count()
    }

    /// Recordings that could not be loaded or aborted mid-run
    pub fn failed(&self) -> usize {
        self.recordings.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn ng_steps(&self) -> usize {
        self.recordings.iter().map(|r| r.ng).sum()
    }

    /// No failed recordings and no NG steps
    pub fn is_clean(&self) -> bool {
        self.recordings.iter().all(RecordingReport::is_ok)
    }

    pub fn get(&self, name: &str) -> Option<&RecordingReport> {
        self.recordings.iter().find(|r| r.name == name)
    }
}

pub struct BatchOrchestrator {
    paths: PathsConfig,
    store: ArtifactStore,
    engine: Arc<dyn ReplayEngine>,
}

impl BatchOrchestrator {
    pub fn new(paths: PathsConfig, engine: Arc<dyn ReplayEngine>) -> Self {
        let store = ArtifactStore::new(&paths.results_dir);
        Self {
            paths,
            store,
            engine,
        }
    }

    /// Recording files directly under the recordings directory, by file name
    pub fn discover(&self) -> ReplayResult<Vec<PathBuf>> {
        let dir = &self.paths.recordings_dir;
        if !dir.is_dir() {
            return Err(ReplayError::InvalidConfig(format!(
                "recordings directory {} does not exist",
                dir.display()
            )));
        }

        let mut recordings = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() && self.is_recording(entry.path()) {
                recordings.push(entry.into_path());
            }
        }
        Ok(recordings)
    }

    fn is_recording(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy())
            .map(|ext| {
                self.paths
                    .extensions
                    .iter()
                    .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            })
            .unwrap_or(false)
    }

    /// Replay every recording in turn
    pub async fn run(&self, instrumentation: &Instrumentation) -> ReplayResult<BatchReport> {
        let started = Instant::now();
        self.paths.validate_results_dir()?;
        self.store.reset()?;
        let paths = self.discover()?;
        info!(
            recordings = paths.len(),
            results = %self.store.root().display(),
            "Running batch"
        );

        let mut report = BatchReport::default();
        let mut names = ArtifactNames::default();
        for path in &paths {
            let name = names.claim(path);
            let recording = self.run_recording(path, name, instrumentation).await;
            match &recording.error {
                None => info!(
                    recording = %recording.name,
                    ok = recording.ok,
                    ng = recording.ng,
                    responses = recording.responses,
                    "✓ {} ({} ms)",
                    recording.name,
                    recording.duration_ms
                ),
                Some(e) => error!(recording = %recording.name, "✗ {} - {}", recording.name, e),
            }
            report.recordings.push(recording);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Batch results: {} passed, {} failed, {} NG step(s) ({} ms)",
            report.passed(),
            report.failed(),
            report.ng_steps(),
            report.duration_ms
        );
        Ok(report)
    }

    async fn run_recording(
        &self,
        path: &Path,
        name: String,
        instrumentation: &Instrumentation,
    ) -> RecordingReport {
        let started = Instant::now();

        let prepared = Recording::load(path).and_then(|mut recording| {
            recording.name = name.clone();
            let flow = recording.parse()?;
            let artifacts = self.store.open_recording(&recording.name)?;
            Ok((recording, flow, artifacts))
        });
        let (recording, flow, artifacts) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let mut report = RecordingReport::new(name);
                report.error = Some(e.to_string());
                report.duration_ms = started.elapsed().as_millis() as u64;
                return report;
            }
        };

        debug!(recording = %recording.name, path = %recording.path.display(), "Loaded recording");
        let ctx = Arc::new(RunContext::new(&recording.name, artifacts));
        let mut hooks = instrumentation.bind(Arc::clone(&ctx));

        let outcome = AssertUnwindSafe(self.engine.run(&flow, &mut hooks))
            .catch_unwind()
            .await;
        instrumentation.settle().await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(ReplayError::RecordingRun {
                name: recording.name.clone(),
                reason: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        };

        RecordingReport {
            name: recording.name.clone(),
            steps_run: ctx.current_step(),
            total_steps: flow.steps.len(),
            ok: ctx.ok_steps(),
            ng: ctx.ng_steps(),
            responses: ctx.response_count(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: error.map(|e| e.to_string()),
        }
    }
}

/// Artifact directory names handed out within one batch.
///
/// A recording is named by its file stem. When two files share a stem
/// (`flow.json` and `flow.JSON`, or `flow.json` and `flow.rec`) the later one
/// falls back to its full file name, then to a numbered suffix. Names are
/// compared case-insensitively so the trees stay apart on case-folding
/// filesystems too.
#[derive(Debug, Default)]
struct ArtifactNames {
    taken: HashSet<String>,
}

impl ArtifactNames {
    fn claim(&mut self, path: &Path) -> String {
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| file_name.clone());

        let mut candidates = vec![stem, file_name.clone()].into_iter();
        let mut n = 2;
        loop {
            let name = candidates.next().unwrap_or_else(|| {
                let numbered = format!("{file_name}-{n}");
                n += 1;
                numbered
            });
            if self.taken.insert(name.to_lowercase()) {
                return name;
            }
            warn!(path = %path.display(), name = %name, "Artifact name already used in this batch");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
