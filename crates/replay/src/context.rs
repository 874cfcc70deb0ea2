//! Per-recording run state
//!
//! A [`RunContext`] is created when a recording starts and dropped when it
//! ends. Hooks own the step counters; the capture pipeline owns the response
//! sequence. Both only ever see the context they were handed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::artifacts::{Outcome, RecordingArtifacts};

#[derive(Debug)]
pub struct RunContext {
    recording: String,
    artifacts: RecordingArtifacts,
    step: AtomicUsize,
    total_steps: AtomicUsize,
    ok_steps: AtomicUsize,
    ng_steps: AtomicUsize,
    responses: AtomicU64,
}

impl RunContext {
    pub fn new(recording: impl Into<String>, artifacts: RecordingArtifacts) -> Self {
        Self {
            recording: recording.into(),
            artifacts,
            step: AtomicUsize::new(0),
            total_steps: AtomicUsize::new(0),
            ok_steps: AtomicUsize::new(0),
            ng_steps: AtomicUsize::new(0),
            responses: AtomicU64::new(0),
        }
    }

    pub fn recording(&self) -> &str {
        &self.recording
    }

    pub fn artifacts(&self) -> &RecordingArtifacts {
        &self.artifacts
    }

    /// Reset the step counters for a flow of `total` steps
    pub fn begin(&self, total: usize) {
        self.step.store(0, Ordering::SeqCst);
        self.total_steps.store(total, Ordering::SeqCst);
        self.ok_steps.store(0, Ordering::SeqCst);
        self.ng_steps.store(0, Ordering::SeqCst);
    }

    /// Move to the next step and return its 1-based index
    pub fn advance_step(&self) -> usize {
        self.step.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_step(&self) -> usize {
        self.step.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps.load(Ordering::SeqCst)
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Ok => self.ok_steps.fetch_add(1, Ordering::SeqCst),
            Outcome::Ng => self.ng_steps.fetch_add(1, Ordering::SeqCst),
        };
    }

    pub fn ok_steps(&self) -> usize {
        self.ok_steps.load(Ordering::SeqCst)
    }

    pub fn ng_steps(&self) -> usize {
        self.ng_steps.load(Ordering::SeqCst)
    }

    /// Claim the next response sequence number (first is 1)
    pub fn next_response_seq(&self) -> u64 {
        self.responses.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn response_count(&self) -> u64 {
        self.responses.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;

    fn context() -> (tempfile::TempDir, RunContext) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path()).open_recording("ctx").unwrap();
        (dir, RunContext::new("ctx", artifacts))
    }

    #[test]
    fn test_step_counter_resets_on_begin() {
        let (_dir, ctx) = context();
        ctx.begin(3);
        assert_eq!(ctx.advance_step(), 1);
        assert_eq!(ctx.advance_step(), 2);
        ctx.record_outcome(Outcome::Ng);

        ctx.begin(5);
        assert_eq!(ctx.current_step(), 0);
        assert_eq!(ctx.total_steps(), 5);
        assert_eq!(ctx.ng_steps(), 0);
        assert_eq!(ctx.advance_step(), 1);
    }

    #[test]
    fn test_response_sequence_starts_at_one() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.response_count(), 0);
        let seqs: Vec<u64> = (0..4).map(|_| ctx.next_response_seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        // Step bookkeeping never touches the response sequence
        ctx.begin(2);
        assert_eq!(ctx.next_response_seq(), 5);
    }
}
