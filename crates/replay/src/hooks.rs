//! Step instrumentation
//!
//! The replay engine calls a [`StepHooks`] implementation around the whole
//! flow and around every step. [`InstrumentationHooks`] uses those calls to
//! observe readiness, take screenshots and write the per-step result log. It
//! never changes what the engine does: a selector that does not become ready
//! is recorded as NG and the step still runs.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::artifacts::{ErrorKind, ErrorRecord, Outcome, ResultLogEntry};
use crate::capture::{CaptureStats, ResponseCapture};
use crate::config::{HookConfig, ReadinessTarget};
use crate::context::RunContext;
use crate::error::{ReplayError, ReplayResult};
use crate::flow::{Flow, Step};
use crate::page::BrowserPage;

/// Lifecycle callbacks around a replay run
#[async_trait]
pub trait StepHooks: Send {
    async fn before_all_steps(&mut self, flow: &Flow) -> ReplayResult<()>;
    async fn before_each_step(&mut self, step: &Step, flow: &Flow) -> ReplayResult<()>;
    async fn after_each_step(&mut self, step: &Step, flow: &Flow) -> ReplayResult<()>;
    async fn after_all_steps(&mut self, flow: &Flow) -> ReplayResult<()>;
}

/// Hooks bound to one recording's [`RunContext`]
pub struct InstrumentationHooks {
    page: Arc<dyn BrowserPage>,
    ctx: Arc<RunContext>,
    config: HookConfig,
}

impl InstrumentationHooks {
    pub fn new(page: Arc<dyn BrowserPage>, ctx: Arc<RunContext>, config: HookConfig) -> Self {
        Self { page, ctx, config }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Wait for the step's target selector and log the outcome
    async fn check_readiness(&self, step_index: usize, step: &Step) -> ReplayResult<Outcome> {
        let total = self.ctx.total_steps();
        let artifacts = self.ctx.artifacts();

        let target = match self.config.readiness_target {
            ReadinessTarget::Last => step.most_specific_selector(),
            ReadinessTarget::First => step.primary_selector(),
        };
        let Some(target) = target else {
            artifacts.append_result(&ResultLogEntry {
                outcome: Outcome::Ok,
                step: step_index,
                total,
                primary_selector: None,
                waited_selector: None,
            })?;
            return Ok(Outcome::Ok);
        };

        let primary = step.primary_selector().map(|s| s.display());
        let waited = target.display();

        if self.config.settle_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.settle_delay_ms)).await;
        }

        let timeout = self.config.readiness_timeout();
        let outcome = match self
            .page
            .wait_for_selector(&target.to_playwright(), timeout)
            .await
        {
            Ok(()) => {
                debug!(step = step_index, selector = %waited, "Selector ready");
                Outcome::Ok
            }
            Err(e) => {
                let err = ReplayError::ReadinessTimeout {
                    selector: waited.clone(),
                    timeout_ms: self.config.readiness_timeout_ms,
                    reason: e.to_string(),
                };
                warn!(recording = %self.ctx.recording(), step = step_index, "{}", err);
                artifacts.append_error(
                    &ErrorRecord::new(ErrorKind::ReadinessTimeout, err.to_string())
                        .with_step(step_index)
                        .with_selector(waited.clone()),
                )?;
                Outcome::Ng
            }
        };

        artifacts.append_result(&ResultLogEntry {
            outcome,
            step: step_index,
            total,
            primary_selector: primary,
            waited_selector: Some(waited),
        })?;
        Ok(outcome)
    }
}

#[async_trait]
impl StepHooks for InstrumentationHooks {
    async fn before_all_steps(&mut self, flow: &Flow) -> ReplayResult<()> {
        info!(recording = %self.ctx.recording(), title = %flow.title, steps = flow.steps.len(), "starting");
        self.ctx.begin(flow.steps.len());
        self.ctx.artifacts().ensure_dirs()
    }

    async fn before_each_step(&mut self, step: &Step, _flow: &Flow) -> ReplayResult<()> {
        let index = self.ctx.advance_step();
        debug!(recording = %self.ctx.recording(), step = index, "before {}", step.label());
        let outcome = self.check_readiness(index, step).await?;
        self.ctx.record_outcome(outcome);
        Ok(())
    }

    async fn after_each_step(&mut self, step: &Step, _flow: &Flow) -> ReplayResult<()> {
        let index = self.ctx.current_step();
        debug!(recording = %self.ctx.recording(), step = index, "after {}", step.label());
        if !self.config.screenshot_policy.captures(index) {
            return Ok(());
        }

        let path = self.ctx.artifacts().screenshot_path(index);
        if let Err(e) = self.page.screenshot(&path, self.config.full_page_screenshots).await {
            warn!(recording = %self.ctx.recording(), step = index, "Screenshot failed: {}", e);
            self.ctx.artifacts().append_error(
                &ErrorRecord::new(ErrorKind::Screenshot, e.to_string()).with_step(index),
            )?;
        }
        Ok(())
    }

    async fn after_all_steps(&mut self, _flow: &Flow) -> ReplayResult<()> {
        info!(
            recording = %self.ctx.recording(),
            ok = self.ctx.ok_steps(),
            ng = self.ctx.ng_steps(),
            responses = self.ctx.response_count(),
            "done"
        );
        Ok(())
    }
}

/// Everything needed to instrument a batch: the page, hook policy and the
/// capture pipeline shared by every recording
pub struct Instrumentation {
    page: Arc<dyn BrowserPage>,
    config: HookConfig,
    capture: ResponseCapture,
}

impl Instrumentation {
    pub fn new(page: Arc<dyn BrowserPage>, config: HookConfig, capture: ResponseCapture) -> Self {
        Self {
            page,
            config,
            capture,
        }
    }

    /// Point capture at `ctx` and return hooks for its run
    pub fn bind(&self, ctx: Arc<RunContext>) -> InstrumentationHooks {
        self.capture.bind(Arc::clone(&ctx));
        InstrumentationHooks::new(Arc::clone(&self.page), ctx, self.config.clone())
    }

    /// Let every response observed so far land in the bound recording
    pub async fn settle(&self) {
        self.capture.flush().await;
    }

    pub async fn shutdown(self) -> CaptureStats {
        self.capture.unbind();
        self.capture.shutdown().await
    }
}
