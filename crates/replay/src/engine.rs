//! Step replay
//!
//! [`ReplayEngine`] is the seam the orchestrator drives; it only has to call
//! the hooks in order. [`PageReplayer`] is the stock implementation that maps
//! recorder steps onto page commands.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ReplayError, ReplayResult};
use crate::flow::{Flow, Step, StepType};
use crate::hooks::StepHooks;
use crate::page::{BrowserPage, PageCommand};

#[async_trait]
pub trait ReplayEngine: Send + Sync {
    /// Replay `flow`, calling `hooks` around the flow and each step
    async fn run(&self, flow: &Flow, hooks: &mut dyn StepHooks) -> ReplayResult<()>;
}

/// Replays steps one after another on a single page
pub struct PageReplayer {
    page: Arc<dyn BrowserPage>,
    default_timeout: Duration,
}

impl PageReplayer {
    pub fn new(page: Arc<dyn BrowserPage>, default_timeout: Duration) -> Self {
        Self {
            page,
            default_timeout,
        }
    }

    fn timeout_ms(&self, step: &Step, flow: &Flow) -> u64 {
        step.timeout
            .or(flow.timeout)
            .unwrap_or(self.default_timeout.as_millis() as u64)
    }

    /// Page command for a step, or `None` when the step has no page effect here
    pub fn command_for(&self, step: &Step, flow: &Flow) -> ReplayResult<Option<PageCommand>> {
        let timeout_ms = self.timeout_ms(step, flow);
        let selectors: Vec<String> = step
            .selector_candidates()
            .iter()
            .map(|s| s.to_playwright())
            .collect();

        let command = match step.kind {
            StepType::SetViewport => PageCommand::SetViewport {
                width: required(step.width, step, "width")?,
                height: required(step.height, step, "height")?,
            },
            StepType::Navigate => PageCommand::Goto {
                url: required(step.url.clone(), step, "url")?,
                timeout_ms,
            },
            StepType::Click | StepType::DoubleClick => PageCommand::Click {
                selectors: non_empty(selectors, step)?,
                click_count: if step.kind == StepType::DoubleClick { 2 } else { 1 },
                button: step.button.clone(),
                offset_x: step.offset_x,
                offset_y: step.offset_y,
                timeout_ms,
            },
            StepType::Hover => PageCommand::Hover {
                selectors: non_empty(selectors, step)?,
                timeout_ms,
            },
            StepType::Change => PageCommand::Fill {
                selectors: non_empty(selectors, step)?,
                value: step.value.clone().unwrap_or_default(),
                timeout_ms,
            },
            StepType::KeyDown => PageCommand::KeyDown {
                key: required(step.key.clone(), step, "key")?,
            },
            StepType::KeyUp => PageCommand::KeyUp {
                key: required(step.key.clone(), step, "key")?,
            },
            StepType::Scroll => PageCommand::Scroll {
                selectors,
                x: step.x.unwrap_or(0.0),
                y: step.y.unwrap_or(0.0),
            },
            StepType::WaitForElement => PageCommand::WaitFor {
                selector: non_empty(selectors, step)?.remove(0),
                timeout_ms,
            },
            StepType::WaitForExpression => PageCommand::WaitForFunction {
                expression: required(step.expression.clone(), step, "expression")?,
                timeout_ms,
            },
            StepType::Close
            | StepType::EmulateNetworkConditions
            | StepType::CustomStep
            | StepType::Unknown => return Ok(None),
        };
        Ok(Some(command))
    }
}

fn required<T>(value: Option<T>, step: &Step, field: &str) -> ReplayResult<T> {
    value.ok_or_else(|| {
        ReplayError::RecordingParse(format!("{} step is missing `{}`", step.kind.as_str(), field))
    })
}

fn non_empty(selectors: Vec<String>, step: &Step) -> ReplayResult<Vec<String>> {
    if selectors.is_empty() {
        return Err(ReplayError::RecordingParse(format!(
            "{} step has no selectors",
            step.kind.as_str()
        )));
    }
    Ok(selectors)
}

#[async_trait]
impl ReplayEngine for PageReplayer {
    async fn run(&self, flow: &Flow, hooks: &mut dyn StepHooks) -> ReplayResult<()> {
        hooks.before_all_steps(flow).await?;

        for (i, step) in flow.steps.iter().enumerate() {
            hooks.before_each_step(step, flow).await?;

            let fail = |reason: String| ReplayError::StepFailed {
                index: i + 1,
                kind: step.kind.as_str().to_string(),
                reason,
            };
            match self.command_for(step, flow).map_err(|e| fail(e.to_string()))? {
                Some(command) => {
                    debug!(step = i + 1, command = command.name(), "Performing {}", step.label());
                    self.page
                        .execute(command)
                        .await
                        .map_err(|e| fail(e.to_string()))?;
                }
                None => warn!(step = i + 1, "Skipping unsupported step type {}", step.kind.as_str()),
            }

            hooks.after_each_step(step, flow).await?;
        }

        hooks.after_all_steps(flow).await
    }
}
