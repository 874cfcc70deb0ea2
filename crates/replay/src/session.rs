//! Session wiring: one batch on one page

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

use crate::capture::{CaptureStats, ResponseCapture};
use crate::config::ReplayConfig;
use crate::engine::{PageReplayer, ReplayEngine};
use crate::error::{ReplayError, ReplayResult};
use crate::hooks::Instrumentation;
use crate::orchestrator::{panic_message, BatchOrchestrator, BatchReport};
use crate::page::BrowserPage;

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub batch: BatchReport,
    pub capture: CaptureStats,
}

impl SessionReport {
    pub fn is_clean(&self) -> bool {
        self.batch.is_clean()
    }
}

/// Run a batch with the stock page replayer
pub async fn run_session(config: &ReplayConfig, page: Arc<dyn BrowserPage>) -> ReplayResult<SessionReport> {
    let engine = Arc::new(PageReplayer::new(
        Arc::clone(&page),
        config.browser.default_timeout(),
    ));
    run_session_with(config, page, engine).await
}

/// Run a batch with a caller-supplied engine
///
/// The capture pipeline is shut down on every path out of here, including an
/// error or panic escaping the orchestrator. Closing the page stays with the
/// caller.
pub async fn run_session_with(
    config: &ReplayConfig,
    page: Arc<dyn BrowserPage>,
    engine: Arc<dyn ReplayEngine>,
) -> ReplayResult<SessionReport> {
    let events = page
        .take_events()
        .ok_or_else(|| ReplayError::Driver("page event stream already taken".to_string()))?;
    let capture = ResponseCapture::spawn(Arc::clone(&page), events, config.capture.clone());
    let instrumentation = Instrumentation::new(page, config.hooks.clone(), capture);
    let orchestrator = BatchOrchestrator::new(config.paths.clone(), engine);

    let outcome = AssertUnwindSafe(orchestrator.run(&instrumentation))
        .catch_unwind()
        .await;
    let capture = instrumentation.shutdown().await;

    match outcome {
        Ok(Ok(batch)) => {
            info!(
                responses = capture.responses,
                failures = capture.failures,
                page_faults = capture.page_faults,
                "Session finished"
            );
            Ok(SessionReport { batch, capture })
        }
        Ok(Err(e)) => {
            error!(kind = e.kind(), "Batch aborted: {}", e);
            Err(e)
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!("Batch panicked: {}", reason);
            Err(ReplayError::Session(reason))
        }
    }
}
