//! Response capture pipeline
//!
//! One task per page lifetime consumes the page's event stream. Sequence
//! numbers are claimed in that single consumer loop, in arrival order; the
//! per-response work (body read, file writes) then runs as its own task so a
//! slow body never holds up numbering of the responses behind it.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::artifacts::{ErrorKind, ErrorRecord};
use crate::config::CaptureConfig;
use crate::context::RunContext;
use crate::error::{ReplayError, ReplayResult};
use crate::page::{BrowserPage, PageEvent, PageEvents, ResponseEvent};

/// Counters reported when the pipeline shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub responses: u64,
    pub bodies_saved: u64,
    pub bodies_skipped: u64,
    pub status_markers: u64,
    pub failures: u64,
    pub unattributed: u64,
    pub page_faults: u64,
}

/// What happened to one response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureOutcome {
    BodySaved,
    BodySkipped,
    StatusMarker,
    Failed,
}

enum Control {
    Flush(oneshot::Sender<()>),
}

/// Handle to the running capture task
pub struct ResponseCapture {
    binding: watch::Sender<Option<Arc<RunContext>>>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<CaptureStats>,
}

impl ResponseCapture {
    /// Start consuming `events`; bodies are read back through `page`
    pub fn spawn(page: Arc<dyn BrowserPage>, events: PageEvents, config: CaptureConfig) -> Self {
        let (binding, binding_rx) = watch::channel(None);
        let (control, control_rx) = mpsc::unbounded_channel();
        let worker = CaptureWorker {
            page,
            config: Arc::new(config),
            events,
            control: control_rx,
            binding: binding_rx,
            in_flight: JoinSet::new(),
            stats: CaptureStats::default(),
        };
        let task = tokio::spawn(worker.run());
        Self {
            binding,
            control,
            task,
        }
    }

    /// Attribute every response from now on to `ctx`
    pub fn bind(&self, ctx: Arc<RunContext>) {
        debug!(recording = %ctx.recording(), "Binding response capture");
        self.binding.send_replace(Some(ctx));
    }

    /// Stop attributing responses to any recording
    pub fn unbind(&self) {
        self.binding.send_replace(None);
    }

    /// Wait until every event queued so far has been fully captured
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(Control::Flush(ack)).is_ok() {
            // A closed channel means the task already drained and exited
            let _ = done.await;
        }
    }

    /// Drain outstanding work and stop the task
    pub async fn shutdown(self) -> CaptureStats {
        let Self {
            binding,
            control,
            task,
        } = self;
        drop(control);
        drop(binding);
        match task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Response capture task ended abnormally: {}", e);
                CaptureStats::default()
            }
        }
    }
}

struct CaptureWorker {
    page: Arc<dyn BrowserPage>,
    config: Arc<CaptureConfig>,
    events: PageEvents,
    control: mpsc::UnboundedReceiver<Control>,
    binding: watch::Receiver<Option<Arc<RunContext>>>,
    in_flight: JoinSet<CaptureOutcome>,
    stats: CaptureStats,
}

impl CaptureWorker {
    async fn run(mut self) -> CaptureStats {
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        debug!("Page event stream closed");
                        break;
                    }
                },
                control = self.control.recv() => match control {
                    Some(Control::Flush(ack)) => {
                        self.drain_queued();
                        self.join_in_flight().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                Some(done) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.tally(done);
                }
            }
        }

        self.drain_queued();
        self.join_in_flight().await;
        info!(
            responses = self.stats.responses,
            bodies = self.stats.bodies_saved,
            skipped = self.stats.bodies_skipped,
            failures = self.stats.failures,
            "Response capture stopped"
        );
        self.stats
    }

    fn drain_queued(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
        }
    }

    async fn join_in_flight(&mut self) {
        while let Some(done) = self.in_flight.join_next().await {
            self.tally(done);
        }
    }

    fn tally(&mut self, done: Result<CaptureOutcome, tokio::task::JoinError>) {
        match done {
            Ok(CaptureOutcome::BodySaved) => self.stats.bodies_saved += 1,
            Ok(CaptureOutcome::BodySkipped) => self.stats.bodies_skipped += 1,
            Ok(CaptureOutcome::StatusMarker) => self.stats.status_markers += 1,
            Ok(CaptureOutcome::Failed) => self.stats.failures += 1,
            Err(e) => {
                self.stats.failures += 1;
                error!("Response capture task panicked: {}", e);
            }
        }
    }

    fn dispatch(&mut self, event: PageEvent) {
        let ctx = self.binding.borrow().clone();
        let recording = ctx.as_ref().map(|c| c.recording().to_string()).unwrap_or_default();
        match event {
            PageEvent::Response(response) => {
                let Some(ctx) = ctx else {
                    self.stats.unattributed += 1;
                    debug!(url = %response.url, "Response outside any recording");
                    return;
                };
                let seq = ctx.next_response_seq();
                self.stats.responses += 1;
                debug!(recording = %recording, seq, status = response.status, url = %response.url, "Response");
                self.in_flight.spawn(capture_response(
                    Arc::clone(&self.page),
                    ctx,
                    seq,
                    response,
                    Arc::clone(&self.config),
                ));
            }
            PageEvent::Console { level, text } => {
                if level == "error" {
                    self.stats.page_faults += 1;
                    warn!(recording = %recording, "Console error: {}", text);
                } else {
                    debug!(recording = %recording, level = %level, "Console: {}", text);
                }
            }
            PageEvent::PageError { message } => {
                self.stats.page_faults += 1;
                warn!(recording = %recording, "Page error: {}", message);
            }
            PageEvent::Crashed => {
                self.stats.page_faults += 1;
                error!(recording = %recording, "Page crashed");
            }
        }
    }
}

/// Persist one response; failures become seq-keyed error artifacts
async fn capture_response(
    page: Arc<dyn BrowserPage>,
    ctx: Arc<RunContext>,
    seq: u64,
    response: ResponseEvent,
    config: Arc<CaptureConfig>,
) -> CaptureOutcome {
    match persist_response(page.as_ref(), &ctx, seq, &response, &config).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let err = ReplayError::ResponseCapture {
                seq,
                reason: e.to_string(),
            };
            warn!(recording = %ctx.recording(), seq, url = %response.url, "{}", err);
            let artifacts = ctx.artifacts();
            if let Err(write_err) = artifacts.write_http(seq, "error.txt", err.to_string()) {
                error!(seq, "Failed to write error artifact: {}", write_err);
            }
            let record = ErrorRecord::new(ErrorKind::ResponseCapture, err.to_string())
                .with_seq(seq)
                .with_url(response.url.clone());
            if let Err(write_err) = artifacts.append_error(&record) {
                error!(seq, "Failed to append error record: {}", write_err);
            }
            CaptureOutcome::Failed
        }
    }
}

async fn persist_response(
    page: &dyn BrowserPage,
    ctx: &RunContext,
    seq: u64,
    response: &ResponseEvent,
    config: &CaptureConfig,
) -> ReplayResult<CaptureOutcome> {
    let artifacts = ctx.artifacts();
    artifacts.write_http(seq, "url.txt", &response.url)?;
    artifacts.write_http(seq, "timing.txt", serde_json::to_vec(&response.timing)?)?;
    artifacts.write_http(seq, "headers.txt", serde_json::to_vec(&response.headers)?)?;

    if response.status != 200 {
        artifacts.write_http(seq, "response.txt", format!("STATUS CODE : {}", response.status))?;
        return Ok(CaptureOutcome::StatusMarker);
    }

    let content_type = response.header("content-type");
    let extension = extension_for(content_type, &config.fallback_extension);
    if config.skips_body(&extension) || config.skips_content_type(content_type) {
        debug!(seq, extension = %extension, "Skipping media body");
        return Ok(CaptureOutcome::BodySkipped);
    }

    let body = page.response_body(response.id).await?;
    artifacts.write_http(seq, &format!("response.{extension}"), body)?;
    Ok(CaptureOutcome::BodySaved)
}

/// Types whose registered extension lists do not lead with the usual one
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("text/plain", "txt"),
    ("text/javascript", "js"),
    ("application/javascript", "js"),
    ("application/x-javascript", "js"),
    ("application/octet-stream", "bin"),
    ("image/svg+xml", "svg"),
    ("image/x-icon", "ico"),
    ("image/vnd.microsoft.icon", "ico"),
    ("font/woff", "woff"),
    ("font/woff2", "woff2"),
    ("font/ttf", "ttf"),
    ("font/otf", "otf"),
    ("application/font-woff", "woff"),
    ("application/font-woff2", "woff2"),
    ("application/x-font-woff", "woff"),
    ("application/x-font-ttf", "ttf"),
    ("application/x-font-otf", "otf"),
    ("application/vnd.ms-fontobject", "eot"),
];

/// File extension for a `content-type` header value
pub fn extension_for(content_type: Option<&str>, fallback: &str) -> String {
    let Some(essence) = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty())
    else {
        return fallback.to_string();
    };

    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(mime, _)| *mime == essence) {
        return ext.to_string();
    }

    let subtype = essence.rsplit('/').next().unwrap_or_default().to_string();
    match mime_guess::get_mime_extensions_str(&essence) {
        Some(extensions) if extensions.contains(&subtype.as_str()) => subtype,
        Some(extensions) => extensions
            .first()
            .map(|ext| ext.to_string())
            .unwrap_or_else(|| fallback.to_string()),
        None => fallback.to_string(),
    }
}
