//! Scripted in-memory page
//!
//! Stands in for the Playwright driver in tests: selectors resolve only when
//! marked ready (now or after a delay), navigations emit a response event, screenshots write a
//! placeholder PNG, and every executed command is recorded.

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ReplayError, ReplayResult};
use crate::page::{BrowserPage, PageCommand, PageEvent, PageEvents, ResponseEvent, ResponseId};

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

pub struct FakePage {
    events_tx: mpsc::UnboundedSender<PageEvent>,
    events_rx: Mutex<Option<PageEvents>>,
    ready: Mutex<HashSet<String>>,
    ready_at: Mutex<HashMap<String, Instant>>,
    failing: Mutex<HashSet<&'static str>>,
    bodies: Mutex<HashMap<ResponseId, Result<Vec<u8>, String>>>,
    commands: Mutex<Vec<PageCommand>>,
    next_response: AtomicU64,
    respond_on_goto: bool,
}

impl FakePage {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            ready: Mutex::new(HashSet::new()),
            ready_at: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            bodies: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            next_response: AtomicU64::new(0),
            respond_on_goto: true,
        }
    }

    /// Disable the automatic response on `goto`
    pub fn without_navigation_responses(mut self) -> Self {
        self.respond_on_goto = false;
        self
    }

    /// Mark a (Playwright-syntax) selector as resolving immediately
    pub fn ready(self, selector: &str) -> Self {
        self.ready.lock().insert(selector.to_string());
        self
    }

    /// Mark a selector as appearing `delay` from now
    pub fn ready_after(self, selector: &str, delay: Duration) -> Self {
        self.ready_at
            .lock()
            .insert(selector.to_string(), Instant::now() + delay);
        self
    }

    /// Make every command with this name fail
    pub fn fail_command(&self, name: &'static str) {
        self.failing.lock().insert(name);
    }

    /// Emit a response event and register its body
    pub fn emit_response(&self, url: &str, status: u16, content_type: &str, body: &[u8]) -> ResponseId {
        self.emit_with_body(url, status, content_type, Ok(body.to_vec()))
    }

    /// Emit a response event whose body can never be read
    pub fn emit_unreadable_response(&self, url: &str, content_type: &str, reason: &str) -> ResponseId {
        self.emit_with_body(url, 200, content_type, Err(reason.to_string()))
    }

    fn emit_with_body(
        &self,
        url: &str,
        status: u16,
        content_type: &str,
        body: Result<Vec<u8>, String>,
    ) -> ResponseId {
        let id = ResponseId(self.next_response.fetch_add(1, Ordering::SeqCst) + 1);
        self.bodies.lock().insert(id, body);
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        let _ = self.events_tx.send(PageEvent::Response(ResponseEvent {
            id,
            url: url.to_string(),
            status,
            headers,
            timing: json!({"startTime": 0.0, "responseEnd": 1.0}),
        }));
        id
    }

    /// Make reading this response's body fail
    pub fn fail_body(&self, id: ResponseId, reason: &str) {
        self.bodies.lock().insert(id, Err(reason.to_string()));
    }

    pub fn emit(&self, event: PageEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn commands(&self) -> Vec<PageCommand> {
        self.commands.lock().clone()
    }

    fn resolves(&self, selectors: &[String]) -> bool {
        let now = Instant::now();
        let ready = self.ready.lock();
        let ready_at = self.ready_at.lock();
        selectors
            .iter()
            .any(|s| ready.contains(s) || ready_at.get(s).is_some_and(|at| *at <= now))
    }
}

impl Default for FakePage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn execute(&self, command: PageCommand) -> ReplayResult<serde_json::Value> {
        self.commands.lock().push(command.clone());
        // Give the capture task a chance to interleave, like a real driver round trip
        tokio::task::yield_now().await;

        let name = command.name();
        if self.failing.lock().contains(name) {
            return Err(ReplayError::Command {
                command: name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }

        match command {
            PageCommand::Goto { url, .. } => {
                if self.respond_on_goto {
                    self.emit_response(&url, 200, "text/html; charset=utf-8", b"<html></html>");
                }
                Ok(serde_json::Value::Null)
            }
            PageCommand::WaitFor { selector, timeout_ms } => {
                let appears = self.ready_at.lock().get(&selector).copied();
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                if self.resolves(std::slice::from_ref(&selector)) {
                    Ok(serde_json::Value::Null)
                } else if let Some(at) = appears.filter(|at| *at <= deadline) {
                    tokio::time::sleep_until(at).await;
                    Ok(serde_json::Value::Null)
                } else {
                    Err(ReplayError::Timeout(format!(
                        "{selector} not visible after {timeout_ms} ms"
                    )))
                }
            }
            PageCommand::Click { selectors, .. }
            | PageCommand::Hover { selectors, .. }
            | PageCommand::Fill { selectors, .. } => {
                if self.resolves(&selectors) {
                    Ok(serde_json::Value::Null)
                } else {
                    Err(ReplayError::Command {
                        command: name.to_string(),
                        reason: format!("no element matches {selectors:?}"),
                    })
                }
            }
            PageCommand::Screenshot { path, .. } => {
                std::fs::write(&path, PNG_SIGNATURE)?;
                Ok(serde_json::Value::Null)
            }
            PageCommand::ResponseBody { response_id } => {
                let body = self.bodies.lock().remove(&response_id);
                match body {
                    Some(Ok(bytes)) => Ok(json!({
                        "body_b64": base64::engine::general_purpose::STANDARD.encode(bytes)
                    })),
                    Some(Err(reason)) => Err(ReplayError::Command {
                        command: name.to_string(),
                        reason,
                    }),
                    None => Err(ReplayError::Command {
                        command: name.to_string(),
                        reason: format!("unknown response {}", response_id.0),
                    }),
                }
            }
            _ => Ok(serde_json::Value::Null),
        }
    }

    fn take_events(&self) -> Option<PageEvents> {
        self.events_rx.lock().take()
    }
}
