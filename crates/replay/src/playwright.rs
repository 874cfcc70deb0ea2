//! Playwright-backed page
//!
//! A small Node.js driver script hosts the browser. It is written to a temp
//! directory at launch and spoken to over stdio, one JSON object per line:
//!
//! ```text
//! -> {"id": 7, "cmd": "wait_for", "selector": "#q", "timeout_ms": 5000}
//! <- {"type": "reply", "id": 7, "ok": true, "result": null}
//! <- {"type": "event", "event": "response", "id": 3, "url": "...", "status": 200, ...}
//! ```
//!
//! Replies are matched to callers by id, so the capture pipeline can read
//! response bodies while a step command is still outstanding.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::BrowserConfig;
use crate::error::{ReplayError, ReplayResult};
use crate::page::{BrowserPage, PageCommand, PageEvent, PageEvents};

/// Extra time the driver gets to report a command's own timeout
const REPLY_GRACE: Duration = Duration::from_secs(5);

const DRIVER_JS: &str = r#"'use strict';
const { createRequire } = require('module');
const path = require('path');
const readline = require('readline');

const config = JSON.parse(process.argv[2]);
const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');
const MAX_RETAINED_RESPONSES = 512;

let playwright;
try {
  playwright = createRequire(path.join(config.resolve_from, 'noop.js'))('playwright');
} catch (err) {
  send({ type: 'fatal', missing_playwright: true, message: String((err && err.message) || err) });
  process.exit(1);
}

function locate(page, selectors) {
  let locator = page.locator(selectors[0]);
  for (const selector of selectors.slice(1)) {
    locator = locator.or(page.locator(selector));
  }
  return locator.first();
}

async function main() {
  const browser = await playwright[config.browser].launch({
    headless: config.headless,
    slowMo: config.slow_mo_ms,
    args: config.args,
  });
  const context = await browser.newContext({
    viewport: config.viewport,
    locale: config.locale || undefined,
  });
  context.setDefaultTimeout(config.default_timeout_ms);
  const page = await context.newPage();

  const responses = new Map();
  let nextResponseId = 0;

  page.on('response', (response) => {
    const id = ++nextResponseId;
    responses.set(id, response);
    if (responses.size > MAX_RETAINED_RESPONSES) {
      responses.delete(responses.keys().next().value);
    }
    let timing = {};
    try {
      timing = response.request().timing();
    } catch (_) {}
    send({
      type: 'event',
      event: 'response',
      id,
      url: response.url(),
      status: response.status(),
      headers: response.headers(),
      timing,
    });
  });
  page.on('console', (msg) => send({ type: 'event', event: 'console', level: msg.type(), text: msg.text() }));
  page.on('pageerror', (err) => send({ type: 'event', event: 'page_error', message: String((err && err.stack) || err) }));
  page.on('crash', () => send({ type: 'event', event: 'crashed' }));

  const shutdown = async () => {
    await browser.close().catch(() => {});
  };

  const handlers = {
    set_viewport: async (c) => {
      await page.setViewportSize({ width: c.width, height: c.height });
    },
    goto: async (c) => {
      await page.goto(c.url, { timeout: c.timeout_ms });
    },
    click: async (c) => {
      const position = c.offset_x != null && c.offset_y != null ? { x: c.offset_x, y: c.offset_y } : undefined;
      await locate(page, c.selectors).click({
        clickCount: c.click_count,
        button: c.button || undefined,
        position,
        timeout: c.timeout_ms,
      });
    },
    hover: async (c) => {
      await locate(page, c.selectors).hover({ timeout: c.timeout_ms });
    },
    fill: async (c) => {
      await locate(page, c.selectors).fill(c.value, { timeout: c.timeout_ms });
    },
    key_down: async (c) => {
      await page.keyboard.down(c.key);
    },
    key_up: async (c) => {
      await page.keyboard.up(c.key);
    },
    scroll: async (c) => {
      if (c.selectors.length > 0) {
        await locate(page, c.selectors).evaluate((el, [x, y]) => el.scrollTo(x, y), [c.x, c.y]);
      } else {
        await page.evaluate(([x, y]) => window.scrollTo(x, y), [c.x, c.y]);
      }
    },
    wait_for: async (c) => {
      await page.locator(c.selector).first().waitFor({ state: 'visible', timeout: c.timeout_ms });
    },
    wait_for_function: async (c) => {
      await page.waitForFunction(c.expression, undefined, { timeout: c.timeout_ms });
    },
    screenshot: async (c) => {
      await page.screenshot({ path: c.path, fullPage: c.full_page });
    },
    response_body: async (c) => {
      const response = responses.get(c.response_id);
      if (!response) {
        throw new Error(`response ${c.response_id} is no longer retained`);
      }
      responses.delete(c.response_id);
      const body = await response.body();
      return { body_b64: body.toString('base64') };
    },
  };

  const input = readline.createInterface({ input: process.stdin });
  input.on('line', async (line) => {
    let command;
    try {
      command = JSON.parse(line);
    } catch (err) {
      process.stderr.write(`unparseable command: ${line}\n`);
      return;
    }
    if (command.cmd === 'close') {
      await shutdown();
      send({ type: 'reply', id: command.id, ok: true, result: null });
      process.exit(0);
    }
    const handler = handlers[command.cmd];
    try {
      if (!handler) {
        throw new Error(`unknown command ${command.cmd}`);
      }
      const result = await handler(command);
      send({ type: 'reply', id: command.id, ok: true, result: result === undefined ? null : result });
    } catch (err) {
      send({ type: 'reply', id: command.id, ok: false, error: String((err && err.message) || err) });
    }
  });
  input.on('close', async () => {
    await shutdown();
    process.exit(0);
  });

  send({ type: 'ready', version: browser.version() });
}

main().catch((err) => {
  send({ type: 'fatal', message: String((err && err.stack) || err) });
  process.exit(1);
});
"#;

/// Launch options handed to the driver script as its only argument
#[derive(Debug, Serialize)]
struct DriverConfig<'a> {
    browser: &'static str,
    headless: bool,
    slow_mo_ms: u64,
    args: &'a [String],
    locale: Option<&'a str>,
    viewport: Viewport,
    default_timeout_ms: u64,
    resolve_from: &'a Path,
}

#[derive(Debug, Serialize)]
struct Viewport {
    width: u32,
    height: u32,
}

/// One line from the driver
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DriverMessage {
    Ready {
        #[serde(default)]
        version: Option<String>,
    },
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event(PageEvent),
    Fatal {
        message: String,
        #[serde(default)]
        missing_playwright: bool,
    },
}

struct Pending {
    command: &'static str,
    reply: oneshot::Sender<ReplayResult<serde_json::Value>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Routes driver output to waiting callers and the event channel
struct Router {
    pending: PendingMap,
    events: mpsc::UnboundedSender<PageEvent>,
    ready: Option<oneshot::Sender<ReplayResult<Option<String>>>>,
    closed: Arc<AtomicBool>,
}

impl Router {
    fn route(&mut self, line: &str) {
        let message = match serde_json::from_str::<DriverMessage>(line) {
            Ok(message) => message,
            Err(_) => {
                debug!("driver: {}", line);
                return;
            }
        };

        match message {
            DriverMessage::Ready { version } => {
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(version));
                }
            }
            DriverMessage::Reply {
                id,
                ok,
                result,
                error,
            } => {
                let Some(pending) = self.pending.lock().remove(&id) else {
                    trace!(id, "Reply for a command nobody is waiting on");
                    return;
                };
                let reply = if ok {
                    Ok(result)
                } else {
                    Err(ReplayError::Command {
                        command: pending.command.to_string(),
                        reason: error.unwrap_or_else(|| "unknown driver error".to_string()),
                    })
                };
                let _ = pending.reply.send(reply);
            }
            DriverMessage::Event(event) => {
                let _ = self.events.send(event);
            }
            DriverMessage::Fatal {
                message,
                missing_playwright,
            } => {
                let err = if missing_playwright {
                    ReplayError::DriverNotFound(message)
                } else {
                    ReplayError::Driver(message)
                };
                match self.ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(err));
                    }
                    None => error!("{}", err),
                }
            }
        }
    }

    /// The driver's stdout ended; nobody will get a reply any more
    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(ReplayError::DriverClosed));
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(ReplayError::Driver(
                "driver exited before the browser was ready".to_string(),
            )));
        }
    }
}

/// Serialize a command with its request id
fn encode_command(id: u64, command: &PageCommand) -> ReplayResult<String> {
    let mut value = serde_json::to_value(command)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("id".to_string(), id.into());
    }
    Ok(serde_json::to_string(&value)?)
}

/// Timeout the driver applies to a command, when it carries one
fn command_timeout(command: &PageCommand) -> Option<Duration> {
    match command {
        PageCommand::Goto { timeout_ms, .. }
        | PageCommand::Click { timeout_ms, .. }
        | PageCommand::Hover { timeout_ms, .. }
        | PageCommand::Fill { timeout_ms, .. }
        | PageCommand::WaitFor { timeout_ms, .. }
        | PageCommand::WaitForFunction { timeout_ms, .. } => Some(Duration::from_millis(*timeout_ms)),
        _ => None,
    }
}

/// A browser page hosted by the Playwright driver process
pub struct PlaywrightPage {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    events: Mutex<Option<PageEvents>>,
    child: tokio::sync::Mutex<Option<Child>>,
    default_timeout: Duration,
    shutdown_timeout: Duration,
    _script_dir: tempfile::TempDir,
}

impl PlaywrightPage {
    /// Start the driver and wait for the browser to come up
    pub async fn launch(config: &BrowserConfig) -> ReplayResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("driver.cjs");
        std::fs::write(&script_path, DRIVER_JS)?;

        let resolve_from: PathBuf = match &config.driver_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let driver_config = DriverConfig {
            browser: config.browser.as_str(),
            headless: config.headless,
            slow_mo_ms: config.slow_mo_ms,
            args: &config.args,
            locale: config.locale.as_deref(),
            viewport: Viewport {
                width: config.viewport_width,
                height: config.viewport_height,
            },
            default_timeout_ms: config.default_timeout_ms,
            resolve_from: &resolve_from,
        };

        info!(
            browser = config.browser.as_str(),
            headless = config.headless,
            "Launching browser"
        );
        let mut child = TokioCommand::new(&config.node_binary)
            .arg(&script_path)
            .arg(serde_json::to_string(&driver_config)?)
            .current_dir(&resolve_from)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ReplayError::DriverNotFound(format!("{}: {}", config.node_binary.display(), e))
                } else {
                    ReplayError::Driver(format!(
                        "Failed to spawn {}: {}",
                        config.node_binary.display(),
                        e
                    ))
                }
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ReplayError::Driver("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ReplayError::Driver("driver stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ReplayError::Driver("driver stderr unavailable".to_string()))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_commands(stdin, outgoing_rx));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let router = Router {
            pending: Arc::clone(&pending),
            events: events_tx,
            ready: Some(ready_tx),
            closed: Arc::clone(&closed),
        };
        tokio::spawn(async move {
            let mut router = router;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => router.route(&line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read driver output: {}", e);
                        break;
                    }
                }
            }
            debug!("Driver output closed");
            router.close();
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("driver stderr: {}", line);
            }
        });

        // Dropping `child` on any early return kills the driver
        match timeout(config.launch_timeout(), ready_rx).await {
            Ok(Ok(Ok(version))) => {
                info!(version = version.as_deref().unwrap_or("unknown"), "Browser ready");
            }
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(ReplayError::DriverClosed),
            Err(_) => {
                return Err(ReplayError::Timeout(format!(
                    "browser launch after {} ms",
                    config.launch_timeout_ms
                )))
            }
        }

        Ok(Self {
            outgoing,
            pending,
            closed,
            next_id: AtomicU64::new(0),
            events: Mutex::new(Some(events_rx)),
            child: tokio::sync::Mutex::new(Some(child)),
            default_timeout: config.default_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            _script_dir: script_dir,
        })
    }
}

async fn write_commands(mut stdin: ChildStdin, mut outgoing: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outgoing.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            warn!("Failed to write to driver: {}", e);
            break;
        }
    }
}

#[async_trait]
impl BrowserPage for PlaywrightPage {
    async fn execute(&self, command: PageCommand) -> ReplayResult<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = command.name();
        let wait = command_timeout(&command)
            .map(|t| t + REPLY_GRACE)
            .unwrap_or(self.default_timeout);
        let line = encode_command(id, &command)?;

        let (reply, response) = oneshot::channel();
        self.pending.lock().insert(
            id,
            Pending {
                command: name,
                reply,
            },
        );
        if self.closed.load(Ordering::SeqCst) || self.outgoing.send(line).is_err() {
            self.pending.lock().remove(&id);
            return Err(ReplayError::DriverClosed);
        }
        trace!(id, command = name, "Sent driver command");

        match timeout(wait, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ReplayError::DriverClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ReplayError::Timeout(format!(
                    "driver reply to `{}` after {} ms",
                    name,
                    wait.as_millis()
                )))
            }
        }
    }

    fn take_events(&self) -> Option<PageEvents> {
        self.events.lock().take()
    }

    async fn close(&self) -> ReplayResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match timeout(self.shutdown_timeout, self.execute(PageCommand::Close)).await {
            Ok(Ok(_)) | Ok(Err(ReplayError::DriverClosed)) => {}
            Ok(Err(e)) => warn!("Driver close command failed: {}", e),
            Err(_) => warn!("Driver did not acknowledge close"),
        }

        match timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Driver exited"),
            Ok(Err(e)) => warn!("Failed to wait for driver: {}", e),
            Err(_) => {
                warn!(
                    "Driver still running after {} ms, killing",
                    self.shutdown_timeout.as_millis()
                );
                child.kill().await?;
            }
        }
        info!("Browser closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ResponseId;
    use serde_json::json;

    fn router() -> (
        Router,
        mpsc::UnboundedReceiver<PageEvent>,
        oneshot::Receiver<ReplayResult<Option<String>>>,
    ) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (ready, ready_rx) = oneshot::channel();
        let router = Router {
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
            ready: Some(ready),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (router, events_rx, ready_rx)
    }

    fn wait_on(router: &Router, id: u64, command: &'static str) -> oneshot::Receiver<ReplayResult<serde_json::Value>> {
        let (reply, rx) = oneshot::channel();
        router.pending.lock().insert(id, Pending { command, reply });
        rx
    }

    #[test]
    fn test_encode_command_adds_id() {
        let line = encode_command(
            9,
            &PageCommand::Goto {
                url: "https://example.com/".to_string(),
                timeout_ms: 1000,
            },
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"id": 9, "cmd": "goto", "url": "https://example.com/", "timeout_ms": 1000})
        );
    }

    #[test]
    fn test_command_timeout() {
        let wait = PageCommand::WaitFor {
            selector: "#a".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(command_timeout(&wait), Some(Duration::from_millis(250)));
        assert_eq!(command_timeout(&PageCommand::Close), None);
    }

    #[tokio::test]
    async fn test_ready_line_completes_launch() {
        let (mut router, _events, ready) = router();
        router.route(r#"{"type": "ready", "version": "120.0"}"#);
        assert_eq!(ready.await.unwrap().unwrap().as_deref(), Some("120.0"));
    }

    #[tokio::test]
    async fn test_missing_playwright_is_reported() {
        let (mut router, _events, ready) = router();
        router.route(r#"{"type": "fatal", "missing_playwright": true, "message": "Cannot find module 'playwright'"}"#);
        let err = ready.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "driver_not_found");
    }

    #[tokio::test]
    async fn test_replies_route_by_id() {
        let (mut router, _events, _ready) = router();
        let first = wait_on(&router, 1, "goto");
        let second = wait_on(&router, 2, "click");

        router.route(r#"{"type": "reply", "id": 2, "ok": false, "error": "element detached"}"#);
        router.route(r#"{"type": "reply", "id": 1, "ok": true, "result": {"body_b64": "aGk="}}"#);

        let err = second.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Page command `click` failed: element detached");
        assert_eq!(first.await.unwrap().unwrap(), json!({"body_b64": "aGk="}));
        assert!(router.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (mut router, mut events, _ready) = router();
        router.route(
            r#"{"type": "event", "event": "response", "id": 4, "url": "https://example.com/a.js",
                "status": 200, "headers": {"content-type": "text/javascript"}, "timing": {"startTime": 1.5}}"#,
        );
        router.route(r#"{"type": "event", "event": "console", "level": "error", "text": "boom"}"#);
        router.route(r#"{"type": "event", "event": "crashed"}"#);
        router.route("plain diagnostic output");

        match events.recv().await.unwrap() {
            PageEvent::Response(response) => {
                assert_eq!(response.id, ResponseId(4));
                assert_eq!(response.header("Content-Type"), Some("text/javascript"));
                assert_eq!(response.timing["startTime"], 1.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            PageEvent::Console {
                level: "error".to_string(),
                text: "boom".to_string(),
            }
        );
        assert_eq!(events.recv().await.unwrap(), PageEvent::Crashed);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_commands() {
        let (mut router, _events, _ready) = router();
        let waiting = wait_on(&router, 1, "wait_for");
        router.close();
        assert!(matches!(waiting.await.unwrap(), Err(ReplayError::DriverClosed)));
        assert!(router.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_node_binary() {
        let config = BrowserConfig {
            node_binary: PathBuf::from("/nonexistent/flowcheck-node"),
            ..BrowserConfig::default()
        };
        match PlaywrightPage::launch(&config).await {
            Err(err) => assert_eq!(err.kind(), "driver_not_found"),
            Ok(_) => panic!("launch should fail without node"),
        }
    }
}
