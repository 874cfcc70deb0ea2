//! Batch replay tests
//!
//! Runs whole sessions against the scripted page and inspects the results
//! tree the way a user would.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowcheck_replay::fake::FakePage;
use flowcheck_replay::page::PageEvents;
use flowcheck_replay::{run_session, BrowserPage, PageCommand, ReplayConfig, ReplayResult};
use tempfile::TempDir;

const SEARCH: &str = r##"{
  "title": "search",
  "steps": [
    { "type": "navigate", "url": "https://example.com/search" },
    { "type": "click", "selectors": [["aria/Search"], ["#q"]] },
    { "type": "click", "selectors": [["#submit"]] }
  ]
}"##;

const LOGIN: &str = r##"{
  "title": "login",
  "steps": [
    { "type": "navigate", "url": "https://example.com/login" },
    { "type": "change", "value": "alice", "selectors": [["#user"]] },
    { "type": "click", "selectors": [["#login"]] }
  ]
}"##;

fn workspace(recordings: &[(&str, &str)]) -> (TempDir, ReplayConfig) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ReplayConfig::default();
    config.paths.recordings_dir = dir.path().join("recordings");
    config.paths.results_dir = dir.path().join("result");
    fs::create_dir_all(&config.paths.recordings_dir).unwrap();
    for (file, contents) in recordings {
        fs::write(config.paths.recordings_dir.join(file), contents).unwrap();
    }
    (dir, config)
}

fn ready_page() -> FakePage {
    FakePage::new()
        .ready("#q")
        .ready("#submit")
        .ready("#user")
        .ready("#login")
}

/// Sequence numbers that have a url artifact
fn captured_seqs(http_dir: &Path) -> BTreeSet<u64> {
    fs::read_dir(http_dir)
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            name.strip_suffix(".url.txt").and_then(|seq| seq.parse().ok())
        })
        .collect()
}

#[tokio::test]
async fn two_recordings_produce_complete_trees() {
    let (dir, config) = workspace(&[("search.json", SEARCH), ("login.json", LOGIN)]);
    let report = run_session(&config, Arc::new(ready_page())).await.unwrap();

    assert!(report.is_clean());
    assert_eq!(report.batch.total(), 2);

    for name in ["search", "login"] {
        let root = dir.path().join("result").join(name);
        for step in 1..=3 {
            assert!(
                root.join(format!("screenshots/{step}.png")).exists(),
                "{name}: missing screenshot {step}"
            );
        }

        let log = fs::read_to_string(root.join("result.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3, "{name}: {log}");
        assert!(lines.iter().all(|l| l.starts_with("OK , ")), "{name}: {log}");
        assert!(lines[0].starts_with("OK , 1/3 , - , -"));

        assert!(root.join("http/1.url.txt").exists());
        assert!(root.join("http/1.headers.txt").exists());
        assert_eq!(
            fs::read_to_string(root.join("http/1.response.html")).unwrap(),
            "<html></html>"
        );
        assert!(!root.join("error.json").exists());
    }

    let search_log = fs::read_to_string(dir.path().join("result/search/result.log")).unwrap();
    assert!(search_log.contains("OK , 2/3 , aria/Search , #q"));
}

#[tokio::test]
async fn failing_recording_does_not_block_the_next() {
    let broken = r##"{"title": "broken", "steps": [
        { "type": "navigate", "url": "https://example.com/" },
        { "type": "click", "selectors": [["#gone"]] },
        { "type": "click", "selectors": [["#submit"]] }
    ]}"##;
    let (dir, config) = workspace(&[
        ("a_broken.json", broken),
        ("b_garbage.json", "[1, 2"),
        ("c_search.json", SEARCH),
    ]);
    let report = run_session(&config, Arc::new(ready_page())).await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.batch.failed(), 2);

    let broken = report.batch.get("a_broken").unwrap();
    assert_eq!((broken.steps_run, broken.ok, broken.ng), (2, 1, 1));
    let broken_root = dir.path().join("result/a_broken");
    let log = fs::read_to_string(broken_root.join("result.log")).unwrap();
    assert_eq!(log.lines().last(), Some("NG , 2/3 , #gone , #gone"));
    let errors = fs::read_to_string(broken_root.join("error.json")).unwrap();
    assert!(errors.contains("\"readiness_timeout\""));

    let search = report.batch.get("c_search").unwrap();
    assert!(search.is_ok());
    let root = dir.path().join("result/c_search");
    assert_eq!(fs::read_to_string(root.join("result.log")).unwrap().lines().count(), 3);
    assert!(root.join("screenshots/3.png").exists());
}

/// Emits a burst of responses whenever something is clicked
struct BurstyPage {
    inner: FakePage,
}

impl BurstyPage {
    const BURST: u64 = 6;
}

#[async_trait]
impl BrowserPage for BurstyPage {
    async fn execute(&self, command: PageCommand) -> ReplayResult<serde_json::Value> {
        if let PageCommand::Click { .. } = &command {
            for i in 0..Self::BURST {
                match i % 3 {
                    0 => self.inner.emit_response(
                        &format!("https://example.com/api/{i}"),
                        200,
                        "application/json",
                        b"{}",
                    ),
                    1 => self.inner.emit_response(
                        &format!("https://example.com/missing/{i}"),
                        404,
                        "text/html",
                        b"",
                    ),
                    _ => self.inner.emit_response(
                        &format!("https://example.com/img/{i}.png"),
                        200,
                        "image/png",
                        b"\x89PNG",
                    ),
                };
                tokio::task::yield_now().await;
            }
        }
        self.inner.execute(command).await
    }

    fn take_events(&self) -> Option<PageEvents> {
        self.inner.take_events()
    }
}

#[tokio::test]
async fn response_sequence_has_no_gaps() {
    let (dir, config) = workspace(&[("search.json", SEARCH), ("login.json", LOGIN)]);
    let page = Arc::new(BurstyPage { inner: ready_page() });
    let report = run_session(&config, page).await.unwrap();

    // navigate, then one burst for each click in each recording
    assert_eq!(report.batch.get("search").unwrap().responses, 1 + 2 * BurstyPage::BURST);
    assert_eq!(report.batch.get("login").unwrap().responses, 1 + BurstyPage::BURST);
    assert_eq!(report.capture.responses, 2 + 3 * BurstyPage::BURST);
    assert_eq!(report.capture.failures, 0);

    for name in ["search", "login"] {
        let http = dir.path().join("result").join(name).join("http");
        let seqs = captured_seqs(&http);
        let expected: BTreeSet<u64> = (1..=seqs.len() as u64).collect();
        assert_eq!(seqs, expected, "{name}: sequence has gaps");
    }

    let http = dir.path().join("result/search/http");
    assert_eq!(
        fs::read_to_string(http.join("3.response.txt")).unwrap(),
        "STATUS CODE : 404"
    );
    assert!(http.join("4.headers.txt").exists());
    assert!(!http.join("4.response.png").exists());
    assert_eq!(fs::read_to_string(http.join("2.response.json")).unwrap(), "{}");
}

/// Navigations answer with a response whose body is already gone
struct DiscardingPage {
    inner: FakePage,
}

#[async_trait]
impl BrowserPage for DiscardingPage {
    async fn execute(&self, command: PageCommand) -> ReplayResult<serde_json::Value> {
        if let PageCommand::Goto { .. } = &command {
            self.inner
                .emit_unreadable_response("https://example.com/slow", "text/plain", "body discarded");
        }
        self.inner.execute(command).await
    }

    fn take_events(&self) -> Option<PageEvents> {
        self.inner.take_events()
    }
}

#[tokio::test]
async fn body_failure_is_recorded_against_its_sequence() {
    let (dir, config) = workspace(&[("search.json", SEARCH)]);
    let page = DiscardingPage {
        inner: ready_page().without_navigation_responses(),
    };

    let report = run_session(&config, Arc::new(page)).await.unwrap();
    assert_eq!(report.capture.failures, 1);
    assert_eq!(report.capture.unattributed, 0);
    assert_eq!(report.batch.get("search").unwrap().responses, 1);
    assert!(report.is_clean());

    let http = dir.path().join("result/search/http");
    let error = fs::read_to_string(http.join("1.error.txt")).unwrap();
    assert!(error.contains("body discarded"));
    let errors = fs::read_to_string(dir.path().join("result/search/error.json")).unwrap();
    let record: serde_json::Value = serde_json::from_str(errors.trim()).unwrap();
    assert_eq!(record["kind"], "response_capture");
    assert_eq!(record["seq"], 1);
}

#[tokio::test]
async fn readiness_ng_does_not_stop_the_replay() {
    let flaky = r##"{"title": "flaky", "steps": [
        { "type": "navigate", "url": "https://example.com/" },
        { "type": "click", "selectors": [["#q"], ["#late"]] },
        { "type": "click", "selectors": [["#submit"]] }
    ]}"##;
    let (dir, config) = workspace(&[("flaky.json", flaky)]);
    let report = run_session(&config, Arc::new(ready_page())).await.unwrap();

    let flaky = report.batch.get("flaky").unwrap();
    assert_eq!(flaky.error, None);
    assert_eq!((flaky.steps_run, flaky.ok, flaky.ng), (3, 2, 1));
    assert!(!report.is_clean());

    let root = dir.path().join("result/flaky");
    let log = fs::read_to_string(root.join("result.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3, "{log}");
    assert_eq!(lines[1], "NG , 2/3 , #q , #late");
    assert!(lines[2].starts_with("OK , 3/3 , #submit"));
    for step in 1..=3 {
        assert!(root.join(format!("screenshots/{step}.png")).exists());
    }
    let errors = fs::read_to_string(root.join("error.json")).unwrap();
    assert_eq!(errors.lines().count(), 1);
    assert!(errors.contains("\"readiness_timeout\""));
}

#[tokio::test]
async fn selector_appearing_before_the_timeout_is_ok() {
    let delayed = r##"{"title": "delayed", "steps": [
        { "type": "navigate", "url": "https://example.com/" },
        { "type": "click", "selectors": [["#spinner-done"]] }
    ]}"##;
    let (dir, mut config) = workspace(&[("delayed.json", delayed)]);
    config.hooks.readiness_timeout_ms = 2_000;
    let page = FakePage::new().ready_after("#spinner-done", Duration::from_millis(200));
    let report = run_session(&config, Arc::new(page)).await.unwrap();

    assert!(report.is_clean());
    let delayed = report.batch.get("delayed").unwrap();
    assert_eq!((delayed.ok, delayed.ng), (2, 0));
    let log = fs::read_to_string(dir.path().join("result/delayed/result.log")).unwrap();
    assert_eq!(log.lines().last(), Some("OK , 2/2 , #spinner-done , #spinner-done"));
    assert!(!dir.path().join("result/delayed/error.json").exists());
}
