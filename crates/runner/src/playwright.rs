//! Playwright page driver
//!
//! Spawns `node` with an embedded driver script and talks to it over stdio,
//! one JSON object per line in each direction. Binary payloads (snapshots,
//! recordings) come back base64 encoded.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::driver::{
    Action, ConsoleMessage, DriverLauncher, PageDriver, RecordingKind, SnapshotKind,
};
use crate::error::{DriverError, DriverResult};

/// Extra time allowed for a reply beyond the operation's own timeout
const REPLY_GRACE: Duration = Duration::from_secs(10);

/// Used for calls that carry no timeout of their own
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

const DRIVER_SCRIPT: &str = r#"
const path = require('path');
const readline = require('readline');
const fs = require('fs');
const os = require('os');

const playwright = require(require.resolve('playwright', { paths: [process.cwd(), __dirname] }));
const options = JSON.parse(process.argv[2]);

let browser, context, page;
let consoleBuffer = [];
let network = null;
let tracing = false;

function reply(id, ok, payload) {
  process.stdout.write(JSON.stringify(Object.assign({ id, ok }, payload)) + '\n');
}

function failure(err) {
  const kind = err && err.name === 'TimeoutError' ? 'timeout' : (err && err.unsupported ? 'unsupported' : 'protocol');
  return { error_kind: kind, error: String(err && err.message ? err.message : err) };
}

function unsupported(message) {
  const err = new Error(message);
  err.unsupported = true;
  return err;
}

async function launch() {
  browser = await playwright[options.browser].launch({ headless: options.headless });
  context = await browser.newContext({ viewport: { width: options.width, height: options.height } });
  page = await context.newPage();
  page.on('console', (msg) => consoleBuffer.push({ level: msg.type(), text: msg.text() }));
  page.on('pageerror', (err) => consoleBuffer.push({ level: 'pageerror', text: String(err) }));
  page.on('response', (res) => {
    if (network) {
      network.push({ url: res.url(), status: res.status(), method: res.request().method() });
    }
  });
}

const ops = {
  async navigate(p) {
    await page.goto(p.url, { timeout: p.timeout_ms, waitUntil: 'load' });
    return page.url();
  },
  async wait_for_attached(p) {
    await page.locator(p.selector).first().waitFor({ state: 'attached', timeout: p.timeout_ms });
    return null;
  },
  async count(p) {
    return await page.locator(p.selector).count();
  },
  async is_visible(p) {
    return await page.locator(p.selector).nth(p.index).isVisible();
  },
  async act(p) {
    const a = p.action;
    const target = p.selector ? page.locator(p.selector) : null;
    switch (a.kind) {
      case 'click': await target.click({ timeout: p.timeout_ms }); break;
      case 'fill': await target.fill(a.text, { timeout: p.timeout_ms }); break;
      case 'press': await target.press(a.key, { timeout: p.timeout_ms }); break;
      case 'keypress': await page.keyboard.press(a.key); break;
      case 'scroll':
        if (target) { await target.scrollIntoViewIfNeeded({ timeout: p.timeout_ms }); }
        else { await page.mouse.wheel(0, options.height); }
        break;
      default: throw unsupported('action ' + a.kind);
    }
    return null;
  },
  async text_content(p) {
    return (await page.locator(p.selector).first().textContent({ timeout: p.timeout_ms })) || '';
  },
  async current_url() {
    return page.url();
  },
  async snapshot(p) {
    switch (p.kind) {
      case 'screenshot': return (await page.screenshot({ fullPage: true })).toString('base64');
      case 'html': return Buffer.from(await page.content(), 'utf8').toString('base64');
      case 'accessibility_tree': {
        const tree = await page.accessibility.snapshot();
        return Buffer.from(JSON.stringify(tree), 'utf8').toString('base64');
      }
      default: throw unsupported('snapshot ' + p.kind);
    }
  },
  async start_recording(p) {
    switch (p.kind) {
      case 'trace': await context.tracing.start({ screenshots: true, snapshots: true }); tracing = true; return null;
      case 'network': network = []; return null;
      default: throw unsupported('recording ' + p.kind);
    }
  },
  async stop_recording(p) {
    switch (p.kind) {
      case 'trace': {
        if (!tracing) { return null; }
        const file = path.join(fs.mkdtempSync(path.join(os.tmpdir(), 'flowseal-')), 'trace.zip');
        await context.tracing.stop({ path: file });
        tracing = false;
        return fs.readFileSync(file).toString('base64');
      }
      case 'network': {
        if (!network) { return null; }
        const data = Buffer.from(JSON.stringify(network), 'utf8').toString('base64');
        network = null;
        return data;
      }
      default: throw unsupported('recording ' + p.kind);
    }
  },
  async drain_console() {
    const drained = consoleBuffer;
    consoleBuffer = [];
    return drained;
  },
  async close() {
    if (browser) { await browser.close(); }
    return null;
  },
};

(async () => {
  try {
    await launch();
    reply(0, true, { result: 'ready' });
  } catch (err) {
    reply(0, false, failure(err));
    process.exit(1);
  }
  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let req;
    try { req = JSON.parse(line); } catch (err) { continue; }
    const op = ops[req.op];
    try {
      if (!op) { throw unsupported('operation ' + req.op); }
      reply(req.id, true, { result: await op(req.params || {}) });
    } catch (err) {
      reply(req.id, false, failure(err));
    }
    if (req.op === 'close') { process.exit(0); }
  }
})();
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser engine '{}'", other)),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub node_binary: String,
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self::from(&BrowserConfig::default())
    }
}

impl From<&BrowserConfig> for PlaywrightConfig {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            node_binary: config.node_binary.clone(),
            browser: config.engine.parse().unwrap_or_default(),
            headless: config.headless,
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
        }
    }
}

/// Opens one Playwright-backed page per run
pub struct PlaywrightLauncher {
    config: PlaywrightConfig,
}

impl PlaywrightLauncher {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverLauncher for PlaywrightLauncher {
    async fn launch(&self) -> DriverResult<Box<dyn PageDriver>> {
        Ok(Box::new(PlaywrightBridge::spawn(&self.config).await?))
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    op: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error_kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl Response {
    fn into_result(self, op: &str, timeout: Duration) -> DriverResult<Value> {
        if self.ok {
            return Ok(self.result);
        }
        let message = self.error.unwrap_or_else(|| "unknown driver error".to_string());
        Err(match self.error_kind.as_deref() {
            Some("timeout") => DriverError::Timeout {
                operation: op.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            Some("unsupported") => DriverError::Unsupported(message),
            _ => DriverError::Protocol(message),
        })
    }
}

/// Parse one stdout line; anything that is not a reply is ignored
fn parse_response(line: &str) -> Option<Response> {
    serde_json::from_str(line.trim()).ok()
}

/// A running node process driving one browser page
pub struct PlaywrightBridge {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    closed: bool,
    _script_dir: TempDir,
}

impl PlaywrightBridge {
    pub async fn spawn(config: &PlaywrightConfig) -> DriverResult<Self> {
        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("flowseal-driver.js");
        std::fs::write(&script_path, DRIVER_SCRIPT)?;

        let options = json!({
            "browser": config.browser.as_str(),
            "headless": config.headless,
            "width": config.viewport_width,
            "height": config.viewport_height,
        });

        debug!(script = %script_path.display(), "starting playwright driver");
        let mut child = Command::new(&config.node_binary)
            .arg(&script_path)
            .arg(options.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Protocol(format!("failed to start {}: {}", config.node_binary, e))
            })?;

        let stdin = child.stdin.take().ok_or(DriverError::Closed)?;
        let stdout = child.stdout.take().ok_or(DriverError::Closed)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "playwright", "{}", line);
                }
            });
        }

        let mut bridge = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            closed: false,
            _script_dir: script_dir,
        };
        bridge.await_reply(0, "launch", CONTROL_TIMEOUT).await?;
        info!(
            browser = config.browser.as_str(),
            headless = config.headless,
            "playwright driver ready"
        );
        Ok(bridge)
    }

    async fn call(&mut self, op: &str, params: Value, timeout: Duration) -> DriverResult<Value> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&Request { id, op, params })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        self.await_reply(id, op, timeout).await
    }

    async fn await_reply(&mut self, id: u64, op: &str, timeout: Duration) -> DriverResult<Value> {
        let read = async {
            loop {
                match self.stdout.next_line().await {
                    Err(e) => return Err(DriverError::Io(e)),
                    Ok(None) => return Err(DriverError::Closed),
                    Ok(Some(line)) => match parse_response(&line) {
                        Some(response) if response.id == id => return Ok(response),
                        Some(response) => {
                            warn!(expected = id, got = response.id, "discarding stale driver reply")
                        }
                        None => debug!(target: "playwright", "{}", line),
                    },
                }
            }
        };
        match tokio::time::timeout(timeout + REPLY_GRACE, read).await {
            Ok(response) => response?.into_result(op, timeout),
            Err(_) => Err(DriverError::Timeout {
                operation: op.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn decode(value: Value) -> DriverResult<Vec<u8>> {
        let encoded = value
            .as_str()
            .ok_or_else(|| DriverError::Protocol("expected base64 payload".to_string()))?;
        BASE64
            .decode(encoded)
            .map_err(|e| DriverError::Protocol(format!("invalid base64 payload: {}", e)))
    }
}

fn millis(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

#[async_trait]
impl PageDriver for PlaywrightBridge {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> DriverResult<String> {
        let value = self
            .call("navigate", json!({ "url": url, "timeout_ms": millis(timeout) }), timeout)
            .await?;
        Ok(value.as_str().unwrap_or(url).to_string())
    }

    async fn wait_for_attached(&mut self, selector: &str, timeout: Duration) -> DriverResult<()> {
        self.call(
            "wait_for_attached",
            json!({ "selector": selector, "timeout_ms": millis(timeout) }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn count(&mut self, selector: &str) -> DriverResult<usize> {
        let value = self
            .call("count", json!({ "selector": selector }), CONTROL_TIMEOUT)
            .await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| DriverError::Protocol(format!("count returned {}", value)))
    }

    async fn is_visible(&mut self, selector: &str, index: usize) -> DriverResult<bool> {
        let value = self
            .call(
                "is_visible",
                json!({ "selector": selector, "index": index }),
                CONTROL_TIMEOUT,
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn act(
        &mut self,
        selector: Option<&str>,
        action: &Action,
        timeout: Duration,
    ) -> DriverResult<()> {
        self.call(
            "act",
            json!({ "selector": selector, "action": action, "timeout_ms": millis(timeout) }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn text_content(&mut self, selector: &str, timeout: Duration) -> DriverResult<String> {
        let value = self
            .call(
                "text_content",
                json!({ "selector": selector, "timeout_ms": millis(timeout) }),
                timeout,
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn current_url(&mut self) -> DriverResult<String> {
        let value = self.call("current_url", json!({}), CONTROL_TIMEOUT).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn snapshot(&mut self, kind: SnapshotKind) -> DriverResult<Vec<u8>> {
        let value = self
            .call("snapshot", json!({ "kind": kind }), CONTROL_TIMEOUT)
            .await?;
        Self::decode(value)
    }

    async fn start_recording(&mut self, kind: RecordingKind) -> DriverResult<()> {
        if kind == RecordingKind::Video {
            return Err(DriverError::Unsupported(
                "video recording must be configured at context creation".to_string(),
            ));
        }
        self.call("start_recording", json!({ "kind": kind }), CONTROL_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn stop_recording(&mut self, kind: RecordingKind) -> DriverResult<Option<Vec<u8>>> {
        let value = self
            .call("stop_recording", json!({ "kind": kind }), CONTROL_TIMEOUT)
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        Self::decode(value).map(Some)
    }

    async fn drain_console(&mut self) -> DriverResult<Vec<ConsoleMessage>> {
        let value = self.call("drain_console", json!({}), CONTROL_TIMEOUT).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.call("close", json!({}), CONTROL_TIMEOUT).await;
        self.closed = true;
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "playwright driver exited"),
            _ => {
                warn!("playwright driver did not exit, killing");
                self.child.kill().await?;
            }
        }
        result.map(|_| ())
    }
}
