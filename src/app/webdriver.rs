use std::fmt;
use std::fs::{self, File};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::errors::CrawlError;
use super::types::{BrowserArg, CrawlConfig};

/// Key under which W3C WebDriver serializes element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const SCRIPT_CLICK: &str = "arguments[0].click();";

/// How an element is found, both on the live page and in a markup snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Css(String),
    XPath(String),
    Role(String),
    TestId(String),
    TextContains { tag: String, text: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Locator::XPath(expr.into())
    }

    pub fn text_contains(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::TextContains {
            tag: tag.into(),
            text: text.into(),
        }
    }

    /// WebDriver `using`/`value` pair for element lookup.
    pub fn strategy(&self) -> (&'static str, String) {
        match self {
            Locator::XPath(expr) => ("xpath", expr.clone()),
            Locator::TextContains { tag, text } => (
                "xpath",
                format!("//{tag}[contains(., {})]", xpath_literal(text)),
            ),
            other => (
                "css selector",
                other.css_selector().unwrap_or_default(),
            ),
        }
    }

    /// CSS form of the locator, when one exists. Used against parsed snapshots.
    pub fn css_selector(&self) -> Option<String> {
        match self {
            Locator::Css(selector) => Some(selector.clone()),
            Locator::Role(role) => Some(format!("[role=\"{role}\"]")),
            Locator::TestId(id) => Some(format!("[data-testid=\"{id}\"]")),
            Locator::XPath(_) | Locator::TextContains { .. } => None,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => write!(f, "css:{selector}"),
            Locator::XPath(expr) => write!(f, "xpath:{expr}"),
            Locator::Role(role) => write!(f, "role:{role}"),
            Locator::TestId(id) => write!(f, "testid:{id}"),
            Locator::TextContains { tag, text } => write!(f, "text:{tag}~{text}"),
        }
    }
}

/// Quotes arbitrary text as an XPath 1.0 string literal.
pub fn xpath_literal(text: &str) -> String {
    if !text.contains('"') {
        return format!("\"{text}\"");
    }
    if !text.contains('\'') {
        return format!("'{text}'");
    }
    let parts = text
        .split('"')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(", '\"', ");
    format!("concat({parts})")
}

/// Opaque handle to an element of the live page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

impl ElementRef {
    fn to_json(&self) -> Value {
        json!({ ELEMENT_KEY: self.0 })
    }

    fn from_json(value: &Value) -> Option<Self> {
        value
            .get(ELEMENT_KEY)
            .and_then(|v| v.as_str())
            .map(|id| ElementRef(id.to_string()))
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element {}", self.0)
    }
}

/// Operations the crawl needs from a controlled browser.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), CrawlError>;

    async fn find_elements(&self, locator: &Locator) -> Result<Vec<ElementRef>, CrawlError>;

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, CrawlError>;

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, CrawlError>;

    async fn is_selected(&self, element: &ElementRef) -> Result<bool, CrawlError>;

    async fn attribute(&self, element: &ElementRef, name: &str)
    -> Result<Option<String>, CrawlError>;

    async fn clear(&self, element: &ElementRef) -> Result<(), CrawlError>;

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), CrawlError>;

    async fn click(&self, element: &ElementRef) -> Result<(), CrawlError>;

    async fn execute_script(
        &self,
        script: &str,
        args: &[ElementRef],
    ) -> Result<Value, CrawlError>;

    async fn page_source(&self) -> Result<String, CrawlError>;

    async fn close(&self) -> Result<(), CrawlError>;

    async fn find_element(&self, locator: &Locator) -> Result<ElementRef, CrawlError> {
        self.find_elements(locator)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CrawlError::NoSuchElement(locator.to_string()))
    }

    /// Clicks through injected script, which is not blocked by overlays.
    async fn script_click(&self, element: &ElementRef) -> Result<(), CrawlError> {
        self.execute_script(SCRIPT_CLICK, std::slice::from_ref(element))
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

/// A W3C WebDriver session spoken over plain HTTP.
pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    session_id: String,
}

impl WebDriverSession {
    pub async fn create(endpoint: &str, capabilities: &Value) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(40))
            .build()?;
        let base = endpoint.trim_end_matches('/').to_string();
        let value = send_command(&client, Method::POST, &format!("{base}/session"), Some(capabilities))
            .await?;
        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                CrawlError::Transport(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })?;
        info!(endpoint = %base, session = %session_id, "webdriver session created");
        Ok(Self {
            client,
            base,
            session_id,
        })
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CrawlError> {
        let endpoint = format!("{}/session/{}{}", self.base, self.session_id, path);
        send_command(&self.client, method, &endpoint, body).await
    }

    async fn element_command(
        &self,
        method: Method,
        element: &ElementRef,
        action: &str,
        body: Option<&Value>,
    ) -> Result<Value, CrawlError> {
        self.command(method, &format!("/element/{}/{action}", element.0), body)
            .await
    }

    async fn element_flag(&self, element: &ElementRef, action: &str) -> Result<bool, CrawlError> {
        let value = self
            .element_command(Method::GET, element, action, None)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

/// Protocol error carried in a response `value`: only an object with an `error` key.
fn wire_error(value: &Value) -> Option<WireError> {
    if !value.as_object()?.contains_key("error") {
        return None;
    }
    WireError::deserialize(value).ok()
}

async fn send_command(
    client: &reqwest::Client,
    method: Method,
    endpoint: &str,
    body: Option<&Value>,
) -> Result<Value, CrawlError> {
    let mut request = client.request(method, endpoint);
    if let Some(body) = body {
        request = request.json(body);
    }
    let res = request.send().await?;
    let status = res.status();
    let text = res.text().await?;
    let mut parsed: Value = serde_json::from_str(&text).unwrap_or_default();

    if let Some(err) = parsed.get("value").and_then(wire_error) {
        return Err(CrawlError::WebDriver {
            error: err.error,
            message: truncate_for_log(&err.message, 260),
        });
    }
    if !status.is_success() {
        return Err(CrawlError::Transport(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_for_log(&text, 260)
        )));
    }
    Ok(parsed
        .get_mut("value")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

#[async_trait]
impl Browser for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        self.command(Method::POST, "/url", Some(&json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn find_elements(&self, locator: &Locator) -> Result<Vec<ElementRef>, CrawlError> {
        let (using, value) = locator.strategy();
        let found = self
            .command(
                Method::POST,
                "/elements",
                Some(&json!({ "using": using, "value": value })),
            )
            .await?;
        Ok(found
            .as_array()
            .map(|arr| arr.iter().filter_map(ElementRef::from_json).collect())
            .unwrap_or_default())
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        self.element_flag(element, "displayed").await
    }

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        self.element_flag(element, "enabled").await
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        self.element_flag(element, "selected").await
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, CrawlError> {
        let value = self
            .element_command(Method::GET, element, &format!("attribute/{name}"), None)
            .await?;
        Ok(match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    async fn clear(&self, element: &ElementRef) -> Result<(), CrawlError> {
        self.element_command(Method::POST, element, "clear", Some(&json!({})))
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), CrawlError> {
        self.element_command(Method::POST, element, "value", Some(&json!({ "text": text })))
            .await
            .map(|_| ())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), CrawlError> {
        self.element_command(Method::POST, element, "click", Some(&json!({})))
            .await
            .map(|_| ())
    }

    async fn execute_script(
        &self,
        script: &str,
        args: &[ElementRef],
    ) -> Result<Value, CrawlError> {
        let args = args.iter().map(ElementRef::to_json).collect::<Vec<_>>();
        self.command(
            Method::POST,
            "/execute/sync",
            Some(&json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn page_source(&self) -> Result<String, CrawlError> {
        let value = self.command(Method::GET, "/source", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), CrawlError> {
        let endpoint = format!("{}/session/{}", self.base, self.session_id);
        self.client.delete(endpoint).send().await?;
        info!(session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

pub fn webdriver_capabilities(browser: BrowserArg, headless: bool, user_agent: &str) -> Value {
    match browser {
        BrowserArg::Firefox => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("-headless".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "eager",
                        "moz:firefoxOptions": {
                            "args": args,
                            "prefs": { "general.useragent.override": user_agent }
                        }
                    }
                }
            })
        }
        BrowserArg::Chrome => {
            let mut args = Vec::<String>::new();
            if headless {
                args.push("--headless".to_string());
            }
            args.push("--no-sandbox".to_string());
            args.push("--disable-dev-shm-usage".to_string());
            args.push(format!("--user-agent={user_agent}"));
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "pageLoadStrategy": "eager",
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

/// A driver binary launched by the crawler. Killed when dropped.
pub struct DriverProcess {
    child: Child,
    binary: String,
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        debug!(binary = %self.binary, "webdriver process stopped");
    }
}

/// Returns a reachable endpoint, starting a local driver when allowed.
pub async fn ensure_webdriver(
    config: &CrawlConfig,
) -> Result<(String, Option<DriverProcess>), CrawlError> {
    let requested = config.webdriver_url.trim_end_matches('/').to_string();
    if webdriver_reachable(&requested) {
        info!(endpoint = %requested, "webdriver endpoint reachable");
        return Ok((requested, None));
    }
    if !config.webdriver_autostart {
        return Err(CrawlError::DriverStart(format!(
            "endpoint {requested} unreachable and autostart is disabled"
        )));
    }

    let port = find_free_local_port()?;
    let endpoint = format!("http://127.0.0.1:{port}");
    let binary = config
        .webdriver_binary
        .clone()
        .unwrap_or_else(|| default_driver_binary(config.browser).to_string());
    warn!(
        requested = %requested,
        binary = %binary,
        "webdriver endpoint unreachable, starting a local driver"
    );
    let process = start_webdriver(&binary, port, &endpoint, config.webdriver_start_timeout).await?;
    info!(endpoint = %endpoint, binary = %binary, "webdriver autostarted");
    Ok((endpoint, Some(process)))
}

fn default_driver_binary(browser: BrowserArg) -> &'static str {
    match browser {
        BrowserArg::Chrome => "chromedriver",
        BrowserArg::Firefox => "geckodriver",
    }
}

fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok())
}

async fn start_webdriver(
    binary: &str,
    port: u16,
    endpoint: &str,
    start_timeout: Duration,
) -> Result<DriverProcess, CrawlError> {
    let log_path = webdriver_log_path(port);
    let log_file = File::options()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let mut cmd = Command::new(binary);
    configure_webdriver_command(&mut cmd, binary, port);
    cmd.stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .stdin(Stdio::null());
    let child = cmd
        .spawn()
        .map_err(|e| CrawlError::DriverStart(format!("failed to spawn {binary}: {e}")))?;
    let mut process = DriverProcess {
        child,
        binary: binary.to_string(),
    };

    let steps = (start_timeout.as_millis() / 200).max(1);
    for _ in 0..steps {
        if webdriver_reachable(endpoint) {
            return Ok(process);
        }
        if let Ok(Some(status)) = process.child.try_wait() {
            let mut reason = format!(
                "{binary} exited early with status {status} (log: {})",
                log_path.display()
            );
            if let Some(tail) = read_log_tail(&log_path, 30) {
                reason = format!("{reason}; tail: {tail}");
            }
            return Err(CrawlError::DriverStart(reason));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mut reason = format!(
        "{binary} did not become ready in time (log: {})",
        log_path.display()
    );
    if let Some(tail) = read_log_tail(&log_path, 30) {
        reason = format!("{reason}; tail: {tail}");
    }
    Err(CrawlError::DriverStart(reason))
}

fn configure_webdriver_command(cmd: &mut Command, binary: &str, port: u16) {
    let lower = binary.to_ascii_lowercase();
    if lower.contains("geckodriver") {
        cmd.arg("--port").arg(port.to_string());
        return;
    }
    cmd.arg(format!("--port={port}"));
    if lower.contains("chromedriver") {
        cmd.arg("--log-level=SEVERE");
    }
}

fn webdriver_log_path(port: u16) -> PathBuf {
    let dir = std::env::temp_dir().join("quote-crawler");
    let _ = fs::create_dir_all(&dir);
    dir.join(format!("webdriver-{port}.log"))
}

fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let all = text.lines().collect::<Vec<_>>();
    let tail = &all[all.len().saturating_sub(lines.max(1))..];
    (!tail.is_empty()).then(|| tail.join(" | "))
}

fn find_free_local_port() -> Result<u16, CrawlError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
