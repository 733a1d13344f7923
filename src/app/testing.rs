//! Scripted in-memory browser used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::errors::CrawlError;
use super::extract::table_locators;
use super::webdriver::{Browser, ElementRef, Locator};
use super::{page_size, paginate, region};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Navigate(String),
    Click(String),
    ScriptClick(String),
    Clear(String),
    SendKeys(String, String),
    PageSource,
    Close,
}

/// Page mutation triggered by clicking an element.
#[derive(Debug, Clone)]
pub enum Effect {
    NextPage,
    Hide(String),
    Toggle(String),
    SetAttribute {
        element: String,
        name: String,
        value: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct MockElement {
    displayed: bool,
    enabled: bool,
    selected: bool,
    attributes: HashMap<String, String>,
    on_click: Vec<Effect>,
    disabled_on_last_page: bool,
}

impl MockElement {
    pub fn visible() -> Self {
        Self {
            displayed: true,
            enabled: true,
            ..Self::default()
        }
    }

    pub fn hidden() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn checked(mut self) -> Self {
        self.selected = true;
        self
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn on_click(mut self, effect: Effect) -> Self {
        self.on_click.push(effect);
        self
    }

    /// Pager control that reports `disabled` once the last page is shown.
    pub fn pager(mut self) -> Self {
        self.disabled_on_last_page = true;
        self.on_click.push(Effect::NextPage);
        self
    }
}

#[derive(Default)]
struct DomState {
    page: usize,
    pages: Vec<String>,
    locators: HashMap<String, Vec<String>>,
    /// Locator key to `(id, attribute, value)`: matches only while the attribute holds that value.
    attribute_locators: HashMap<String, Vec<(String, String, String)>>,
    elements: HashMap<String, MockElement>,
    failing: HashSet<String>,
    calls: Vec<Call>,
    lookups: usize,
}

impl DomState {
    fn on_last_page(&self) -> bool {
        self.page + 1 >= self.pages.len()
    }

    fn element(&self, element: &ElementRef) -> Result<&MockElement, CrawlError> {
        self.elements
            .get(&element.0)
            .ok_or_else(|| CrawlError::WebDriver {
                error: "stale element reference".to_string(),
                message: element.0.clone(),
            })
    }

    fn pager_disabled(&self, el: &MockElement) -> bool {
        el.disabled_on_last_page && self.on_last_page()
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::NextPage => {
                if !self.on_last_page() {
                    self.page += 1;
                }
            }
            Effect::Hide(id) => {
                if let Some(el) = self.elements.get_mut(&id) {
                    el.displayed = false;
                }
            }
            Effect::Toggle(id) => {
                if let Some(el) = self.elements.get_mut(&id) {
                    el.selected = !el.selected;
                }
            }
            Effect::SetAttribute {
                element,
                name,
                value,
            } => {
                if let Some(el) = self.elements.get_mut(&element) {
                    el.attributes.insert(name, value);
                }
            }
        }
    }

    fn click(&mut self, element: &ElementRef, call: Call) -> Result<(), CrawlError> {
        let effects = self.element(element)?.on_click.clone();
        self.calls.push(call);
        for effect in effects {
            self.apply(effect);
        }
        Ok(())
    }
}

pub struct MockBrowser {
    state: Mutex<DomState>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DomState::default()),
        }
    }

    pub fn pages(mut self, pages: Vec<String>) -> Self {
        self.state.get_mut().unwrap().pages = pages;
        self
    }

    /// Registers `id` as a match for `locator`, replacing its prior state.
    pub fn element(mut self, locator: &Locator, id: &str, element: MockElement) -> Self {
        let state = self.state.get_mut().unwrap();
        state.elements.insert(id.to_string(), element);
        state
            .locators
            .entry(locator.to_string())
            .or_default()
            .push(id.to_string());
        self
    }

    /// Adds an element that no locator matches yet.
    pub fn node(mut self, id: &str, element: MockElement) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .elements
            .insert(id.to_string(), element);
        self
    }

    /// Lets `locator` match the element `id` only while its `name` attribute equals `value`,
    /// like an XPath attribute predicate re-evaluated on every lookup.
    pub fn element_while(mut self, locator: &Locator, id: &str, name: &str, value: &str) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .attribute_locators
            .entry(locator.to_string())
            .or_default()
            .push((id.to_string(), name.to_string(), value.to_string()));
        self
    }

    pub fn failing(mut self, locator: &Locator) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .failing
            .insert(locator.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn lookups(&self) -> usize {
        self.state.lock().unwrap().lookups
    }

    pub fn script_clicks_on(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::ScriptClick(target) if target == id))
            .count()
    }

    pub fn page_source_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::PageSource))
            .count()
    }

    pub fn typed_into(&self, id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SendKeys(target, text) if target == id => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn is_selected_now(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .elements
            .get(id)
            .is_some_and(|el| el.selected)
    }

    /// A screener page whose region menu, page size control and pager all
    /// behave, serving `pages` as successive table snapshots.
    pub fn screener(region_name: &str, pages: Vec<String>) -> Self {
        MockBrowser::new()
            .pages(pages)
            .element(&region::region_menu_button(), "region-menu", MockElement::visible())
            .element(&region::search_input(), "search", MockElement::visible())
            .element(
                &region::region_checkbox(region_name),
                "region-box",
                MockElement::visible().on_click(Effect::Toggle("region-box".into())),
            )
            .element(
                &region::apply_button(),
                "apply",
                MockElement::visible().on_click(Effect::Hide("search".into())),
            )
            .node("rows", MockElement::visible().with_attr("title", "25"))
            .element_while(&page_size::rows_per_page_trigger(25), "rows", "title", "25")
            .element_while(&page_size::rows_per_page_trigger(100), "rows", "title", "100")
            .element(
                &page_size::page_size_option(100),
                "rows-100",
                MockElement::visible().on_click(Effect::SetAttribute {
                    element: "rows".into(),
                    name: "title".into(),
                    value: "100".into(),
                }),
            )
            .element(
                &paginate::next_page_button(),
                "next",
                MockElement::visible().pager(),
            )
            .element(&table_locators()[0], "table", MockElement::visible())
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn navigate(&self, url: &str) -> Result<(), CrawlError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Navigate(url.to_string()));
        Ok(())
    }

    async fn find_elements(&self, locator: &Locator) -> Result<Vec<ElementRef>, CrawlError> {
        let mut state = self.state.lock().unwrap();
        state.lookups += 1;
        let key = locator.to_string();
        if state.failing.contains(&key) {
            return Err(CrawlError::WebDriver {
                error: "unknown error".to_string(),
                message: format!("lookup of {key} failed"),
            });
        }
        let mut found = state
            .locators
            .get(&key)
            .map(|ids| ids.iter().map(|id| ElementRef(id.clone())).collect::<Vec<_>>())
            .unwrap_or_default();
        if let Some(candidates) = state.attribute_locators.get(&key) {
            for (id, name, value) in candidates {
                let matches = state
                    .elements
                    .get(id)
                    .and_then(|el| el.attributes.get(name))
                    .is_some_and(|current| current == value);
                if matches {
                    found.push(ElementRef(id.clone()));
                }
            }
        }
        Ok(found)
    }

    async fn is_displayed(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        let state = self.state.lock().unwrap();
        Ok(state.element(element)?.displayed)
    }

    async fn is_enabled(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        let state = self.state.lock().unwrap();
        let el = state.element(element)?;
        Ok(el.enabled && !state.pager_disabled(el))
    }

    async fn is_selected(&self, element: &ElementRef) -> Result<bool, CrawlError> {
        let state = self.state.lock().unwrap();
        Ok(state.element(element)?.selected)
    }

    async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, CrawlError> {
        let state = self.state.lock().unwrap();
        let el = state.element(element)?;
        if name == "disabled" && state.pager_disabled(el) {
            return Ok(Some("true".to_string()));
        }
        Ok(el.attributes.get(name).cloned())
    }

    async fn clear(&self, element: &ElementRef) -> Result<(), CrawlError> {
        let mut state = self.state.lock().unwrap();
        state.element(element)?;
        state.calls.push(Call::Clear(element.0.clone()));
        Ok(())
    }

    async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<(), CrawlError> {
        let mut state = self.state.lock().unwrap();
        state.element(element)?;
        state
            .calls
            .push(Call::SendKeys(element.0.clone(), text.to_string()));
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), CrawlError> {
        self.state
            .lock()
            .unwrap()
            .click(element, Call::Click(element.0.clone()))
    }

    async fn execute_script(
        &self,
        script: &str,
        args: &[ElementRef],
    ) -> Result<Value, CrawlError> {
        let Some(target) = args.first() else {
            return Ok(Value::Null);
        };
        if script.contains(".click()") {
            self.state
                .lock()
                .unwrap()
                .click(target, Call::ScriptClick(target.0.clone()))?;
        }
        Ok(Value::Null)
    }

    async fn page_source(&self) -> Result<String, CrawlError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::PageSource);
        Ok(state.pages.get(state.page).cloned().unwrap_or_default())
    }

    async fn close(&self) -> Result<(), CrawlError> {
        self.state.lock().unwrap().calls.push(Call::Close);
        Ok(())
    }
}

/// Renders a quote table with a `thead` header row.
pub fn quote_table(headers: &[&str], rows: &[[&str; 3]]) -> String {
    let head = headers
        .iter()
        .map(|h| format!("<th>{h}</th>"))
        .collect::<String>();
    let body = rows
        .iter()
        .map(|row| {
            let cells = row
                .iter()
                .map(|c| format!("<td>{c}</td>"))
                .collect::<String>();
            format!("<tr>{cells}</tr>")
        })
        .collect::<String>();
    format!(
        "<html><body><table><thead><tr>{head}</tr></thead><tbody>{body}</tbody></table></body></html>"
    )
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` under a plain-text fmt subscriber and returns what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}
