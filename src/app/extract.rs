use std::collections::HashSet;

use scraper::{ElementRef as HtmlElement, Html, Selector};
use serde::Serialize;
use tracing::{debug, warn};

use super::errors::CrawlError;
use super::wait::{Condition, StepContext};
use super::webdriver::{Browser, Locator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteRow {
    pub symbol: String,
    pub name: String,
    pub price: String,
}

/// Rows of one crawl, unique by symbol, in first-seen order.
#[derive(Debug, Default)]
pub struct Accumulator {
    rows: Vec<QuoteRow>,
    symbols: HashSet<String>,
}

impl Accumulator {
    /// Keeps `row` unless its symbol was already seen.
    pub fn insert(&mut self, row: QuoteRow) -> bool {
        if !self.symbols.insert(row.symbol.clone()) {
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[QuoteRow] {
        &self.rows
    }
}

/// Header substrings naming the symbol, name and price columns, matched in this order.
const ROLE_LABELS: [&str; 3] = ["symbol", "name", "price"];

/// Column index of each field on one rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMapping {
    pub symbol: usize,
    pub name: usize,
    pub price: usize,
}

impl Default for HeaderMapping {
    fn default() -> Self {
        Self {
            symbol: 0,
            name: 1,
            price: 2,
        }
    }
}

impl HeaderMapping {
    /// Matches header labels by case-insensitive substring. Roles without a
    /// matching label keep their positional default.
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut mapping = HeaderMapping::default();
        for (index, header) in headers.iter().enumerate() {
            let header = header.as_ref().to_lowercase();
            match ROLE_LABELS.iter().position(|role| header.contains(role)) {
                Some(0) => mapping.symbol = index,
                Some(1) => mapping.name = index,
                Some(2) => mapping.price = index,
                _ => {}
            }
        }
        mapping
    }

    fn max_index(&self) -> usize {
        self.symbol.max(self.name).max(self.price)
    }
}

/// Table containers, in lookup order.
pub fn table_locators() -> Vec<Locator> {
    vec![
        Locator::css("table"),
        Locator::Role("table".into()),
        Locator::TestId("data-table".into()),
    ]
}

/// Waits for the table, snapshots the page and merges its rows. Returns the
/// number of rows that were new.
pub async fn extract_current_page<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
    accumulator: &mut Accumulator,
) -> Result<usize, CrawlError> {
    ctx.waiter
        .until(
            ctx.browser,
            &Condition::AnyPresent(table_locators()),
            ctx.config.timeouts.element,
        )
        .await?;
    let source = ctx.browser.page_source().await?;
    Ok(extract_rows(&source, accumulator))
}

pub fn extract_rows(html: &str, accumulator: &mut Accumulator) -> usize {
    let doc = Html::parse_document(html);
    let Some(table) = locate_table(&doc) else {
        warn!("no table found in page snapshot");
        return 0;
    };

    let headers = header_labels(table);
    let mapping = HeaderMapping::from_headers(headers.as_slice());
    let labelled = headers.iter().any(|header| is_role_label(header));
    debug!(?headers, ?mapping, "header mapping");

    let body = select_first(table, "tbody").unwrap_or(table);
    let Some(tr) = selector("tr") else {
        return 0;
    };

    let before = accumulator.len();
    for row in body.select(&tr) {
        let cells = row_cells(row);
        if is_header_repeat(&cells, &headers, labelled) {
            continue;
        }
        if cells.len() <= mapping.max_index() {
            continue;
        }

        let symbol = cell_text(cells[mapping.symbol]);
        if symbol.is_empty() || accumulator.contains(&symbol) {
            continue;
        }
        accumulator.insert(QuoteRow {
            symbol,
            name: cell_text(cells[mapping.name]),
            price: strip_thousands_separators(&cell_text(cells[mapping.price])),
        });
    }
    accumulator.len() - before
}

fn locate_table(doc: &Html) -> Option<HtmlElement<'_>> {
    table_locators()
        .iter()
        .filter_map(|locator| locator.css_selector())
        .filter_map(|css| selector(&css))
        .find_map(|sel| doc.select(&sel).next())
}

fn header_labels(table: HtmlElement<'_>) -> Vec<String> {
    let Some(cell) = selector("th, td") else {
        return Vec::new();
    };
    let labels = |scope: Option<HtmlElement<'_>>| -> Vec<String> {
        scope
            .map(|scope| {
                scope
                    .select(&cell)
                    .map(|el| cell_text(el).to_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    };

    let from_thead = labels(select_first(table, "thead"));
    if !from_thead.is_empty() {
        return from_thead;
    }
    labels(select_first(table, "tr"))
}

fn is_role_label(header: &str) -> bool {
    ROLE_LABELS.iter().any(|role| header.contains(role))
}

/// A row repeating the header: its first cell reads `symbol`, or, when the
/// header names at least one column role, every cell matches the header.
fn is_header_repeat(cells: &[HtmlElement<'_>], headers: &[String], labelled: bool) -> bool {
    let texts = cells
        .iter()
        .map(|cell| cell_text(*cell).to_lowercase())
        .collect::<Vec<_>>();
    if texts.first().is_some_and(|first| first == "symbol") {
        return true;
    }
    labelled && !texts.is_empty() && texts == headers
}

fn row_cells(row: HtmlElement<'_>) -> Vec<HtmlElement<'_>> {
    row.children()
        .filter_map(HtmlElement::wrap)
        .filter(|el| matches!(el.value().name(), "td" | "th"))
        .collect()
}

/// Cell text with every text node trimmed and concatenated.
fn cell_text(el: HtmlElement<'_>) -> String {
    el.text().map(str::trim).collect::<String>()
}

fn strip_thousands_separators(raw: &str) -> String {
    raw.replace(',', "")
}

fn select_first<'a>(scope: HtmlElement<'a>, css: &str) -> Option<HtmlElement<'a>> {
    let sel = selector(css)?;
    scope.select(&sel).next()
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}
