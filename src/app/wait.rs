//! Polling waits against the live page.
//!
//! Every UI step awaits its precondition through [`Waiter::until`] instead of
//! sleeping. Fixed sleeps are only used by callers for asynchronous data
//! fetches that expose no observable signal.

use std::fmt;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use super::errors::CrawlError;
use super::types::CrawlConfig;
use super::webdriver::{Browser, ElementRef, Locator};

/// A predicate over the live page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Present(Locator),
    /// Present under the first of several locators, tried in order.
    AnyPresent(Vec<Locator>),
    Visible(Locator),
    Clickable(Locator),
    Invisible(Locator),
    AttributeEquals {
        locator: Locator,
        name: String,
        value: String,
    },
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Present(locator) => write!(f, "presence of {locator}"),
            Condition::AnyPresent(locators) => {
                let names = locators
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" | ");
                write!(f, "presence of any of [{names}]")
            }
            Condition::Visible(locator) => write!(f, "visibility of {locator}"),
            Condition::Clickable(locator) => write!(f, "clickability of {locator}"),
            Condition::Invisible(locator) => write!(f, "invisibility of {locator}"),
            Condition::AttributeEquals {
                locator,
                name,
                value,
            } => write!(f, "{name}=\"{value}\" on {locator}"),
        }
    }
}

enum Check {
    Met(Option<ElementRef>),
    Unmet,
}

async fn check<B: Browser + ?Sized>(
    browser: &B,
    condition: &Condition,
) -> Result<Check, CrawlError> {
    match condition {
        Condition::Present(locator) => Ok(first(browser, locator).await?.map_or(Check::Unmet, |el| {
            Check::Met(Some(el))
        })),
        Condition::AnyPresent(locators) => {
            for locator in locators {
                if let Some(el) = first(browser, locator).await? {
                    return Ok(Check::Met(Some(el)));
                }
            }
            Ok(Check::Unmet)
        }
        Condition::Visible(locator) => {
            let Some(el) = first(browser, locator).await? else {
                return Ok(Check::Unmet);
            };
            if browser.is_displayed(&el).await? {
                Ok(Check::Met(Some(el)))
            } else {
                Ok(Check::Unmet)
            }
        }
        Condition::Clickable(locator) => {
            let Some(el) = first(browser, locator).await? else {
                return Ok(Check::Unmet);
            };
            if browser.is_displayed(&el).await? && browser.is_enabled(&el).await? {
                Ok(Check::Met(Some(el)))
            } else {
                Ok(Check::Unmet)
            }
        }
        Condition::Invisible(locator) => {
            let Some(el) = first(browser, locator).await? else {
                return Ok(Check::Met(None));
            };
            // A node detached between lookup and query counts as gone.
            match browser.is_displayed(&el).await {
                Ok(true) => Ok(Check::Unmet),
                Ok(false) | Err(_) => Ok(Check::Met(None)),
            }
        }
        Condition::AttributeEquals {
            locator,
            name,
            value,
        } => {
            let Some(el) = first(browser, locator).await? else {
                return Ok(Check::Unmet);
            };
            if browser.attribute(&el, name).await?.as_deref() == Some(value.as_str()) {
                Ok(Check::Met(Some(el)))
            } else {
                Ok(Check::Unmet)
            }
        }
    }
}

async fn first<B: Browser + ?Sized>(
    browser: &B,
    locator: &Locator,
) -> Result<Option<ElementRef>, CrawlError> {
    Ok(browser.find_elements(locator).await?.into_iter().next())
}

#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    poll_interval: Duration,
}

impl Waiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Polls `condition` until it holds or `timeout` elapses. Lookup errors
    /// while polling count as "not yet".
    pub async fn until<B: Browser + ?Sized>(
        &self,
        browser: &B,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, CrawlError> {
        let started = Instant::now();
        loop {
            match check(browser, condition).await {
                Ok(Check::Met(element)) => return Ok(element),
                Ok(Check::Unmet) => {}
                Err(err) => tracing::trace!(%condition, error = %err, "poll failed"),
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(CrawlError::ConditionTimeout {
                    condition: condition.to_string(),
                    elapsed,
                });
            }
            sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Like [`Waiter::until`], for conditions that resolve to an element.
    pub async fn element<B: Browser + ?Sized>(
        &self,
        browser: &B,
        condition: &Condition,
        timeout: Duration,
    ) -> Result<ElementRef, CrawlError> {
        self.until(browser, condition, timeout)
            .await?
            .ok_or_else(|| CrawlError::NoSuchElement(condition.to_string()))
    }
}

/// What every controller step needs: the browser, the waiter and the run's settings.
pub struct StepContext<'a, B: Browser + ?Sized> {
    pub browser: &'a B,
    pub waiter: Waiter,
    pub config: &'a CrawlConfig,
}

impl<'a, B: Browser + ?Sized> StepContext<'a, B> {
    pub fn new(browser: &'a B, config: &'a CrawlConfig) -> Self {
        Self {
            browser,
            waiter: Waiter::new(config.poll_interval),
            config,
        }
    }
}
