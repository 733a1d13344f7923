use tokio::time::sleep;
use tracing::{error, info, warn};

use super::errors::{CrawlError, RecoverableFailure};
use super::extract::extract_current_page;
use super::runtime::CrawlSession;
use super::wait::StepContext;
use super::webdriver::{Browser, Locator};

pub fn next_page_button() -> Locator {
    Locator::TestId("next-page-button".into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTurn {
    Advanced,
    /// No next-page control on the page.
    NoControl,
    /// The control is there but disabled.
    Disabled,
}

/// Clicks "next page" if there is one, then waits for the new rows to load.
pub async fn turn_page<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
) -> Result<PageTurn, RecoverableFailure> {
    let fail = |e: CrawlError| RecoverableFailure::new("pagination", e);

    let found = ctx
        .browser
        .find_elements(&next_page_button())
        .await
        .map_err(fail)?;
    let Some(next) = found.into_iter().next() else {
        return Ok(PageTurn::NoControl);
    };
    if !ctx.browser.is_enabled(&next).await.map_err(fail)?
        || ctx
            .browser
            .attribute(&next, "disabled")
            .await
            .map_err(fail)?
            .is_some()
    {
        return Ok(PageTurn::Disabled);
    }

    ctx.browser.script_click(&next).await.map_err(fail)?;
    sleep(ctx.config.pagination_settle).await;
    Ok(PageTurn::Advanced)
}

/// Extracts every page of the table into the session's accumulator.
///
/// Only a failure on the first page is returned. Later failures end the
/// loop and keep what was gathered.
pub async fn scrape_all_pages<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
    session: &mut CrawlSession,
) -> Result<(), CrawlError> {
    loop {
        info!(page = session.page_index, "scraping page");
        match extract_current_page(ctx, &mut session.accumulator).await {
            Ok(added) => info!(
                page = session.page_index,
                added,
                total = session.accumulator.len(),
                "page extracted"
            ),
            Err(err) if session.page_index == 1 => return Err(err),
            Err(err) => {
                error!(page = session.page_index, error = %err, "pagination stopped");
                return Ok(());
            }
        }

        match turn_page(ctx).await {
            Ok(PageTurn::Advanced) => {
                session.page_index += 1;
                info!(page = session.page_index, "next button clicked");
            }
            Ok(PageTurn::NoControl) => {
                info!("no more pages, next button not found");
                return Ok(());
            }
            Ok(PageTurn::Disabled) => {
                info!("next button is disabled, end of pages");
                return Ok(());
            }
            Err(failure) => {
                warn!(page = session.page_index, reason = %failure.reason, "pagination stopped");
                return Ok(());
            }
        }
    }
}
