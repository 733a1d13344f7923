use tokio::time::sleep;
use tracing::{info, warn};

use super::errors::{CrawlError, RecoverableFailure, StepResult};
use super::wait::{Condition, StepContext};
use super::webdriver::{Browser, Locator};

/// The rows-per-page button, found next to its label or by the page size it shows.
pub fn rows_per_page_trigger(shown_size: u32) -> Locator {
    Locator::xpath(format!(
        r#"//span[contains(text(), "Rows per page")]/following::button[1] | //button[@title="{shown_size}"]"#
    ))
}

pub fn page_size_option(size: u32) -> Locator {
    Locator::css(format!(r#"div[role="option"][data-value="{size}"]"#))
}

/// Switches the table to `config.page_size` rows per page.
///
/// Any failure leaves the table at its default size; the caller logs and moves on.
pub async fn expand_page_size<B: Browser + ?Sized>(ctx: &StepContext<'_, B>) -> StepResult {
    let config = ctx.config;
    let size = config.page_size;
    let fail = |e: CrawlError| RecoverableFailure::new("page size", e);
    info!(size, "changing rows per page");

    let dropdown = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Clickable(rows_per_page_trigger(config.default_page_size)),
            config.timeouts.element,
        )
        .await
        .map_err(fail)?;
    ctx.browser.script_click(&dropdown).await.map_err(fail)?;
    info!("rows dropdown clicked");

    let option = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Clickable(page_size_option(size)),
            config.timeouts.option,
        )
        .await
        .map_err(fail)?;
    ctx.browser.script_click(&option).await.map_err(fail)?;
    info!(size, "page size option selected via script");

    // Looked up again: the old locator no longer matches once the title changes.
    ctx.waiter
        .until(
            ctx.browser,
            &Condition::AttributeEquals {
                locator: rows_per_page_trigger(size),
                name: "title".to_string(),
                value: size.to_string(),
            },
            config.timeouts.element,
        )
        .await
        .map_err(fail)?;
    info!(size, "table switched page size");

    // The title flips before the new rows arrive.
    sleep(config.page_size_settle).await;
    Ok(())
}

/// Runs [`expand_page_size`], logging a failure instead of returning it.
pub async fn expand_page_size_or_default<B: Browser + ?Sized>(ctx: &StepContext<'_, B>) -> bool {
    match expand_page_size(ctx).await {
        Ok(()) => true,
        Err(failure) => {
            warn!(
                step = failure.step,
                reason = %failure.reason,
                "could not change rows per page, sticking to default"
            );
            false
        }
    }
}
