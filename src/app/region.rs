use std::fmt;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::errors::{CrawlError, RecoverableFailure, StepResult};
use super::wait::{Condition, StepContext};
use super::webdriver::{Browser, Locator, xpath_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Idle,
    PopupDismissed,
    MenuOpen,
    SelectionsCleared,
    RegionTyped,
    RegionChecked,
    Applied,
    MenuClosed,
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RegionState::Idle => "idle",
            RegionState::PopupDismissed => "popup_dismissed",
            RegionState::MenuOpen => "menu_open",
            RegionState::SelectionsCleared => "selections_cleared",
            RegionState::RegionTyped => "region_typed",
            RegionState::RegionChecked => "region_checked",
            RegionState::Applied => "applied",
            RegionState::MenuClosed => "menu_closed",
        };
        f.write_str(label)
    }
}

pub fn explore_done_button() -> Locator {
    Locator::xpath(r#"//div[contains(text(), "Explore")]//following::button[contains(., "Done")]"#)
}

pub fn region_menu_button() -> Locator {
    Locator::xpath(r#"//button[contains(@class, "menuBtn") and contains(., "Region")]"#)
}

pub fn search_input() -> Locator {
    Locator::css(r#"input[placeholder="Search..."]"#)
}

pub fn selection_checkboxes() -> Locator {
    Locator::xpath(r#"//div[contains(@class,"menu-surface-dialog")]//input[@type="checkbox"]"#)
}

/// Checkbox nested in a label naming the region, or right after a span naming it.
pub fn region_checkbox(region: &str) -> Locator {
    let text = xpath_literal(region);
    Locator::xpath(format!(
        r#"//label[contains(., {text})]//input[@type="checkbox"] | //span[contains(., {text})]/following-sibling::input[@type="checkbox"]"#
    ))
}

pub fn apply_button() -> Locator {
    Locator::text_contains("button", "Apply")
}

/// Selects `region` as the only active region filter.
///
/// Missing menu trigger or region checkbox abort the crawl. The popup,
/// clearing and Apply steps are best-effort.
pub async fn apply_region_filter<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
    region: &str,
) -> Result<(), CrawlError> {
    info!(region, "attempting to select region");
    let mut state = RegionState::Idle;

    match dismiss_popup(ctx).await {
        Ok(()) => transition(&mut state, RegionState::PopupDismissed),
        Err(failure) => debug!(reason = %failure.reason, "no initial popup"),
    }

    open_region_menu(ctx).await?;
    transition(&mut state, RegionState::MenuOpen);

    match clear_selections(ctx).await {
        Ok(cleared) => {
            debug!(cleared, "previous selections cleared");
            transition(&mut state, RegionState::SelectionsCleared);
        }
        Err(failure) => warn!(reason = %failure.reason, "error while clearing selection"),
    }

    type_region(ctx, region).await?;
    transition(&mut state, RegionState::RegionTyped);

    check_region(ctx, region).await?;
    transition(&mut state, RegionState::RegionChecked);

    match click_apply(ctx).await {
        Ok(()) => transition(&mut state, RegionState::Applied),
        Err(failure) => warn!(reason = %failure.reason, "apply button not found"),
    }

    ctx.waiter
        .until(
            ctx.browser,
            &Condition::Invisible(search_input()),
            ctx.config.timeouts.element,
        )
        .await?;
    transition(&mut state, RegionState::MenuClosed);
    info!(region, "filter applied (menu closed)");
    Ok(())
}

fn transition(state: &mut RegionState, next: RegionState) {
    info!(from = %state, to = %next, "region filter");
    *state = next;
}

async fn dismiss_popup<B: Browser + ?Sized>(ctx: &StepContext<'_, B>) -> StepResult {
    let step = "dismiss popup";
    let done = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Clickable(explore_done_button()),
            ctx.config.timeouts.popup,
        )
        .await
        .map_err(|e| RecoverableFailure::new(step, e))?;
    ctx.browser
        .click(&done)
        .await
        .map_err(|e| RecoverableFailure::new(step, e))?;
    info!("initial popup closed");
    Ok(())
}

async fn open_region_menu<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
) -> Result<(), CrawlError> {
    info!("looking for region button");
    let button = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Clickable(region_menu_button()),
            ctx.config.timeouts.region_menu,
        )
        .await
        .map_err(|e| CrawlError::RegionMenuNotFound(e.to_string()))?;
    ctx.browser
        .click(&button)
        .await
        .map_err(|e| CrawlError::RegionMenuNotFound(e.to_string()))?;
    info!("region button clicked");
    Ok(())
}

/// Unchecks every checked box in the selection surface. Returns how many were toggled.
async fn clear_selections<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
) -> Result<usize, RecoverableFailure> {
    let fail = |e: CrawlError| RecoverableFailure::new("clear selections", e);
    info!("clearing previous selections");

    ctx.waiter
        .until(
            ctx.browser,
            &Condition::Visible(search_input()),
            ctx.config.timeouts.element,
        )
        .await
        .map_err(fail)?;

    let boxes = ctx
        .browser
        .find_elements(&selection_checkboxes())
        .await
        .map_err(fail)?;
    let mut cleared = 0;
    for checkbox in boxes {
        if !ctx.browser.is_selected(&checkbox).await.map_err(fail)? {
            continue;
        }
        ctx.browser.script_click(&checkbox).await.map_err(fail)?;
        info!(%checkbox, "previous checkbox unchecked");
        cleared += 1;
        sleep(ctx.config.toggle_pacing).await;
    }
    Ok(cleared)
}

async fn type_region<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
    region: &str,
) -> Result<(), CrawlError> {
    // Visibility was already awaited while clearing; look it up directly.
    let input = ctx.browser.find_element(&search_input()).await?;
    ctx.browser.clear(&input).await?;
    ctx.browser.send_keys(&input, region).await?;
    info!(region, "typed region in search box");
    Ok(())
}

async fn check_region<B: Browser + ?Sized>(
    ctx: &StepContext<'_, B>,
    region: &str,
) -> Result<(), CrawlError> {
    let not_selectable = |e: CrawlError| CrawlError::RegionNotSelectable {
        region: region.to_string(),
        reason: e.to_string(),
    };
    let checkbox = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Present(region_checkbox(region)),
            ctx.config.timeouts.element,
        )
        .await
        .map_err(not_selectable)?;
    ctx.browser
        .script_click(&checkbox)
        .await
        .map_err(not_selectable)?;
    info!(region, "region checkbox checked via script");
    Ok(())
}

async fn click_apply<B: Browser + ?Sized>(ctx: &StepContext<'_, B>) -> StepResult {
    let step = "apply";
    let apply = ctx
        .waiter
        .element(
            ctx.browser,
            &Condition::Clickable(apply_button()),
            ctx.config.timeouts.apply,
        )
        .await
        .map_err(|e| RecoverableFailure::new(step, e))?;
    ctx.browser
        .script_click(&apply)
        .await
        .map_err(|e| RecoverableFailure::new(step, e))?;
    info!("apply button clicked");
    Ok(())
}
