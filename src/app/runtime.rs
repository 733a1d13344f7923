use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use super::data_io::save_dataset;
use super::errors::CrawlError;
use super::extract::Accumulator;
use super::page_size::expand_page_size_or_default;
use super::paginate::scrape_all_pages;
use super::region::apply_region_filter;
use super::types::{Cli, CrawlConfig};
use super::wait::StepContext;
use super::webdriver::{Browser, WebDriverSession, ensure_webdriver, webdriver_capabilities};

/// State of one crawl run, advanced page by page.
#[derive(Debug)]
pub struct CrawlSession {
    pub region: String,
    pub page_index: usize,
    pub accumulator: Accumulator,
}

impl CrawlSession {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            page_index: 1,
            accumulator: Accumulator::default(),
        }
    }
}

/// Drives one browser session from the listing page to the saved dataset.
pub struct Crawler<B: Browser> {
    browser: B,
    config: CrawlConfig,
}

impl<B: Browser> Crawler<B> {
    pub fn new(browser: B, config: CrawlConfig) -> Self {
        Self { browser, config }
    }

    /// Runs the crawl and closes the browser on every exit path.
    pub async fn run(&self) -> Result<Option<PathBuf>, CrawlError> {
        let result = self.crawl().await;
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser session");
        }
        if let Err(err) = &result {
            error!(region = %self.config.region, error = %err, "crawl failed");
        }
        result
    }

    async fn crawl(&self) -> Result<Option<PathBuf>, CrawlError> {
        let config = &self.config;
        let ctx = StepContext::new(&self.browser, config);

        info!(url = %config.base_url, "accessing listing page");
        self.browser.navigate(config.base_url.as_str()).await?;

        apply_region_filter(&ctx, &config.region).await?;
        expand_page_size_or_default(&ctx).await;

        let mut session = CrawlSession::new(&config.region);
        scrape_all_pages(&ctx, &mut session).await?;
        info!(
            region = %session.region,
            pages = session.page_index,
            total = session.accumulator.len(),
            "crawl finished"
        );

        save_dataset(
            session.accumulator.rows(),
            &config.output_dir,
            &session.region,
        )
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run_crawler(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "crawler exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_crawler(cli: Cli) -> Result<Option<PathBuf>, CrawlError> {
    let config = CrawlConfig::try_from(cli)?;
    info!(region = %config.region, headless = config.headless, "starting crawler");

    // Held until the crawl returns; dropping it stops an autostarted driver.
    let (endpoint, _driver) = ensure_webdriver(&config).await?;
    let capabilities = webdriver_capabilities(config.browser, config.headless, &config.user_agent);
    let session = WebDriverSession::create(&endpoint, &capabilities).await?;
    Crawler::new(session, config).run().await
}
