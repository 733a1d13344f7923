use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use url::Url;

use super::errors::CrawlError;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "quote-crawler",
    version,
    about = "Filters a paginated quote screener by region and exports every row to CSV"
)]
pub struct Cli {
    /// Region to filter (e.g. "United States", "Argentina")
    #[arg(long, env = "REGION", default_value = "Brazil")]
    pub region: String,

    /// Listing page holding the quote table
    #[arg(long, env = "BASE_URL", value_name = "URL")]
    pub base_url: String,

    #[arg(long, env = "HEADLESS", default_value_t = true, action = ArgAction::Set)]
    pub headless: bool,

    #[arg(long, env = "OUTPUT_DIR", value_name = "DIR", default_value = "cdn")]
    pub output_dir: PathBuf,

    #[arg(
        long,
        env = "WEBDRIVER_URL",
        value_name = "URL",
        default_value = "http://localhost:9515"
    )]
    pub webdriver_url: String,

    #[arg(long, value_enum, default_value_t = BrowserArg::Chrome)]
    pub webdriver_browser: BrowserArg,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,

    #[arg(long, value_name = "UA", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Rows per page to switch the table to
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub page_size: u32,

    /// Rows per page the table shows before it is changed
    #[arg(long, value_name = "N", default_value_t = 25)]
    pub default_page_size: u32,

    /// Settling delay after a page size change or a page turn
    #[arg(long, value_name = "MS", default_value_t = 3000)]
    pub settle_ms: u64,

    #[arg(long, value_name = "MS", default_value_t = 250)]
    pub poll_ms: u64,
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum BrowserArg {
    Chrome,
    Firefox,
}

/// Deadlines for each awaited UI condition.
#[derive(Debug, Clone)]
pub struct StepTimeouts {
    pub popup: Duration,
    pub region_menu: Duration,
    pub element: Duration,
    pub apply: Duration,
    pub option: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            popup: Duration::from_secs(5),
            region_menu: Duration::from_secs(15),
            element: Duration::from_secs(10),
            apply: Duration::from_secs(5),
            option: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub base_url: Url,
    pub region: String,
    pub headless: bool,
    pub output_dir: PathBuf,
    pub browser: BrowserArg,
    pub webdriver_url: String,
    pub webdriver_binary: Option<String>,
    pub webdriver_autostart: bool,
    pub webdriver_start_timeout: Duration,
    pub user_agent: String,
    pub page_size: u32,
    pub default_page_size: u32,
    pub page_size_settle: Duration,
    pub pagination_settle: Duration,
    pub toggle_pacing: Duration,
    pub poll_interval: Duration,
    pub timeouts: StepTimeouts,
}

impl CrawlConfig {
    pub fn new(base_url: &str, region: &str) -> Result<Self, CrawlError> {
        let base_url =
            Url::parse(base_url).map_err(|e| CrawlError::Config(format!("invalid base url: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(CrawlError::Config(format!(
                "base url must be http or https, got {}",
                base_url.scheme()
            )));
        }
        if region.trim().is_empty() {
            return Err(CrawlError::Config("region must not be empty".to_string()));
        }

        Ok(Self {
            base_url,
            region: region.to_string(),
            headless: true,
            output_dir: PathBuf::from("cdn"),
            browser: BrowserArg::Chrome,
            webdriver_url: "http://localhost:9515".to_string(),
            webdriver_binary: None,
            webdriver_autostart: true,
            webdriver_start_timeout: Duration::from_secs(12),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            page_size: 100,
            default_page_size: 25,
            page_size_settle: Duration::from_secs(3),
            pagination_settle: Duration::from_secs(3),
            toggle_pacing: Duration::from_millis(500),
            poll_interval: Duration::from_millis(250),
            timeouts: StepTimeouts::default(),
        })
    }
}

impl TryFrom<Cli> for CrawlConfig {
    type Error = CrawlError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut config = CrawlConfig::new(&cli.base_url, &cli.region)?;
        if cli.page_size == 0 {
            return Err(CrawlError::Config("page size must be positive".to_string()));
        }
        let settle = Duration::from_millis(cli.settle_ms);
        config.headless = cli.headless;
        config.output_dir = cli.output_dir;
        config.browser = cli.webdriver_browser;
        config.webdriver_url = cli.webdriver_url;
        config.webdriver_binary = cli.webdriver_binary;
        config.webdriver_autostart = !cli.no_webdriver_autostart;
        config.webdriver_start_timeout = Duration::from_millis(cli.webdriver_start_timeout_ms);
        config.user_agent = cli.user_agent;
        config.page_size = cli.page_size;
        config.default_page_size = cli.default_page_size;
        config.page_size_settle = settle;
        config.pagination_settle = settle;
        config.poll_interval = Duration::from_millis(cli.poll_ms.max(1));
        Ok(config)
    }
}
