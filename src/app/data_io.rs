use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use super::errors::CrawlError;
use super::extract::QuoteRow;

pub const CRAWLER_NAME: &str = "yahoo_finance_crawler";

/// `<unix-ts>_<crawler>_<region>.csv`, spaces in the region replaced by underscores.
pub fn output_file_name(timestamp: i64, region: &str) -> String {
    let region = region.replace(' ', "_");
    format!("{timestamp}_{CRAWLER_NAME}_{region}.csv")
}

struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    fn new(output_path: &Path) -> Result<Self, CrawlError> {
        let file = File::create(output_path)?;
        let writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_writer(file);
        Ok(Self { writer })
    }

    fn write_row(&mut self, row: &QuoteRow) -> Result<(), CrawlError> {
        self.writer.serialize(row)?;
        Ok(())
    }

    fn finalize(mut self) -> Result<(), CrawlError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes `rows` to a fresh timestamped file under `output_dir`.
///
/// Returns `None` without touching the filesystem when there is nothing to write.
pub fn save_dataset(
    rows: &[QuoteRow],
    output_dir: &Path,
    region: &str,
) -> Result<Option<PathBuf>, CrawlError> {
    if rows.is_empty() {
        warn!(region, "no data collected, nothing saved");
        return Ok(None);
    }

    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(output_file_name(Utc::now().timestamp(), region));
    let mut sink = CsvSink::new(&path)?;
    for row in rows {
        sink.write_row(row)?;
    }
    sink.finalize()?;

    info!(rows = rows.len(), path = %path.display(), "dataset saved");
    Ok(Some(path))
}
