use std::io::{Read, Write};

use indicatif::{ProgressBar, ProgressStyle};

use crate::WeightError;

const CHUNK_SIZE: usize = 64 * 1024;

/// Transport used by the [weight cache](crate::weights::WeightCache) to retrieve remote blobs.
pub trait Fetch: Send + Sync {
    /// Stream the content located at `url` into `sink`, returning the number of bytes written.
    fn fetch(&self, url: &str, name: &str, sink: &mut dyn Write) -> Result<u64, WeightError>;
}

/// Blocking HTTP transport.
///
/// Download progress is reported with a [progress bar](indicatif) drawn on stderr, so that
/// stdout stays reserved for results.
#[derive(new, Debug, Clone)]
pub struct HttpFetcher {
    /// Show the progress bar.
    verbose: bool,
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, name: &str, sink: &mut dyn Write) -> Result<u64, WeightError> {
        let mut response = reqwest::blocking::get(url).map_err(|source| WeightError::Download {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeightError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let progress = self.progress_bar(response.content_length(), name);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written = 0;

        loop {
            let count = response.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            sink.write_all(&buffer[..count])?;
            written += count as u64;
            progress.inc(count as u64);
        }

        progress.finish_and_clear();

        Ok(written)
    }
}

impl HttpFetcher {
    fn progress_bar(&self, total: Option<u64>, name: &str) -> ProgressBar {
        if !self.verbose {
            return ProgressBar::hidden();
        }

        let (progress, template) = match total {
            Some(total) => (
                ProgressBar::new(total),
                "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
            ),
            None => (
                ProgressBar::new_spinner(),
                "{msg} [{elapsed_precise}] {spinner} {bytes}",
            ),
        };

        if let Ok(style) = ProgressStyle::with_template(template) {
            progress.set_style(style.progress_chars("=>-"));
        }
        progress.set_message(format!("Downloading {name}"));

        progress
    }
}
