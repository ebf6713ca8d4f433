//! Transfer progress display for replayed GET and PUT operations.

use indicatif::{ProgressBar, ProgressStyle};

/// Transfer progress tracker
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Progress bar for an object of `total_bytes`, spinner when unknown
    #[must_use]
    pub fn new(total_bytes: Option<u64>, label: &str) -> Self {
        let bar = match total_bytes {
            Some(total) => {
                let bar = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("{msg}\n[{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes}")
                {
                    bar.set_style(style.progress_chars("#>-"));
                }
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Add bytes moved by one packet
    pub fn advance(&self, bytes: usize) {
        self.bar.inc(bytes as u64);
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}
