//! Progress bar utilities
//!
//! Bars are hidden when `visible` is false, which is how tests and `--no-progress` runs keep
//! stderr clean.

use indicatif::{ProgressBar, ProgressStyle};

const BYTES_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";
const ITEMS_TEMPLATE: &str =
    "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})";

fn styled(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Byte-count bar for a single download
pub fn create_download_progress(size: u64, message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(size);
    pb.set_style(styled(BYTES_TEMPLATE));
    pb.set_message(message.to_string());
    pb
}

/// Item-count bar (catalog files, conversion chunks)
pub fn create_progress_bar(total: u64, message: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(styled(ITEMS_TEMPLATE));
    pb.set_message(message.to_string());
    pb
}

/// Keep the tail of a long path readable inside a bar message
pub fn short_label(label: &str, max_chars: usize) -> String {
    let count = label.chars().count();
    if count <= max_chars {
        return label.to_string();
    }
    let tail: String = label.chars().skip(count - max_chars).collect();
    format!("…{tail}")
}
