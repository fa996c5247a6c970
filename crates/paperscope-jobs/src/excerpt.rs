//! Text excerpts from stored PDFs via `pdftotext` (poppler-utils).
//!
//! Extraction is best effort: a missing binary, a non-PDF file or a timeout
//! all yield `None`, and enrichment falls back to the metadata prompt.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use paperscope_core::defaults;

#[derive(Debug, Clone)]
pub struct ExcerptExtractor {
    enabled: bool,
    max_pages: u32,
    max_chars: usize,
    timeout: Duration,
}

impl Default for ExcerptExtractor {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pages: defaults::EXCERPT_MAX_PAGES,
            max_chars: defaults::EXCERPT_MAX_CHARS,
            timeout: Duration::from_secs(defaults::EXCERPT_TIMEOUT_SECS),
        }
    }
}

impl ExcerptExtractor {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self {
            enabled,
            timeout,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// Extract the first pages of `path` as plain text.
    pub async fn extract(&self, path: &Path) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let mut command = Command::new("pdftotext");
        command
            .arg("-l")
            .arg(self.max_pages.to_string())
            .arg(path)
            .arg("-")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(path = %path.display(), error = %e, "pdftotext unavailable, skipping excerpt");
                return None;
            }
            Err(_) => {
                warn!(path = %path.display(), timeout_secs = self.timeout.as_secs(), "pdftotext timed out");
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(path = %path.display(), status = %output.status, stderr = %stderr.trim(), "pdftotext failed");
            return None;
        }

        let text = clean_excerpt(&String::from_utf8_lossy(&output.stdout), self.max_chars);
        (!text.is_empty()).then_some(text)
    }
}

/// Collapse runs of blank lines and cut to `max_chars` characters.
pub fn clean_excerpt(raw: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut blank_run = 0;
    for line in raw.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    let trimmed = out.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
