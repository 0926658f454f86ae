//! README summary extraction

use std::path::Path;
use tracing::debug;

/// Title and first paragraph of a README
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadmeSummary {
    pub title: Option<String>,
    pub description: String,
}

/// Read and summarize a README file. Any failure yields an empty summary.
pub fn read_summary(path: &Path) -> ReadmeSummary {
    match std::fs::read_to_string(path) {
        Ok(text) => summarize(&text),
        Err(e) => {
            debug!("Skipping unreadable README {:?}: {}", path, e);
            ReadmeSummary::default()
        }
    }
}

/// Take the first `# ` heading as the title and the paragraph that follows
/// it as the description.
pub fn summarize(text: &str) -> ReadmeSummary {
    let mut lines = text.lines();

    let title = loop {
        match lines.next() {
            Some(line) => {
                if let Some(rest) = line.trim_start().strip_prefix("# ") {
                    break rest.trim().to_string();
                }
            }
            None => return ReadmeSummary::default(),
        }
    };

    let mut paragraph: Vec<&str> = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if paragraph.is_empty() {
                continue;
            }
            break;
        }
        if trimmed.starts_with('#') {
            break;
        }
        paragraph.push(trimmed);
    }

    ReadmeSummary {
        title: (!title.is_empty()).then_some(title),
        description: paragraph.join(" "),
    }
}
