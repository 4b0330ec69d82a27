//! Batch input files: one `Title | Author` per line.

use crate::errors::{ClipflowError, Result};
use crate::registry::WorkItem;
use std::path::Path;

/// Parses batch input text.
///
/// Blank lines and lines starting with `#` are ignored. The author part is
/// optional.
pub fn parse_batch(text: &str) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (title, author) = match line.split_once('|') {
            Some((title, author)) => (title.trim(), Some(author.trim())),
            None => (line, None),
        };
        if title.is_empty() {
            return Err(ClipflowError::BatchInput {
                line: index + 1,
                message: "missing title".into(),
            });
        }
        if author.is_some_and(|a| a.contains('|')) {
            return Err(ClipflowError::BatchInput {
                line: index + 1,
                message: "expected 'Title | Author'".into(),
            });
        }
        items.push(WorkItem::new(title, author));
    }
    Ok(items)
}

/// Reads and parses a batch input file.
pub fn read_batch_file(path: &Path) -> Result<Vec<WorkItem>> {
    let text = std::fs::read_to_string(path)?;
    parse_batch(&text)
}
