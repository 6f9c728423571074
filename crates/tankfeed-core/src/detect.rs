//! Format detection for raw source content.
//!
//! Resolution order is explicit override, then file extension, then content
//! sniffing. Sniffing looks at the leading token, delimiter consistency and
//! fixed-width column alignment before falling back to whitespace text.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Candidate delimiters in priority order.
pub const CANDIDATE_DELIMITERS: [char; 5] = [',', ';', '\t', '|', ':'];

/// Number of non-empty lines inspected when sniffing.
const SNIFF_LINES: usize = 5;

/// Supported content formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// Delimiter-separated values (CSV, TSV, pipe, ...)
    Delimited,
    /// JSON array or object
    Json,
    /// Tag-based XML
    Xml,
    /// Whitespace-aligned fixed-width columns
    FixedWidth,
    /// Generic whitespace-tokenized text
    Text,
}

impl Format {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Delimited => "delimited",
            Format::Json => "json",
            Format::Xml => "xml",
            Format::FixedWidth => "fixed_width",
            Format::Text => "text",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delimited" | "csv" | "tsv" | "psv" => Ok(Format::Delimited),
            "json" => Ok(Format::Json),
            "xml" => Ok(Format::Xml),
            "fixed_width" | "fixed-width" | "fixed" | "fwf" => Ok(Format::FixedWidth),
            "text" | "txt" => Ok(Format::Text),
            other => Err(Error::Validation(format!("unknown format '{}'", other))),
        }
    }
}

/// Resolve the format of `sample`.
///
/// `explicit` wins when set. Otherwise the extension of `path` is consulted,
/// and content sniffing decides when the extension is absent or ambiguous.
pub fn detect_format(explicit: Option<Format>, path: Option<&Path>, sample: &str) -> Result<Format> {
    if let Some(format) = explicit {
        return Ok(format);
    }

    if let Some(format) = path.and_then(format_from_extension) {
        return Ok(format);
    }

    sniff_content(sample)
}

/// Map a file extension to a format. Ambiguous extensions return `None`.
pub fn format_from_extension(path: &Path) -> Option<Format> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" | "psv" => Some(Format::Delimited),
        "json" => Some(Format::Json),
        "xml" => Some(Format::Xml),
        "fwf" | "prn" => Some(Format::FixedWidth),
        _ => None,
    }
}

/// Classify content by inspecting it.
pub fn sniff_content(sample: &str) -> Result<Format> {
    let trimmed = sample.trim_start_matches('\u{feff}').trim_start();
    let Some(first) = trimmed.chars().next() else {
        return Err(Error::FormatDetection("content is empty".into()));
    };

    match first {
        '{' | '[' => return Ok(Format::Json),
        '<' => return Ok(Format::Xml),
        _ => {}
    }

    let lines = sample_lines(trimmed, SNIFF_LINES);

    if consistent_delimiter(&lines).is_some() {
        return Ok(Format::Delimited);
    }

    if is_fixed_width(&lines) {
        return Ok(Format::FixedWidth);
    }

    Ok(Format::Text)
}

/// First `limit` non-empty lines of `content`, trailing whitespace removed.
pub(crate) fn sample_lines(content: &str, limit: usize) -> Vec<&str> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .take(limit)
        .collect()
}

/// First candidate delimiter whose count is positive and identical on every line.
pub(crate) fn consistent_delimiter(lines: &[&str]) -> Option<char> {
    let first = lines.first()?;
    CANDIDATE_DELIMITERS.into_iter().find(|&candidate| {
        let count = first.matches(candidate).count();
        count > 0 && lines.iter().all(|line| line.matches(candidate).count() == count)
    })
}

fn is_fixed_width(lines: &[&str]) -> bool {
    if lines.len() < 2 {
        return false;
    }

    let ranges = column_ranges(lines);
    if ranges.len() < 2 {
        return false;
    }

    // Padded records share one length; ragged ones must tokenize into
    // exactly the aligned columns.
    let first_len = lines[0].chars().count();
    let same_length = lines.iter().all(|line| line.chars().count() == first_len);
    let tokens_align = lines
        .iter()
        .all(|line| line.split_whitespace().count() == ranges.len());

    same_length || tokens_align
}

/// Character ranges `[start, end)` of columns separated by whitespace that
/// is aligned across every line. Positions past the end of a short line
/// count as whitespace.
pub(crate) fn column_ranges(lines: &[&str]) -> Vec<(usize, usize)> {
    let rows: Vec<Vec<char>> = lines.iter().map(|line| line.chars().collect()).collect();
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);

    let blank_at = |pos: usize| {
        rows.iter()
            .all(|row| row.get(pos).map_or(true, |c| c.is_whitespace()))
    };

    let mut ranges = Vec::new();
    let mut start: Option<usize> = None;
    for pos in 0..width {
        match (blank_at(pos), start) {
            (false, None) => start = Some(pos),
            (true, Some(s)) => {
                ranges.push((s, pos));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push((s, width));
    }
    ranges
}
