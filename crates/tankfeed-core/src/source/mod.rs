//! Data sources: descriptors, the registry that watches them, and the
//! per-kind watcher tasks.

pub mod error_log;
pub mod event;
pub mod loader;
pub mod registry;
pub mod remote;
mod watcher;

pub use error_log::{ErrorEntry, ErrorLog};
pub use event::{BatchMetadata, SourceEvent};
pub use loader::{ContentLoader, StandardLoader};
pub use registry::{SourceLifecycle, SourceRegistry, SourceStatus};

use crate::detect::Format;
use crate::mapping::FieldMapping;
use crate::parser::ParseOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Smallest accepted polling interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

/// Kind of monitored location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A single local file
    File,
    /// A local directory of files
    Directory,
    /// An HTTP(S) endpoint
    Remote,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::Directory => "directory",
            SourceKind::Remote => "remote",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format setting of a source: detected per read, or fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FormatChoice {
    #[default]
    Auto,
    Fixed(Format),
}

impl FormatChoice {
    /// The explicit format, if any.
    pub fn explicit(&self) -> Option<Format> {
        match self {
            FormatChoice::Auto => None,
            FormatChoice::Fixed(format) => Some(*format),
        }
    }
}

impl TryFrom<String> for FormatChoice {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().eq_ignore_ascii_case("auto") || value.trim().is_empty() {
            Ok(FormatChoice::Auto)
        } else {
            value.parse().map(FormatChoice::Fixed)
        }
    }
}

impl From<FormatChoice> for String {
    fn from(choice: FormatChoice) -> Self {
        match choice {
            FormatChoice::Auto => "auto".to_string(),
            FormatChoice::Fixed(format) => format.as_str().to_string(),
        }
    }
}

impl fmt::Display for FormatChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatChoice::Auto => f.write_str("auto"),
            FormatChoice::Fixed(format) => format.fmt(f),
        }
    }
}

/// Supported text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Ok(Encoding::Latin1),
            other => Err(Error::Validation(format!("unsupported encoding '{}'", other))),
        }
    }
}

impl Encoding {
    /// Decode raw bytes. UTF-8 drops a leading byte-order mark and replaces
    /// invalid sequences.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => {
                let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
                String::from_utf8_lossy(bytes).into_owned()
            }
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Operator-supplied description of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    /// Unique source id
    pub id: String,

    /// Location kind
    pub kind: SourceKind,

    /// File path, directory path or URL
    pub location: String,

    /// Content format, `auto` to detect per read
    #[serde(default)]
    pub format: FormatChoice,

    /// Text encoding of the content
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Poll on an interval instead of watching for change events
    #[serde(default)]
    pub polling: bool,

    /// Poll interval in milliseconds
    #[serde(default)]
    pub poll_interval: Option<u64>,

    /// Canonical field to source column table
    #[serde(default)]
    pub mapping: FieldMapping,

    /// Parsing options
    #[serde(default)]
    pub options: ParseOptions,

    /// Disabled sources are registered but not watched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_enabled() -> bool {
    true
}

impl SourceDescriptor {
    /// Create a descriptor with default settings.
    pub fn new(id: impl Into<String>, kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            location: location.into(),
            format: FormatChoice::Auto,
            encoding: default_encoding(),
            polling: false,
            poll_interval: None,
            mapping: FieldMapping::default(),
            options: ParseOptions::default(),
            enabled: true,
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = FormatChoice::Fixed(format);
        self
    }

    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.polling = true;
        self.poll_interval = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parsed encoding. Call after [`validate`](Self::validate).
    pub fn text_encoding(&self) -> Encoding {
        self.encoding.parse().unwrap_or(Encoding::Utf8)
    }

    /// Interval between polls, falling back to `default_ms`.
    pub fn poll_period(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.poll_interval.unwrap_or(default_ms))
    }

    /// Check the descriptor before registration.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("source id is required".into()));
        }
        if self.location.trim().is_empty() {
            return Err(Error::Validation(format!(
                "source '{}': location is required",
                self.id
            )));
        }

        self.encoding
            .parse::<Encoding>()
            .map_err(|e| Error::Validation(format!("source '{}': {}", self.id, e)))?;

        if let Some(delimiter) = self.options.delimiter {
            if !delimiter.is_ascii() || delimiter == '"' || delimiter == '\n' {
                return Err(Error::Validation(format!(
                    "source '{}': invalid delimiter {:?}",
                    self.id, delimiter
                )));
            }
        }

        if let Some(interval) = self.poll_interval {
            if interval < MIN_POLL_INTERVAL_MS {
                return Err(Error::Validation(format!(
                    "source '{}': poll interval must be at least {}ms",
                    self.id, MIN_POLL_INTERVAL_MS
                )));
            }
        }

        if self.kind == SourceKind::Remote {
            remote::validate_destination(&self.location)?;
        }

        Ok(())
    }
}
