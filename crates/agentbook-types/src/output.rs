//! Normalized execution output items.
//!
//! Every piece of output produced while running a code cell — a chunk of
//! stdout, a rendered image, an interpreter error — is flattened into one
//! `OutputItem`. The interchange boundary (engine `interchange` module) maps
//! these to and from the mime-keyed notebook output records losslessly.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// What kind of output an item carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum OutputKind {
    /// Text written to standard output.
    #[default]
    Stdout,
    /// Text written to standard error.
    Stderr,
    /// Plain-text expression result (execute_result text/plain).
    Result,
    /// Image bitmap, stored as a data-URI string.
    Img,
    /// Markup payload (display_data text/html).
    Html,
    /// Interpreter error summary.
    Error,
}

impl OutputKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::Result => "result",
            OutputKind::Img => "img",
            OutputKind::Html => "html",
            OutputKind::Error => "error",
        }
    }

    /// Check if this kind is textual stream output.
    pub fn is_stream(&self) -> bool {
        matches!(self, OutputKind::Stdout | OutputKind::Stderr)
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized piece of execution output.
///
/// Items are appended in source-event order and never reordered or coalesced,
/// so intermediate renders are a strict prefix of the final render.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    /// What kind of payload this is.
    #[serde(rename = "type")]
    pub kind: OutputKind,
    /// The payload: text, safe HTML, or a data-URI for images.
    pub content: String,
    /// Optional truncated form for collapsed display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_content: Option<String>,
}

impl OutputItem {
    /// Create an item of the given kind.
    pub fn new(kind: OutputKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            short_content: None,
        }
    }

    /// Stdout text.
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Stdout, content)
    }

    /// Stderr text.
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Stderr, content)
    }

    /// Plain-text expression result.
    pub fn result(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Result, content)
    }

    /// Image payload (data-URI).
    pub fn img(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Img, content)
    }

    /// HTML payload.
    pub fn html(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Html, content)
    }

    /// Error summary.
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, content)
    }

    /// Attach a truncated form for collapsed display.
    pub fn with_short(mut self, short: impl Into<String>) -> Self {
        self.short_content = Some(short.into());
        self
    }

    /// Check if this is an error item.
    pub fn is_error(&self) -> bool {
        self.kind == OutputKind::Error
    }
}
