//! Notebook-level metadata.
//!
//! Title, timestamps, kernel descriptor, file/project location, and an opaque
//! settings bag (environment variables, mounted resources, installed service
//! references) consumed only by collaborators — the engine never interprets
//! `settings`, it just round-trips it.

use serde::{Deserialize, Serialize};

/// Kernel/language descriptor for the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Kernel name (e.g., "python3").
    pub name: String,
    /// Language name (e.g., "python").
    pub language: String,
}

impl Default for KernelSpec {
    fn default() -> Self {
        Self {
            name: "python3".to_string(),
            language: "python".to_string(),
        }
    }
}

/// Document-level metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    /// Human-readable title.
    pub title: String,
    /// When the document was created (Unix millis).
    pub created: u64,
    /// When the document was last modified (Unix millis).
    pub modified: u64,
    /// Kernel/language descriptor.
    #[serde(default)]
    pub kernel_spec: KernelSpec,
    /// File location, if the document has been saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Project location, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Arbitrary per-document settings (env vars, mounts, service refs).
    /// Opaque to the engine.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

impl NotebookMetadata {
    /// Create metadata for a new untitled document.
    pub fn new(title: impl Into<String>) -> Self {
        let now = crate::now_millis();
        Self {
            title: title.into(),
            created: now,
            modified: now,
            kernel_spec: KernelSpec::default(),
            file_path: None,
            project_id: None,
            settings: serde_json::Value::Null,
        }
    }

    /// Update the modified timestamp.
    pub fn touch(&mut self) {
        self.modified = crate::now_millis();
    }
}

impl Default for NotebookMetadata {
    fn default() -> Self {
        Self::new("Untitled")
    }
}
