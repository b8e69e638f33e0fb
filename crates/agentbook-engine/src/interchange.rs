//! Notebook interchange (nbformat 4.5 JSON).
//!
//! The persisted form is the conventional notebook JSON shape: version
//! markers, a metadata object, and an ordered cell array where `source` may
//! be a string or an array of line fragments, and code-cell outputs use the
//! fixed record vocabulary (`stream`, `display_data`, `execute_result`,
//! `error`). The flat internal output model round-trips losslessly:
//!
//! - stdout/stderr ↔ `stream`
//! - html ↔ `display_data` `text/html`
//! - img ↔ `display_data` `image/*` — the data-URI prefix is stripped on
//!   write and re-derived from the declared mime type on read, payload
//!   bit-exact
//! - result ↔ `execute_result` `text/plain`
//! - error ↔ `error`, traceback joined into the item content internally and
//!   split back to lines on write
//!
//! Thinking cells are never part of this form: filtered on save and,
//! defensively, on load. `load(save(doc)) == filter_thinking(doc)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use agentbook_types::{
    Cell, CellId, CellMetadata, CellRole, CellType, NotebookMetadata, OutputItem, OutputKind,
};

use crate::notebook::Notebook;

const NBFORMAT: u32 = 4;
const NBFORMAT_MINOR: u32 = 5;

/// Interchange failures.
#[derive(Debug, thiserror::Error)]
pub enum InterchangeError {
    #[error("invalid notebook JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported nbformat version {0}")]
    UnsupportedVersion(u32),
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Serialize, Deserialize)]
struct WireNotebook {
    nbformat: u32,
    nbformat_minor: u32,
    metadata: NotebookMetadata,
    cells: Vec<WireCell>,
}

/// `source` and mime payloads may be a whole string or line fragments that
/// concatenate to it.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Fragments {
    Text(String),
    Lines(Vec<String>),
}

impl Fragments {
    fn join(self) -> String {
        match self {
            Fragments::Text(text) => text,
            Fragments::Lines(lines) => lines.concat(),
        }
    }
}

/// Split text into line fragments, each keeping its terminator.
fn split_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == '\n' {
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[derive(Serialize, Deserialize)]
struct WireCell {
    cell_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    source: Fragments,
    #[serde(default)]
    metadata: WireCellMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<WireOutput>,
}

#[derive(Default, Serialize, Deserialize)]
struct WireCellMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<CellRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<u64>,
    #[serde(flatten)]
    extra: CellMetadata,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
enum WireOutput {
    Stream {
        name: String,
        text: Fragments,
    },
    DisplayData {
        data: BTreeMap<String, Fragments>,
    },
    ExecuteResult {
        data: BTreeMap<String, Fragments>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_count: Option<u64>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

// =============================================================================
// Save
// =============================================================================

/// Serialize a notebook to interchange JSON. Uses the live-content snapshot,
/// so in-progress edits of visible cells are captured. Thinking cells are
/// filtered.
pub fn save(notebook: &Notebook) -> Result<String, InterchangeError> {
    let cells = notebook
        .current_cells_content()
        .into_iter()
        .filter(|cell| cell.cell_type.is_persistable())
        .map(cell_to_wire)
        .collect();
    let wire = WireNotebook {
        nbformat: NBFORMAT,
        nbformat_minor: NBFORMAT_MINOR,
        metadata: notebook.metadata.clone(),
        cells,
    };
    Ok(serde_json::to_string_pretty(&wire)?)
}

fn cell_to_wire(cell: Cell) -> WireCell {
    let is_code = cell.cell_type == CellType::Code;
    WireCell {
        cell_type: cell.cell_type.as_str().to_string(),
        id: Some(cell.id.to_string()),
        source: Fragments::Lines(split_lines(&cell.content)),
        metadata: WireCellMeta {
            role: Some(cell.role),
            created_at: Some(cell.created_at),
            extra: cell.metadata,
        },
        execution_count: if is_code { cell.execution_count } else { None },
        outputs: if is_code {
            cell.output
                .iter()
                .map(|item| output_to_wire(item, cell.execution_count))
                .collect()
        } else {
            Vec::new()
        },
    }
}

fn output_to_wire(item: &OutputItem, execution_count: Option<u64>) -> WireOutput {
    match item.kind {
        OutputKind::Stdout => WireOutput::Stream {
            name: "stdout".to_string(),
            text: Fragments::Text(item.content.clone()),
        },
        OutputKind::Stderr => WireOutput::Stream {
            name: "stderr".to_string(),
            text: Fragments::Text(item.content.clone()),
        },
        OutputKind::Html => WireOutput::DisplayData {
            data: BTreeMap::from([(
                "text/html".to_string(),
                Fragments::Text(item.content.clone()),
            )]),
        },
        OutputKind::Img => {
            let (mime, payload) = strip_data_uri(&item.content);
            WireOutput::DisplayData {
                data: BTreeMap::from([(mime, Fragments::Text(payload))]),
            }
        }
        OutputKind::Result => WireOutput::ExecuteResult {
            data: BTreeMap::from([(
                "text/plain".to_string(),
                Fragments::Text(item.content.clone()),
            )]),
            execution_count,
        },
        OutputKind::Error => {
            let (ename, evalue, traceback) = split_error(&item.content);
            WireOutput::Error {
                ename,
                evalue,
                traceback,
            }
        }
    }
}

/// `data:<mime>;base64,<payload>` → (mime, payload). Non-URI content falls
/// back to png with the content as payload.
fn strip_data_uri(content: &str) -> (String, String) {
    if let Some(rest) = content.strip_prefix("data:") {
        if let Some((mime, payload)) = rest.split_once(";base64,") {
            return (mime.to_string(), payload.to_string());
        }
    }
    ("image/png".to_string(), content.to_string())
}

/// First line is `ename: evalue`; remaining lines are the joined traceback.
fn split_error(content: &str) -> (String, String, Vec<String>) {
    let mut lines = content.lines();
    let head = lines.next().unwrap_or_default();
    let (ename, evalue) = match head.split_once(": ") {
        Some((ename, evalue)) => (ename.to_string(), evalue.to_string()),
        None => (head.to_string(), String::new()),
    };
    (ename, evalue, lines.map(str::to_string).collect())
}

// =============================================================================
// Load
// =============================================================================

/// Parse interchange JSON back into metadata and cells.
pub fn load(json: &str) -> Result<(NotebookMetadata, Vec<Cell>), InterchangeError> {
    let wire: WireNotebook = serde_json::from_str(json)?;
    if wire.nbformat != NBFORMAT {
        return Err(InterchangeError::UnsupportedVersion(wire.nbformat));
    }
    let cells = wire
        .cells
        .into_iter()
        .filter_map(cell_from_wire)
        .collect();
    Ok((wire.metadata, cells))
}

/// Parse interchange JSON and replace a notebook's contents in place.
pub fn load_into(notebook: &mut Notebook, json: &str) -> Result<(), InterchangeError> {
    let (metadata, cells) = load(json)?;
    notebook.metadata = metadata;
    notebook.restore_cells(cells);
    Ok(())
}

fn cell_from_wire(wire: WireCell) -> Option<Cell> {
    let cell_type = CellType::from_str(&wire.cell_type).unwrap_or(CellType::Markdown);
    if !cell_type.is_persistable() {
        warn!("thinking cell in interchange input, dropped");
        return None;
    }
    let id = wire
        .id
        .as_deref()
        .and_then(|raw| CellId::parse(raw).ok())
        .unwrap_or_default();
    let role = wire.metadata.role.unwrap_or_default();

    let mut cell = Cell::new(cell_type, wire.source.join(), role).with_id(id);
    cell.metadata = wire.metadata.extra;
    if let Some(created_at) = wire.metadata.created_at {
        cell.created_at = created_at;
    }
    if cell_type == CellType::Code {
        cell.execution_count = wire.execution_count;
        cell.output = wire.outputs.into_iter().filter_map(output_from_wire).collect();
    }
    Some(cell)
}

fn output_from_wire(wire: WireOutput) -> Option<OutputItem> {
    match wire {
        WireOutput::Stream { name, text } => {
            let text = text.join();
            match name.as_str() {
                "stderr" => Some(OutputItem::stderr(text)),
                _ => Some(OutputItem::stdout(text)),
            }
        }
        WireOutput::DisplayData { data } => mime_to_item(data, false),
        WireOutput::ExecuteResult { data, .. } => mime_to_item(data, true),
        WireOutput::Error {
            ename,
            evalue,
            traceback,
        } => {
            let mut content = format!("{ename}: {evalue}");
            for line in traceback {
                content.push('\n');
                content.push_str(&line);
            }
            Some(OutputItem::error(content))
        }
    }
}

fn mime_to_item(data: BTreeMap<String, Fragments>, is_result: bool) -> Option<OutputItem> {
    let mut data: BTreeMap<String, String> =
        data.into_iter().map(|(mime, v)| (mime, v.join())).collect();
    for mime in ["image/png", "image/jpeg"] {
        if let Some(payload) = data.remove(mime) {
            // Re-derive the data-URI prefix from the declared mime type.
            return Some(OutputItem::img(format!("data:{mime};base64,{payload}")));
        }
    }
    if let Some(markup) = data.remove("text/html") {
        return Some(OutputItem::html(markup));
    }
    if let Some(text) = data.remove("text/plain") {
        return Some(if is_result {
            OutputItem::result(text)
        } else {
            OutputItem::stdout(text)
        });
    }
    None
}
