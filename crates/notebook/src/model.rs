//! Notebook model: ordered cells, their outputs, and notebook metadata.
//!
//! A [`Notebook`] is a value. Cells are held behind `Arc`, so producing a new
//! version after an edit clones only the cell that changed and shares the
//! rest with the previous version. Mutating accessors are crate-private;
//! outside this crate a notebook changes only by running actions through
//! the reducer.

use std::collections::HashMap;
use std::sync::Arc;

use jupyter_protocol::JupyterMessageContent;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::CellId;

pub type Metadata = Map<String, Value>;

// ── Cell types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Code => write!(f, "code"),
            CellType::Markdown => write!(f, "markdown"),
            CellType::Raw => write!(f, "raw"),
        }
    }
}

impl std::str::FromStr for CellType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(CellType::Code),
            "markdown" => Ok(CellType::Markdown),
            "raw" => Ok(CellType::Raw),
            other => Err(format!("unknown cell type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeCell {
    pub metadata: Metadata,
    pub source: String,
    pub execution_count: Option<u32>,
    pub outputs: Vec<Output>,
}

/// Markdown and raw cells share a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TextCell {
    pub metadata: Metadata,
    pub source: String,
    pub attachments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Code(CodeCell),
    Markdown(TextCell),
    Raw(TextCell),
}

/// Metadata flag toggled by the visibility actions.
pub const OUTPUT_HIDDEN: &str = "outputHidden";
pub const INPUT_HIDDEN: &str = "inputHidden";
pub const OUTPUT_EXPANDED: &str = "outputExpanded";

impl Cell {
    pub fn code(source: impl Into<String>) -> Cell {
        Cell::Code(CodeCell {
            metadata: Metadata::new(),
            source: source.into(),
            execution_count: None,
            outputs: Vec::new(),
        })
    }

    pub fn markdown(source: impl Into<String>) -> Cell {
        Cell::Markdown(TextCell::new(source))
    }

    pub fn raw(source: impl Into<String>) -> Cell {
        Cell::Raw(TextCell::new(source))
    }

    pub fn with_source(cell_type: CellType, source: impl Into<String>) -> Cell {
        match cell_type {
            CellType::Code => Cell::code(source),
            CellType::Markdown => Cell::markdown(source),
            CellType::Raw => Cell::raw(source),
        }
    }

    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::Code(_) => CellType::Code,
            Cell::Markdown(_) => CellType::Markdown,
            Cell::Raw(_) => CellType::Raw,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Cell::Code(c) => &c.source,
            Cell::Markdown(c) | Cell::Raw(c) => &c.source,
        }
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        match self {
            Cell::Code(c) => c.source = source.into(),
            Cell::Markdown(c) | Cell::Raw(c) => c.source = source.into(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Cell::Code(c) => &c.metadata,
            Cell::Markdown(c) | Cell::Raw(c) => &c.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Cell::Code(c) => &mut c.metadata,
            Cell::Markdown(c) | Cell::Raw(c) => &mut c.metadata,
        }
    }

    /// Outputs of a code cell; text cells have none.
    pub fn outputs(&self) -> &[Output] {
        match self {
            Cell::Code(c) => &c.outputs,
            Cell::Markdown(_) | Cell::Raw(_) => &[],
        }
    }

    pub fn execution_count(&self) -> Option<u32> {
        match self {
            Cell::Code(c) => c.execution_count,
            Cell::Markdown(_) | Cell::Raw(_) => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match self {
            Cell::Code(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeCell> {
        match self {
            Cell::Code(c) => Some(c),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        self.metadata()
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.metadata_mut()
            .insert(name.to_string(), Value::Bool(value));
    }

    pub fn toggle_flag(&mut self, name: &str) {
        let current = self.flag(name);
        self.set_flag(name, !current);
    }

    pub fn tags(&self) -> Vec<&str> {
        self.metadata()
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Tags behave as a set: add when missing, remove when present.
    pub fn toggle_tag(&mut self, tag: &str) {
        let metadata = self.metadata_mut();
        let tags = metadata
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !tags.is_array() {
            *tags = Value::Array(Vec::new());
        }
        if let Value::Array(list) = tags {
            let before = list.len();
            list.retain(|t| t.as_str() != Some(tag));
            if list.len() == before {
                list.push(Value::String(tag.to_string()));
            }
        }
    }

    /// Same source and metadata under another cell type.
    ///
    /// Becoming a code cell starts with no outputs and no execution count;
    /// leaving code drops them.
    pub fn converted_to(&self, cell_type: CellType) -> Cell {
        let metadata = self.metadata().clone();
        let source = self.source().to_string();
        let attachments = match self {
            Cell::Markdown(c) | Cell::Raw(c) => c.attachments.clone(),
            Cell::Code(_) => None,
        };
        match cell_type {
            CellType::Code => Cell::Code(CodeCell {
                metadata,
                source,
                execution_count: None,
                outputs: Vec::new(),
            }),
            CellType::Markdown => Cell::Markdown(TextCell {
                metadata,
                source,
                attachments,
            }),
            CellType::Raw => Cell::Raw(TextCell {
                metadata,
                source,
                attachments,
            }),
        }
    }
}

impl TextCell {
    pub fn new(source: impl Into<String>) -> TextCell {
        TextCell {
            metadata: Metadata::new(),
            source: source.into(),
            attachments: None,
        }
    }
}

// ── Outputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamName::Stdout => write!(f, "stdout"),
            StreamName::Stderr => write!(f, "stderr"),
        }
    }
}

/// Kernel-side bookkeeping attached to display outputs. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    ExecuteResult {
        #[serde(default)]
        execution_count: Option<u32>,
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default, skip_serializing)]
        transient: Option<Transient>,
    },
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default, skip_serializing)]
        transient: Option<Transient>,
    },
    Stream {
        name: StreamName,
        #[serde(deserialize_with = "multiline")]
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn stream(name: StreamName, text: impl Into<String>) -> Output {
        Output::Stream {
            name,
            text: text.into(),
        }
    }

    pub fn display_data(data: MimeBundle, display_id: Option<&str>) -> Output {
        Output::DisplayData {
            data,
            metadata: Metadata::new(),
            transient: display_id.map(|id| Transient {
                display_id: Some(id.to_string()),
            }),
        }
    }

    /// Parse nbformat-shaped output JSON (with `output_type`).
    pub fn from_json(value: Value) -> Result<Output, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The output an iopub message adds to a cell, if it is an output message.
    ///
    /// `update_display_data` reads as the `display_data` it replaces.
    pub fn from_content(content: &JupyterMessageContent) -> Option<Result<Output, serde_json::Error>> {
        let output_type = match content {
            JupyterMessageContent::StreamContent(_) => "stream",
            JupyterMessageContent::DisplayData(_)
            | JupyterMessageContent::UpdateDisplayData(_) => "display_data",
            JupyterMessageContent::ExecuteResult(_) => "execute_result",
            JupyterMessageContent::ErrorOutput(_) => "error",
            _ => return None,
        };
        let output = serde_json::to_value(content).and_then(|mut value| {
            if let Value::Object(fields) = &mut value {
                fields.insert("output_type".into(), Value::String(output_type.into()));
            }
            Output::from_json(value)
        });
        Some(output)
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            Output::ExecuteResult { .. } => "execute_result",
            Output::DisplayData { .. } => "display_data",
            Output::Stream { .. } => "stream",
            Output::Error { .. } => "error",
        }
    }

    pub fn display_id(&self) -> Option<&str> {
        match self {
            Output::ExecuteResult { transient, .. } | Output::DisplayData { transient, .. } => {
                transient.as_ref().and_then(|t| t.display_id.as_deref())
            }
            Output::Stream { .. } | Output::Error { .. } => None,
        }
    }

    /// The same payload as a `display_data` output.
    pub fn into_display_data(self) -> Output {
        match self {
            Output::ExecuteResult {
                data,
                metadata,
                transient,
                ..
            } => Output::DisplayData {
                data,
                metadata,
                transient,
            },
            other => other,
        }
    }
}

// ── Mime bundles ────────────────────────────────────────────────────

/// Mimetype → payload. Payloads are opaque to the core.
///
/// On disk, textual payloads may be split into line arrays; in memory they
/// are always joined. JSON mimetypes keep their JSON value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MimeBundle(Map<String, Value>);

/// `application/json` and `application/<anything>+json`.
pub fn is_json_mimetype(mimetype: &str) -> bool {
    match mimetype.strip_prefix("application/") {
        Some("json") => true,
        Some(rest) => rest.ends_with("+json"),
        None => false,
    }
}

impl MimeBundle {
    pub fn new() -> Self {
        MimeBundle(Map::new())
    }

    pub fn with(mut self, mimetype: &str, payload: impl Into<Value>) -> Self {
        self.0.insert(mimetype.to_string(), payload.into());
        self
    }

    pub fn get(&self, mimetype: &str) -> Option<&Value> {
        self.0.get(mimetype)
    }

    pub fn mimetypes(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for MimeBundle {
    fn from(map: Map<String, Value>) -> Self {
        let joined = map
            .into_iter()
            .map(|(mimetype, payload)| {
                let payload = if is_json_mimetype(&mimetype) {
                    payload
                } else {
                    join_lines(payload)
                };
                (mimetype, payload)
            })
            .collect();
        MimeBundle(joined)
    }
}

impl<'de> Deserialize<'de> for MimeBundle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(MimeBundle::from(map))
    }
}

/// An array made only of strings becomes one string; anything else is kept.
fn join_lines(value: Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => Value::String(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        other => other,
    }
}

/// Split text into lines that keep their trailing newline.
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split_inclusive('\n').map(|s| s.to_string()).collect()
}

/// nbformat's "string or list of lines" fields, read as one string.
fn multiline<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        One(String),
        Lines(Vec<String>),
    }

    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::One(text) => text,
        Multiline::Lines(lines) => lines.concat(),
    })
}

// ── Notebook ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    pub(crate) cell_order: Vec<CellId>,
    pub(crate) cell_map: HashMap<CellId, Arc<Cell>>,
    pub(crate) metadata: Metadata,
}

impl Default for Notebook {
    fn default() -> Self {
        Notebook::new()
    }
}

impl Notebook {
    pub fn new() -> Self {
        Notebook {
            cell_order: Vec::new(),
            cell_map: HashMap::new(),
            metadata: Metadata::new(),
        }
    }

    /// Build a notebook from cells in order. A repeated id keeps its first cell.
    pub fn from_cells(cells: impl IntoIterator<Item = (CellId, Cell)>) -> Self {
        let mut notebook = Notebook::new();
        for (id, cell) in cells {
            let index = notebook.cell_order.len();
            notebook.insert_cell_at(index, id, cell);
        }
        notebook
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn cell_order(&self) -> &[CellId] {
        &self.cell_order
    }

    pub fn cell(&self, id: &CellId) -> Option<&Cell> {
        self.cell_map.get(id).map(Arc::as_ref)
    }

    /// Cells in document order.
    pub fn cells(&self) -> impl Iterator<Item = (&CellId, &Cell)> {
        self.cell_order
            .iter()
            .filter_map(|id| self.cell_map.get(id).map(|cell| (id, cell.as_ref())))
    }

    pub fn len(&self) -> usize {
        self.cell_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_order.is_empty()
    }

    pub fn index_of(&self, id: &CellId) -> Option<usize> {
        self.cell_order.iter().position(|c| c == id)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// `metadata.kernelspec.name`, then `metadata.language_info.name`.
    pub fn kernelspec_name(&self) -> Option<&str> {
        self.metadata_name("kernelspec")
            .or_else(|| self.metadata_name("language_info"))
    }

    fn metadata_name(&self, section: &str) -> Option<&str> {
        self.metadata
            .get(section)
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Same order, same metadata, and each cell is the very same version.
    ///
    /// Cells are compared by pointer: an edit always replaces the edited
    /// cell's `Arc`, so this never reports unchanged content as changed.
    pub fn same_content(&self, other: &Notebook) -> bool {
        self.cell_order == other.cell_order
            && self.metadata == other.metadata
            && self.cell_order.iter().all(|id| {
                match (self.cell_map.get(id), other.cell_map.get(id)) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                }
            })
    }

    /// Order and map agree and the order has no duplicates.
    pub fn is_consistent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.cell_order.len() == self.cell_map.len()
            && self
                .cell_order
                .iter()
                .all(|id| seen.insert(id) && self.cell_map.contains_key(id))
    }

    // ── crate-private mutation ──────────────────────────────────────

    /// Insert at `index` (clamped to the end). Ignored if `id` is already present.
    pub(crate) fn insert_cell_at(&mut self, index: usize, id: CellId, cell: Cell) -> bool {
        if self.cell_map.contains_key(&id) {
            return false;
        }
        let index = index.min(self.cell_order.len());
        self.cell_order.insert(index, id.clone());
        self.cell_map.insert(id, Arc::new(cell));
        true
    }

    pub(crate) fn remove_cell(&mut self, id: &CellId) -> Option<Arc<Cell>> {
        let removed = self.cell_map.remove(id)?;
        self.cell_order.retain(|c| c != id);
        Some(removed)
    }

    /// Copy-on-write access to one cell.
    pub(crate) fn cell_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.cell_map.get_mut(id).map(Arc::make_mut)
    }

    pub(crate) fn code_cell_ids(&self) -> Vec<CellId> {
        self.cells()
            .filter(|(_, cell)| cell.cell_type() == CellType::Code)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
