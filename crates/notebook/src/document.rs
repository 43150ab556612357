//! Document: a notebook plus the editing session state around it.
//!
//! Transient bookkeeping (cell status, display slots, pagers) belongs to
//! the session and is never written to disk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::display::DisplayRegistry;
use crate::ids::CellId;
use crate::model::{Cell, Notebook};

/// Per-cell execution status shown next to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Queued,
    Busy,
    Idle,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Queued => write!(f, "queued"),
            CellStatus::Busy => write!(f, "busy"),
            CellStatus::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransientState {
    pub(crate) cell_status: HashMap<CellId, CellStatus>,
    pub(crate) displays: DisplayRegistry,
    pub(crate) cell_pagers: HashMap<CellId, Vec<Value>>,
}

/// Single-slot clipboard.
#[derive(Debug, Clone, PartialEq)]
pub struct Copied {
    pub id: CellId,
    pub cell: Arc<Cell>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub(crate) notebook: Notebook,
    pub(crate) transient: TransientState,
    pub(crate) cell_focused: Option<CellId>,
    pub(crate) editor_focused: Option<CellId>,
    pub(crate) sticky_cells: HashSet<CellId>,
    pub(crate) copied: Option<Copied>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly loaded notebook: first cell focused, no transient state.
    pub fn from_notebook(notebook: Notebook) -> Self {
        let cell_focused = notebook.cell_order().first().cloned();
        Document {
            notebook,
            cell_focused,
            ..Document::default()
        }
    }

    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    pub fn cell_focused(&self) -> Option<&CellId> {
        self.cell_focused.as_ref()
    }

    pub fn editor_focused(&self) -> Option<&CellId> {
        self.editor_focused.as_ref()
    }

    pub fn is_sticky(&self, id: &CellId) -> bool {
        self.sticky_cells.contains(id)
    }

    pub fn sticky_cells(&self) -> &HashSet<CellId> {
        &self.sticky_cells
    }

    pub fn copied(&self) -> Option<&Copied> {
        self.copied.as_ref()
    }

    pub fn cell_status(&self, id: &CellId) -> Option<CellStatus> {
        self.transient.cell_status.get(id).copied()
    }

    pub fn cell_pagers(&self, id: &CellId) -> &[Value] {
        self.transient
            .cell_pagers
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn displays(&self) -> &DisplayRegistry {
        &self.transient.displays
    }

    /// Purge everything the session tracks for one cell.
    pub(crate) fn clean_cell_transient(&mut self, id: &CellId) {
        self.transient.cell_pagers.remove(id);
        self.transient.cell_status.remove(id);
        self.transient.displays.forget_cell(id);
    }

    pub(crate) fn reset_transient(&mut self) {
        self.transient = TransientState::default();
    }
}
