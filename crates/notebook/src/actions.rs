//! Actions: every change to a session is one of these.
//!
//! Actions that create cells carry the new cell's id, so reducing the same
//! action twice gives the same document. Use the constructors to mint ids.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::CellStatus;
use crate::ids::{CellId, ContentRef, KernelRef};
use crate::kernel::{Kernel, KernelInfo, KernelStatus, KernelspecInfo};
use crate::model::{CellType, Notebook, Output};

/// What a restart does with existing outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputHandling {
    /// Keep outputs as they are.
    #[default]
    None,
    /// Clear every output when the restart begins.
    ClearAll,
    /// Clear every output, then run all cells on the new kernel.
    RunAll,
}

impl std::fmt::Display for OutputHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputHandling::None => write!(f, "none"),
            OutputHandling::ClearAll => write!(f, "clear_all"),
            OutputHandling::RunAll => write!(f, "run_all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    // ── Cell insertion ──────────────────────────────────────────────
    CreateCellAfter {
        id: Option<CellId>,
        new_id: CellId,
        cell_type: CellType,
        source: String,
    },
    CreateCellBefore {
        id: Option<CellId>,
        new_id: CellId,
        cell_type: CellType,
        source: String,
    },
    CreateCellAppend {
        new_id: CellId,
        cell_type: CellType,
        source: String,
    },
    CreateCellIfEmpty {
        new_id: CellId,
        cell_type: CellType,
    },

    // ── Structure and clipboard ─────────────────────────────────────
    RemoveCell {
        id: Option<CellId>,
    },
    MoveCell {
        id: CellId,
        destination_id: CellId,
        above: bool,
    },
    MergeCellAfter {
        id: CellId,
    },
    CopyCell {
        id: Option<CellId>,
    },
    CutCell {
        id: Option<CellId>,
    },
    PasteCell {
        new_id: CellId,
    },

    // ── Focus ───────────────────────────────────────────────────────
    FocusCell {
        id: CellId,
    },
    FocusNextCell {
        id: Option<CellId>,
        create_cell_if_undefined: bool,
        new_id: CellId,
    },
    FocusPreviousCell {
        id: Option<CellId>,
    },
    FocusCellEditor {
        id: Option<CellId>,
    },
    FocusNextCellEditor {
        id: Option<CellId>,
        create_cell_if_undefined: bool,
        new_id: CellId,
    },
    FocusPreviousCellEditor {
        id: Option<CellId>,
    },
    ToggleStickyCell {
        id: CellId,
    },

    // ── Content and metadata ────────────────────────────────────────
    UpdateSource {
        id: CellId,
        source: String,
    },
    ChangeCellType {
        id: Option<CellId>,
        to: CellType,
    },
    ToggleOutputVisibility {
        id: Option<CellId>,
    },
    ToggleInputVisibility {
        id: Option<CellId>,
    },
    ToggleOutputExpansion {
        id: Option<CellId>,
    },
    UnhideAll {
        output_hidden: bool,
        input_hidden: bool,
    },
    ToggleTagInCell {
        id: CellId,
        tag: String,
    },
    OverwriteMetadataField {
        field: String,
        value: Value,
    },
    DeleteMetadataField {
        field: String,
    },
    SetLanguageInfo {
        kernel_ref: KernelRef,
        language_info: Value,
    },
    SetKernelspecInfo {
        kernel_ref: KernelRef,
        kernelspec: KernelspecInfo,
    },

    // ── Outputs ─────────────────────────────────────────────────────
    ClearOutputs {
        id: Option<CellId>,
    },
    ClearAllOutputs,
    AppendOutput {
        id: CellId,
        output: Output,
    },
    UpdateDisplay {
        display_id: String,
        output: Output,
    },
    UpdateCellStatus {
        id: CellId,
        status: CellStatus,
    },
    UpdateExecutionCount {
        id: CellId,
        count: Option<u32>,
    },
    UpdateCellPagers {
        id: CellId,
        pagers: Vec<Value>,
    },

    // ── Notebook ────────────────────────────────────────────────────
    SetNotebook {
        notebook: Notebook,
    },
    SaveFulfilled,

    // ── Execution ───────────────────────────────────────────────────
    ExecuteCell {
        id: CellId,
        source: String,
    },
    ExecuteAllCells,
    AbortExecution {
        id: CellId,
    },
    ErrorExecuting {
        id: Option<CellId>,
        error: String,
    },
    ErrorUpdateDisplay {
        error: String,
    },

    // ── Kernel lifecycle ────────────────────────────────────────────
    LaunchKernelByName {
        kernel_name: String,
        kernel_ref: KernelRef,
    },
    LaunchKernel {
        kernel_ref: KernelRef,
        kernel_name: String,
    },
    LaunchKernelSuccessful {
        kernel: Kernel,
        kernel_ref: KernelRef,
        content_ref: ContentRef,
    },
    LaunchKernelFailed {
        kernel_ref: KernelRef,
        error: String,
    },
    SetExecutionState {
        kernel_ref: KernelRef,
        state: KernelStatus,
    },
    SetKernelInfo {
        kernel_ref: KernelRef,
        info: KernelInfo,
    },
    KernelInfoFailed {
        kernel_ref: KernelRef,
        error: String,
    },
    RestartKernel {
        kernel_ref: KernelRef,
        output_handling: OutputHandling,
    },
    RestartKernelSuccessful {
        kernel_ref: KernelRef,
    },
    RestartKernelFailed {
        kernel_ref: KernelRef,
        error: String,
    },
    InterruptKernel {
        kernel_ref: KernelRef,
    },
    InterruptKernelFailed {
        kernel_ref: KernelRef,
        error: String,
    },
    ShutdownKernel {
        kernel_ref: KernelRef,
    },

    // ── Notifications ───────────────────────────────────────────────
    DismissNotification {
        key: String,
    },
}

impl Action {
    pub fn create_cell_after(id: Option<CellId>, cell_type: CellType, source: impl Into<String>) -> Action {
        Action::CreateCellAfter {
            id,
            new_id: CellId::new(),
            cell_type,
            source: source.into(),
        }
    }

    pub fn create_cell_before(id: Option<CellId>, cell_type: CellType, source: impl Into<String>) -> Action {
        Action::CreateCellBefore {
            id,
            new_id: CellId::new(),
            cell_type,
            source: source.into(),
        }
    }

    pub fn create_cell_append(cell_type: CellType, source: impl Into<String>) -> Action {
        Action::CreateCellAppend {
            new_id: CellId::new(),
            cell_type,
            source: source.into(),
        }
    }

    pub fn create_cell_if_empty(cell_type: CellType) -> Action {
        Action::CreateCellIfEmpty {
            new_id: CellId::new(),
            cell_type,
        }
    }

    pub fn paste_cell() -> Action {
        Action::PasteCell {
            new_id: CellId::new(),
        }
    }

    pub fn focus_next_cell(id: Option<CellId>, create_cell_if_undefined: bool) -> Action {
        Action::FocusNextCell {
            id,
            create_cell_if_undefined,
            new_id: CellId::new(),
        }
    }

    pub fn focus_next_cell_editor(id: Option<CellId>, create_cell_if_undefined: bool) -> Action {
        Action::FocusNextCellEditor {
            id,
            create_cell_if_undefined,
            new_id: CellId::new(),
        }
    }

    /// Launch `kernel_name` under a fresh kernel ref.
    pub fn launch_kernel_by_name(kernel_name: impl Into<String>) -> Action {
        Action::LaunchKernelByName {
            kernel_name: kernel_name.into(),
            kernel_ref: KernelRef::new(),
        }
    }

    /// SCREAMING_SNAKE name, used in logs and notification keys.
    pub fn action_type(&self) -> &'static str {
        match self {
            Action::CreateCellAfter { .. } => "CREATE_CELL_AFTER",
            Action::CreateCellBefore { .. } => "CREATE_CELL_BEFORE",
            Action::CreateCellAppend { .. } => "CREATE_CELL_APPEND",
            Action::CreateCellIfEmpty { .. } => "CREATE_CELL_IF_EMPTY",
            Action::RemoveCell { .. } => "REMOVE_CELL",
            Action::MoveCell { .. } => "MOVE_CELL",
            Action::MergeCellAfter { .. } => "MERGE_CELL_AFTER",
            Action::CopyCell { .. } => "COPY_CELL",
            Action::CutCell { .. } => "CUT_CELL",
            Action::PasteCell { .. } => "PASTE_CELL",
            Action::FocusCell { .. } => "FOCUS_CELL",
            Action::FocusNextCell { .. } => "FOCUS_NEXT_CELL",
            Action::FocusPreviousCell { .. } => "FOCUS_PREVIOUS_CELL",
            Action::FocusCellEditor { .. } => "FOCUS_CELL_EDITOR",
            Action::FocusNextCellEditor { .. } => "FOCUS_NEXT_CELL_EDITOR",
            Action::FocusPreviousCellEditor { .. } => "FOCUS_PREVIOUS_CELL_EDITOR",
            Action::ToggleStickyCell { .. } => "TOGGLE_STICKY_CELL",
            Action::UpdateSource { .. } => "UPDATE_SOURCE",
            Action::ChangeCellType { .. } => "CHANGE_CELL_TYPE",
            Action::ToggleOutputVisibility { .. } => "TOGGLE_OUTPUT_VISIBILITY",
            Action::ToggleInputVisibility { .. } => "TOGGLE_INPUT_VISIBILITY",
            Action::ToggleOutputExpansion { .. } => "TOGGLE_OUTPUT_EXPANSION",
            Action::UnhideAll { .. } => "UNHIDE_ALL",
            Action::ToggleTagInCell { .. } => "TOGGLE_TAG_IN_CELL",
            Action::OverwriteMetadataField { .. } => "OVERWRITE_METADATA_FIELD",
            Action::DeleteMetadataField { .. } => "DELETE_METADATA_FIELD",
            Action::SetLanguageInfo { .. } => "SET_LANGUAGE_INFO",
            Action::SetKernelspecInfo { .. } => "SET_KERNELSPEC_INFO",
            Action::ClearOutputs { .. } => "CLEAR_OUTPUTS",
            Action::ClearAllOutputs => "CLEAR_ALL_OUTPUTS",
            Action::AppendOutput { .. } => "APPEND_OUTPUT",
            Action::UpdateDisplay { .. } => "UPDATE_DISPLAY",
            Action::UpdateCellStatus { .. } => "UPDATE_CELL_STATUS",
            Action::UpdateExecutionCount { .. } => "UPDATE_EXECUTION_COUNT",
            Action::UpdateCellPagers { .. } => "UPDATE_CELL_PAGERS",
            Action::SetNotebook { .. } => "SET_NOTEBOOK",
            Action::SaveFulfilled => "SAVE_FULFILLED",
            Action::ExecuteCell { .. } => "EXECUTE_CELL",
            Action::ExecuteAllCells => "EXECUTE_ALL_CELLS",
            Action::AbortExecution { .. } => "ABORT_EXECUTION",
            Action::ErrorExecuting { .. } => "ERROR_EXECUTING",
            Action::ErrorUpdateDisplay { .. } => "ERROR_UPDATE_DISPLAY",
            Action::LaunchKernelByName { .. } => "LAUNCH_KERNEL_BY_NAME",
            Action::LaunchKernel { .. } => "LAUNCH_KERNEL",
            Action::LaunchKernelSuccessful { .. } => "LAUNCH_KERNEL_SUCCESSFUL",
            Action::LaunchKernelFailed { .. } => "LAUNCH_KERNEL_FAILED",
            Action::SetExecutionState { .. } => "SET_EXECUTION_STATE",
            Action::SetKernelInfo { .. } => "SET_KERNEL_INFO",
            Action::KernelInfoFailed { .. } => "KERNEL_INFO_FAILED",
            Action::RestartKernel { .. } => "RESTART_KERNEL",
            Action::RestartKernelSuccessful { .. } => "RESTART_KERNEL_SUCCESSFUL",
            Action::RestartKernelFailed { .. } => "RESTART_KERNEL_FAILED",
            Action::InterruptKernel { .. } => "INTERRUPT_KERNEL",
            Action::InterruptKernelFailed { .. } => "INTERRUPT_KERNEL_FAILED",
            Action::ShutdownKernel { .. } => "SHUTDOWN_KERNEL",
            Action::DismissNotification { .. } => "DISMISS_NOTIFICATION",
        }
    }

    /// The failure this action reports, if it is an error action.
    ///
    /// Returns the notification key and message. Keys combine the action
    /// type with the cell or kernel it concerns, so repeated failures of
    /// one cell replace each other instead of piling up.
    pub fn failure(&self) -> Option<(String, String)> {
        let (subject, error) = match self {
            Action::ErrorExecuting { id, error } => {
                (id.as_ref().map(CellId::to_string), error)
            }
            Action::ErrorUpdateDisplay { error } => (None, error),
            Action::LaunchKernelFailed { kernel_ref, error }
            | Action::KernelInfoFailed { kernel_ref, error }
            | Action::RestartKernelFailed { kernel_ref, error }
            | Action::InterruptKernelFailed { kernel_ref, error } => {
                (Some(kernel_ref.to_string()), error)
            }
            _ => return None,
        };
        let key = match subject {
            Some(subject) => format!("{}:{}", self.action_type(), subject),
            None => self.action_type().to_string(),
        };
        Some((key, error.clone()))
    }
}
