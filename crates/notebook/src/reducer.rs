//! The document reducer.
//!
//! `reduce` is pure: it takes a document and an action and returns the next
//! document. Untouched cells are shared with the previous version.
//! Actions that name a cell the document does not have change nothing.

use std::sync::Arc;

use log::debug;
use serde_json::json;

use crate::actions::{Action, OutputHandling};
use crate::display::KeyPath;
use crate::document::{CellStatus, Copied, Document};
use crate::ids::CellId;
use crate::model::{Cell, CellType, Output, INPUT_HIDDEN, OUTPUT_EXPANDED, OUTPUT_HIDDEN};
use crate::outputs::reduce_outputs;

pub fn reduce(document: &Document, action: &Action) -> Document {
    let mut next = document.clone();
    apply(&mut next, action);
    next
}

fn apply(doc: &mut Document, action: &Action) {
    match action {
        // ── Insertion ───────────────────────────────────────────────
        Action::CreateCellAfter {
            id,
            new_id,
            cell_type,
            source,
        } => {
            if let Some(anchor) = target(doc, id, action) {
                insert_next_to(doc, &anchor, 1, new_id, Cell::with_source(*cell_type, source.as_str()));
            }
        }
        Action::CreateCellBefore {
            id,
            new_id,
            cell_type,
            source,
        } => {
            if let Some(anchor) = target(doc, id, action) {
                insert_next_to(doc, &anchor, 0, new_id, Cell::with_source(*cell_type, source.as_str()));
            }
        }
        Action::CreateCellAppend {
            new_id,
            cell_type,
            source,
        } => {
            let end = doc.notebook.len();
            doc.notebook
                .insert_cell_at(end, new_id.clone(), Cell::with_source(*cell_type, source.as_str()));
        }
        Action::CreateCellIfEmpty { new_id, cell_type } => {
            if doc.notebook.is_empty()
                && doc
                    .notebook
                    .insert_cell_at(0, new_id.clone(), Cell::with_source(*cell_type, ""))
            {
                doc.cell_focused = Some(new_id.clone());
            }
        }

        // ── Structure ───────────────────────────────────────────────
        Action::RemoveCell { id } => {
            if let Some(id) = target(doc, id, action) {
                remove_cell(doc, &id);
            }
        }
        Action::MoveCell {
            id,
            destination_id,
            above,
        } => move_cell(doc, id, destination_id, *above),
        Action::MergeCellAfter { id } => merge_cell_after(doc, id),

        // ── Clipboard ───────────────────────────────────────────────
        Action::CopyCell { id } => {
            if let Some(id) = target(doc, id, action) {
                copy_cell(doc, &id);
            }
        }
        Action::CutCell { id } => {
            if let Some(id) = target(doc, id, action) {
                copy_cell(doc, &id);
                remove_cell(doc, &id);
            }
        }
        Action::PasteCell { new_id } => paste_cell(doc, new_id),

        // ── Focus ───────────────────────────────────────────────────
        Action::FocusCell { id } => {
            if doc.notebook.cell(id).is_some() {
                doc.cell_focused = Some(id.clone());
            } else {
                debug!("[reducer] {}: unknown cell {}", action.action_type(), id);
            }
        }
        Action::FocusNextCell {
            id,
            create_cell_if_undefined,
            new_id,
        } => {
            if let Some(id) = target(doc, id, action) {
                if let Some(next) = next_cell(doc, &id, *create_cell_if_undefined, new_id) {
                    doc.cell_focused = Some(next);
                }
            }
        }
        Action::FocusPreviousCell { id } => {
            if let Some(previous) = target(doc, id, action).and_then(|id| previous_cell(doc, &id)) {
                doc.cell_focused = Some(previous);
            }
        }
        Action::FocusCellEditor { id } => {
            if let Some(id) = target(doc, id, action) {
                doc.editor_focused = Some(id);
            }
        }
        Action::FocusNextCellEditor {
            id,
            create_cell_if_undefined,
            new_id,
        } => {
            if let Some(id) = target(doc, id, action) {
                let created = doc.notebook.cell(new_id).is_none();
                if let Some(next) = next_cell(doc, &id, *create_cell_if_undefined, new_id) {
                    if created && &next == new_id {
                        doc.cell_focused = Some(next.clone());
                    }
                    doc.editor_focused = Some(next);
                }
            }
        }
        Action::FocusPreviousCellEditor { id } => {
            if let Some(id) = target(doc, id, action) {
                doc.editor_focused = previous_cell(doc, &id);
            }
        }
        Action::ToggleStickyCell { id } => {
            if doc.notebook.cell(id).is_none() {
                debug!("[reducer] {}: unknown cell {}", action.action_type(), id);
            } else if !doc.sticky_cells.remove(id) {
                doc.sticky_cells.insert(id.clone());
            }
        }

        // ── Content and metadata ────────────────────────────────────
        Action::UpdateSource { id, source } => {
            if let Some(cell) = doc.notebook.cell_mut(id) {
                cell.set_source(source.as_str());
            }
        }
        Action::ChangeCellType { id, to } => {
            if let Some(id) = target(doc, id, action) {
                change_cell_type(doc, &id, *to);
            }
        }
        Action::ToggleOutputVisibility { id } => toggle_flag(doc, id, action, OUTPUT_HIDDEN),
        Action::ToggleInputVisibility { id } => toggle_flag(doc, id, action, INPUT_HIDDEN),
        Action::ToggleOutputExpansion { id } => toggle_flag(doc, id, action, OUTPUT_EXPANDED),
        Action::UnhideAll {
            output_hidden,
            input_hidden,
        } => {
            for id in doc.notebook.code_cell_ids() {
                if let Some(cell) = doc.notebook.cell_mut(&id) {
                    cell.set_flag(OUTPUT_HIDDEN, *output_hidden);
                    cell.set_flag(INPUT_HIDDEN, *input_hidden);
                }
            }
        }
        Action::ToggleTagInCell { id, tag } => {
            if let Some(cell) = doc.notebook.cell_mut(id) {
                cell.toggle_tag(tag);
            }
        }
        Action::OverwriteMetadataField { field, value } => {
            doc.notebook
                .metadata_mut()
                .insert(field.clone(), value.clone());
        }
        Action::DeleteMetadataField { field } => {
            doc.notebook.metadata_mut().remove(field);
        }
        Action::SetLanguageInfo { language_info, .. } => {
            doc.notebook
                .metadata_mut()
                .insert("language_info".to_string(), language_info.clone());
        }
        Action::SetKernelspecInfo { kernelspec, .. } => {
            let metadata = doc.notebook.metadata_mut();
            metadata.insert(
                "kernelspec".to_string(),
                json!({
                    "name": kernelspec.name,
                    "language": kernelspec.language,
                    "display_name": kernelspec.display_name,
                }),
            );
            metadata.insert("kernel_info".to_string(), json!({ "name": kernelspec.name }));
        }

        // ── Outputs ─────────────────────────────────────────────────
        Action::ClearOutputs { id } => {
            if let Some(id) = target(doc, id, action) {
                clear_outputs(doc, &id);
            }
        }
        Action::ClearAllOutputs => clear_all_outputs(doc),
        Action::AppendOutput { id, output } => append_output(doc, id, output),
        Action::UpdateDisplay { display_id, output } => update_display(doc, display_id, output),
        Action::UpdateCellStatus { id, status } => {
            if doc.notebook.cell(id).is_some() {
                doc.transient.cell_status.insert(id.clone(), *status);
            }
        }
        Action::UpdateExecutionCount { id, count } => {
            if let Some(code) = doc.notebook.cell_mut(id).and_then(Cell::as_code_mut) {
                code.execution_count = *count;
            }
        }
        Action::UpdateCellPagers { id, pagers } => {
            if doc.notebook.cell(id).is_some() {
                doc.transient.cell_pagers.insert(id.clone(), pagers.clone());
            }
        }

        // ── Notebook ────────────────────────────────────────────────
        Action::SetNotebook { notebook } => {
            *doc = Document::from_notebook(notebook.clone());
        }
        Action::ExecuteCell { id, .. } => {
            if doc.notebook.cell(id).is_some_and(|c| c.cell_type() == CellType::Code) {
                doc.transient.cell_status.insert(id.clone(), CellStatus::Queued);
            }
        }
        Action::ErrorExecuting { id: Some(id), .. } => {
            // The request never went out; drop the queued marker.
            if doc.cell_status(id) == Some(CellStatus::Queued) {
                doc.transient.cell_status.remove(id);
            }
        }
        Action::RestartKernel {
            output_handling, ..
        } => {
            if matches!(output_handling, OutputHandling::ClearAll | OutputHandling::RunAll) {
                clear_all_outputs(doc);
            }
        }

        // Session-level actions: the document does not change.
        Action::SaveFulfilled
        | Action::ExecuteAllCells
        | Action::AbortExecution { .. }
        | Action::ErrorExecuting { id: None, .. }
        | Action::ErrorUpdateDisplay { .. }
        | Action::LaunchKernelByName { .. }
        | Action::LaunchKernel { .. }
        | Action::LaunchKernelSuccessful { .. }
        | Action::LaunchKernelFailed { .. }
        | Action::SetExecutionState { .. }
        | Action::SetKernelInfo { .. }
        | Action::KernelInfoFailed { .. }
        | Action::RestartKernelSuccessful { .. }
        | Action::RestartKernelFailed { .. }
        | Action::InterruptKernel { .. }
        | Action::InterruptKernelFailed { .. }
        | Action::ShutdownKernel { .. }
        | Action::DismissNotification { .. } => {}
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// The cell an action applies to: its own id, else the focused cell.
fn target(doc: &Document, id: &Option<CellId>, action: &Action) -> Option<CellId> {
    let id = id.as_ref().or(doc.cell_focused.as_ref())?;
    if doc.notebook.cell(id).is_some() {
        Some(id.clone())
    } else {
        debug!("[reducer] {}: unknown cell {}", action.action_type(), id);
        None
    }
}

fn insert_next_to(doc: &mut Document, anchor: &CellId, offset: usize, new_id: &CellId, cell: Cell) {
    if let Some(index) = doc.notebook.index_of(anchor) {
        doc.notebook.insert_cell_at(index + offset, new_id.clone(), cell);
    }
}

fn remove_cell(doc: &mut Document, id: &CellId) {
    let Some(index) = doc.notebook.index_of(id) else {
        return;
    };
    doc.notebook.remove_cell(id);
    doc.clean_cell_transient(id);
    doc.sticky_cells.remove(id);

    if doc.cell_focused.as_ref() == Some(id) {
        // Focus moves to the cell that took its place, else the one above.
        let order = doc.notebook.cell_order();
        doc.cell_focused = order
            .get(index)
            .or_else(|| index.checked_sub(1).and_then(|i| order.get(i)))
            .cloned();
    }
    if doc.editor_focused.as_ref() == Some(id) {
        doc.editor_focused = None;
    }
}

fn move_cell(doc: &mut Document, id: &CellId, destination_id: &CellId, above: bool) {
    let (Some(old), Some(dest)) = (
        doc.notebook.index_of(id),
        doc.notebook.index_of(destination_id),
    ) else {
        debug!("[reducer] MOVE_CELL: unknown cell {id} or {destination_id}");
        return;
    };
    let new = if above { dest } else { dest + 1 };
    if old == new {
        return;
    }
    let target = if old < new { new - 1 } else { new };
    let order = &mut doc.notebook.cell_order;
    let moved = order.remove(old);
    order.insert(target, moved);
}

fn merge_cell_after(doc: &mut Document, id: &CellId) {
    let Some(index) = doc.notebook.index_of(id) else {
        debug!("[reducer] MERGE_CELL_AFTER: unknown cell {id}");
        return;
    };
    let Some(next_id) = doc.notebook.cell_order().get(index + 1).cloned() else {
        return;
    };
    let next_source = doc
        .notebook
        .cell(&next_id)
        .map(|cell| cell.source().to_string())
        .unwrap_or_default();
    if let Some(cell) = doc.notebook.cell_mut(id) {
        let merged = format!("{}\n\n{}", cell.source(), next_source);
        cell.set_source(merged);
    }
    remove_cell(doc, &next_id);
}

fn copy_cell(doc: &mut Document, id: &CellId) {
    if let Some(cell) = doc.notebook.cell_map.get(id) {
        doc.copied = Some(Copied {
            id: id.clone(),
            cell: Arc::clone(cell),
        });
    }
}

fn paste_cell(doc: &mut Document, new_id: &CellId) {
    let Some(copied) = doc.copied.clone() else {
        debug!("[reducer] PASTE_CELL: nothing copied");
        return;
    };
    let anchor = doc
        .cell_focused
        .as_ref()
        .and_then(|id| doc.notebook.index_of(id))
        .or_else(|| doc.notebook.index_of(&copied.id));
    let index = match anchor {
        Some(index) => index + 1,
        None => doc.notebook.len(),
    };
    doc.notebook
        .insert_cell_at(index, new_id.clone(), copied.cell.as_ref().clone());
}

/// The cell after `id`, creating one at the end when asked to.
fn next_cell(doc: &mut Document, id: &CellId, create: bool, new_id: &CellId) -> Option<CellId> {
    let index = doc.notebook.index_of(id)?;
    if let Some(next) = doc.notebook.cell_order().get(index + 1) {
        return Some(next.clone());
    }
    if !create {
        return None;
    }
    let cell_type = match doc.notebook.cell(id).map(Cell::cell_type) {
        Some(CellType::Code) => CellType::Code,
        _ => CellType::Markdown,
    };
    doc.notebook
        .insert_cell_at(index + 1, new_id.clone(), Cell::with_source(cell_type, ""))
        .then(|| new_id.clone())
}

fn previous_cell(doc: &Document, id: &CellId) -> Option<CellId> {
    let index = doc.notebook.index_of(id)?;
    doc.notebook
        .cell_order()
        .get(index.saturating_sub(1))
        .cloned()
}

fn change_cell_type(doc: &mut Document, id: &CellId, to: CellType) {
    let Some(cell) = doc.notebook.cell(id) else {
        return;
    };
    let from = cell.cell_type();
    if from == to {
        return;
    }
    let converted = cell.converted_to(to);
    if let Some(cell) = doc.notebook.cell_mut(id) {
        *cell = converted;
    }
    if from == CellType::Code {
        doc.clean_cell_transient(id);
    }
}

fn toggle_flag(doc: &mut Document, id: &Option<CellId>, action: &Action, flag: &str) {
    if let Some(id) = target(doc, id, action) {
        if let Some(cell) = doc.notebook.cell_mut(&id) {
            cell.toggle_flag(flag);
        }
    }
}

fn clear_outputs(doc: &mut Document, id: &CellId) {
    let Some(code) = doc.notebook.cell_mut(id).and_then(Cell::as_code_mut) else {
        return;
    };
    code.outputs.clear();
    code.execution_count = None;
    doc.clean_cell_transient(id);
}

fn clear_all_outputs(doc: &mut Document) {
    for id in doc.notebook.code_cell_ids() {
        if let Some(code) = doc.notebook.cell_mut(&id).and_then(Cell::as_code_mut) {
            code.outputs.clear();
            code.execution_count = None;
        }
    }
    doc.reset_transient();
}

fn append_output(doc: &mut Document, id: &CellId, output: &Output) {
    let Some(code) = doc.notebook.cell_mut(id).and_then(Cell::as_code_mut) else {
        debug!("[reducer] APPEND_OUTPUT: {id} is not a code cell");
        return;
    };

    let display_id = match output {
        Output::DisplayData { .. } => output.display_id(),
        _ => None,
    };
    let Some(display_id) = display_id else {
        let outputs = std::mem::take(&mut code.outputs);
        code.outputs = reduce_outputs(outputs, output.clone());
        return;
    };

    let key_path = KeyPath {
        cell_id: id.clone(),
        index: code.outputs.len(),
    };
    let paths = doc.transient.displays.record(display_id, key_path).to_vec();
    write_display(doc, &paths, output);
}

fn update_display(doc: &mut Document, display_id: &str, output: &Output) {
    let paths = doc.transient.displays.paths(display_id).to_vec();
    if paths.is_empty() {
        debug!("[reducer] UPDATE_DISPLAY: no slots for {display_id}");
        return;
    }
    let output = output.clone().into_display_data();
    write_display(doc, &paths, &output);
}

/// Write `output` into every slot. A slot one past the end is an append;
/// slots further out, or in cells that are gone, are skipped.
fn write_display(doc: &mut Document, paths: &[KeyPath], output: &Output) {
    for path in paths {
        let Some(code) = doc.notebook.cell_mut(&path.cell_id).and_then(Cell::as_code_mut) else {
            continue;
        };
        match path.index.cmp(&code.outputs.len()) {
            std::cmp::Ordering::Less => code.outputs[path.index] = output.clone(),
            std::cmp::Ordering::Equal => code.outputs.push(output.clone()),
            std::cmp::Ordering::Greater => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::KernelRef;
    use crate::kernel::KernelspecInfo;
    use crate::model::{MimeBundle, Notebook, StreamName, Transient};

    fn id(s: &str) -> CellId {
        CellId::from(s)
    }

    fn abc() -> Document {
        Document::from_notebook(Notebook::from_cells([
            (id("a"), Cell::code("a")),
            (id("b"), Cell::markdown("b")),
            (id("c"), Cell::code("c")),
        ]))
    }

    fn order(doc: &Document) -> Vec<&str> {
        doc.notebook().cell_order().iter().map(CellId::as_str).collect()
    }

    fn cell<'a>(doc: &'a Document, name: &str) -> &'a Cell {
        doc.notebook().cell(&id(name)).unwrap()
    }

    fn outputs<'a>(doc: &'a Document, name: &str) -> &'a [Output] {
        doc.notebook().cell(&id(name)).map(Cell::outputs).unwrap_or_default()
    }

    fn display(text: &str, display_id: &str) -> Output {
        Output::display_data(MimeBundle::new().with("text/plain", text), Some(display_id))
    }

    fn append(name: &str, output: Output) -> Action {
        Action::AppendOutput { id: id(name), output }
    }

    fn stdout(text: &str) -> Output {
        Output::stream(StreamName::Stdout, text)
    }

    fn run(doc: Document, actions: &[Action]) -> Document {
        actions.iter().fold(doc, |doc, action| reduce(&doc, action))
    }

    #[test]
    fn test_invalid_targets_are_noops() {
        let focused_c = reduce(&abc(), &Action::FocusCell { id: id("c") });
        let cases = [
            (abc(), Action::CreateCellAfter {
                id: Some(id("zzz")),
                new_id: id("x"),
                cell_type: CellType::Code,
                source: String::new(),
            }),
            (abc(), Action::MoveCell {
                id: id("b"),
                destination_id: id("a"),
                above: false,
            }),
            (abc(), Action::MergeCellAfter { id: id("c") }),
            (abc(), Action::PasteCell { new_id: id("p") }),
            (abc(), Action::FocusCell { id: id("zzz") }),
            (abc(), Action::FocusPreviousCellEditor { id: Some(id("zzz")) }),
            (focused_c.clone(), Action::FocusPreviousCell { id: Some(id("zzz")) }),
            (focused_c, Action::FocusNextCell {
                id: None,
                create_cell_if_undefined: false,
                new_id: id("x"),
            }),
            (abc(), Action::ChangeCellType {
                id: Some(id("a")),
                to: CellType::Code,
            }),
            (abc(), append("b", stdout("x"))),
            (abc(), Action::UpdateDisplay {
                display_id: "nope".into(),
                output: display("1", "nope"),
            }),
            (abc(), Action::ExecuteCell {
                id: id("b"),
                source: "b".into(),
            }),
            (abc(), Action::RemoveCell { id: Some(id("zzz")) }),
        ];
        for (before, action) in cases {
            assert_eq!(before, reduce(&before, &action), "{} changed the document", action.action_type());
        }
    }

    #[test]
    fn test_create_cells() {
        let doc = run(abc(), &[
            Action::CreateCellAfter {
                id: Some(id("a")),
                new_id: id("x"),
                cell_type: CellType::Code,
                source: "x".into(),
            },
            Action::CreateCellBefore {
                id: Some(id("a")),
                new_id: id("y"),
                cell_type: CellType::Markdown,
                source: String::new(),
            },
            Action::FocusCell { id: id("b") },
            Action::CreateCellAfter {
                id: None,
                new_id: id("z"),
                cell_type: CellType::Code,
                source: String::new(),
            },
        ]);
        assert_eq!(order(&doc), vec!["y", "a", "x", "b", "z", "c"]);
        assert_eq!(cell(&doc, "x").source(), "x");
        assert_eq!(cell(&doc, "y").cell_type(), CellType::Markdown);

        let empty = Action::CreateCellIfEmpty {
            new_id: id("x"),
            cell_type: CellType::Code,
        };
        let doc = reduce(&Document::new(), &empty);
        assert_eq!(order(&doc), vec!["x"]);
        assert_eq!(doc.cell_focused(), Some(&id("x")));
        assert_eq!(order(&reduce(&doc, &Action::CreateCellIfEmpty {
            new_id: id("y"),
            cell_type: CellType::Code,
        })), vec!["x"]);
    }

    #[test]
    fn test_remove_cell_purges_transient() {
        let doc = run(abc(), &[
            append("a", display("1", "D")),
            Action::UpdateCellStatus {
                id: id("a"),
                status: CellStatus::Busy,
            },
            Action::ToggleStickyCell { id: id("a") },
            Action::RemoveCell { id: Some(id("a")) },
        ]);
        assert_eq!(order(&doc), vec!["b", "c"]);
        assert!(doc.displays().is_empty());
        assert_eq!(doc.cell_status(&id("a")), None);
        assert!(!doc.is_sticky(&id("a")));
        assert_eq!(doc.cell_focused(), Some(&id("b")));
    }

    #[test]
    fn test_move_and_merge() {
        let moved = |from: &str, to: &str, above: bool| {
            let doc = reduce(&abc(), &Action::MoveCell {
                id: id(from),
                destination_id: id(to),
                above,
            });
            order(&doc).join("")
        };
        assert_eq!(moved("a", "c", false), "bca");
        assert_eq!(moved("c", "a", true), "cab");
        assert_eq!(moved("a", "c", true), "bac");

        let doc = reduce(&abc(), &Action::MergeCellAfter { id: id("a") });
        assert_eq!(order(&doc), vec!["a", "c"]);
        assert_eq!(cell(&doc, "a").source(), "a\n\nb");
    }

    #[test]
    fn test_clipboard() {
        let doc = run(abc(), &[
            Action::CopyCell { id: Some(id("c")) },
            Action::FocusCell { id: id("a") },
            Action::PasteCell { new_id: id("p") },
            Action::PasteCell { new_id: id("q") },
            Action::UpdateSource {
                id: id("p"),
                source: "changed".into(),
            },
        ]);
        assert_eq!(order(&doc), vec!["a", "q", "p", "b", "c"]);
        assert_eq!(cell(&doc, "q").source(), "c");

        let doc = run(abc(), &[
            Action::CutCell { id: Some(id("a")) },
            Action::PasteCell { new_id: id("p") },
        ]);
        // Focus moved to "b" when "a" was cut.
        assert_eq!(order(&doc), vec!["b", "p", "c"]);
        assert_eq!(doc.copied().map(|c| c.id.as_str()), Some("a"));
    }

    #[test]
    fn test_cell_focus() {
        let next = |doc: &Document, from: Option<&str>, create: bool| {
            reduce(doc, &Action::FocusNextCell {
                id: from.map(id),
                create_cell_if_undefined: create,
                new_id: id("x"),
            })
        };
        let doc = next(&abc(), None, false);
        assert_eq!(doc.cell_focused(), Some(&id("b")));
        let doc = run(doc, &[
            Action::FocusPreviousCell { id: None },
            Action::FocusPreviousCell { id: None },
        ]);
        assert_eq!(doc.cell_focused(), Some(&id("a")));

        let doc = next(&abc(), Some("c"), true);
        assert_eq!(order(&doc), vec!["a", "b", "c", "x"]);
        assert_eq!(doc.cell_focused(), Some(&id("x")));
        assert_eq!(cell(&doc, "x").cell_type(), CellType::Code);

        let raw = Document::from_notebook(Notebook::from_cells([(id("m"), Cell::raw(""))]));
        assert_eq!(cell(&next(&raw, None, true), "x").cell_type(), CellType::Markdown);

        let doc = run(abc(), &[
            Action::ToggleStickyCell { id: id("b") },
            Action::ToggleStickyCell { id: id("c") },
            Action::ToggleStickyCell { id: id("c") },
        ]);
        assert!(doc.is_sticky(&id("b")));
        assert!(!doc.is_sticky(&id("c")));
    }

    #[test]
    fn test_editor_focus() {
        let editor_next = |from: Option<&str>, create: bool| Action::FocusNextCellEditor {
            id: from.map(id),
            create_cell_if_undefined: create,
            new_id: id("x"),
        };
        let doc = run(abc(), &[
            Action::FocusCellEditor { id: Some(id("b")) },
            editor_next(None, false),
        ]);
        // Moving the editor does not move the cell focus.
        assert_eq!(doc.editor_focused(), Some(&id("b")));
        assert_eq!(doc.cell_focused(), Some(&id("a")));

        let doc = reduce(&doc, &editor_next(Some("b"), false));
        assert_eq!(doc.editor_focused(), Some(&id("c")));

        let doc = reduce(&doc, &editor_next(Some("c"), true));
        assert_eq!(doc.editor_focused(), Some(&id("x")));
        assert_eq!(doc.cell_focused(), Some(&id("x")));

        let doc = reduce(&doc, &Action::FocusPreviousCellEditor { id: Some(id("x")) });
        assert_eq!(doc.editor_focused(), Some(&id("c")));
    }

    #[test]
    fn test_change_cell_type() {
        let doc = run(abc(), &[
            append("a", stdout("hi")),
            Action::UpdateExecutionCount {
                id: id("a"),
                count: Some(1),
            },
            Action::ChangeCellType {
                id: Some(id("a")),
                to: CellType::Markdown,
            },
        ]);
        assert_eq!(cell(&doc, "a").cell_type(), CellType::Markdown);
        assert_eq!(cell(&doc, "a").source(), "a");

        let back = reduce(&doc, &Action::ChangeCellType {
            id: Some(id("a")),
            to: CellType::Code,
        });
        assert_eq!(cell(&back, "a").execution_count(), None);
        assert!(cell(&back, "a").outputs().is_empty());
    }

    #[test]
    fn test_cell_metadata_toggles() {
        let doc = run(abc(), &[
            Action::ToggleOutputVisibility { id: Some(id("a")) },
            Action::ToggleInputVisibility { id: Some(id("c")) },
            Action::ToggleOutputExpansion { id: Some(id("c")) },
        ]);
        assert!(cell(&doc, "a").flag(OUTPUT_HIDDEN));
        assert!(cell(&doc, "c").flag(INPUT_HIDDEN));
        assert!(cell(&doc, "c").flag(OUTPUT_EXPANDED));

        let doc = reduce(&doc, &Action::UnhideAll {
            output_hidden: false,
            input_hidden: false,
        });
        assert!(!cell(&doc, "a").flag(OUTPUT_HIDDEN));
        assert!(!cell(&doc, "c").flag(INPUT_HIDDEN));
        // Markdown cells are left alone.
        assert!(cell(&doc, "b").metadata().is_empty());

        let tag = Action::ToggleTagInCell {
            id: id("a"),
            tag: "parameters".into(),
        };
        let doc = reduce(&abc(), &tag);
        assert_eq!(cell(&doc, "a").tags(), vec!["parameters"]);
        assert!(cell(&reduce(&doc, &tag), "a").tags().is_empty());
    }

    #[test]
    fn test_notebook_metadata_fields() {
        let doc = run(abc(), &[
            Action::OverwriteMetadataField {
                field: "title".into(),
                value: json!("Analysis"),
            },
            Action::SetKernelspecInfo {
                kernel_ref: KernelRef::from("k"),
                kernelspec: KernelspecInfo {
                    name: "python3".into(),
                    display_name: "Python 3".into(),
                    language: "python".into(),
                },
            },
            Action::SetLanguageInfo {
                kernel_ref: KernelRef::from("k"),
                language_info: json!({"name": "python"}),
            },
        ]);
        let metadata = doc.notebook().metadata();
        assert_eq!(metadata["title"], json!("Analysis"));
        assert_eq!(metadata["kernelspec"]["display_name"], json!("Python 3"));
        assert_eq!(metadata["kernel_info"]["name"], json!("python3"));
        assert_eq!(metadata["language_info"]["name"], json!("python"));

        let doc = reduce(&doc, &Action::DeleteMetadataField {
            field: "title".into(),
        });
        assert!(doc.notebook().metadata().get("title").is_none());
    }

    #[test]
    fn test_append_streams_through_accumulator() {
        let doc = run(abc(), &[append("a", stdout("hello")), append("a", stdout(" world"))]);
        assert_eq!(outputs(&doc, "a"), &[stdout("hello world")]);
    }

    #[test]
    fn test_display_fans_out_across_cells() {
        let doc = run(abc(), &[
            append("a", display("1", "D")),
            append("c", stdout("log")),
            append("c", display("2", "D")),
        ]);
        // The second append rewrote the first slot too.
        assert_eq!(outputs(&doc, "a"), &[display("2", "D")]);
        assert_eq!(
            doc.displays().paths("D"),
            &[
                KeyPath { cell_id: id("a"), index: 0 },
                KeyPath { cell_id: id("c"), index: 1 },
            ]
        );

        let doc = reduce(&doc, &Action::UpdateDisplay {
            display_id: "D".into(),
            output: Output::ExecuteResult {
                execution_count: Some(1),
                data: MimeBundle::new().with("text/plain", "3"),
                metadata: Default::default(),
                transient: Some(Transient {
                    display_id: Some("D".into()),
                }),
            },
        });
        assert_eq!(outputs(&doc, "a"), &[display("3", "D")]);
        assert_eq!(outputs(&doc, "c"), &[stdout("log"), display("3", "D")]);
    }

    #[test]
    fn test_clearing_outputs() {
        let doc = run(abc(), &[
            append("a", display("1", "D")),
            append("c", display("1", "D")),
            Action::ClearOutputs { id: Some(id("a")) },
            Action::UpdateDisplay {
                display_id: "D".into(),
                output: display("2", "D"),
            },
        ]);
        assert!(outputs(&doc, "a").is_empty());
        assert_eq!(outputs(&doc, "c"), &[display("2", "D")]);

        let doc = run(doc, &[
            Action::UpdateExecutionCount {
                id: id("c"),
                count: Some(4),
            },
            Action::UpdateCellPagers {
                id: id("c"),
                pagers: vec![json!({"text/plain": "help"})],
            },
            Action::ClearAllOutputs,
        ]);
        assert!(outputs(&doc, "c").is_empty());
        assert_eq!(cell(&doc, "c").execution_count(), None);
        assert!(doc.displays().is_empty());
        assert!(doc.cell_pagers(&id("c")).is_empty());
    }

    #[test]
    fn test_execute_cell_queues_without_clearing() {
        let doc = run(abc(), &[
            append("a", stdout("old")),
            Action::ExecuteCell {
                id: id("a"),
                source: "a".into(),
            },
        ]);
        // Outputs are cleared by the execution itself once it is issued.
        assert_eq!(outputs(&doc, "a").len(), 1);
        assert_eq!(doc.cell_status(&id("a")), Some(CellStatus::Queued));

        let doc = reduce(&doc, &Action::ErrorExecuting {
            id: Some(id("a")),
            error: "Kernel not connected!".into(),
        });
        assert_eq!(doc.cell_status(&id("a")), None);
        assert_eq!(outputs(&doc, "a").len(), 1);
    }

    #[test]
    fn test_restart_with_clear_all() {
        let doc = reduce(&abc(), &append("a", stdout("old")));
        let restart = |output_handling| Action::RestartKernel {
            kernel_ref: KernelRef::from("k"),
            output_handling,
        };
        assert_eq!(outputs(&reduce(&doc, &restart(OutputHandling::None)), "a").len(), 1);
        assert!(outputs(&reduce(&doc, &restart(OutputHandling::ClearAll)), "a").is_empty());
    }

    #[test]
    fn test_set_notebook_replaces_everything() {
        let doc = run(abc(), &[
            Action::ToggleStickyCell { id: id("a") },
            Action::SetNotebook {
                notebook: Notebook::from_cells([(id("z"), Cell::code(""))]),
            },
        ]);
        assert_eq!(order(&doc), vec!["z"]);
        assert_eq!(doc.cell_focused(), Some(&id("z")));
        assert!(doc.sticky_cells().is_empty());
    }

    #[test]
    fn test_untouched_cells_are_shared() {
        let before = abc();
        let after = reduce(&before, &Action::UpdateSource {
            id: id("a"),
            source: "changed".into(),
        });
        let shared = |doc: &Document, name: &str| doc.notebook.cell_map.get(&id(name)).cloned().unwrap();
        assert!(Arc::ptr_eq(&shared(&before, "b"), &shared(&after, "b")));
        assert!(!Arc::ptr_eq(&shared(&before, "a"), &shared(&after, "a")));
    }

    #[test]
    fn test_order_invariant_holds_across_actions() {
        let actions = vec![
            Action::create_cell_append(CellType::Code, "1"),
            Action::CreateCellAfter {
                id: Some(id("b")),
                new_id: id("d"),
                cell_type: CellType::Raw,
                source: String::new(),
            },
            Action::MoveCell {
                id: id("d"),
                destination_id: id("a"),
                above: true,
            },
            Action::CutCell { id: Some(id("c")) },
            Action::PasteCell { new_id: id("e") },
            Action::PasteCell { new_id: id("e") },
            Action::MergeCellAfter { id: id("a") },
            Action::RemoveCell { id: None },
            Action::FocusNextCell {
                id: Some(id("e")),
                create_cell_if_undefined: true,
                new_id: id("f"),
            },
            Action::MoveCell {
                id: id("f"),
                destination_id: id("d"),
                above: false,
            },
            Action::CreateCellBefore {
                id: Some(id("d")),
                new_id: id("d"),
                cell_type: CellType::Code,
                source: String::new(),
            },
        ];

        let mut doc = abc();
        for action in &actions {
            doc = reduce(&doc, action);
            assert!(
                doc.notebook().is_consistent(),
                "inconsistent after {}",
                action.action_type()
            );
        }
    }
}
