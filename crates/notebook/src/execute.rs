//! The execution engine: turns `ExecuteCell` into a conversation with the
//! kernel and the conversation's replies into document actions.
//!
//! Each cell has at most one live conversation. Executing a cell again
//! aborts the previous conversation (and waits for it to stop) before the
//! new request goes out, so replies to a superseded request never reach
//! the document. Conversations end only from the outside: a new execution
//! of the same cell, `AbortExecution`, removal of the cell, or a new kernel.

use std::collections::HashMap;

use jupyter_protocol::{
    ExecuteReply, ExecuteRequest, ExecutionState, JupyterMessage, JupyterMessageContent, Payload,
};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::actions::Action;
use crate::document::CellStatus;
use crate::ids::{CellId, KernelRef};
use crate::kernel::{is_reply_to, Kernel};
use crate::model::{CellType, Output};
use crate::state::NotebookState;
use crate::store::StoreHandle;

pub const KERNEL_NOT_CONNECTED: &str = "Kernel not connected!";

struct Conversation {
    kernel_ref: KernelRef,
    task: JoinHandle<()>,
}

pub struct ExecutionEngine {
    task: JoinHandle<()>,
}

impl ExecutionEngine {
    /// Start the engine. It sees every action applied after this call.
    pub fn spawn(store: StoreHandle) -> ExecutionEngine {
        let actions = store.subscribe();
        let task = tokio::spawn(run(store, actions));
        ExecutionEngine { task }
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct EngineState {
    conversations: HashMap<CellId, Conversation>,
    display_watcher: Option<(KernelRef, JoinHandle<()>)>,
}

impl EngineState {
    /// Abort the cell's conversation and wait until it has stopped.
    async fn stop(&mut self, id: &CellId) {
        if let Some(conversation) = self.conversations.remove(id) {
            conversation.task.abort();
            let _ = conversation.task.await;
            debug!("[execute] Stopped conversation for cell {}", id);
        }
    }

    async fn stop_where(&mut self, mut stale: impl FnMut(&CellId, &Conversation) -> bool) {
        let ids: Vec<CellId> = self
            .conversations
            .iter()
            .filter(|(id, c)| stale(*id, *c))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    fn stop_display_watcher(&mut self) {
        if let Some((_, task)) = self.display_watcher.take() {
            task.abort();
        }
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        for conversation in self.conversations.values() {
            conversation.task.abort();
        }
        self.stop_display_watcher();
    }
}

async fn run(store: StoreHandle, mut actions: mpsc::UnboundedReceiver<Action>) {
    let mut engine = EngineState::default();

    while let Some(action) = actions.recv().await {
        match action {
            Action::ExecuteCell { id, source } => {
                engine.stop(&id).await;
                match kernel_for(&store.state(), &id) {
                    Ok(kernel) => {
                        let kernel_ref = kernel.kernel_ref.clone();
                        let task = tokio::spawn(converse(store.clone(), kernel, id.clone(), source));
                        engine
                            .conversations
                            .insert(id, Conversation { kernel_ref, task });
                    }
                    Err(error) => {
                        warn!("[execute] Cannot execute cell {}: {}", id, error);
                        store.dispatch(Action::ErrorExecuting {
                            id: Some(id),
                            error,
                        });
                    }
                }
            }
            Action::ExecuteAllCells => {
                let state = store.state();
                for (id, cell) in state.notebook().cells() {
                    if cell.cell_type() == CellType::Code {
                        store.dispatch(Action::ExecuteCell {
                            id: id.clone(),
                            source: cell.source().to_string(),
                        });
                    }
                }
            }
            Action::AbortExecution { id } => engine.stop(&id).await,
            Action::RemoveCell { .. }
            | Action::CutCell { .. }
            | Action::MergeCellAfter { .. }
            | Action::ChangeCellType { .. }
            | Action::SetNotebook { .. } => {
                // Whatever cell went away (or stopped being code) loses its conversation.
                let state = store.state();
                engine
                    .stop_where(|id, _| {
                        state
                            .notebook()
                            .cell(id)
                            .map_or(true, |cell| cell.cell_type() != CellType::Code)
                    })
                    .await;
            }
            Action::LaunchKernel { kernel_ref, .. } => {
                engine.stop_where(|_, c| c.kernel_ref != kernel_ref).await;
                engine.stop_display_watcher();
            }
            Action::LaunchKernelSuccessful {
                kernel, kernel_ref, ..
            } => {
                if !store.state().kernel.is_current(&kernel_ref) {
                    continue;
                }
                engine.stop_where(|_, c| c.kernel_ref != kernel_ref).await;
                engine.stop_display_watcher();
                let task = tokio::spawn(watch_display_updates(store.clone(), kernel));
                engine.display_watcher = Some((kernel_ref, task));
            }
            Action::ShutdownKernel { kernel_ref } => {
                engine.stop_where(|_, c| c.kernel_ref == kernel_ref).await;
                if matches!(&engine.display_watcher, Some((r, _)) if *r == kernel_ref) {
                    engine.stop_display_watcher();
                }
            }
            _ => {}
        }
    }
}

/// The kernel an execution of `id` would go to, or why there is none.
fn kernel_for(state: &NotebookState, id: &CellId) -> Result<Kernel, String> {
    match state.notebook().cell(id) {
        None => return Err(format!("Cell {id} does not exist")),
        Some(cell) if cell.cell_type() != CellType::Code => {
            return Err(format!("Cell {id} is not a code cell"))
        }
        Some(_) => {}
    }
    match &state.kernel.kernel {
        Some(kernel) if state.kernel.accepts_execution() => Ok(kernel.clone()),
        _ => Err(KERNEL_NOT_CONNECTED.to_string()),
    }
}

// ── Conversation ────────────────────────────────────────────────────

/// One cell's execution: send the request, then translate every child
/// message until aborted or the kernel goes away.
async fn converse(store: StoreHandle, kernel: Kernel, id: CellId, source: String) {
    // Subscribe first so no reply can slip past.
    let mut shell = kernel.channels.subscribe_shell();
    let mut iopub = kernel.channels.subscribe_iopub();

    let request = kernel.request(ExecuteRequest::new(source));
    let msg_id = request.header.msg_id.clone();

    store.dispatch(Action::ClearOutputs {
        id: Some(id.clone()),
    });
    store.dispatch(Action::UpdateCellStatus {
        id: id.clone(),
        status: CellStatus::Busy,
    });
    store.dispatch(Action::UpdateCellPagers {
        id: id.clone(),
        pagers: Vec::new(),
    });

    if let Err(e) = kernel.channels.send(request).await {
        warn!("[execute] Could not send execute_request for cell {}: {}", id, e);
        // No status message will ever come back for this request.
        store.dispatch(Action::UpdateCellStatus {
            id: id.clone(),
            status: CellStatus::Idle,
        });
        store.dispatch(Action::ErrorExecuting {
            id: Some(id),
            error: e.to_string(),
        });
        return;
    }
    info!("[execute] Sent execute_request {} for cell {}", msg_id, id);

    let mut conversation = ConversationState {
        store,
        id,
        pagers: Vec::new(),
        seen_input: false,
    };

    loop {
        tokio::select! {
            reply = shell.recv() => match reply {
                Ok(message) if is_reply_to(&message, &msg_id) => conversation.on_shell(&message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[execute] Shell subscriber for cell {} lagged by {}", conversation.id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = iopub.recv() => match message {
                Ok(message) if is_reply_to(&message, &msg_id) => conversation.on_iopub(&message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[execute] iopub subscriber for cell {} lagged by {}", conversation.id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("[execute] Kernel channels closed for cell {}", conversation.id);
}

struct ConversationState {
    store: StoreHandle,
    id: CellId,
    pagers: Vec<Value>,
    seen_input: bool,
}

impl ConversationState {
    fn on_shell(&mut self, message: &JupyterMessage) {
        if let JupyterMessageContent::ExecuteReply(reply) = &message.content {
            self.on_execute_reply(reply);
        }
    }

    fn on_execute_reply(&mut self, reply: &ExecuteReply) {
        for payload in &reply.payload {
            match payload {
                Payload::Page { data, .. } => {
                    let data = match serde_json::to_value(data) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("[execute] Unreadable pager for cell {}: {}", self.id, e);
                            continue;
                        }
                    };
                    self.pagers.push(data);
                    self.store.dispatch(Action::UpdateCellPagers {
                        id: self.id.clone(),
                        pagers: self.pagers.clone(),
                    });
                }
                Payload::SetNextInput { text, replace: true, .. } => {
                    self.store.dispatch(Action::UpdateSource {
                        id: self.id.clone(),
                        source: text.clone(),
                    });
                }
                Payload::SetNextInput { text, replace: false, .. } => {
                    self.store.dispatch(Action::create_cell_after(
                        Some(self.id.clone()),
                        CellType::Code,
                        text.clone(),
                    ));
                }
                _ => {}
            }
        }
    }

    fn on_iopub(&mut self, message: &JupyterMessage) {
        match &message.content {
            JupyterMessageContent::Status(status) => {
                let status = match status.execution_state {
                    ExecutionState::Busy => CellStatus::Busy,
                    ExecutionState::Idle => CellStatus::Idle,
                    _ => return,
                };
                self.store.dispatch(Action::UpdateCellStatus {
                    id: self.id.clone(),
                    status,
                });
            }
            JupyterMessageContent::ExecuteInput(input) => {
                if !self.seen_input {
                    self.seen_input = true;
                    self.store.dispatch(Action::UpdateExecutionCount {
                        id: self.id.clone(),
                        count: u32::try_from(input.execution_count.0).ok(),
                    });
                }
            }
            JupyterMessageContent::ClearOutput(_) => self.store.dispatch(Action::ClearOutputs {
                id: Some(self.id.clone()),
            }),
            // Handled by the display watcher, whichever cell it targets.
            JupyterMessageContent::UpdateDisplayData(_) => {}
            content => match Output::from_content(content) {
                Some(Ok(output)) => self.store.dispatch(Action::AppendOutput {
                    id: self.id.clone(),
                    output,
                }),
                Some(Err(e)) => warn!(
                    "[execute] Malformed {} for cell {}: {}",
                    message.message_type(),
                    self.id,
                    e
                ),
                None => {}
            },
        }
    }
}

// ── Display updates ─────────────────────────────────────────────────

/// Map every `update_display_data` on the kernel's iopub to `UpdateDisplay`.
///
/// Display updates are not tied to a request; they may target outputs of
/// any cell.
async fn watch_display_updates(store: StoreHandle, kernel: Kernel) {
    let mut iopub = kernel.channels.subscribe_iopub();
    loop {
        let message = match iopub.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[execute] Display watcher lagged by {}", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let JupyterMessageContent::UpdateDisplayData(update) = &message.content else {
            continue;
        };

        let display_id = update.transient.display_id.clone();
        match (display_id, Output::from_content(&message.content)) {
            (Some(display_id), Some(Ok(output))) => {
                store.dispatch(Action::UpdateDisplay { display_id, output })
            }
            (_, Some(Err(e))) => store.dispatch(Action::ErrorUpdateDisplay {
                error: format!("Malformed update_display_data: {e}"),
            }),
            _ => store.dispatch(Action::ErrorUpdateDisplay {
                error: "update_display_data without a display_id".to_string(),
            }),
        }
    }
    debug!("[execute] Display watcher for {} stopped", kernel.kernel_ref);
}
