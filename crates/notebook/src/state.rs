//! Session state: the document plus kernel bookkeeping and notifications.

use std::path::PathBuf;

use log::debug;

use crate::actions::Action;
use crate::document::Document;
use crate::ids::{ContentRef, KernelRef};
use crate::kernel::{Kernel, KernelChannels, KernelInfo, KernelStatus};
use crate::model::Notebook;
use crate::reducer::reduce;

/// A dismissible failure report.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelState {
    /// The launch currently considered live. Actions for other refs are stale.
    pub kernel_ref: Option<KernelRef>,
    pub kernel_name: Option<String>,
    pub status: KernelStatus,
    pub kernel: Option<Kernel>,
    pub info: Option<KernelInfo>,
}

impl KernelState {
    pub fn is_current(&self, kernel_ref: &KernelRef) -> bool {
        self.kernel_ref.as_ref() == Some(kernel_ref)
    }

    pub fn channels(&self) -> Option<&KernelChannels> {
        self.kernel.as_ref().map(|k| &k.channels)
    }

    /// Whether an execute request can be issued now.
    pub fn accepts_execution(&self) -> bool {
        self.kernel.is_some() && !self.status.rejects_execution()
    }
}

#[derive(Debug, Clone)]
pub struct NotebookState {
    pub content_ref: ContentRef,
    pub path: Option<PathBuf>,
    pub document: Document,
    pub kernel: KernelState,
    /// The notebook differs from what was last loaded or saved.
    pub dirty: bool,
    pub notifications: Vec<Notification>,
}

impl Default for NotebookState {
    fn default() -> Self {
        NotebookState::new(Notebook::new(), None)
    }
}

impl NotebookState {
    pub fn new(notebook: Notebook, path: Option<PathBuf>) -> Self {
        NotebookState {
            content_ref: ContentRef::new(),
            path,
            document: Document::from_notebook(notebook),
            kernel: KernelState::default(),
            dirty: false,
            notifications: Vec::new(),
        }
    }

    pub fn notebook(&self) -> &Notebook {
        self.document.notebook()
    }
}

/// Kernel-scoped actions carry the ref they were issued for.
fn kernel_ref_of(action: &Action) -> Option<&KernelRef> {
    match action {
        Action::LaunchKernelSuccessful { kernel_ref, .. }
        | Action::SetExecutionState { kernel_ref, .. }
        | Action::SetKernelInfo { kernel_ref, .. }
        | Action::SetLanguageInfo { kernel_ref, .. }
        | Action::SetKernelspecInfo { kernel_ref, .. }
        | Action::RestartKernel { kernel_ref, .. }
        | Action::InterruptKernel { kernel_ref }
        | Action::ShutdownKernel { kernel_ref }
        | Action::LaunchKernelFailed { kernel_ref, .. } => Some(kernel_ref),
        _ => None,
    }
}

pub fn reduce_state(state: &NotebookState, action: &Action) -> NotebookState {
    if let Some(kernel_ref) = kernel_ref_of(action) {
        if !state.kernel.is_current(kernel_ref) {
            debug!(
                "[state] Ignoring {} for stale kernel {}",
                action.action_type(),
                kernel_ref
            );
            return with_notification(state.clone(), action);
        }
    }

    let mut next = state.clone();
    next.document = reduce(&state.document, action);
    if !next.notebook().same_content(state.notebook()) {
        next.dirty = true;
    }

    match action {
        Action::LaunchKernel {
            kernel_ref,
            kernel_name,
        } => {
            next.kernel = KernelState {
                kernel_ref: Some(kernel_ref.clone()),
                kernel_name: Some(kernel_name.clone()),
                status: KernelStatus::Launching,
                kernel: None,
                info: None,
            };
        }
        Action::LaunchKernelSuccessful { kernel, .. } => {
            next.kernel.kernel_name = Some(kernel.name.clone());
            next.kernel.kernel = Some(kernel.clone());
            next.kernel.status = KernelStatus::Starting;
        }
        Action::LaunchKernelFailed { .. } => {
            next.kernel.kernel = None;
            next.kernel.status = KernelStatus::NotConnected;
        }
        Action::RestartKernelFailed { kernel_ref, .. } if next.kernel.is_current(kernel_ref) => {
            next.kernel.kernel = None;
            next.kernel.status = KernelStatus::NotConnected;
        }
        Action::SetExecutionState { state, .. } => {
            next.kernel.status = *state;
        }
        Action::SetKernelInfo { info, .. } => {
            next.kernel.info = Some(info.clone());
            // A kernel that answered kernel_info is ready even if its
            // first status message was missed.
            if next.kernel.status == KernelStatus::Starting {
                next.kernel.status = KernelStatus::Idle;
            }
        }
        Action::RestartKernel { .. } => {
            next.kernel.status = KernelStatus::Restarting;
        }
        Action::ShutdownKernel { .. } => {
            next.kernel = KernelState::default();
        }
        Action::SetNotebook { .. } | Action::SaveFulfilled => {
            next.dirty = false;
        }
        Action::DismissNotification { key } => {
            next.notifications.retain(|n| &n.key != key);
        }
        _ => {}
    }

    with_notification(next, action)
}

/// Error actions become notifications; a repeated key replaces the old one.
fn with_notification(mut state: NotebookState, action: &Action) -> NotebookState {
    if let Some((key, message)) = action.failure() {
        state.notifications.retain(|n| n.key != key);
        state.notifications.push(Notification { key, message });
    }
    state
}
