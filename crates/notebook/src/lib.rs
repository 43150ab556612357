//! Notebook document engine and Jupyter kernel execution core.
//!
//! A session is a [`store::Store`] holding [`state::NotebookState`]. Everything
//! that changes it is an [`actions::Action`] applied by the pure
//! [`reducer::reduce`]. The [`execute::ExecutionEngine`] and
//! [`lifecycle::KernelLifecycle`] are tasks that watch the applied actions and
//! talk to kernels over [`kernel::KernelChannels`], answering with more actions.

pub mod actions;
pub mod display;
pub mod document;
pub mod execute;
pub mod format;
pub mod ids;
pub mod kernel;
pub mod launcher;
pub mod lifecycle;
pub mod model;
pub mod outputs;
pub mod reducer;
pub mod settings;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use actions::{Action, OutputHandling};
pub use document::{CellStatus, Document};
pub use execute::ExecutionEngine;
pub use format::{parse_notebook, read_notebook, serialize_notebook, write_notebook, FormatError};
pub use ids::{CellId, ContentRef, KernelRef};
pub use kernel::{Kernel, KernelChannels, KernelStatus};
pub use launcher::{KernelLauncher, RuntimelibLauncher};
pub use lifecycle::{KernelLifecycle, LifecycleConfig};
pub use model::{Cell, CellType, MimeBundle, Notebook, Output, StreamName};
pub use state::NotebookState;
pub use store::{Store, StoreHandle};
