//! Kernel lifecycle: launch, handshake, status, interrupt, restart and shutdown.
//!
//! The controller listens to the store like the execution engine does and
//! answers lifecycle actions with more actions. Every kernel-scoped action
//! it emits carries the `KernelRef` it was started for, so anything that
//! arrives after a newer launch is dropped by the reducer.

use std::sync::Arc;
use std::time::Duration;

use jupyter_protocol::{InterruptRequest, JupyterMessageContent, KernelInfoRequest, ShutdownRequest};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::actions::{Action, OutputHandling};
use crate::ids::KernelRef;
use crate::kernel::{is_reply_to, Kernel, KernelInfo, KernelStatus};
use crate::launcher::{KernelLauncher, LaunchedKernel};
use crate::settings::AppSettings;
use crate::store::StoreHandle;

const FALLBACK_KERNEL: &str = "python3";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleConfig {
    pub launch_timeout: Duration,
    pub kernel_info_timeout: Duration,
    /// Bound on the whole restart: launch plus the new kernel reporting in.
    pub restart_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig::from_settings(&AppSettings::default())
    }
}

impl LifecycleConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        LifecycleConfig {
            launch_timeout: Duration::from_secs(settings.launch_timeout_secs),
            kernel_info_timeout: Duration::from_secs(settings.kernel_info_timeout_secs),
            restart_timeout: Duration::from_secs(settings.restart_timeout_secs),
        }
    }
}

pub struct KernelLifecycle {
    task: JoinHandle<()>,
}

impl KernelLifecycle {
    pub fn spawn(
        store: StoreHandle,
        launcher: Arc<dyn KernelLauncher>,
        config: LifecycleConfig,
    ) -> KernelLifecycle {
        let actions = store.subscribe();
        let controller = Controller {
            store,
            launcher,
            config,
            flows: Vec::new(),
            watchers: None,
        };
        KernelLifecycle {
            task: tokio::spawn(controller.run(actions)),
        }
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for KernelLifecycle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Controller {
    store: StoreHandle,
    launcher: Arc<dyn KernelLauncher>,
    config: LifecycleConfig,
    /// Launches and restarts in progress.
    flows: Vec<JoinHandle<()>>,
    /// Status republisher and handshake of the current kernel.
    watchers: Option<(KernelRef, Vec<JoinHandle<()>>)>,
}

impl Drop for Controller {
    fn drop(&mut self) {
        for flow in &self.flows {
            flow.abort();
        }
        self.stop_watchers();
    }
}

impl Controller {
    async fn run(mut self, mut actions: mpsc::UnboundedReceiver<Action>) {
        while let Some(action) = actions.recv().await {
            self.flows.retain(|flow| !flow.is_finished());
            match action {
                Action::LaunchKernelByName {
                    kernel_name,
                    kernel_ref,
                } => self.launch_by_name(kernel_name, kernel_ref),
                Action::LaunchKernelSuccessful {
                    kernel, kernel_ref, ..
                } => {
                    if self.store.state().kernel.is_current(&kernel_ref) {
                        self.watch_kernel(kernel);
                    } else {
                        debug!("[lifecycle] Ignoring superseded kernel {}", kernel_ref);
                    }
                }
                Action::RestartKernel {
                    kernel_ref,
                    output_handling,
                } => self.restart(kernel_ref, output_handling),
                Action::InterruptKernel { kernel_ref } => self.interrupt(kernel_ref),
                Action::ShutdownKernel { kernel_ref } => {
                    if matches!(&self.watchers, Some((r, _)) if *r == kernel_ref) {
                        self.stop_watchers();
                    }
                    self.shutdown_in_background(kernel_ref);
                }
                _ => {}
            }
        }
    }

    fn stop_watchers(&mut self) {
        if let Some((_, tasks)) = self.watchers.take() {
            for task in tasks {
                task.abort();
            }
        }
    }

    fn shutdown_in_background(&self, kernel_ref: KernelRef) {
        let launcher = Arc::clone(&self.launcher);
        tokio::spawn(async move {
            if let Err(e) = launcher.shutdown(&kernel_ref).await {
                warn!("[lifecycle] Failed to shut down {}: {}", kernel_ref, e);
            }
        });
    }

    // ── Launch ──────────────────────────────────────────────────────

    fn launch_by_name(&mut self, kernel_name: String, kernel_ref: KernelRef) {
        // A fresh launch replaces whatever kernel is running.
        if let Some(previous) = self.store.state().kernel.kernel_ref.clone() {
            if previous != kernel_ref {
                self.shutdown_in_background(previous);
            }
        }

        let store = self.store.clone();
        let launcher = Arc::clone(&self.launcher);
        let timeout = self.config.launch_timeout;
        self.flows.push(tokio::spawn(async move {
            store
                .dispatch_applied(Action::LaunchKernel {
                    kernel_ref: kernel_ref.clone(),
                    kernel_name: kernel_name.clone(),
                })
                .await;
            match launch(launcher.as_ref(), &kernel_name, &kernel_ref, timeout).await {
                Ok(launched) => install(&store, launcher.as_ref(), launched).await,
                Err(error) => {
                    warn!("[lifecycle] Launch of {} failed: {}", kernel_name, error);
                    store.dispatch(Action::LaunchKernelFailed { kernel_ref, error });
                }
            }
        }));
    }

    // ── Watchers ────────────────────────────────────────────────────

    fn watch_kernel(&mut self, kernel: Kernel) {
        self.stop_watchers();
        info!("[lifecycle] Kernel {} ({}) connected", kernel.name, kernel.kernel_ref);

        let status = tokio::spawn(republish_status(self.store.clone(), kernel.clone()));
        let handshake = tokio::spawn(handshake(
            self.store.clone(),
            kernel.clone(),
            self.config.kernel_info_timeout,
        ));
        self.watchers = Some((kernel.kernel_ref, vec![status, handshake]));
    }

    // ── Interrupt ───────────────────────────────────────────────────

    /// Ask the kernel to interrupt whatever it is running.
    ///
    /// The request goes out on control and nothing waits for its reply; the
    /// interrupted execution ends through its own iopub and shell messages.
    fn interrupt(&self, kernel_ref: KernelRef) {
        let state = self.store.state();
        if !state.kernel.is_current(&kernel_ref) {
            debug!("[lifecycle] Ignoring interrupt of superseded kernel {}", kernel_ref);
            return;
        }
        let Some(kernel) = &state.kernel.kernel else {
            self.store.dispatch(Action::InterruptKernelFailed {
                kernel_ref,
                error: "No kernel to interrupt".to_string(),
            });
            return;
        };

        match kernel.channels.try_send(kernel.control_request(InterruptRequest {})) {
            Ok(()) => info!("[lifecycle] Sent interrupt_request to {}", kernel_ref),
            Err(e) => {
                warn!("[lifecycle] Interrupt of {} failed: {}", kernel_ref, e);
                self.store.dispatch(Action::InterruptKernelFailed {
                    kernel_ref,
                    error: e.to_string(),
                });
            }
        }
    }

    // ── Restart ─────────────────────────────────────────────────────

    fn restart(&mut self, old_ref: KernelRef, output_handling: OutputHandling) {
        let state = self.store.state();
        if !state.kernel.is_current(&old_ref) {
            debug!("[lifecycle] Ignoring restart of superseded kernel {}", old_ref);
            return;
        }

        let kernel_name = state
            .kernel
            .kernel_name
            .clone()
            .or_else(|| state.notebook().kernelspec_name().map(str::to_string))
            .unwrap_or_else(|| FALLBACK_KERNEL.to_string());

        if let Some(old) = &state.kernel.kernel {
            let request = old.control_request(ShutdownRequest { restart: false });
            if let Err(e) = old.channels.try_send(request) {
                debug!("[lifecycle] shutdown_request to {} not sent: {}", old_ref, e);
            }
        }
        self.stop_watchers();
        self.shutdown_in_background(old_ref);

        let new_ref = KernelRef::new();
        info!("[lifecycle] Restarting {} as {}", kernel_name, new_ref);

        let store = self.store.clone();
        let launcher = Arc::clone(&self.launcher);
        let timeout = self.config.restart_timeout;
        self.flows.push(tokio::spawn(async move {
            store
                .dispatch_applied(Action::LaunchKernel {
                    kernel_ref: new_ref.clone(),
                    kernel_name: kernel_name.clone(),
                })
                .await;

            let outcome = tokio::time::timeout(timeout, async {
                let launched = launch(launcher.as_ref(), &kernel_name, &new_ref, timeout).await?;
                install(&store, launcher.as_ref(), launched).await;
                wait_until_ready(&store, &new_ref).await
            })
            .await
            .unwrap_or_else(|_| Err(format!("Restart did not finish within {}s", timeout.as_secs())));

            match outcome {
                Ok(()) => {
                    store.dispatch(Action::RestartKernelSuccessful {
                        kernel_ref: new_ref,
                    });
                    if output_handling == OutputHandling::RunAll {
                        store.dispatch(Action::ExecuteAllCells);
                    }
                }
                Err(error) => {
                    warn!("[lifecycle] Restart failed: {}", error);
                    if let Err(e) = launcher.shutdown(&new_ref).await {
                        debug!("[lifecycle] Cleanup of {} failed: {}", new_ref, e);
                    }
                    store.dispatch(Action::RestartKernelFailed {
                        kernel_ref: new_ref,
                        error,
                    });
                }
            }
        }));
    }
}

/// Launch within `timeout`, flattening both failure kinds into a message.
async fn launch(
    launcher: &dyn KernelLauncher,
    kernel_name: &str,
    kernel_ref: &KernelRef,
    timeout: Duration,
) -> Result<LaunchedKernel, String> {
    match tokio::time::timeout(timeout, launcher.launch(kernel_name, kernel_ref)).await {
        Ok(Ok(launched)) => Ok(launched),
        Ok(Err(e)) => Err(format!("Failed to launch kernel {kernel_name}: {e:#}")),
        Err(_) => Err(format!(
            "Kernel {kernel_name} did not start within {}s",
            timeout.as_secs()
        )),
    }
}

/// Hand a launched kernel to the store, unless a newer launch took over meanwhile.
async fn install(store: &StoreHandle, launcher: &dyn KernelLauncher, launched: LaunchedKernel) {
    let LaunchedKernel { kernel, kernelspec } = launched;
    let kernel_ref = kernel.kernel_ref.clone();
    let state = store.state();
    if !state.kernel.is_current(&kernel_ref) {
        info!("[lifecycle] Launch {} was superseded, shutting it down", kernel_ref);
        if let Err(e) = launcher.shutdown(&kernel_ref).await {
            warn!("[lifecycle] Failed to shut down {}: {}", kernel_ref, e);
        }
        return;
    }

    if let Some(kernelspec) = kernelspec {
        store.dispatch(Action::SetKernelspecInfo {
            kernel_ref: kernel_ref.clone(),
            kernelspec,
        });
    }
    store.dispatch(Action::LaunchKernelSuccessful {
        kernel,
        kernel_ref,
        content_ref: state.content_ref.clone(),
    });
}

/// Wait until the kernel under `kernel_ref` has left launching/starting.
///
/// Executions issued before that would be refused as not connected.
async fn wait_until_ready(store: &StoreHandle, kernel_ref: &KernelRef) -> Result<(), String> {
    let state = store
        .wait_for(|s| {
            !s.kernel.is_current(kernel_ref)
                || !matches!(
                    s.kernel.status,
                    KernelStatus::Launching | KernelStatus::Starting
                )
        })
        .await
        .ok_or_else(|| "Store stopped during restart".to_string())?;

    if !state.kernel.is_current(kernel_ref) {
        return Err(format!("Kernel {kernel_ref} was replaced during restart"));
    }
    if state.kernel.kernel.is_none() {
        return Err(format!("Kernel {kernel_ref} disconnected during restart"));
    }
    Ok(())
}

/// Mirror the kernel's iopub `status` into the store.
///
/// The kernel stays `Starting` until it reports a status or answers
/// `kernel_info_request`.
async fn republish_status(store: StoreHandle, kernel: Kernel) {
    let mut iopub = kernel.channels.subscribe_iopub();

    loop {
        let message = match iopub.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[lifecycle] Status watcher lagged by {}", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let JupyterMessageContent::Status(status) = &message.content else {
            continue;
        };
        if let Some(state) = KernelStatus::from_execution_state(&status.execution_state) {
            store.dispatch(Action::SetExecutionState {
                kernel_ref: kernel.kernel_ref.clone(),
                state,
            });
        }
    }
    debug!("[lifecycle] iopub closed for {}", kernel.kernel_ref);
}

/// Ask the kernel about itself and record the answer.
async fn handshake(store: StoreHandle, kernel: Kernel, timeout: Duration) {
    let kernel_ref = kernel.kernel_ref.clone();
    match kernel_info(&kernel, timeout).await {
        Ok(info) => {
            store.dispatch(Action::SetLanguageInfo {
                kernel_ref: kernel_ref.clone(),
                language_info: info.language_info.clone(),
            });
            store.dispatch(Action::SetKernelInfo { kernel_ref, info });
        }
        Err(error) => {
            warn!("[lifecycle] Kernel info for {} failed: {}", kernel_ref, error);
            store.dispatch(Action::KernelInfoFailed { kernel_ref, error });
        }
    }
}

async fn kernel_info(kernel: &Kernel, timeout: Duration) -> Result<KernelInfo, String> {
    let mut shell = kernel.channels.subscribe_shell();
    let request = kernel.request(KernelInfoRequest {});
    let msg_id = request.header.msg_id.clone();
    kernel
        .channels
        .send(request)
        .await
        .map_err(|e| e.to_string())?;

    let reply = tokio::time::timeout(timeout, async {
        loop {
            match shell.recv().await {
                Ok(message) if is_reply_to(&message, &msg_id) => {
                    if let JupyterMessageContent::KernelInfoReply(reply) = message.content {
                        return Ok(reply);
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err("Kernel closed before replying to kernel_info_request".to_string())
                }
            }
        }
    })
    .await
    .map_err(|_| format!("No kernel_info_reply within {}s", timeout.as_secs_f32()))??;

    KernelInfo::from_reply(&reply).map_err(|e| format!("Malformed kernel_info_reply: {e}"))
}
