//! Kernel process launching.
//!
//! [`KernelLauncher`] is the seam between the lifecycle controller and
//! whatever actually starts kernels. [`RuntimelibLauncher`] starts local
//! kernelspecs over ZeroMQ and bridges their sockets into
//! [`KernelChannels`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jupyter_protocol::{
    Channel, ConnectionInfo, InterruptRequest, JupyterKernelspec, JupyterMessage, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ids::KernelRef;
use crate::kernel::{Kernel, KernelChannels, KernelEndpoint, KernelspecInfo};

/// What a successful launch hands back.
#[derive(Debug)]
pub struct LaunchedKernel {
    pub kernel: Kernel,
    pub kernelspec: Option<KernelspecInfo>,
}

#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel from the named kernelspec, identified by `kernel_ref`.
    async fn launch(&self, kernel_name: &str, kernel_ref: &KernelRef) -> Result<LaunchedKernel>;

    /// Stop the kernel started under `kernel_ref`. Unknown refs are not an error.
    async fn shutdown(&self, kernel_ref: &KernelRef) -> Result<()>;
}

/// A kernel process this launcher started.
struct RunningKernel {
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    session_id: String,
    tasks: Vec<JoinHandle<()>>,
    _process: tokio::process::Child,
}

impl Drop for RunningKernel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Launches local kernelspecs with `runtimelib`.
#[derive(Default)]
pub struct RuntimelibLauncher {
    running: Mutex<HashMap<KernelRef, RunningKernel>>,
}

impl RuntimelibLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop every kernel still running.
    pub async fn shutdown_all(&self) {
        let refs: Vec<KernelRef> = self.running.lock().await.keys().cloned().collect();
        for kernel_ref in refs {
            if let Err(e) = self.shutdown(&kernel_ref).await {
                warn!("[launcher] Failed to shut down {}: {}", kernel_ref, e);
            }
        }
    }
}

#[async_trait]
impl KernelLauncher for RuntimelibLauncher {
    async fn launch(&self, kernel_name: &str, kernel_ref: &KernelRef) -> Result<LaunchedKernel> {
        let kernelspec = runtimelib::find_kernelspec(kernel_name).await?;

        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(kernel_name.to_string()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("runt-kernel-{}.json", kernel_id));

        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        info!(
            "[launcher] Starting kernel {} ({}) at {:?}",
            kernel_name, kernel_ref, connection_file
        );

        let kernelspec_info = kernelspec_info(kernel_name, &kernelspec.kernelspec);

        let process = kernelspec
            .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))?
            .kill_on_drop(true)
            .spawn()?;

        // Give the kernel a moment to bind its sockets.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let session_id = Uuid::new_v4().to_string();
        let (channels, endpoint) = KernelChannels::pair();
        let tasks = match bridge(&connection_info, &session_id, endpoint).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tokio::fs::remove_file(&connection_file).await.ok();
                return Err(e);
            }
        };

        self.running.lock().await.insert(
            kernel_ref.clone(),
            RunningKernel {
                connection_info,
                connection_file,
                session_id: session_id.clone(),
                tasks,
                _process: process,
            },
        );

        info!("[launcher] Kernel started: {} ({})", kernel_id, kernel_ref);

        Ok(LaunchedKernel {
            kernel: Kernel::new(kernel_ref.clone(), kernel_name, channels).with_session(session_id),
            kernelspec: Some(kernelspec_info),
        })
    }

    async fn shutdown(&self, kernel_ref: &KernelRef) -> Result<()> {
        let Some(running) = self.running.lock().await.remove(kernel_ref) else {
            debug!("[launcher] No running kernel for {}", kernel_ref);
            return Ok(());
        };

        match runtimelib::create_client_control_connection(
            &running.connection_info,
            &running.session_id,
        )
        .await
        {
            Ok(mut control) => {
                let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                control.send(request).await.ok();
            }
            Err(e) => warn!("[launcher] Control connection for shutdown failed: {}", e),
        }

        tokio::fs::remove_file(&running.connection_file).await.ok();
        info!("[launcher] Kernel {} shut down", kernel_ref);
        // Dropping `running` aborts the bridges and kills the process.
        Ok(())
    }
}

/// Connection file for a kernel id, or the argument itself if it already names a `.json` file.
pub fn connection_file_for(kernel_id: &str) -> PathBuf {
    let path = Path::new(kernel_id);
    if path.extension().is_some_and(|ext| ext == "json") {
        return path.to_path_buf();
    }
    runtimelib::dirs::runtime_dir().join(format!("runt-kernel-{}.json", kernel_id))
}

/// Send `interrupt_request` over control to a kernel running elsewhere.
pub async fn interrupt_kernel(connection_file: &Path) -> Result<()> {
    let contents = tokio::fs::read_to_string(connection_file)
        .await
        .with_context(|| format!("reading {}", connection_file.display()))?;
    let connection_info: ConnectionInfo = serde_json::from_str(&contents)?;

    let session_id = Uuid::new_v4().to_string();
    let mut control =
        runtimelib::create_client_control_connection(&connection_info, &session_id).await?;
    let request: JupyterMessage = InterruptRequest {}.into();
    control.send(request).await?;

    info!("[launcher] Sent interrupt_request via {:?}", connection_file);
    Ok(())
}

/// What the notebook records about the kernelspec it was launched from.
fn kernelspec_info(kernel_name: &str, kernelspec: &JupyterKernelspec) -> KernelspecInfo {
    KernelspecInfo {
        name: kernel_name.to_string(),
        display_name: kernelspec.display_name.clone(),
        language: kernelspec.language.clone(),
    }
}

/// Connect to the kernel's sockets and pump messages between them and `endpoint`.
async fn bridge(
    connection_info: &ConnectionInfo,
    session_id: &str,
    endpoint: KernelEndpoint,
) -> Result<Vec<JoinHandle<()>>> {
    let KernelEndpoint {
        mut requests,
        shell: shell_tx,
        iopub: iopub_tx,
    } = endpoint;

    let mut iopub =
        runtimelib::create_client_iopub_connection(connection_info, "", session_id).await?;
    let identity = runtimelib::peer_identity_for_session(session_id)?;
    let shell = runtimelib::create_client_shell_connection_with_identity(
        connection_info,
        session_id,
        identity,
    )
    .await?;
    let (mut shell_writer, mut shell_reader) = shell.split();
    let mut control =
        runtimelib::create_client_control_connection(connection_info, session_id).await?;

    let iopub_task = tokio::spawn(async move {
        loop {
            match iopub.read().await {
                Ok(message) => {
                    let _ = iopub_tx.send(message);
                }
                Err(e) => {
                    error!("[launcher] iopub read error: {}", e);
                    break;
                }
            }
        }
    });

    let shell_task = tokio::spawn(async move {
        loop {
            match shell_reader.read().await {
                Ok(message) => {
                    let _ = shell_tx.send(message);
                }
                Err(e) => {
                    error!("[launcher] shell read error: {}", e);
                    break;
                }
            }
        }
    });

    let request_task = tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            let to_control = matches!(message.channel, Some(Channel::Control));
            let msg_type = message.message_type().to_string();
            let sent = if to_control {
                control.send(message).await
            } else {
                shell_writer.send(message).await
            };
            match sent {
                Ok(()) => debug!("[launcher] Sent {}", msg_type),
                Err(e) => {
                    error!("[launcher] Failed to send {}: {}", msg_type, e);
                    break;
                }
            }
        }
    });

    Ok(vec![iopub_task, shell_task, request_task])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kernelspec_info_from_kernel_json() {
        let kernelspec: JupyterKernelspec = serde_json::from_value(json!({
            "argv": ["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
            "display_name": "Python 3 (ipykernel)",
            "language": "python"
        }))
        .unwrap();
        let info = kernelspec_info("python3", &kernelspec);
        assert_eq!(info.name, "python3");
        assert_eq!(info.display_name, "Python 3 (ipykernel)");
        assert_eq!(info.language, "python");
        // The kernelspec is still usable afterwards.
        assert_eq!(kernelspec.argv.len(), 5);
    }

    #[test]
    fn test_connection_file_for_id_or_path() {
        assert_eq!(
            connection_file_for("calm-otter"),
            runtimelib::dirs::runtime_dir().join("runt-kernel-calm-otter.json")
        );
        assert_eq!(
            connection_file_for("/tmp/kernel-1.json"),
            PathBuf::from("/tmp/kernel-1.json")
        );
    }

    #[tokio::test]
    async fn test_interrupt_needs_a_connection_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("runt-kernel-gone.json");
        let error = interrupt_kernel(&missing).await.unwrap_err();
        assert!(format!("{error:#}").contains("runt-kernel-gone.json"));
    }
}
