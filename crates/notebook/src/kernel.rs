//! Kernel handles as the core sees them: channels, status and reported info.
//!
//! The core never talks to sockets. A transport (see `launcher`) or a test
//! kernel owns the far side of [`KernelChannels`] through a
//! [`KernelEndpoint`]: it receives outbound requests and publishes shell
//! replies and iopub messages. Any number of tasks may subscribe to the
//! inbound side; only the execution engine and the lifecycle controller
//! send.

use jupyter_protocol::{Channel, JupyterMessage, JupyterMessageContent, KernelInfoReply};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::ids::KernelRef;

/// Buffer size for each kernel channel.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel channels are closed")]
    ChannelClosed,

    #[error("kernel request queue is full")]
    QueueFull,
}

// ── Channels ────────────────────────────────────────────────────────

/// Core side of one kernel's channels.
#[derive(Debug, Clone)]
pub struct KernelChannels {
    requests: mpsc::Sender<JupyterMessage>,
    shell: broadcast::Sender<JupyterMessage>,
    iopub: broadcast::Sender<JupyterMessage>,
}

/// Kernel side of [`KernelChannels`].
///
/// Requests carry the channel they are meant for; anything not marked
/// [`Channel::Control`] goes to shell.
#[derive(Debug)]
pub struct KernelEndpoint {
    pub requests: mpsc::Receiver<JupyterMessage>,
    pub shell: broadcast::Sender<JupyterMessage>,
    pub iopub: broadcast::Sender<JupyterMessage>,
}

impl KernelChannels {
    /// Connected core and kernel sides.
    pub fn pair() -> (KernelChannels, KernelEndpoint) {
        let (requests_tx, requests_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shell, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (iopub, _) = broadcast::channel(CHANNEL_CAPACITY);

        let channels = KernelChannels {
            requests: requests_tx,
            shell: shell.clone(),
            iopub: iopub.clone(),
        };
        let endpoint = KernelEndpoint {
            requests: requests_rx,
            shell,
            iopub,
        };
        (channels, endpoint)
    }

    pub async fn send(&self, message: JupyterMessage) -> Result<(), KernelError> {
        self.requests
            .send(message)
            .await
            .map_err(|_| KernelError::ChannelClosed)
    }

    /// Queue a request without waiting for room.
    pub fn try_send(&self, message: JupyterMessage) -> Result<(), KernelError> {
        self.requests.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => KernelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => KernelError::ChannelClosed,
        })
    }

    pub fn subscribe_shell(&self) -> broadcast::Receiver<JupyterMessage> {
        self.shell.subscribe()
    }

    pub fn subscribe_iopub(&self) -> broadcast::Receiver<JupyterMessage> {
        self.iopub.subscribe()
    }

    /// The kernel side has gone away.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

impl KernelEndpoint {
    /// Publish a shell reply. Having no subscribers is not an error.
    pub fn reply(&self, message: JupyterMessage) {
        let _ = self.shell.send(message);
    }

    /// Publish an iopub message. Having no subscribers is not an error.
    pub fn publish(&self, message: JupyterMessage) {
        let _ = self.iopub.send(message);
    }
}

/// `msg_id` of the request that caused `message`.
pub fn parent_msg_id(message: &JupyterMessage) -> Option<&str> {
    message.parent_header.as_ref().map(|h| h.msg_id.as_str())
}

pub fn is_reply_to(message: &JupyterMessage, msg_id: &str) -> bool {
    parent_msg_id(message) == Some(msg_id)
}

// ── Kernel ──────────────────────────────────────────────────────────

/// A launched kernel: identity, the session used to address it, and its channels.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub kernel_ref: KernelRef,
    pub name: String,
    pub session: String,
    pub channels: KernelChannels,
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.kernel_ref == other.kernel_ref
            && self.name == other.name
            && self.session == other.session
    }
}

impl Kernel {
    pub fn new(kernel_ref: KernelRef, name: impl Into<String>, channels: KernelChannels) -> Self {
        Kernel {
            kernel_ref,
            name: name.into(),
            session: Uuid::new_v4().to_string(),
            channels,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    /// A shell request in this kernel's session.
    pub fn request(&self, content: impl Into<JupyterMessageContent>) -> JupyterMessage {
        JupyterMessage::new(content, None)
            .with_session(&self.session)
            .with_channel(Channel::Shell)
    }

    /// A control request in this kernel's session.
    pub fn control_request(&self, content: impl Into<JupyterMessageContent>) -> JupyterMessage {
        self.request(content).with_channel(Channel::Control)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    #[default]
    NotConnected,
    Launching,
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::NotConnected => write!(f, "not_connected"),
            KernelStatus::Launching => write!(f, "launching"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

impl KernelStatus {
    /// Map a kernel-reported `execution_state`.
    pub fn from_execution_state(state: &jupyter_protocol::ExecutionState) -> Option<KernelStatus> {
        match state {
            jupyter_protocol::ExecutionState::Busy => Some(KernelStatus::Busy),
            jupyter_protocol::ExecutionState::Idle => Some(KernelStatus::Idle),
            jupyter_protocol::ExecutionState::Starting => Some(KernelStatus::Starting),
            jupyter_protocol::ExecutionState::Restarting => Some(KernelStatus::Restarting),
            jupyter_protocol::ExecutionState::Terminating
            | jupyter_protocol::ExecutionState::Dead => Some(KernelStatus::Dead),
            _ => None,
        }
    }

    /// Executions can only be issued to a kernel that is idle or busy.
    pub fn rejects_execution(&self) -> bool {
        !matches!(self, KernelStatus::Idle | KernelStatus::Busy)
    }
}

// ── Reported info ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelpLink {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: String,
}

/// What a kernel says about itself in `kernel_info_reply`.
///
/// `language_info` is kept as JSON since it lands in notebook metadata as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
    #[serde(default)]
    pub language_info: Value,
}

impl KernelInfo {
    pub fn from_reply(reply: &KernelInfoReply) -> Result<KernelInfo, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(reply)?)
    }

    pub fn language_name(&self) -> Option<&str> {
        self.language_info.get("name").and_then(Value::as_str)
    }
}

/// The kernelspec a notebook records in `metadata.kernelspec`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelspecInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub language: String,
}
