//! An in-process kernel for driving the engine without a real kernel.
//!
//! [`LoopbackKernel`] answers requests on the kernel side of
//! [`KernelChannels`]. Executed code is a tiny line-oriented script:
//!
//! | line | effect |
//! |---|---|
//! | `print TEXT` | stdout stream `TEXT\n` |
//! | `warn TEXT` | stderr stream `TEXT\n` |
//! | `display ID TEXT` | `display_data` with display id `ID` |
//! | `update ID TEXT` | `update_display_data` for `ID` |
//! | `fail TEXT` | `error` output |
//! | `clear` | `clear_output` |
//! | `page TEXT` | pager payload on the reply |
//! | `next TEXT` / `replace TEXT` | `set_next_input` payload |
//! | `sleep MS` | pause before the next line; an interrupt ends the run |
//! | anything else | `execute_result` echoing the line |

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ClearOutput, DisplayData, ErrorOutput, ExecuteInput, ExecuteReply, ExecuteResult,
    ExecutionCount, InterruptReply, JupyterMessage, JupyterMessageContent, KernelInfoReply,
    LanguageInfo, Media, MediaType, Payload, ReplyStatus, ShutdownReply, Status, StreamContent,
    Transient, UpdateDisplayData,
};
use log::debug;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ids::KernelRef;
use crate::kernel::{Kernel, KernelChannels, KernelEndpoint, KernelspecInfo};
use crate::launcher::{KernelLauncher, LaunchedKernel};

#[derive(Debug, Clone)]
pub struct LoopbackKernel {
    /// Reply to `kernel_info_request`. Turn off to exercise handshake timeouts.
    pub answer_kernel_info: bool,
    pub language: String,
}

impl Default for LoopbackKernel {
    fn default() -> Self {
        LoopbackKernel {
            answer_kernel_info: true,
            language: "python".to_string(),
        }
    }
}

/// How one run of a script ended.
enum Run {
    Completed,
    Interrupted,
}

struct Session {
    endpoint: KernelEndpoint,
    /// Requests that arrived while a script was sleeping.
    pending: VecDeque<JupyterMessage>,
    execution_count: usize,
}

impl Session {
    async fn next_request(&mut self) -> Option<JupyterMessage> {
        match self.pending.pop_front() {
            Some(request) => Some(request),
            None => self.endpoint.requests.recv().await,
        }
    }

    fn publish(&self, content: impl Into<JupyterMessageContent>, parent: &JupyterMessage) {
        let message = JupyterMessage::new(content, Some(parent));
        self.endpoint.publish(message);
    }

    fn reply(&self, message: JupyterMessage) {
        self.endpoint.reply(message);
    }

    /// Sleep, unless an interrupt arrives first.
    async fn sleep(&mut self, duration: Duration) -> Run {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Run::Completed,
                request = self.endpoint.requests.recv() => match request {
                    Some(request) if request.message_type() == "interrupt_request" => {
                        self.reply(
                            InterruptReply { status: ReplyStatus::Ok, error: None }
                                .as_child_of(&request),
                        );
                        return Run::Interrupted;
                    }
                    Some(request) => self.pending.push_back(request),
                    None => return Run::Interrupted,
                },
            }
        }
    }
}

impl LoopbackKernel {
    /// Serve `endpoint` until every core-side sender is gone or shutdown is requested.
    pub fn spawn(self, endpoint: KernelEndpoint) -> JoinHandle<()> {
        tokio::spawn(self.serve(endpoint))
    }

    async fn serve(self, endpoint: KernelEndpoint) {
        let mut session = Session {
            endpoint,
            pending: VecDeque::new(),
            execution_count: 0,
        };

        while let Some(request) = session.next_request().await {
            debug!("[loopback] {}", request.message_type());
            match &request.content {
                JupyterMessageContent::ExecuteRequest(execute) => {
                    session.execution_count += 1;
                    let code = execute.code.clone();
                    self.execute(&mut session, &request, &code).await;
                }
                JupyterMessageContent::KernelInfoRequest(_) if self.answer_kernel_info => {
                    session.publish(Status::busy(), &request);
                    session.reply(self.kernel_info().as_child_of(&request));
                    session.publish(Status::idle(), &request);
                }
                JupyterMessageContent::InterruptRequest(_) => {
                    session.reply(
                        InterruptReply {
                            status: ReplyStatus::Ok,
                            error: None,
                        }
                        .as_child_of(&request),
                    );
                }
                JupyterMessageContent::ShutdownRequest(shutdown) => {
                    session.reply(
                        ShutdownReply {
                            restart: shutdown.restart,
                            status: ReplyStatus::Ok,
                            error: None,
                        }
                        .as_child_of(&request),
                    );
                    break;
                }
                _ => {}
            }
        }
    }

    fn kernel_info(&self) -> KernelInfoReply {
        KernelInfoReply {
            status: ReplyStatus::Ok,
            protocol_version: "5.3".to_string(),
            implementation: "loopback".to_string(),
            implementation_version: "1.0".to_string(),
            language_info: LanguageInfo {
                name: self.language.clone(),
                version: "3.12".to_string(),
                mimetype: Some("text/x-python".to_string()),
                file_extension: Some(".py".to_string()),
                pygments_lexer: None,
                codemirror_mode: None,
                nbconvert_exporter: None,
            },
            banner: "loopback kernel".to_string(),
            help_links: Vec::new(),
            debugger: false,
            error: None,
        }
    }

    async fn execute(&self, session: &mut Session, request: &JupyterMessage, code: &str) {
        let execution_count = ExecutionCount::new(session.execution_count);
        let text = |text: &str| Media::from(MediaType::Plain(text.to_string()));

        session.publish(Status::busy(), request);
        session.publish(
            ExecuteInput {
                code: code.to_string(),
                execution_count,
            },
            request,
        );

        let mut payload = Vec::new();
        let mut status = ReplyStatus::Ok;
        for line in code.lines().filter(|l| !l.trim().is_empty()) {
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => session.publish(StreamContent::stdout(&format!("{rest}\n")), request),
                "warn" => session.publish(StreamContent::stderr(&format!("{rest}\n")), request),
                "display" => {
                    let (display_id, shown) = rest.split_once(' ').unwrap_or((rest, ""));
                    session.publish(
                        DisplayData {
                            data: text(shown),
                            metadata: Default::default(),
                            transient: Some(Transient {
                                display_id: Some(display_id.to_string()),
                            }),
                        },
                        request,
                    );
                }
                "update" => {
                    let (display_id, shown) = rest.split_once(' ').unwrap_or((rest, ""));
                    session.publish(UpdateDisplayData::new(text(shown), display_id), request);
                }
                "fail" => session.publish(
                    ErrorOutput {
                        ename: "Error".to_string(),
                        evalue: rest.to_string(),
                        traceback: vec![rest.to_string()],
                    },
                    request,
                ),
                "clear" => session.publish(ClearOutput { wait: false }, request),
                "page" => payload.push(Payload::Page {
                    data: text(rest),
                    start: 0,
                }),
                "next" | "replace" => payload.push(Payload::SetNextInput {
                    text: rest.to_string(),
                    replace: command == "replace",
                }),
                "sleep" => {
                    let ms = rest.trim().parse().unwrap_or(0);
                    if let Run::Interrupted = session.sleep(Duration::from_millis(ms)).await {
                        session.publish(
                            ErrorOutput {
                                ename: "KeyboardInterrupt".to_string(),
                                evalue: String::new(),
                                traceback: vec!["KeyboardInterrupt".to_string()],
                            },
                            request,
                        );
                        status = ReplyStatus::Error;
                        break;
                    }
                }
                _ => session.publish(
                    ExecuteResult {
                        execution_count,
                        data: text(line),
                        metadata: Default::default(),
                        transient: None,
                    },
                    request,
                ),
            }
        }

        session.reply(
            ExecuteReply {
                status,
                execution_count,
                payload,
                ..Default::default()
            }
            .as_child_of(request),
        );
        session.publish(Status::idle(), request);
    }
}

/// A [`KernelLauncher`] that starts [`LoopbackKernel`]s.
#[derive(Default)]
pub struct LoopbackLauncher {
    kernel: LoopbackKernel,
    fail_with: Option<String>,
    delay: Option<Duration>,
    running: Arc<Mutex<Vec<(KernelRef, JoinHandle<()>)>>>,
}

impl LoopbackLauncher {
    pub fn new(kernel: LoopbackKernel) -> Self {
        LoopbackLauncher {
            kernel,
            ..LoopbackLauncher::default()
        }
    }

    /// Refuse every launch with `error`.
    pub fn failing(error: impl Into<String>) -> Self {
        LoopbackLauncher {
            fail_with: Some(error.into()),
            ..LoopbackLauncher::default()
        }
    }

    /// Wait `delay` before answering each launch.
    pub fn delayed(delay: Duration) -> Self {
        LoopbackLauncher {
            delay: Some(delay),
            ..LoopbackLauncher::default()
        }
    }

    /// Refs launched and not yet shut down.
    pub async fn running(&self) -> Vec<KernelRef> {
        self.running
            .lock()
            .await
            .iter()
            .map(|(kernel_ref, _)| kernel_ref.clone())
            .collect()
    }
}

#[async_trait]
impl KernelLauncher for LoopbackLauncher {
    async fn launch(&self, kernel_name: &str, kernel_ref: &KernelRef) -> anyhow::Result<LaunchedKernel> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.fail_with {
            anyhow::bail!("{}", error);
        }

        let (channels, endpoint) = KernelChannels::pair();
        let task = self.kernel.clone().spawn(endpoint);
        self.running.lock().await.push((kernel_ref.clone(), task));

        Ok(LaunchedKernel {
            kernel: Kernel::new(kernel_ref.clone(), kernel_name, channels),
            kernelspec: Some(KernelspecInfo {
                name: kernel_name.to_string(),
                display_name: format!("Loopback ({kernel_name})"),
                language: self.kernel.language.clone(),
            }),
        })
    }

    async fn shutdown(&self, kernel_ref: &KernelRef) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        running.retain(|(r, task)| {
            if r == kernel_ref {
                task.abort();
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::is_reply_to;
    use jupyter_protocol::{ExecuteRequest, ExecutionState, InterruptRequest};

    fn kernel(channels: KernelChannels) -> Kernel {
        Kernel::new(KernelRef::from("k"), "python3", channels)
    }

    #[tokio::test]
    async fn test_loopback_answers_execute() {
        let (channels, endpoint) = KernelChannels::pair();
        let _task = LoopbackKernel::default().spawn(endpoint);
        let mut iopub = channels.subscribe_iopub();
        let mut shell = channels.subscribe_shell();

        let request = kernel(channels.clone()).request(ExecuteRequest::new("print hi".to_string()));
        let msg_id = request.header.msg_id.clone();
        channels.send(request).await.unwrap();

        let mut types = Vec::new();
        loop {
            let message = iopub.recv().await.unwrap();
            assert!(is_reply_to(&message, &msg_id));
            types.push(message.message_type().to_string());
            if let JupyterMessageContent::Status(status) = &message.content {
                if status.execution_state == ExecutionState::Idle {
                    break;
                }
            }
        }
        assert_eq!(types, vec!["status", "execute_input", "stream", "status"]);

        let reply = shell.recv().await.unwrap();
        assert_eq!(reply.message_type(), "execute_reply");
        assert!(is_reply_to(&reply, &msg_id));
    }

    #[tokio::test]
    async fn test_interrupt_ends_a_sleeping_run() {
        let (channels, endpoint) = KernelChannels::pair();
        let _task = LoopbackKernel::default().spawn(endpoint);
        let mut shell = channels.subscribe_shell();
        let kernel = kernel(channels.clone());

        let execute = kernel.request(ExecuteRequest::new("sleep 60000\nprint never".to_string()));
        let execute_id = execute.header.msg_id.clone();
        channels.send(execute).await.unwrap();
        channels
            .send(kernel.control_request(InterruptRequest {}))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let message = shell.recv().await.unwrap();
                if is_reply_to(&message, &execute_id) {
                    return message;
                }
            }
        })
        .await
        .expect("execute_reply after interrupt");
        match reply.content {
            JupyterMessageContent::ExecuteReply(reply) => {
                assert_eq!(reply.status, ReplyStatus::Error)
            }
            other => panic!("expected execute_reply, got {:?}", other),
        }
    }
}
