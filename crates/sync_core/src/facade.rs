use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use futures::stream::BoxStream;
use shared::{
    domain::{
        ConnectionEpoch, DialogResponse, Program, RequestId, ServerStatus, SidebarInfo,
        StatusSnapshot, TestItemKey, TestStatus,
    },
    error::SyncError,
    protocol::{ConsoleEvent, OrchestratorCommand, TerminalKey, Topic},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    dialog_arbiter::{DialogArbiter, DialogNotice, PendingDialog},
    settings::SyncSettings,
    status_registry::{StatusNotice, StatusRegistry},
    subscription::{lock, Subscription},
    terminal::{TerminalItem, TerminalMultiplexer},
    transport::{
        ChannelTransport, ConnectionHandle, ConnectionState, Connector, EpochTransition,
        InboundFrame, WsConnector,
    },
};

/// Applies inbound console events to the local mirrors.
struct Ingress {
    registry: Arc<StatusRegistry>,
    dialogs: Arc<DialogArbiter>,
    terminal: Arc<TerminalMultiplexer>,
    sidebar: watch::Sender<SidebarInfo>,
    malformed: AtomicU64,
}

impl Ingress {
    fn handle(&self, frame: &InboundFrame) {
        let event = match ConsoleEvent::decode(frame.topic, &frame.payload) {
            Ok(event) => event,
            Err(error) => return self.reject(&error),
        };

        match event {
            ConsoleEvent::StatusUpdate(update) => {
                self.registry.apply(update.key, update.status);
            }
            ConsoleEvent::StatusSnapshot(snapshot) => {
                let changes = self.registry.merge(snapshot.entries);
                debug!(changed = changes.len(), "merged status snapshot");
            }
            ConsoleEvent::ShowDialog(prompt) => {
                if let Err(SyncError::DialogBusy { pending }) =
                    self.dialogs.adopt(prompt.request_id, prompt.request.clone())
                {
                    warn!(%pending, replacement = %prompt.request_id, "orchestrator replaced an open dialog");
                    self.dialogs.dismiss();
                    let _ = self.dialogs.adopt(prompt.request_id, prompt.request);
                }
            }
            ConsoleEvent::HideDialog => {
                self.dialogs.dismiss();
            }
            ConsoleEvent::TerminalOutput(output) => {
                if output.epoch != frame.epoch {
                    debug!(chunk_epoch = %output.epoch, live = %frame.epoch, "dropping stale terminal chunk");
                    return;
                }
                self.terminal.append_at(output.sequence, output.text);
            }
            ConsoleEvent::SidebarField(update) => {
                let mut rejected = None;
                self.sidebar.send_if_modified(|info| {
                    match info.set(update.field, &update.value) {
                        Ok(changed) => changed,
                        Err(err) => {
                            rejected = Some(err);
                            false
                        }
                    }
                });
                if let Some(err) = rejected {
                    self.reject(&SyncError::malformed(frame.topic.as_str(), err));
                }
            }
        }
    }

    fn on_epoch(&self, transition: &EpochTransition) {
        match *transition {
            EpochTransition::Started { epoch, previous } => {
                info!(%epoch, previous = ?previous, "console mirror entering new epoch");
                self.terminal.reset_epoch(epoch);
                self.dialogs.dismiss();
            }
            EpochTransition::Ended { epoch } => {
                debug!(%epoch, "console mirror leaving epoch");
                self.terminal.finalize_epoch();
                self.dialogs.dismiss();
            }
        }
    }

    fn reject(&self, error: &SyncError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(%error, "dropping console event");
    }
}

/// Console-side composition point: mirrors orchestrator state delivered
/// over a [`ChannelTransport`] and sends operator commands back.
///
/// Lifecycle is `new`, `connect`, (use), `disconnect`, `dispose`.
pub struct SyncFacade {
    transport: ChannelTransport,
    ingress: Arc<Ingress>,
    wiring: Mutex<Vec<Subscription>>,
}

impl SyncFacade {
    /// Must be called inside a Tokio runtime.
    pub fn new(settings: SyncSettings, connector: Arc<dyn Connector>) -> Self {
        let ingress = Arc::new(Ingress {
            registry: Arc::new(StatusRegistry::new()),
            dialogs: Arc::new(DialogArbiter::new()),
            terminal: Arc::new(TerminalMultiplexer::new(settings.terminal_retention)),
            sidebar: watch::channel(SidebarInfo::default()).0,
            malformed: AtomicU64::new(0),
        });
        let transport = ChannelTransport::new(settings, connector);

        let mut wiring = Vec::with_capacity(Topic::CONSOLE_BOUND.len() + 1);
        let hook = Arc::clone(&ingress);
        wiring.push(transport.on_epoch_change(move |transition| hook.on_epoch(transition)));
        for topic in Topic::CONSOLE_BOUND {
            let sink = Arc::clone(&ingress);
            wiring.push(transport.subscribe(topic, move |frame| sink.handle(frame)));
        }

        Self {
            transport,
            ingress,
            wiring: Mutex::new(wiring),
        }
    }

    pub fn websocket(settings: SyncSettings) -> Result<Self, SyncError> {
        let connector =
            WsConnector::new(&settings.endpoint_url, settings.outbound_queue_capacity)?;
        Ok(Self::new(settings, Arc::new(connector)))
    }

    pub async fn connect(&self) -> Result<ConnectionHandle, SyncError> {
        self.transport.connect().await
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Disconnects and releases every internal subscription.
    pub async fn dispose(&self) {
        self.transport.dispose().await;
        lock(&self.wiring).clear();
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.ingress.registry.snapshot()
    }

    pub fn status_of(&self, key: &TestItemKey) -> Option<TestStatus> {
        self.ingress.registry.get(key)
    }

    pub fn on_status_change(
        &self,
        callback: impl Fn(&StatusNotice) + Send + Sync + 'static,
    ) -> Subscription {
        self.ingress.registry.watch(callback)
    }

    pub fn on_dialog_request(
        &self,
        callback: impl Fn(&DialogNotice) + Send + Sync + 'static,
    ) -> Subscription {
        self.ingress.dialogs.watch(callback)
    }

    pub fn pending_dialog(&self) -> Option<PendingDialog> {
        self.ingress.dialogs.pending()
    }

    /// Sends the operator's choice. The local dialog closes only if the
    /// response was queued, so a failed send can be retried; a dialog hidden
    /// or replaced concurrently yields `StaleResponse` and nothing is sent.
    pub fn respond_to_dialog(
        &self,
        request_id: RequestId,
        button_label: &str,
    ) -> Result<DialogResponse, SyncError> {
        self.ingress
            .dialogs
            .respond_with(request_id, button_label, |response| {
                self.send(OrchestratorCommand::DialogResponse(response.clone()))
            })
    }

    pub fn cancel_dialog(&self) -> Result<Option<DialogResponse>, SyncError> {
        self.ingress.dialogs.cancel_with(|response| {
            self.send(OrchestratorCommand::DialogResponse(response.clone()))
        })
    }

    pub fn terminal_stream(&self, from: Option<u64>) -> BoxStream<'static, TerminalItem> {
        self.ingress.terminal.subscribe(from)
    }

    pub fn terminal_transcript(&self) -> String {
        self.ingress.terminal.transcript()
    }

    /// Epoch the terminal mirror currently follows.
    pub fn terminal_epoch(&self) -> ConnectionEpoch {
        self.ingress.terminal.epoch()
    }

    pub fn send_key(&self, key: &str) -> Result<(), SyncError> {
        self.send(OrchestratorCommand::TerminalKey(TerminalKey {
            key: key.to_string(),
        }))
    }

    pub fn request_machine_code_set(&self, code: &str) -> Result<(), SyncError> {
        self.send(OrchestratorCommand::SetMachineCode(code.to_string()))
    }

    pub fn set_server_status(&self, status: ServerStatus) -> Result<(), SyncError> {
        self.send(OrchestratorCommand::SetServerStatus(status))
    }

    pub fn select_program(&self, program: Program) -> Result<(), SyncError> {
        self.send(OrchestratorCommand::SelectProgram(program))
    }

    pub fn sidebar_info(&self) -> SidebarInfo {
        self.ingress.sidebar.borrow().clone()
    }

    pub fn watch_sidebar(&self) -> watch::Receiver<SidebarInfo> {
        self.ingress.sidebar.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    /// Inbound frames dropped so far because they failed validation.
    pub fn malformed_payloads(&self) -> u64 {
        self.transport.malformed_frames() + self.ingress.malformed.load(Ordering::Relaxed)
    }

    fn send(&self, command: OrchestratorCommand) -> Result<(), SyncError> {
        let topic = command.topic();
        self.transport.publish(topic, command.payload()?)
    }
}

#[cfg(test)]
#[path = "tests/facade_tests.rs"]
mod tests;
