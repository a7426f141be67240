use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use shared::{
    domain::{
        ConnectionEpoch, DialogRequest, DialogResponse, Program, RequestId, ServerStatus,
        SidebarField, SidebarInfo, StatusSnapshot, TestItemKey, TestStatus,
    },
    error::SyncError,
    protocol::{
        ConsoleEvent, DialogPrompt, OrchestratorCommand, SidebarFieldUpdate,
        StatusSnapshotPayload, StatusUpdate, TerminalOutput, WireFrame,
    },
};
use sync_core::{
    Connector, DialogArbiter, Link, PendingDialog, StatusRegistry, TerminalChunk,
    TerminalMultiplexer,
};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::HubSettings;

/// How a raised dialog ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogOutcome {
    Chosen(String),
    Cancelled,
    /// Hidden by the orchestrator before anyone answered.
    Dismissed,
}

impl DialogOutcome {
    pub fn chosen(&self) -> Option<&str> {
        match self {
            DialogOutcome::Chosen(label) => Some(label),
            _ => None,
        }
    }
}

/// Claim on the outcome of one dialog raised through the hub.
#[derive(Debug)]
pub struct DialogTicket {
    pub request_id: RequestId,
    outcome: oneshot::Receiver<DialogOutcome>,
}

impl DialogTicket {
    pub async fn outcome(self) -> DialogOutcome {
        self.outcome.await.unwrap_or(DialogOutcome::Dismissed)
    }
}

/// State a console receives when it attaches, followed by live events.
pub struct Attachment {
    pub replay: Vec<ConsoleEvent>,
    pub events: broadcast::Receiver<ConsoleEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orchestrator-side endpoint: the single writer of status, dialogs and
/// terminal output, fanning them out to every attached console.
///
/// Every mutation and its broadcast happen under one sequencer lock, and
/// [`OrchestratorHub::attach`] takes the same lock, so a console's replay
/// and its live events never overlap or leave a hole.
pub struct OrchestratorHub {
    settings: HubSettings,
    sequencer: Mutex<()>,
    registry: StatusRegistry,
    dialogs: DialogArbiter,
    terminal: TerminalMultiplexer,
    sidebar: watch::Sender<SidebarInfo>,
    program: Mutex<Option<Program>>,
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<DialogOutcome>>>,
    events: broadcast::Sender<ConsoleEvent>,
    commands: broadcast::Sender<OrchestratorCommand>,
    kick: watch::Sender<u64>,
    connections: AtomicUsize,
}

impl OrchestratorHub {
    pub fn new(settings: HubSettings) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (commands, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            terminal: TerminalMultiplexer::new(settings.terminal_retention),
            settings,
            sequencer: Mutex::new(()),
            registry: StatusRegistry::new(),
            dialogs: DialogArbiter::new(),
            sidebar: watch::channel(SidebarInfo::default()).0,
            program: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            events,
            commands,
            kick: watch::channel(0).0,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Stores `status` and tells every console, including when a fresh key
    /// first appears as `untested`.
    pub fn set_status(&self, key: impl Into<TestItemKey>, status: TestStatus) {
        let key = key.into();
        let _seq = lock(&self.sequencer);
        if self.registry.write(key.clone(), status).is_visible() {
            self.broadcast(ConsoleEvent::StatusUpdate(StatusUpdate { key, status }));
        }
    }

    /// Puts every listed item back to `untested`, e.g. before a new unit.
    pub fn reset_statuses<K: Into<TestItemKey>>(&self, keys: impl IntoIterator<Item = K>) {
        for key in keys {
            self.set_status(key, TestStatus::Untested);
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.registry.snapshot()
    }

    pub fn show_dialog(&self, request: DialogRequest) -> Result<DialogTicket, SyncError> {
        let _seq = lock(&self.sequencer);
        let request_id = self.dialogs.request(request.clone())?;
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(request_id, tx);
        self.broadcast(ConsoleEvent::ShowDialog(DialogPrompt {
            request_id,
            request,
        }));
        Ok(DialogTicket {
            request_id,
            outcome: rx,
        })
    }

    /// Raises a dialog and waits until an operator answers it or the
    /// orchestrator cancels or hides it. There is no timeout.
    pub async fn show_dialog_and_wait(
        &self,
        request: DialogRequest,
    ) -> Result<DialogOutcome, SyncError> {
        let ticket = self.show_dialog(request)?;
        Ok(ticket.outcome().await)
    }

    pub fn pending_dialog(&self) -> Option<PendingDialog> {
        self.dialogs.pending()
    }

    /// Closes the open dialog without an answer.
    pub fn hide_dialog(&self) -> Option<RequestId> {
        let _seq = lock(&self.sequencer);
        let request_id = self.dialogs.dismiss()?;
        self.resolve(request_id, DialogOutcome::Dismissed);
        self.broadcast(ConsoleEvent::HideDialog);
        Some(request_id)
    }

    /// Resolves the open dialog as cancelled on behalf of the operator.
    pub fn cancel_dialog(&self) -> Option<DialogResponse> {
        let _seq = lock(&self.sequencer);
        let response = self.dialogs.cancel()?;
        self.resolve(response.request_id, DialogOutcome::Cancelled);
        self.broadcast(ConsoleEvent::HideDialog);
        Some(response)
    }

    pub fn terminal_write(&self, text: impl Into<String>) -> TerminalChunk {
        let _seq = lock(&self.sequencer);
        let chunk = self.terminal.append(text);
        self.broadcast(ConsoleEvent::TerminalOutput(TerminalOutput {
            sequence: chunk.sequence,
            epoch: chunk.epoch,
            text: chunk.text.clone(),
        }));
        chunk
    }

    pub fn terminal_transcript(&self) -> String {
        self.terminal.transcript()
    }

    /// Stores one sidebar field. Returns whether the value changed.
    pub fn set_sidebar_field(&self, field: SidebarField, value: &str) -> Result<bool, SyncError> {
        let _seq = lock(&self.sequencer);
        self.store_sidebar_field(field, value)
    }

    pub fn set_machine_code(&self, code: &str) -> bool {
        self.set_sidebar_field(SidebarField::MachineCode, code)
            .unwrap_or(false)
    }

    pub fn set_server_status(&self, status: ServerStatus) -> bool {
        self.set_sidebar_field(SidebarField::ServerStatus, status.as_str())
            .unwrap_or(false)
    }

    pub fn set_upload_count(&self, count: u32) -> bool {
        self.set_sidebar_field(SidebarField::UploadCount, &count.to_string())
            .unwrap_or(false)
    }

    pub fn increment_upload_count(&self) -> u32 {
        let _seq = lock(&self.sequencer);
        let next = self.sidebar.borrow().upload_count.saturating_add(1);
        let _ = self.store_sidebar_field(SidebarField::UploadCount, &next.to_string());
        next
    }

    pub fn set_current_device(&self, device: &str) -> bool {
        self.set_sidebar_field(SidebarField::CurrentDevice, device)
            .unwrap_or(false)
    }

    pub fn set_serial_number(&self, serial: &str) -> bool {
        self.set_sidebar_field(SidebarField::SerialNumber, serial)
            .unwrap_or(false)
    }

    pub fn set_target_ip(&self, ip: &str) -> bool {
        self.set_sidebar_field(SidebarField::TargetIp, ip)
            .unwrap_or(false)
    }

    pub fn sidebar_info(&self) -> SidebarInfo {
        self.sidebar.borrow().clone()
    }

    pub fn watch_sidebar(&self) -> watch::Receiver<SidebarInfo> {
        self.sidebar.subscribe()
    }

    /// Program the operator picked, once selected.
    pub fn program(&self) -> Option<Program> {
        *lock(&self.program)
    }

    /// Commands sent by consoles, after the hub has applied them.
    pub fn subscribe_commands(&self) -> broadcast::Receiver<OrchestratorCommand> {
        self.commands.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Forces every attached console to reconnect and resync.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    /// Snapshot for a newly attached console: full status, every sidebar
    /// field, the open dialog, then the retained terminal backlog.
    pub fn attach(&self) -> Attachment {
        let _seq = lock(&self.sequencer);
        let mut replay = vec![ConsoleEvent::StatusSnapshot(StatusSnapshotPayload {
            entries: self.registry.snapshot(),
        })];
        let sidebar = self.sidebar.borrow().clone();
        replay.extend(SidebarField::ALL.into_iter().map(|field| {
            ConsoleEvent::SidebarField(SidebarFieldUpdate {
                field,
                value: sidebar.value_of(field),
            })
        }));
        if let Some(pending) = self.dialogs.pending() {
            replay.push(ConsoleEvent::ShowDialog(DialogPrompt {
                request_id: pending.request_id,
                request: pending.request,
            }));
        }
        replay.extend(self.terminal.backlog().into_iter().map(|chunk| {
            ConsoleEvent::TerminalOutput(TerminalOutput {
                sequence: chunk.sequence,
                epoch: chunk.epoch,
                text: chunk.text,
            })
        }));
        Attachment {
            replay,
            events: self.events.subscribe(),
        }
    }

    /// Serves one console over `link` until either side goes away.
    pub async fn serve_link(self: Arc<Self>, epoch: ConnectionEpoch, link: Link) {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let Attachment { replay, mut events } = self.attach();
        let mut stamper = Stamper::new(epoch);
        let mut kick = self.kick.subscribe();
        kick.borrow_and_update();

        let attached = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%epoch, consoles = attached, replayed = replay.len(), "console attached");

        'serve: {
            for event in replay {
                if !send_stamped(&outbound, &mut stamper, event).await {
                    break 'serve;
                }
            }
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !send_stamped(&outbound, &mut stamper, event).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%epoch, skipped, "console lagged behind; dropping it to force a resync");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    frame = inbound.recv() => match frame {
                        Some(text) => self.ingest(epoch, &text),
                        None => break,
                    },
                    _ = kick.changed() => {
                        info!(%epoch, "dropping console on request");
                        break;
                    }
                }
            }
        }

        let remaining = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(%epoch, consoles = remaining, "console detached");
    }

    fn ingest(&self, epoch: ConnectionEpoch, text: &str) {
        let frame = match WireFrame::decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%epoch, %error, "dropping console frame");
                return;
            }
        };
        if frame.epoch.is_some_and(|tagged| tagged != epoch) {
            debug!(%epoch, topic = %frame.topic, "dropping stale-epoch console frame");
            return;
        }
        match OrchestratorCommand::from_frame(&frame) {
            Ok(command) => self.handle_command(command),
            Err(error) => warn!(%epoch, %error, "dropping console frame"),
        }
    }

    /// Applies a console command and forwards it to command subscribers.
    pub fn handle_command(&self, command: OrchestratorCommand) {
        match &command {
            OrchestratorCommand::DialogResponse(response) => {
                let _seq = lock(&self.sequencer);
                match self
                    .dialogs
                    .respond(response.request_id, response.button_label.clone())
                {
                    Ok(accepted) => {
                        let outcome = if accepted.is_cancel() {
                            DialogOutcome::Cancelled
                        } else {
                            DialogOutcome::Chosen(accepted.button_label)
                        };
                        self.resolve(response.request_id, outcome);
                        self.broadcast(ConsoleEvent::HideDialog);
                    }
                    Err(error) => {
                        debug!(%error, "ignoring dialog response");
                        return;
                    }
                }
            }
            OrchestratorCommand::SetMachineCode(code) => {
                let _seq = lock(&self.sequencer);
                let _ = self.store_sidebar_field(SidebarField::MachineCode, code);
            }
            OrchestratorCommand::SetServerStatus(status) => {
                let _seq = lock(&self.sequencer);
                let _ = self.store_sidebar_field(SidebarField::ServerStatus, status.as_str());
            }
            OrchestratorCommand::SelectProgram(program) => {
                *lock(&self.program) = Some(*program);
                info!(?program, "program selected");
            }
            OrchestratorCommand::TerminalKey(_) => {}
        }
        let _ = self.commands.send(command);
    }

    fn store_sidebar_field(&self, field: SidebarField, value: &str) -> Result<bool, SyncError> {
        let mut outcome = Ok(false);
        self.sidebar.send_if_modified(|info| {
            outcome = info.set(field, value);
            matches!(outcome, Ok(true))
        });
        let changed =
            outcome.map_err(|err| SyncError::malformed("sidebar-field-update", err))?;
        if changed {
            self.broadcast(ConsoleEvent::SidebarField(SidebarFieldUpdate {
                field,
                value: self.sidebar.borrow().value_of(field),
            }));
        }
        Ok(changed)
    }

    fn resolve(&self, request_id: RequestId, outcome: DialogOutcome) {
        if let Some(waiter) = lock(&self.waiters).remove(&request_id) {
            let _ = waiter.send(outcome);
        }
    }

    fn broadcast(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }
}

/// Rewrites terminal chunks into the per-connection numbering a console
/// expects: sequence 0 at attach time, tagged with the console's epoch.
struct Stamper {
    epoch: ConnectionEpoch,
    next_terminal: u64,
}

impl Stamper {
    fn new(epoch: ConnectionEpoch) -> Self {
        Self {
            epoch,
            next_terminal: 0,
        }
    }

    fn encode(&mut self, event: ConsoleEvent) -> Result<String, SyncError> {
        let event = match event {
            ConsoleEvent::TerminalOutput(mut output) => {
                output.sequence = self.next_terminal;
                output.epoch = self.epoch;
                self.next_terminal += 1;
                ConsoleEvent::TerminalOutput(output)
            }
            other => other,
        };
        event.to_frame(Some(self.epoch))?.encode()
    }
}

async fn send_stamped(
    outbound: &tokio::sync::mpsc::Sender<String>,
    stamper: &mut Stamper,
    event: ConsoleEvent,
) -> bool {
    match stamper.encode(event) {
        Ok(text) => outbound.send(text).await.is_ok(),
        Err(error) => {
            warn!(%error, "skipping unencodable console event");
            true
        }
    }
}

/// In-process link to a hub, for consoles living in the same process.
pub struct HubConnector {
    hub: Arc<OrchestratorHub>,
}

impl HubConnector {
    pub fn new(hub: Arc<OrchestratorHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn open(&self, epoch: ConnectionEpoch) -> Result<Link, SyncError> {
        let (console_end, hub_end) = Link::pair(self.hub.settings().link_capacity);
        tokio::spawn(Arc::clone(&self.hub).serve_link(epoch, hub_end));
        Ok(console_end)
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
