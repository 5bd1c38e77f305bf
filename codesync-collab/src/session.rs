//! Collaboration session: one event loop per open project.
//!
//! ## Architecture
//!
//! ```text
//!  SessionHandle ──cmd──┐
//!                       ▼
//!  Transport ──feed──► run loop ──► SessionState ──► EditorSurface
//!                       ▲  │          (presence, cursors, buffers,
//!  debounce / notice ───┘  │           propagator, saves, chat)
//!  poll tick ──────────────┘               │
//!                                          ▼ outbox
//!                                      Transport ──► relay
//! ```
//!
//! All session state is owned by the loop task; nothing here is shared
//! or locked. [`SessionState`] is the synchronous core and can be driven
//! directly in tests.

use std::future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::buffer::{OpenBuffer, OpenBuffers};
use crate::bus::{CollabEvent, EventBus, Subscription};
use crate::chat::{ChatEntry, ChatLog};
use crate::client::{ConnectionState, Transport};
use crate::config::CollabConfig;
use crate::cursor::{CursorAction, CursorSource, CursorSynchronizer, Decoration};
use crate::error::{Ignored, SessionError};
use crate::presence::{PresenceAction, PresenceChange, PresenceDirectory, RosterEntry};
use crate::propagator::CodeChangePropagator;
use crate::protocol::{
    Envelope, EnvelopeCodec, EnvelopeKind, FileId, ParticipantId, Payload, ProjectId,
    SessionIdentity,
};
use crate::save::{SaveNotice, SaveNotifier};
use crate::store::FileStore;

// ───────────────────────────────────────────────────────────────────
// Rendering seam
// ───────────────────────────────────────────────────────────────────

/// What the session needs from the editor UI.
///
/// Called from the session loop only, one call at a time.
pub trait EditorSurface: Send + 'static {
    /// Replace all collaborator decorations for the active file.
    fn render_decorations(&mut self, file_id: Option<&FileId>, decorations: &[Decoration]);

    /// Replace the editor text of the (active) file.
    fn replace_visible_text(&mut self, file_id: &FileId, content: &str);

    fn show_notice(&mut self, notice: &SaveNotice);

    fn dismiss_notice(&mut self, _notice_id: u64) {}

    fn roster_changed(&mut self, roster: &[RosterEntry]);

    /// Connection indicator: connected or not, nothing finer.
    fn connection_changed(&mut self, connected: bool);

    fn chat_received(&mut self, _entry: &ChatEntry) {}

    /// Current editor cursor, read by the poll fallback.
    fn cursor_position(&self) -> Option<(FileId, u32, u32)> {
        None
    }
}

/// Point-in-time copy of session state for the UI.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub roster: Vec<RosterEntry>,
    pub buffers: Vec<OpenBuffer>,
    pub active_file: Option<FileId>,
    pub decorations: Vec<Decoration>,
    pub notices: Vec<SaveNotice>,
    pub chat: Vec<ChatEntry>,
    pub pending_change: Option<FileId>,
}

impl SessionSnapshot {
    /// Open buffer for `file_id`, if any.
    pub fn buffer(&self, file_id: &FileId) -> Option<&OpenBuffer> {
        self.buffers.iter().find(|b| &b.file_id == file_id)
    }

    /// Roster ids, self first.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.roster
            .iter()
            .map(|entry| entry.participant.id.clone())
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Synchronous core
// ───────────────────────────────────────────────────────────────────

fn absorbed(what: &str, reason: Ignored) {
    log::debug!("Ignored {what}: {reason}");
}

/// The state containers of one session and the reducers that route
/// events and commands through them. Outbound frames collect in an outbox.
pub struct SessionState {
    codec: EnvelopeCodec,
    presence: PresenceDirectory,
    cursors: CursorSynchronizer,
    buffers: OpenBuffers,
    propagator: CodeChangePropagator,
    saves: SaveNotifier,
    chat: ChatLog,
    connected: bool,
    outbox: Vec<String>,
}

impl SessionState {
    /// Fresh state: disconnected, no tabs, empty roster.
    pub fn new(identity: SessionIdentity, config: &CollabConfig) -> Self {
        let local_id = identity.user_id.clone();
        Self {
            presence: PresenceDirectory::new(&identity),
            cursors: CursorSynchronizer::new(local_id.clone(), identity.user_name.clone()),
            buffers: OpenBuffers::new(),
            propagator: CodeChangePropagator::new(local_id.clone(), config.debounce()),
            saves: SaveNotifier::new(local_id.clone(), config.notice_ttl()),
            chat: ChatLog::new(local_id, config.chat_history),
            codec: EnvelopeCodec::new(identity),
            connected: false,
            outbox: Vec::new(),
        }
    }

    /// Who this session speaks as.
    pub fn identity(&self) -> &SessionIdentity {
        self.codec.identity()
    }

    /// Whether the transport last reported an open socket.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn buffers(&self) -> &OpenBuffers {
        &self.buffers
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.presence
    }

    pub fn cursors(&self) -> &CursorSynchronizer {
        &self.cursors
    }

    /// Frames encoded since the last call, oldest first.
    pub fn take_outbox(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    fn send(&mut self, payload: Payload) {
        let kind = payload.kind();
        match self.codec.encode(payload) {
            Ok(frame) => self.outbox.push(frame),
            Err(e) => log::error!("Failed to encode {kind}: {e}"),
        }
    }

    fn send_all(&mut self, payloads: Vec<Payload>) {
        for payload in payloads {
            self.send(payload);
        }
    }

    fn render_roster(&self, surface: &mut dyn EditorSurface) {
        surface.roster_changed(&self.presence.snapshot());
    }

    fn render_decorations(&self, surface: &mut dyn EditorSurface) {
        surface.render_decorations(self.cursors.active_file(), self.cursors.decorations());
    }

    /// Tell everyone which file we are in, and record it locally.
    fn announce_selection(&mut self) {
        let Some(active) = self.buffers.active() else {
            return;
        };
        let file_id = active.file_id.clone();
        let file_name = active.file_name.clone();
        let stamp = self.codec.stamp();
        let location = self.presence.local_location(&file_id, &file_name, 1, 1, stamp);
        if let Err(reason) = self.presence.apply(PresenceAction::SetLocation(location)) {
            absorbed("local selection", reason);
        }
        self.send(Payload::FileSelection { file_id, file_name });
    }

    fn activated(&mut self, surface: &mut dyn EditorSurface) {
        let active = self.buffers.active_id().cloned();
        match self.cursors.apply(CursorAction::Activate(active)) {
            Ok(_) => self.render_decorations(surface),
            Err(reason) => absorbed("activate", reason),
        }
        self.announce_selection();
        self.render_roster(surface);
    }

    // ── transport events ─────────────────────────────────────────

    /// Apply one transport event.
    pub fn handle_event(&mut self, event: CollabEvent, surface: &mut dyn EditorSurface, now: Instant) {
        match event {
            CollabEvent::Connected { project_id } => {
                log::info!("Session connected to project {project_id}");
                self.connected = true;
                surface.connection_changed(true);
                self.announce_selection();
            }
            CollabEvent::Disconnected { code, reason } => {
                log::info!("Session disconnected ({code}): {reason}");
                self.connected = false;
                surface.connection_changed(false);
                if let Ok(PresenceChange::RosterChanged { .. }) =
                    self.presence.apply(PresenceAction::Clear)
                {
                    self.render_roster(surface);
                }
                if let Ok(true) = self.cursors.apply(CursorAction::ClearRemote) {
                    self.render_decorations(surface);
                }
            }
            CollabEvent::Reconnecting { attempt, delay } => {
                log::debug!("Session waiting {delay:?} before reconnect attempt {attempt}");
            }
            CollabEvent::Error { message, terminal } => {
                if terminal {
                    log::error!("Collaboration unavailable: {message}");
                    self.connected = false;
                    surface.connection_changed(false);
                } else {
                    log::warn!("Transport error: {message}");
                }
            }
            CollabEvent::Inbound(envelope) => self.handle_envelope(&envelope, surface, now),
        }
    }

    /// Route one inbound envelope to its consumers.
    pub fn handle_envelope(&mut self, envelope: &Envelope, surface: &mut dyn EditorSurface, now: Instant) {
        let kind = envelope.kind();
        log::trace!("Inbound {kind} from {}", envelope.user_id);

        match kind {
            EnvelopeKind::UserJoined
            | EnvelopeKind::UserLeft
            | EnvelopeKind::UsersList
            | EnvelopeKind::FileSelection
            | EnvelopeKind::UserTyping => self.handle_presence(envelope, surface),

            EnvelopeKind::CursorPosition => {
                let buffers = &self.buffers;
                match self
                    .presence
                    .apply_remote(envelope, |id| buffers.file_name(id).map(str::to_string))
                {
                    Ok(_) => self.render_roster(surface),
                    Err(reason) => absorbed("cursor location", reason),
                }
                match self.cursors.apply_remote(envelope) {
                    Ok(true) => self.render_decorations(surface),
                    Ok(false) => {}
                    Err(reason) => absorbed("cursor", reason),
                }
            }

            EnvelopeKind::CodeChange => {
                match self.propagator.apply_remote(envelope, &mut self.buffers) {
                    Ok(update) if update.visible => {
                        surface.replace_visible_text(&update.file_id, &update.content)
                    }
                    Ok(_) => {}
                    Err(reason) => absorbed("code change", reason),
                }
            }

            EnvelopeKind::FileSaved => {
                match self.saves.apply_remote(envelope, &mut self.buffers, now) {
                    Ok(saved) => {
                        if let Some(stopped) = self.propagator.cancel_file(&saved.update.file_id) {
                            self.send(stopped);
                        }
                        if saved.update.visible {
                            surface.replace_visible_text(&saved.update.file_id, &saved.update.content);
                        }
                        surface.show_notice(&saved.notice);
                    }
                    Err(reason) => absorbed("file save", reason),
                }
            }

            EnvelopeKind::ChatMessage => match self.chat.apply_remote(envelope) {
                Ok(entry) => surface.chat_received(entry),
                Err(reason) => absorbed("chat", reason),
            },
        }
    }

    fn handle_presence(&mut self, envelope: &Envelope, surface: &mut dyn EditorSurface) {
        let buffers = &self.buffers;
        let change = self
            .presence
            .apply_remote(envelope, |id| buffers.file_name(id).map(str::to_string));

        match change {
            Ok(change) => {
                self.render_roster(surface);
                if let (PresenceChange::RosterChanged { .. }, EnvelopeKind::UsersList) =
                    (change, envelope.kind())
                {
                    let keep = self
                        .presence
                        .snapshot()
                        .into_iter()
                        .map(|entry| entry.participant.id)
                        .collect();
                    if let Ok(true) = self.cursors.apply(CursorAction::Retain(keep)) {
                        self.render_decorations(surface);
                    }
                }
            }
            Err(reason) => absorbed(envelope.kind().as_str(), reason),
        }

        // Cursors are tracked for participants the roster may not know.
        if envelope.kind() == EnvelopeKind::UserLeft {
            match self.cursors.apply_remote(envelope) {
                Ok(true) => self.render_decorations(surface),
                Ok(false) => {}
                Err(reason) => absorbed("cursor removal", reason),
            }
        }

        // A newcomer learns where we are.
        if let Payload::UserJoined { user } = &envelope.payload {
            let local_id = &self.identity().user_id;
            if &user.id != local_id && !envelope.is_from(local_id) {
                self.announce_selection();
            }
        }
    }

    // ── UI commands ──────────────────────────────────────────────

    /// Open (or re-focus) a tab and make it active.
    pub fn open_file(&mut self, buffer: OpenBuffer, surface: &mut dyn EditorSurface) {
        log::debug!("Opening {} ({})", buffer.file_name, buffer.file_id);
        self.buffers.open(buffer);
        self.activated(surface);
    }

    /// Close a tab. A pending edit for it is broadcast first.
    pub fn close_file(&mut self, file_id: &FileId, surface: &mut dyn EditorSurface) {
        if self.propagator.pending_file() == Some(file_id) {
            let flushed = self.propagator.flush();
            self.send_all(flushed);
        }
        let was_active = self.buffers.is_active(file_id);
        if self.buffers.close(file_id).is_none() {
            absorbed("close", Ignored::FileNotOpen);
            return;
        }
        if was_active {
            self.activated(surface);
        }
    }

    /// Make an open tab active and announce it.
    pub fn activate_file(&mut self, file_id: &FileId, surface: &mut dyn EditorSurface) {
        match self.buffers.activate(file_id) {
            Ok(()) => self.activated(surface),
            Err(reason) => absorbed("activate", reason),
        }
    }

    /// A local keystroke-level edit (full new content).
    pub fn local_edit(&mut self, file_id: &FileId, content: String, now: Instant) {
        if let Err(reason) = self.buffers.local_edit(file_id, content.clone()) {
            absorbed("local edit", reason);
            return;
        }
        let outgoing = self.propagator.local_edit(file_id, content, now);
        self.send_all(outgoing);
    }

    /// Local cursor movement from any source.
    pub fn cursor_moved(
        &mut self,
        file_id: &FileId,
        line: u32,
        column: u32,
        source: CursorSource,
        surface: &mut dyn EditorSurface,
    ) {
        let Some(file_name) = self.buffers.file_name(file_id).map(str::to_string) else {
            absorbed("cursor move", Ignored::FileNotOpen);
            return;
        };
        let stamp = self.codec.stamp();
        let payload = match self.cursors.move_local(file_id, line, column, source, stamp) {
            Ok(payload) => payload,
            Err(Ignored::Unchanged) => return,
            Err(reason) => {
                absorbed("cursor move", reason);
                return;
            }
        };
        self.send(payload);
        self.render_decorations(surface);

        let location = self
            .presence
            .local_location(file_id, &file_name, line, column, stamp);
        if self.presence.apply(PresenceAction::SetLocation(location)).is_ok() {
            self.render_roster(surface);
        }
    }

    /// Poll fallback: read the editor cursor and treat it as a movement.
    pub fn poll_cursor(&mut self, surface: &mut dyn EditorSurface) {
        if let Some((file_id, line, column)) = surface.cursor_position() {
            self.cursor_moved(&file_id, line, column, CursorSource::Poll, surface);
        }
    }

    /// Content to persist for `file_id`.
    pub fn content_to_save(&self, file_id: &FileId) -> Result<String, SessionError> {
        self.buffers
            .get(file_id)
            .map(|buffer| buffer.content.clone())
            .ok_or_else(|| SessionError::FileNotOpen(file_id.clone()))
    }

    /// The store accepted the content: mark saved and broadcast.
    pub fn file_persisted(&mut self, file_id: &FileId) -> Result<(), SessionError> {
        let payload = self
            .saves
            .local_saved(&mut self.buffers, file_id)
            .map_err(|_| SessionError::FileNotOpen(file_id.clone()))?;
        if let Some(stopped) = self.propagator.cancel_file(file_id) {
            self.send(stopped);
        }
        log::info!("Saved {file_id}");
        self.send(payload);
        Ok(())
    }

    /// Record a local chat message and queue its broadcast.
    pub fn send_chat(&mut self, message: String, surface: &mut dyn EditorSurface) {
        let envelope = self.codec.envelope(Payload::ChatMessage {
            message: message.clone(),
        });
        let entry = self.chat.push(ChatEntry {
            from: envelope.user_id.clone(),
            from_name: envelope.user_name.clone(),
            message,
            timestamp: envelope.timestamp,
        });
        surface.chat_received(entry);
        match envelope.encode() {
            Ok(frame) => self.outbox.push(frame),
            Err(e) => log::error!("Failed to encode chat message: {e}"),
        }
    }

    // ── timers ───────────────────────────────────────────────────

    /// Earliest pending timer (debounce flush or notice expiry).
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.propagator.deadline(), self.saves.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer due at `now`.
    pub fn tick(&mut self, now: Instant, surface: &mut dyn EditorSurface) {
        let due = self.propagator.poll_due(now);
        self.send_all(due);
        for notice in self.saves.expire(now) {
            surface.dismiss_notice(notice.id);
        }
    }

    /// Cancel timers and pending broadcasts.
    pub fn shutdown(&mut self) {
        self.propagator.cancel();
        self.saves.clear();
        self.outbox.clear();
    }

    /// Copy of the state the UI renders from.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connected: self.connected,
            roster: self.presence.snapshot(),
            buffers: self.buffers.iter().cloned().collect(),
            active_file: self.buffers.active_id().cloned(),
            decorations: self.cursors.decorations().to_vec(),
            notices: self.saves.notices().cloned().collect(),
            chat: self.chat.entries().cloned().collect(),
            pending_change: self.propagator.pending_file().cloned(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Runtime
// ───────────────────────────────────────────────────────────────────

/// Commands from the UI to the session loop.
pub enum SessionCommand {
    OpenFile {
        file_id: FileId,
        file_name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    CloseFile {
        file_id: FileId,
    },
    ActivateFile {
        file_id: FileId,
    },
    LocalEdit {
        file_id: FileId,
        content: String,
    },
    CursorMoved {
        file_id: FileId,
        line: u32,
        column: u32,
        source: CursorSource,
    },
    SaveFile {
        file_id: FileId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SendChat {
        message: String,
    },
    Roster {
        reply: oneshot::Sender<Vec<RosterEntry>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct CollabSession;

impl CollabSession {
    /// Connect to the project and spawn the session loop.
    pub async fn start<S: EditorSurface>(
        identity: SessionIdentity,
        config: CollabConfig,
        store: Arc<dyn FileStore>,
        surface: S,
    ) -> Result<SessionHandle, SessionError> {
        let bus = EventBus::new(config.bus_capacity);
        let (feed, events) = mpsc::channel(config.inbound_capacity.max(1));
        let mut transport = Transport::new(config.clone(), bus.clone()).with_feed(feed);
        transport
            .connect(&identity.project_id, &identity.user_id, &identity.user_name)
            .await?;

        let (tx, rx) = mpsc::channel(64);
        let project_id = identity.project_id.clone();
        let connection = transport.watch_state();
        let session = SessionLoop {
            state: SessionState::new(identity, &config),
            config,
            transport,
            store,
            surface,
            commands: rx,
            events,
        };
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            project_id,
            tx,
            bus,
            connection,
            task: Some(task),
        })
    }
}

struct SessionLoop<S> {
    state: SessionState,
    config: CollabConfig,
    transport: Transport,
    store: Arc<dyn FileStore>,
    surface: S,
    commands: mpsc::Receiver<SessionCommand>,
    /// Every transport event, in order. Never lossy.
    events: mpsc::Receiver<CollabEvent>,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

impl<S: EditorSurface> SessionLoop<S> {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.config.cursor_poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.reset();

        loop {
            let deadline = self.state.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { reply }) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                event = self.events.recv() => match event {
                    Some(event) => self.state.handle_event(event, &mut self.surface, Instant::now()),
                    None => {
                        log::error!("Transport feed closed, ending session");
                        self.stop().await;
                        return;
                    }
                },
                _ = until(deadline) => self.state.tick(Instant::now(), &mut self.surface),
                _ = poll.tick() => self.state.poll_cursor(&mut self.surface),
            }
            self.flush_outbox();
        }
    }

    fn flush_outbox(&mut self) {
        for frame in self.state.take_outbox() {
            self.transport.send(frame);
        }
    }

    async fn stop(&mut self) {
        self.state.shutdown();
        // Unblocks a reader waiting for feed capacity.
        self.events.close();
        self.transport.disconnect().await;
        log::info!("Session for project {} closed", self.state.identity().project_id);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        let surface = &mut self.surface;
        match command {
            SessionCommand::OpenFile {
                file_id,
                file_name,
                reply,
            } => {
                let result = if self.state.buffers().is_open(&file_id) {
                    self.state.activate_file(&file_id, surface);
                    Ok(())
                } else {
                    match self.store.read(&file_id).await {
                        Ok(content) => {
                            self.state
                                .open_file(OpenBuffer::new(file_id, file_name, content), surface);
                            Ok(())
                        }
                        Err(e) => {
                            log::warn!("Could not open {file_id}: {e}");
                            Err(SessionError::Store(e))
                        }
                    }
                };
                let _ = reply.send(result);
            }
            SessionCommand::CloseFile { file_id } => self.state.close_file(&file_id, surface),
            SessionCommand::ActivateFile { file_id } => self.state.activate_file(&file_id, surface),
            SessionCommand::LocalEdit { file_id, content } => {
                self.state.local_edit(&file_id, content, Instant::now())
            }
            SessionCommand::CursorMoved {
                file_id,
                line,
                column,
                source,
            } => self.state.cursor_moved(&file_id, line, column, source, surface),
            SessionCommand::SaveFile { file_id, reply } => {
                let result = self.save(&file_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::SendChat { message } => self.state.send_chat(message, surface),
            SessionCommand::Roster { reply } => {
                let _ = reply.send(self.state.presence().snapshot());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            SessionCommand::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
        }
    }

    async fn save(&mut self, file_id: &FileId) -> Result<(), SessionError> {
        let content = self.state.content_to_save(file_id)?;
        if let Err(e) = self.store.write(file_id, &content).await {
            log::error!("Saving {file_id} failed: {e}");
            return Err(e.into());
        }
        self.state.file_persisted(file_id)
    }
}

/// Cloneless handle to a running session. Dropping it ends the session.
pub struct SessionHandle {
    project_id: ProjectId,
    tx: mpsc::Sender<SessionCommand>,
    bus: EventBus,
    connection: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Project this session is bound to.
    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Observe transport events. Lossy: a slow subscriber skips events,
    /// the session itself never does.
    pub fn events(&self) -> Subscription {
        self.bus.subscribe()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Open a tab, loading its content from the store.
    pub async fn open_file(
        &self,
        file_id: impl Into<FileId>,
        file_name: impl Into<String>,
    ) -> Result<(), SessionError> {
        let file_id = file_id.into();
        let file_name = file_name.into();
        self.request(|reply| SessionCommand::OpenFile {
            file_id,
            file_name,
            reply,
        })
        .await?
    }

    /// Close a tab; a pending edit for it is broadcast first.
    pub async fn close_file(&self, file_id: impl Into<FileId>) -> Result<(), SessionError> {
        self.send(SessionCommand::CloseFile {
            file_id: file_id.into(),
        })
        .await
    }

    /// Switch the active tab and announce the selection.
    pub async fn activate_file(&self, file_id: impl Into<FileId>) -> Result<(), SessionError> {
        self.send(SessionCommand::ActivateFile {
            file_id: file_id.into(),
        })
        .await
    }

    /// Record a local edit (full new content); broadcast after the debounce.
    pub async fn local_edit(
        &self,
        file_id: impl Into<FileId>,
        content: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::LocalEdit {
            file_id: file_id.into(),
            content: content.into(),
        })
        .await
    }

    /// Report a local cursor movement from any source.
    pub async fn cursor_moved(
        &self,
        file_id: impl Into<FileId>,
        line: u32,
        column: u32,
        source: CursorSource,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::CursorMoved {
            file_id: file_id.into(),
            line,
            column,
            source,
        })
        .await
    }

    /// Persist through the store, then broadcast `file_saved`.
    pub async fn save_file(&self, file_id: impl Into<FileId>) -> Result<(), SessionError> {
        let file_id = file_id.into();
        self.request(|reply| SessionCommand::SaveFile { file_id, reply })
            .await?
    }

    /// Send a chat message to the project.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::SendChat {
            message: message.into(),
        })
        .await
    }

    /// Current roster, self first.
    pub async fn roster(&self) -> Result<Vec<RosterEntry>, SessionError> {
        self.request(|reply| SessionCommand::Roster { reply }).await
    }

    /// Point-in-time copy of the whole session state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Get the transport connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Whether the transport has an open socket.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Observe connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Cancel timers, close the socket with 1000 and wait for the loop.
    pub async fn shutdown(mut self) {
        let _ = self.request(|reply| SessionCommand::Shutdown { reply }).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Session task ended abnormally: {e}");
            }
        }
    }
}

/// Owns at most one live session; switching projects fully stops the
/// previous one first.
pub struct SessionManager {
    config: CollabConfig,
    store: Arc<dyn FileStore>,
    current: Option<SessionHandle>,
}

impl SessionManager {
    /// Create a manager with no open project.
    pub fn new(config: CollabConfig, store: Arc<dyn FileStore>) -> Self {
        Self {
            config,
            store,
            current: None,
        }
    }

    /// Stop the current session (if any), then start one for `identity`.
    pub async fn open_project<S: EditorSurface>(
        &mut self,
        identity: SessionIdentity,
        surface: S,
    ) -> Result<&SessionHandle, SessionError> {
        self.close().await;
        log::info!("Opening project {}", identity.project_id);
        let handle =
            CollabSession::start(identity, self.config.clone(), self.store.clone(), surface).await?;
        Ok(self.current.insert(handle))
    }

    /// The live session, if a project is open.
    pub fn current(&self) -> Option<&SessionHandle> {
        self.current.as_ref()
    }

    /// Shut the current session down and wait for it.
    pub async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            session.shutdown().await;
        }
    }
}
