//! Session orchestrator: binds the stream, the REST client and the
//! reconciliation engine to the conversation currently on screen.
//!
//! [`ChatSession`] pumps [`SessionEvent`]s from the shared
//! [`TransportSession`] into the [`SyncEngine`] and carries out the
//! resulting [`SyncEffect`]s. Every conversation switch starts a new
//! context: history loads and read-status lookups started for an older
//! context are cancelled or discarded when they finish.
//!
//! While the session is hidden, envelopes are still received and decoded
//! but change nothing and notify nobody.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use parley_proto::message::{ConversationId, MessageId, ReadStatus, UserId};

use crate::api::ChatApi;
use crate::chat::{ClearedMarkers, CommandBuilder, CommandConfig, HistoryFetcher, TypingRoster};
use crate::sync::engine::{EngineConfig, SyncEngine};
use crate::sync::{Notice, SyncEffect, Timeline};
use crate::transport::session::{SessionEvent, TransportSession};
use crate::transport::{Dialer, TransportError};

/// Settings for a [`ChatSession`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Reconciliation settings.
    pub engine: EngineConfig,
    /// Outbound command timing.
    pub commands: CommandConfig,
    /// Messages requested per history page.
    pub page_size: u32,
    /// Capacity of the notice channel.
    pub notice_buffer: usize,
}

impl SessionSettings {
    /// Default settings for `local_user`.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            engine: EngineConfig::new(local_user),
            commands: CommandConfig::default(),
            page_size: 50,
            notice_buffer: 256,
        }
    }
}

struct Shared<D: Dialer, A: ChatApi> {
    transport: TransportSession<D>,
    api: Arc<A>,
    engine: Arc<Mutex<SyncEngine>>,
    history: HistoryFetcher<A>,
    commands: CommandBuilder<D, A>,
    cleared: Mutex<ClearedMarkers>,
    roster: Mutex<TypingRoster>,
    /// Current context; bumped on every switch and detach.
    context: AtomicU64,
    visible: AtomicBool,
    notices: mpsc::Sender<Notice>,
    tasks: Mutex<JoinSet<()>>,
    events: tokio::sync::Mutex<mpsc::Receiver<SessionEvent>>,
}

/// The conversation-bound client core.
///
/// Dropping the session stops its background tasks but leaves the
/// transport open; the transport is shared and outlives conversations.
pub struct ChatSession<D: Dialer, A: ChatApi> {
    shared: Arc<Shared<D, A>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer, A: ChatApi> ChatSession<D, A> {
    /// Build a session over an existing transport and its event receiver.
    ///
    /// Returns the session and the receiver for user-facing notices. The
    /// session starts hidden with no conversation; call
    /// [`switch_to`](Self::switch_to) and [`attach`](Self::attach).
    #[must_use]
    pub fn new(
        transport: TransportSession<D>,
        events: mpsc::Receiver<SessionEvent>,
        api: Arc<A>,
        cleared: ClearedMarkers,
        settings: SessionSettings,
    ) -> (Self, mpsc::Receiver<Notice>) {
        let (notice_tx, notice_rx) = mpsc::channel(settings.notice_buffer);
        let local_user = settings.engine.local_user;
        let engine = Arc::new(Mutex::new(SyncEngine::new(settings.engine)));
        let commands = CommandBuilder::new(
            transport.clone(),
            Arc::clone(&api),
            Arc::clone(&engine),
            notice_tx.clone(),
            settings.commands,
        );
        let shared = Arc::new(Shared {
            history: HistoryFetcher::new(Arc::clone(&api), settings.page_size),
            transport,
            api,
            engine,
            commands,
            cleared: Mutex::new(cleared),
            roster: Mutex::new(TypingRoster::new(local_user)),
            context: AtomicU64::new(0),
            visible: AtomicBool::new(false),
            notices: notice_tx,
            tasks: Mutex::new(JoinSet::new()),
            events: tokio::sync::Mutex::new(events),
        });
        let session = Self {
            shared,
            pump: Mutex::new(None),
        };
        (session, notice_rx)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start consuming stream events. No-op if already attached.
    pub fn attach(&self) {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *pump = Some(tokio::spawn(async move {
            let mut events = shared.events.lock().await;
            while let Some(event) = events.recv().await {
                shared.handle(event).await;
            }
            tracing::debug!("session event channel closed");
        }));
    }

    /// Stop consuming stream events and cancel conversation-bound work:
    /// pending history loads, read-status lookups, the typing timer and any
    /// open edit. The transport stays open.
    pub async fn detach(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.shared.context.fetch_add(1, Ordering::SeqCst);
        self.shared.visible.store(false, Ordering::SeqCst);
        self.shared.tasks.lock().abort_all();
        self.shared.commands.stop_typing().await;
        self.shared.commands.cancel_edit();
        tracing::info!("session detached");
    }

    /// Connect (or reconnect) the shared transport.
    ///
    /// # Errors
    ///
    /// Returns the connect failure, also delivered as a notice.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.shared.transport.connect().await
    }

    /// Make `conversation` (or a first-contact conversation with `peer`)
    /// the active one and start loading its history.
    pub async fn switch_to(&self, conversation: Option<ConversationId>, peer: Option<UserId>) {
        // typing stop goes to the conversation being left
        self.shared.commands.stop_typing().await;
        self.shared.commands.cancel_edit();

        let context = self.shared.context.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.tasks.lock().abort_all();
        let previous = self.shared.engine.lock().conversation_id().cloned();
        if let Some(previous) = previous {
            self.shared.history.forget(&previous);
        }
        self.shared.engine.lock().reset(conversation.clone(), peer);
        self.shared.roster.lock().clear();
        self.shared.commands.latch().release();
        self.shared.visible.store(true, Ordering::SeqCst);

        tracing::info!(
            conversation_id = ?conversation,
            peer = ?peer,
            context,
            "switched conversation"
        );
        if let Some(conversation) = conversation {
            self.shared.spawn_history(conversation, context);
        }
    }

    /// Gate live events on whether the conversation is on screen.
    ///
    /// Showing a hidden session reloads history, since everything pushed
    /// while hidden was dropped.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.shared.visible.swap(visible, Ordering::SeqCst);
        if visible && !was_visible {
            self.reload_history();
        }
    }

    /// Whether live events are applied.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.shared.visible.load(Ordering::SeqCst)
    }

    /// Load the active conversation's history again.
    pub fn reload_history(&self) {
        let conversation = self.shared.engine.lock().conversation_id().cloned();
        if let Some(conversation) = conversation {
            let context = self.shared.context.load(Ordering::SeqCst);
            self.shared.spawn_history(conversation, context);
        }
    }

    /// Empty the list of `conversation` and remember the clear across
    /// restarts. Returns whether the active list was emptied.
    pub fn clear(&self, conversation: &ConversationId) -> bool {
        let cleared = self.shared.engine.lock().clear(conversation);
        self.shared.history.forget(conversation);
        if let Err(err) = self.shared.cleared.lock().insert(conversation.clone()) {
            tracing::warn!(conversation_id = %conversation, err = %err, "clear marker not saved");
        }
        cleared
    }

    /// Look up the read state of `ids`, retrying refused ids when `force`.
    pub fn refresh_read_status(&self, ids: Vec<MessageId>, force: bool) {
        let context = self.shared.context.load(Ordering::SeqCst);
        self.shared.spawn_read_status(ids, force, context);
    }

    /// Apply one stream event. The attached pump calls this for every
    /// event; it is public for driving a session without a pump.
    pub async fn handle(&self, event: SessionEvent) {
        self.shared.handle(event).await;
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Outbound commands for the active conversation.
    #[must_use]
    pub fn commands(&self) -> &CommandBuilder<D, A> {
        &self.shared.commands
    }

    /// The shared transport.
    #[must_use]
    pub fn transport(&self) -> &TransportSession<D> {
        &self.shared.transport
    }

    /// Receiver that observes every published timeline.
    #[must_use]
    pub fn timeline(&self) -> watch::Receiver<Timeline> {
        self.shared.engine.lock().subscribe()
    }

    /// Current timeline.
    #[must_use]
    pub fn snapshot(&self) -> Timeline {
        self.shared.engine.lock().snapshot()
    }

    /// The active conversation.
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.shared.engine.lock().conversation_id().cloned()
    }

    /// Message in edit mode.
    #[must_use]
    pub fn editing(&self) -> Option<MessageId> {
        self.shared.engine.lock().editing().cloned()
    }

    /// Known read state of `id`.
    #[must_use]
    pub fn read_status(&self, id: &MessageId) -> Option<ReadStatus> {
        self.shared.engine.lock().read_status().get(id).cloned()
    }

    /// Others typing in `conversation`.
    #[must_use]
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.shared.roster.lock().typing_in(conversation)
    }
}

impl<D: Dialer, A: ChatApi> Drop for ChatSession<D, A> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.shared.tasks.lock().abort_all();
    }
}

impl<D: Dialer, A: ChatApi> Shared<D, A> {
    fn notify(&self, notice: Notice) {
        if self.notices.try_send(notice).is_err() {
            tracing::debug!("notice dropped, channel full or closed");
        }
    }

    fn is_current(&self, context: u64) -> bool {
        self.context.load(Ordering::SeqCst) == context
    }

    async fn handle(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.notify(Notice::Connected);
                // catch up on anything missed while disconnected
                let conversation = self.engine.lock().conversation_id().cloned();
                if let Some(conversation) = conversation
                    && self.visible.load(Ordering::SeqCst)
                {
                    self.spawn_history(conversation, self.context.load(Ordering::SeqCst));
                }
            }
            SessionEvent::Closed(closure) => {
                self.commands.latch().release();
                if let Some(reason) = closure.describe() {
                    tracing::warn!(code = closure.code, %reason, "stream lost");
                    self.notify(Notice::ConnectionLost {
                        reason,
                        retry: closure.should_retry(),
                    });
                }
            }
            SessionEvent::Error(err) if err.is_user_facing() => {
                self.notify(Notice::TransportFault(err.to_string()));
            }
            SessionEvent::Error(err) => {
                tracing::debug!(err = %err, "protocol fault dropped");
            }
            SessionEvent::Typing(status) => {
                if !self.visible.load(Ordering::SeqCst) {
                    return;
                }
                let active = self.engine.lock().conversation_id().cloned();
                let changed = self.roster.lock().apply(&status);
                if let Some((conversation_id, typing)) = changed
                    && active.as_ref() == Some(&conversation_id)
                {
                    self.notify(Notice::TypingChanged {
                        conversation_id,
                        typing,
                    });
                }
            }
            SessionEvent::Envelope(inbound) => {
                if !self.visible.load(Ordering::SeqCst) {
                    tracing::trace!("session hidden, envelope ignored");
                    return;
                }
                let context = self.context.load(Ordering::SeqCst);
                let effects = self.engine.lock().ingest_live(inbound);
                for effect in effects {
                    self.apply(effect, context).await;
                }
            }
        }
    }

    async fn apply(self: &Arc<Self>, effect: SyncEffect, context: u64) {
        match effect {
            SyncEffect::Notify(notice) => self.notify(notice),
            SyncEffect::SendReadReceipt {
                conversation_id,
                message_id,
            } => {
                self.commands
                    .send_read_receipt(conversation_id, message_id)
                    .await;
            }
            SyncEffect::ConversationAdopted {
                conversation_id,
                load_history,
            } => {
                if load_history {
                    self.spawn_history(conversation_id, context);
                }
            }
            SyncEffect::RefreshReadStatus(ids) => self.spawn_read_status(ids, true, context),
            SyncEffect::ReleaseSendLatch => self.commands.latch().release(),
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn spawn_history(self: &Arc<Self>, conversation: ConversationId, context: u64) {
        let shared = Arc::clone(self);
        self.spawn(async move { shared.load_history(conversation, context).await });
    }

    fn spawn_read_status(self: &Arc<Self>, ids: Vec<MessageId>, force: bool, context: u64) {
        if ids.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        self.spawn(async move { shared.lookup_read_status(ids, force, context).await });
    }

    async fn load_history(&self, conversation: ConversationId, context: u64) {
        let Some(history) = self.history.fetch(&conversation).await else {
            return;
        };
        if !self.is_current(context) {
            tracing::debug!(conversation_id = %conversation, "history for a previous context discarded");
            return;
        }
        let consumed = match self.cleared.lock().remove(&conversation) {
            Ok(consumed) => consumed,
            Err(err) => {
                tracing::warn!(conversation_id = %conversation, err = %err, "clear marker not removed");
                true
            }
        };
        if consumed {
            tracing::info!(conversation_id = %conversation, "conversation was cleared, history not shown");
            return;
        }

        let (timeline, local) = {
            let mut engine = self.engine.lock();
            engine.ingest_history(history);
            (engine.snapshot(), engine.local_user())
        };
        self.commands.mark_history_read(&conversation, &timeline).await;

        let own: Vec<MessageId> = timeline
            .iter()
            .filter(|m| m.is_from(local) && !m.id.is_provisional() && !m.is_recalled)
            .map(|m| m.id.clone())
            .collect();
        self.lookup_read_status(own, false, context).await;
    }

    async fn lookup_read_status(&self, ids: Vec<MessageId>, force: bool, context: u64) {
        let mut updated = Vec::new();
        for id in ids {
            if !self.engine.lock().read_status_mut().begin_lookup(&id, force) {
                continue;
            }
            let result = self.api.read_status(&id).await;
            if !self.is_current(context) {
                return;
            }
            if result.is_ok() {
                updated.push(id.clone());
            }
            self.engine
                .lock()
                .read_status_mut()
                .finish_lookup(&id, result.as_ref().cloned());
        }
        if !updated.is_empty() {
            self.notify(Notice::ReadStatusUpdated(updated));
        }
    }
}
