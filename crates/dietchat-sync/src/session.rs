use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dietchat_types::api::SendMessageRequest;
use dietchat_types::events::RealtimeEvent;
use dietchat_types::models::{ConversationKey, Message};

use crate::api::ConversationApi;
use crate::error::SyncError;
use crate::merge::{apply_read_update, max_id, merge};
use crate::realtime::{RealtimeFeed, RealtimeTransport};
use crate::receipts::ReceiptBatcher;

const COMMAND_CAPACITY: usize = 32;
const REALTIME_DOWN_NOTICE: &str =
    "Live updates are unavailable. New messages will appear within a few seconds.";
const LOAD_FAILED_NOTICE: &str = "Messages could not be loaded. Retrying shortly.";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Presence heartbeat period while the conversation is open and visible.
    pub heartbeat_every: Duration,
    /// Incremental fetch period in polling mode.
    pub poll_every: Duration,
    /// How long unread messages stay on screen before they are marked read.
    pub read_dwell: Duration,
    /// Reported with every heartbeat ("web", "ios", ...).
    pub source: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_every: Duration::from_secs(20),
            poll_every: Duration::from_secs(15),
            read_dwell: Duration::from_millis(1500),
            source: "web".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Loading the log; a failed load is retried every poll period.
    Hydrating,
    LiveSubscribed,
    /// Entered when realtime is unavailable; lasts until the session ends.
    Polling,
}

/// What the UI renders.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub mode: SyncMode,
    pub messages: Vec<Message>,
    pub cursor: Option<i64>,
    /// Unread messages from the other party in the merged list.
    pub unread_count: usize,
    /// Soft, dismissible notice (e.g. realtime unavailable).
    pub notice: Option<String>,
    pub visible: bool,
}

pub enum SyncCommand {
    Send {
        request: SendMessageRequest,
        reply: oneshot::Sender<Result<Message, SyncError>>,
    },
    SetVisible(bool),
    DismissNotice,
    Leave,
}

/// One open conversation. The driver task owns all state; callers talk to it
/// through commands and watch its snapshots.
pub struct SyncSession {
    commands: mpsc::Sender<SyncCommand>,
    snapshot: watch::Receiver<SyncSnapshot>,
    task: JoinHandle<()>,
}

impl SyncSession {
    pub fn spawn(
        api: Arc<dyn ConversationApi>,
        realtime: Arc<dyn RealtimeTransport>,
        key: ConversationKey,
        viewer: Uuid,
        config: SyncConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let initial = SyncSnapshot {
            mode: SyncMode::Hydrating,
            messages: Vec::new(),
            cursor: None,
            unread_count: 0,
            notice: None,
            visible: true,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let driver = Driver {
            receipts: ReceiptBatcher::new(viewer),
            api,
            realtime,
            key,
            viewer,
            config,
            mode: SyncMode::Hydrating,
            messages: Vec::new(),
            cursor: None,
            notice: None,
            visible: true,
            hydrated: false,
            catch_up_pending: false,
            feed: None,
            poll: None,
            dwell_deadline: None,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx));

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    pub fn snapshot(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.clone()
    }

    pub fn current(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Append a message. On success it is already merged into the list.
    pub async fn send(&self, request: SendMessageRequest) -> Result<Message, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SyncCommand::Send { request, reply })
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), SyncError> {
        self.commands
            .send(SyncCommand::SetVisible(visible))
            .await
            .map_err(|_| SyncError::Closed)
    }

    pub async fn dismiss_notice(&self) -> Result<(), SyncError> {
        self.commands
            .send(SyncCommand::DismissNotice)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Stop syncing and wait for the final inactive heartbeat to go out.
    pub async fn leave(self) {
        let _ = self.commands.send(SyncCommand::Leave).await;
        if let Err(e) = self.task.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }
}

enum Wake {
    Command(Option<SyncCommand>),
    Realtime(Option<RealtimeEvent>),
    Poll,
    Heartbeat,
    Dwell,
}

struct Driver {
    api: Arc<dyn ConversationApi>,
    realtime: Arc<dyn RealtimeTransport>,
    key: ConversationKey,
    viewer: Uuid,
    config: SyncConfig,

    mode: SyncMode,
    messages: Vec<Message>,
    cursor: Option<i64>,
    notice: Option<String>,
    visible: bool,

    /// The full load has succeeded at least once.
    hydrated: bool,
    /// A realtime insert could not be fetched; the next fetch goes from the cursor.
    catch_up_pending: bool,

    feed: Option<RealtimeFeed>,
    /// Polling in Polling mode; a load or catch-up retry timer otherwise.
    poll: Option<Interval>,
    receipts: ReceiptBatcher,
    dwell_deadline: Option<Instant>,

    snapshot: watch::Sender<SyncSnapshot>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<SyncCommand>) {
        self.send_heartbeat(true).await;
        self.hydrate().await;

        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_every,
            self.config.heartbeat_every,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                event = next_feed_event(&mut self.feed) => Wake::Realtime(event),
                _ = tick(&mut self.poll) => Wake::Poll,
                _ = heartbeat.tick() => Wake::Heartbeat,
                _ = wait_deadline(self.dwell_deadline) => Wake::Dwell,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(SyncCommand::Leave)) => break,
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Realtime(Some(event)) => self.handle_event(event).await,
                Wake::Realtime(None) => {
                    warn!("Realtime feed for {} closed, falling back to polling", self.key);
                    self.feed = None;
                    self.enter_polling(Some(REALTIME_DOWN_NOTICE));
                }
                Wake::Poll => {
                    if self.hydrated {
                        self.catch_up().await;
                    } else {
                        self.hydrate().await;
                    }
                }
                Wake::Heartbeat => {
                    if self.visible {
                        self.send_heartbeat(true).await;
                    }
                }
                Wake::Dwell => self.flush_receipts().await,
            }
        }

        // Leaving: stop polling, drop the live subscription, then say goodbye.
        self.poll = None;
        self.feed = None;
        self.dwell_deadline = None;
        self.send_heartbeat(false).await;
        debug!("Left conversation {}", self.key);
    }

    /// Full load, then try to go live. A failed load is retried on the poll
    /// period before any subscription is attempted.
    async fn hydrate(&mut self) {
        match self.api.fetch_since(self.key, None).await {
            Ok(page) => {
                debug!(
                    "Hydrated {} with {} message(s), server unread {:?}",
                    self.key,
                    page.messages.len(),
                    page.unread_count
                );
                self.hydrated = true;
                self.poll = None;
                if self.notice.as_deref() == Some(LOAD_FAILED_NOTICE) {
                    self.notice = None;
                }
                self.absorb(page.messages);
                self.publish();
            }
            Err(e) => {
                warn!("Loading {} failed: {}", self.key, e);
                self.notice = Some(LOAD_FAILED_NOTICE.to_string());
                self.arm_poll();
                self.publish();
                return;
            }
        }

        match self.realtime.subscribe(self.key).await {
            Ok(feed) => {
                info!("Live updates active for {}", self.key);
                self.feed = Some(feed);
                self.mode = SyncMode::LiveSubscribed;
                self.publish();
                // Messages committed between the load and the subscription
                // have no event on this feed.
                self.catch_up().await;
            }
            Err(e) => {
                warn!("Realtime subscribe for {} failed: {}", self.key, e);
                self.enter_polling(Some(REALTIME_DOWN_NOTICE));
            }
        }
    }

    fn enter_polling(&mut self, notice: Option<&str>) {
        self.mode = SyncMode::Polling;
        if let Some(notice) = notice {
            self.notice = Some(notice.to_string());
        }
        self.arm_poll();
        self.publish();
    }

    fn arm_poll(&mut self) {
        let mut poll = interval_at(Instant::now() + self.config.poll_every, self.config.poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);
    }

    /// Incremental fetch from the cursor. While live, a failure arms the poll
    /// timer as a retry and a success disarms it.
    async fn catch_up(&mut self) {
        match self.api.fetch_since(self.key, self.cursor).await {
            Ok(page) => {
                if !page.messages.is_empty() {
                    debug!(
                        "Fetch after {:?} in {} returned {} message(s)",
                        self.cursor,
                        self.key,
                        page.messages.len()
                    );
                }
                self.catch_up_pending = false;
                if self.mode == SyncMode::LiveSubscribed {
                    self.poll = None;
                }
                self.absorb(page.messages);
            }
            Err(e) => {
                warn!("Fetch after {:?} in {} failed: {}", self.cursor, self.key, e);
                if self.mode == SyncMode::LiveSubscribed {
                    self.catch_up_pending = true;
                    if self.poll.is_none() {
                        self.arm_poll();
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Send { request, reply } => {
                let result = self.api.send(self.key, &request).await;
                if let Ok(message) = &result {
                    // The realtime or poll echo of this id merges as a no-op.
                    self.absorb(vec![message.clone()]);
                }
                let _ = reply.send(result);
            }
            SyncCommand::SetVisible(visible) => {
                if self.visible == visible {
                    return;
                }
                self.visible = visible;
                self.send_heartbeat(visible).await;
                if visible {
                    self.observe_unread();
                } else {
                    // Pending receipts wait until the conversation is seen again.
                    self.dwell_deadline = None;
                }
                self.publish();
            }
            SyncCommand::DismissNotice => {
                self.notice = None;
                self.publish();
            }
            SyncCommand::Leave => {}
        }
    }

    async fn handle_event(&mut self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::MessageInsert { id, .. } => {
                if self.messages.binary_search_by_key(&id, |m| m.id).is_ok() {
                    return;
                }
                if self.catch_up_pending {
                    self.catch_up().await;
                    return;
                }
                match self.api.fetch_one(self.key, id).await {
                    Ok(message) => self.absorb(vec![message]),
                    Err(e) => {
                        // Merging a later id first would move the cursor past this one.
                        warn!("Fetching message {} of {} failed: {}", id, self.key, e);
                        self.catch_up().await;
                    }
                }
            }
            RealtimeEvent::MessageUpdate { id, is_read, read_at, .. } => {
                if apply_read_update(&mut self.messages, id, is_read, read_at) {
                    self.publish();
                }
            }
            _ => {}
        }
    }

    async fn flush_receipts(&mut self) {
        self.dwell_deadline = None;
        if !self.visible {
            return;
        }
        let Some(batch) = self.receipts.take_batch() else {
            return;
        };

        match self.api.mark_read(self.key, &batch).await {
            Ok(marked) => {
                debug!("Marked {} of {} message(s) read in {}", marked, batch.len(), self.key);
                self.receipts.confirm(&batch);
                let now = Utc::now().trunc_subsecs(3);
                for id in &batch {
                    apply_read_update(&mut self.messages, *id, true, Some(now));
                }
                self.publish();
            }
            Err(e) => {
                warn!("Marking {} message(s) read in {} failed: {}", batch.len(), self.key, e);
                self.receipts.requeue(&batch);
                self.dwell_deadline = Some(Instant::now() + self.config.poll_every);
            }
        }
    }

    /// Every arrival path funnels through here.
    fn absorb(&mut self, incoming: Vec<Message>) {
        if incoming.is_empty() {
            return;
        }
        merge(&mut self.messages, incoming);
        // The cursor never moves backwards.
        self.cursor = match (self.cursor, max_id(&self.messages)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.observe_unread();
        self.publish();
    }

    fn observe_unread(&mut self) {
        if !self.visible {
            return;
        }
        self.receipts.observe(&self.messages);
        if self.receipts.has_pending() && self.dwell_deadline.is_none() {
            self.dwell_deadline = Some(Instant::now() + self.config.read_dwell);
        }
    }

    /// Best effort: presence errors are logged and otherwise ignored.
    async fn send_heartbeat(&mut self, is_active: bool) {
        if let Err(e) = self.api.heartbeat(self.key, is_active, &self.config.source).await {
            debug!("Presence heartbeat for {} failed: {}", self.key, e);
        }
    }

    fn publish(&self) {
        let unread_count = self
            .messages
            .iter()
            .filter(|m| !m.is_read && m.sender_id != self.viewer)
            .count();
        self.snapshot.send_replace(SyncSnapshot {
            mode: self.mode,
            messages: self.messages.clone(),
            cursor: self.cursor,
            unread_count,
            notice: self.notice.clone(),
            visible: self.visible,
        });
    }
}

async fn next_feed_event(feed: &mut Option<RealtimeFeed>) -> Option<RealtimeEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
