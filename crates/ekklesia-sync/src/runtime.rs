//! Async runtime around [`SyncEngine`].
//!
//! One tokio task owns the engine and processes, one at a time, commands
//! from [`EngineHandle`]s, deliveries from the event bus and completions of
//! the collaborator calls it spawned. Collaborator calls never run on the
//! engine task; their results come back tagged with the generation they
//! were issued under, so a superseded result is discarded.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use ekklesia_bus::{Delivery, EventBus};
use ekklesia_shared::{ConversationKey, Message, MessageId, MessageRow, UserId};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{Collaborators, DispatchOutcome, DispatchRequest};
use crate::config::EngineConfig;
use crate::engine::{MarkReadRequest, RosterFetch, RosterOutcome, SyncEngine};
use crate::error::{Result, SourceError, SyncError};
use crate::roster::Contact;
use crate::session::{FetchTicket, HistoryOutcome};

/// Commands sent *to* the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    SelectConversation {
        key: ConversationKey,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseConversation(oneshot::Sender<Option<ConversationKey>>),
    /// Optimistically send a message; replies with its temporary id.
    Send {
        body: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    /// Resend a failed message; replies with the new temporary id.
    Retry {
        id: MessageId,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    MarkRead(UserId),
    RefreshRoster,
    GetTimeline(oneshot::Sender<Vec<Message>>),
    GetRoster(oneshot::Sender<Vec<Contact>>),
    GetUnreadTotal(oneshot::Sender<u32>),
    GetActiveConversation(oneshot::Sender<Option<ConversationKey>>),
    /// Release every subscription and stop the task.
    Shutdown(oneshot::Sender<()>),
}

/// Notifications sent *from* the engine task to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotification {
    Started,
    TimelineChanged {
        key: ConversationKey,
    },
    RosterChanged,
    MessageFailed {
        key: ConversationKey,
        message_id: MessageId,
        reason: String,
    },
    SubscriptionFailed {
        topic: String,
        reason: String,
        will_retry: bool,
    },
    SubscriptionRestored {
        topic: String,
    },
    HistoryFailed {
        key: ConversationKey,
        reason: String,
    },
    RosterSourceFailed {
        source: String,
        reason: String,
    },
    MarkReadFailed {
        contact: UserId,
        reason: String,
    },
    Closed,
}

/// Results of spawned work, fed back into the engine task.
enum Completion {
    History {
        generation: u64,
        result: std::result::Result<Vec<MessageRow>, SourceError>,
    },
    Dispatched {
        key: ConversationKey,
        token: Uuid,
        outcome: DispatchOutcome,
    },
    Roster {
        generation: u64,
        fetch: RosterFetch,
    },
    MarkRead {
        contact: UserId,
        result: std::result::Result<(), SourceError>,
    },
    RetrySubscription {
        generation: u64,
        attempt: u32,
    },
    RetryInbox {
        attempt: u32,
    },
}

/// Cloneable front end to a running engine task.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    async fn post(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub async fn select_conversation(&self, key: ConversationKey) -> Result<()> {
        self.request(|reply| EngineCommand::SelectConversation { key, reply })
            .await?
    }

    pub async fn close_conversation(&self) -> Result<Option<ConversationKey>> {
        self.request(EngineCommand::CloseConversation).await
    }

    pub async fn send(&self, body: impl Into<String>) -> Result<MessageId> {
        let body = body.into();
        self.request(|reply| EngineCommand::Send { body, reply }).await?
    }

    pub async fn retry(&self, id: MessageId) -> Result<MessageId> {
        self.request(|reply| EngineCommand::Retry { id, reply }).await?
    }

    pub async fn mark_read(&self, contact: UserId) -> Result<()> {
        self.post(EngineCommand::MarkRead(contact)).await
    }

    pub async fn refresh_roster(&self) -> Result<()> {
        self.post(EngineCommand::RefreshRoster).await
    }

    pub async fn timeline(&self) -> Result<Vec<Message>> {
        self.request(EngineCommand::GetTimeline).await
    }

    pub async fn roster(&self) -> Result<Vec<Contact>> {
        self.request(EngineCommand::GetRoster).await
    }

    pub async fn unread_total(&self) -> Result<u32> {
        self.request(EngineCommand::GetUnreadTotal).await
    }

    pub async fn active_conversation(&self) -> Result<Option<ConversationKey>> {
        self.request(EngineCommand::GetActiveConversation).await
    }

    /// Stop the engine. Resolves once every subscription is released.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(EngineCommand::Shutdown).await
    }
}

/// Spawn the engine task. Must be called from within a tokio runtime.
pub fn spawn_engine(
    config: EngineConfig,
    me: UserId,
    bus: Arc<dyn EventBus>,
    collaborators: Collaborators,
) -> (EngineHandle, mpsc::Receiver<EngineNotification>) {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<EngineCommand>(config.command_capacity);
    let (notif_tx, notif_rx) = mpsc::channel::<EngineNotification>(config.notification_capacity);
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<Delivery>();
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();

    let engine = SyncEngine::new(config, me, bus, delivery_tx);
    let mut runner = Runner {
        engine,
        collaborators,
        notifications: notif_tx,
        completions: completion_tx,
    };

    tokio::spawn(async move {
        runner.start();
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                // --- Commands from handles ---
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let ControlFlow::Break(reply) = runner.handle_command(cmd) {
                                shutdown_reply = Some(reply);
                                break;
                            }
                        }
                        None => {
                            info!("All engine handles dropped, shutting down");
                            break;
                        }
                    }
                }

                // --- Bus deliveries ---
                Some(delivery) = delivery_rx.recv() => {
                    runner.handle_delivery(delivery);
                }

                // --- Spawned work completing ---
                Some(completion) = completion_rx.recv() => {
                    runner.handle_completion(completion);
                }
            }
        }

        runner.engine.shutdown();
        runner.notify(EngineNotification::Closed);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    });

    (EngineHandle { commands: cmd_tx }, notif_rx)
}

fn failed_topic(error: &SyncError) -> String {
    match error {
        SyncError::SubscriptionFailed { topic, .. } => topic.clone(),
        _ => String::new(),
    }
}

struct Runner {
    engine: SyncEngine,
    collaborators: Collaborators,
    notifications: mpsc::Sender<EngineNotification>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Runner {
    fn notify(&self, notification: EngineNotification) {
        match self.notifications.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(notification = ?dropped, "Notification channel full, dropping");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Notification receiver dropped");
            }
        }
    }

    fn start(&mut self) {
        match self.engine.start() {
            Ok(effects) => {
                self.notify(EngineNotification::Started);
                if let Some(error) = effects.inbox_error {
                    self.subscription_failed(&error, Completion::RetryInbox { attempt: 0 }, 0);
                }
                self.spawn_roster(effects.roster_generation);
            }
            Err(e) => error!(error = %e, "Engine failed to start"),
        }
    }

    /// Breaks with the reply channel of a shutdown request.
    fn handle_command(&mut self, cmd: EngineCommand) -> ControlFlow<oneshot::Sender<()>> {
        match cmd {
            EngineCommand::SelectConversation { key, reply } => {
                let result = self.select(key);
                let _ = reply.send(result);
            }
            EngineCommand::CloseConversation(reply) => {
                let _ = reply.send(self.engine.close_conversation());
            }
            EngineCommand::Send { body, reply } => {
                let result = self.engine.send(&body).map(|request| self.dispatch(request));
                let _ = reply.send(result);
            }
            EngineCommand::Retry { id, reply } => {
                let result = self.engine.retry(&id).map(|request| self.dispatch(request));
                let _ = reply.send(result);
            }
            EngineCommand::MarkRead(contact) => {
                if let Some(request) = self.engine.mark_read(&contact) {
                    self.spawn_mark_read(request);
                    self.notify(EngineNotification::RosterChanged);
                }
            }
            EngineCommand::RefreshRoster => {
                let generation = self.engine.begin_roster_refresh();
                self.spawn_roster(generation);
            }
            EngineCommand::GetTimeline(reply) => {
                let _ = reply.send(self.engine.timeline());
            }
            EngineCommand::GetRoster(reply) => {
                let _ = reply.send(self.engine.roster());
            }
            EngineCommand::GetUnreadTotal(reply) => {
                let _ = reply.send(self.engine.unread_total());
            }
            EngineCommand::GetActiveConversation(reply) => {
                let _ = reply.send(self.engine.active_conversation().cloned());
            }
            EngineCommand::Shutdown(reply) => {
                info!("Engine shutdown requested");
                return ControlFlow::Break(reply);
            }
        }
        ControlFlow::Continue(())
    }

    fn select(&mut self, key: ConversationKey) -> Result<()> {
        let effects = self.engine.select_conversation(key.clone())?;
        if let Some(error) = effects.subscription_error {
            let retry = Completion::RetrySubscription {
                generation: effects.fetch.generation,
                attempt: 0,
            };
            self.subscription_failed(&error, retry, 0);
        }
        self.spawn_history(effects.fetch);
        if let Some(request) = effects.mark_read {
            self.spawn_mark_read(request);
        }
        self.notify(EngineNotification::TimelineChanged { key });
        self.notify(EngineNotification::RosterChanged);
        Ok(())
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        let effects = self.engine.handle_delivery(delivery);
        if effects.timeline_changed {
            if let Some(key) = self.engine.active_conversation().cloned() {
                self.notify(EngineNotification::TimelineChanged { key });
            }
        }
        if effects.roster_changed {
            self.notify(EngineNotification::RosterChanged);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::History { generation, result } => {
                match self.engine.history_loaded(generation, result) {
                    HistoryOutcome::Stale => {}
                    HistoryOutcome::Applied { .. } => {
                        if let Some(key) = self.engine.active_conversation().cloned() {
                            self.notify(EngineNotification::TimelineChanged { key });
                        }
                    }
                    HistoryOutcome::Failed { key, error } => {
                        self.notify(EngineNotification::HistoryFailed {
                            key: key.clone(),
                            reason: error.to_string(),
                        });
                        self.notify(EngineNotification::TimelineChanged { key });
                    }
                }
            }
            Completion::Dispatched {
                key,
                token,
                outcome,
            } => {
                let reason = match &outcome {
                    DispatchOutcome::Failed { reason } => reason.clone(),
                    DispatchOutcome::Delivered => String::new(),
                };
                if let Some(message_id) = self.engine.dispatch_completed(&key, token, outcome) {
                    self.notify(EngineNotification::MessageFailed {
                        key: key.clone(),
                        message_id,
                        reason,
                    });
                    self.notify(EngineNotification::TimelineChanged { key });
                }
            }
            Completion::Roster { generation, fetch } => {
                if let RosterOutcome::Applied {
                    failed_sources,
                    summaries_error,
                    mark_read,
                } = self.engine.roster_loaded(generation, fetch)
                {
                    for (source, error) in failed_sources {
                        self.notify(EngineNotification::RosterSourceFailed {
                            source,
                            reason: error.to_string(),
                        });
                    }
                    if let Some(error) = summaries_error {
                        self.notify(EngineNotification::RosterSourceFailed {
                            source: "summaries".to_string(),
                            reason: error.to_string(),
                        });
                    }
                    if let Some(request) = mark_read {
                        self.spawn_mark_read(request);
                    }
                    self.notify(EngineNotification::RosterChanged);
                }
            }
            Completion::MarkRead { contact, result } => match result {
                Ok(()) => self.engine.mark_read_synced(&contact),
                Err(error) => {
                    warn!(contact = %contact, error = %error, "Remote mark-read failed");
                    self.notify(EngineNotification::MarkReadFailed {
                        contact,
                        reason: error.to_string(),
                    });
                }
            },
            Completion::RetrySubscription {
                generation,
                attempt,
            } => match self.engine.retry_subscription(generation) {
                Ok(Some(ticket)) => {
                    self.notify(EngineNotification::SubscriptionRestored {
                        topic: ticket.key.to_topic().to_string(),
                    });
                    self.spawn_history(ticket);
                }
                Ok(None) => {}
                Err(error) => {
                    let next = attempt + 1;
                    let retry = Completion::RetrySubscription {
                        generation,
                        attempt: next,
                    };
                    self.subscription_failed(&error, retry, next);
                }
            },
            Completion::RetryInbox { attempt } => match self.engine.retry_inbox() {
                Ok(Some(generation)) => {
                    self.notify(EngineNotification::SubscriptionRestored {
                        topic: self.engine.me().inbox_topic().to_string(),
                    });
                    self.spawn_roster(generation);
                }
                Ok(None) => {}
                Err(error) => {
                    let next = attempt + 1;
                    self.subscription_failed(&error, Completion::RetryInbox { attempt: next }, next);
                }
            },
        }
    }

    /// Report a subscription failure and schedule `retry` unless the attempt
    /// budget is spent.
    fn subscription_failed(&self, error: &SyncError, retry: Completion, attempt: u32) {
        let will_retry = attempt < self.engine.config().subscribe_retries;
        warn!(error = %error, attempt, will_retry, "Subscription failed");
        self.notify(EngineNotification::SubscriptionFailed {
            topic: failed_topic(error),
            reason: error.to_string(),
            will_retry,
        });
        if will_retry {
            self.schedule(retry, self.backoff(attempt));
        }
    }

    /// `base * 2^attempt` plus up to `base` of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.engine.config().subscribe_backoff;
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base_ms)
        };
        exp.saturating_add(Duration::from_millis(jitter))
    }

    fn schedule(&self, completion: Completion, delay: Duration) {
        let tx = self.completions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(completion);
        });
    }

    fn dispatch(&self, request: DispatchRequest) -> MessageId {
        let message_id = MessageId::Temporary(request.correlation_token);
        let key = request.conversation_key.clone();
        let token = request.correlation_token;
        self.notify(EngineNotification::TimelineChanged { key: key.clone() });

        let future = self.collaborators.dispatcher.dispatch(request);
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let outcome = future.await;
            let _ = tx.send(Completion::Dispatched {
                key,
                token,
                outcome,
            });
        });
        message_id
    }

    fn spawn_history(&self, ticket: FetchTicket) {
        debug!(conversation = %ticket.key, generation = ticket.generation, "Fetching history");
        let future = self.collaborators.history.fetch_history(ticket.key);
        let tx = self.completions.clone();
        let generation = ticket.generation;
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(Completion::History { generation, result });
        });
    }

    fn spawn_roster(&self, generation: u64) {
        debug!(generation, "Fetching roster");
        let contacts: Vec<_> = self
            .collaborators
            .contact_sources
            .iter()
            .map(|source| {
                let name = source.name().to_string();
                let future = source.fetch_contacts();
                async move { (name, future.await) }
            })
            .collect();
        let summaries = self
            .collaborators
            .history
            .fetch_summaries(self.engine.me().clone());
        let tx = self.completions.clone();

        tokio::spawn(async move {
            let (sources, summaries) = futures::join!(join_all(contacts), summaries);
            let _ = tx.send(Completion::Roster {
                generation,
                fetch: RosterFetch { sources, summaries },
            });
        });
    }

    fn spawn_mark_read(&self, request: MarkReadRequest) {
        let contact = request.contact.clone();
        let future = self
            .collaborators
            .read_markers
            .mark_read_remote(request.me, request.contact);
        let tx = self.completions.clone();
        tokio::spawn(async move {
            let result = future.await;
            let _ = tx.send(Completion::MarkRead { contact, result });
        });
    }
}
